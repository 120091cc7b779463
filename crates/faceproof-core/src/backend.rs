//! Inference backend capability and its ONNX Runtime implementation.
//!
//! The pipeline only ever talks to [`InferenceBackend`]: load a model once,
//! run it with a single named input tensor, release it when done. Session
//! caching and thread-safety live behind this trait.

use ndarray::{ArrayD, IxDyn};
use ort::session::Session;
use ort::value::TensorRef;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;

/// Dynamic-rank float32 tensor exchanged with the backend.
pub type Tensor = ArrayD<f32>;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("unknown model handle {0:?}")]
    UnknownModel(ModelHandle),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("model execution failed: {0}")]
    ExecutionFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Opaque reference to a model loaded by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModelHandle(pub u64);

/// Named output tensors, kept in the model's declared output order.
#[derive(Debug, Clone, Default)]
pub struct ModelOutputs {
    entries: Vec<(String, Tensor)>,
}

impl ModelOutputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, tensor: Tensor) -> Self {
        self.insert(name, tensor);
        self
    }

    /// Insert or replace the tensor stored under `name`.
    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) {
        let name = name.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = tensor,
            None => self.entries.push((name, tensor)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, t)| t)
    }

    /// The model's first declared output.
    pub fn first(&self) -> Option<&Tensor> {
        self.entries.first().map(|(_, t)| t)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(String, Tensor)> for ModelOutputs {
    fn from_iter<I: IntoIterator<Item = (String, Tensor)>>(iter: I) -> Self {
        let mut outputs = ModelOutputs::new();
        for (name, tensor) in iter {
            outputs.insert(name, tensor);
        }
        outputs
    }
}

/// Executes pretrained models. Implementations must tolerate concurrent
/// `run` calls against the same handle.
pub trait InferenceBackend: Send + Sync {
    /// Load (or reuse) the model identified by `model_id`.
    fn load(&self, model_id: &str) -> Result<ModelHandle, BackendError>;

    fn run(
        &self,
        model: ModelHandle,
        input_name: &str,
        input: &Tensor,
    ) -> Result<ModelOutputs, BackendError>;

    fn release(&self, model: ModelHandle) -> Result<(), BackendError>;
}

struct LoadedModel<S> {
    model_id: String,
    session: Arc<Mutex<S>>,
    output_names: Vec<String>,
    /// Outstanding `load` calls that returned this handle.
    refs: usize,
}

/// Reference-counted session cache keyed by model id.
struct Registry<S> {
    next_handle: u64,
    by_model_id: HashMap<String, ModelHandle>,
    models: HashMap<ModelHandle, LoadedModel<S>>,
}

impl<S> Default for Registry<S> {
    fn default() -> Self {
        Self {
            next_handle: 0,
            by_model_id: HashMap::new(),
            models: HashMap::new(),
        }
    }
}

impl<S> Registry<S> {
    /// Take another reference to an already-loaded model.
    fn acquire(&mut self, model_id: &str) -> Option<ModelHandle> {
        let handle = *self.by_model_id.get(model_id)?;
        let loaded = self.models.get_mut(&handle)?;
        loaded.refs += 1;
        Some(handle)
    }

    fn insert(&mut self, model_id: &str, session: S, output_names: Vec<String>) -> ModelHandle {
        let handle = ModelHandle(self.next_handle);
        self.next_handle += 1;
        self.by_model_id.insert(model_id.to_string(), handle);
        self.models.insert(
            handle,
            LoadedModel {
                model_id: model_id.to_string(),
                session: Arc::new(Mutex::new(session)),
                output_names,
                refs: 1,
            },
        );
        handle
    }

    fn get(&self, model: ModelHandle) -> Option<&LoadedModel<S>> {
        self.models.get(&model)
    }

    /// Drop one reference. Returns the model id once the last reference is gone.
    fn release(&mut self, model: ModelHandle) -> Result<Option<String>, BackendError> {
        let loaded = self
            .models
            .get_mut(&model)
            .ok_or(BackendError::UnknownModel(model))?;
        loaded.refs -= 1;
        if loaded.refs > 0 {
            return Ok(None);
        }
        let loaded = self
            .models
            .remove(&model)
            .ok_or(BackendError::UnknownModel(model))?;
        self.by_model_id.remove(&loaded.model_id);
        Ok(Some(loaded.model_id))
    }
}

/// ONNX Runtime backend. Model ids are paths to `.onnx` files.
///
/// Sessions are cached by model id: loading the same file twice returns the
/// same handle, and the session is dropped only after a matching number of
/// `release` calls. Runs against one session are serialised by a per-session mutex,
/// runs against different sessions proceed in parallel.
pub struct OrtBackend {
    intra_threads: usize,
    registry: RwLock<Registry<Session>>,
}

impl OrtBackend {
    pub fn new(intra_threads: usize) -> Self {
        Self {
            intra_threads: intra_threads.max(1),
            registry: RwLock::new(Registry::default()),
        }
    }

    /// Number of sessions currently held.
    pub fn loaded_models(&self) -> usize {
        self.registry.read().map(|r| r.models.len()).unwrap_or(0)
    }

    fn session_for(
        &self,
        model: ModelHandle,
    ) -> Result<(Arc<Mutex<Session>>, Vec<String>), BackendError> {
        let registry = self
            .registry
            .read()
            .map_err(|_| BackendError::Unavailable("model registry lock poisoned".into()))?;
        let loaded = registry.get(model).ok_or(BackendError::UnknownModel(model))?;
        Ok((Arc::clone(&loaded.session), loaded.output_names.clone()))
    }
}

impl Default for OrtBackend {
    fn default() -> Self {
        Self::new(2)
    }
}

impl InferenceBackend for OrtBackend {
    fn load(&self, model_id: &str) -> Result<ModelHandle, BackendError> {
        if let Some(handle) = self
            .registry
            .write()
            .map_err(|_| BackendError::Unavailable("model registry lock poisoned".into()))?
            .acquire(model_id)
        {
            tracing::debug!(model = model_id, "reusing cached session");
            return Ok(handle);
        }

        if !Path::new(model_id).exists() {
            return Err(BackendError::ModelNotFound(model_id.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(self.intra_threads)
            .map_err(ort::Error::from)?
            .commit_from_file(model_id)?;

        let output_names: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();

        tracing::info!(
            path = model_id,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?output_names,
            "loaded ONNX model"
        );

        let mut registry = self
            .registry
            .write()
            .map_err(|_| BackendError::Unavailable("model registry lock poisoned".into()))?;

        // Another caller may have loaded the same file while we were building the session.
        if let Some(handle) = registry.acquire(model_id) {
            return Ok(handle);
        }

        Ok(registry.insert(model_id, session, output_names))
    }

    fn run(
        &self,
        model: ModelHandle,
        input_name: &str,
        input: &Tensor,
    ) -> Result<ModelOutputs, BackendError> {
        let (session, output_names) = self.session_for(model)?;
        let mut session = session
            .lock()
            .map_err(|_| BackendError::Unavailable(format!("session {model:?} lock poisoned")))?;

        let outputs = session.run(ort::inputs![
            input_name => TensorRef::from_array_view(input.view())?
        ])?;

        let mut result = ModelOutputs::new();
        for name in &output_names {
            let (shape, data) = outputs[name.as_str()]
                .try_extract_tensor::<f32>()
                .map_err(|e| BackendError::ExecutionFailed(format!("output {name}: {e}")))?;

            let dims = shape
                .iter()
                .map(|&d| usize::try_from(d))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|_| {
                    BackendError::ExecutionFailed(format!("output {name}: negative dimension in {shape:?}"))
                })?;

            let tensor = Tensor::from_shape_vec(IxDyn(&dims), data.to_vec())
                .map_err(|e| BackendError::ExecutionFailed(format!("output {name}: {e}")))?;
            result.insert(name.clone(), tensor);
        }

        Ok(result)
    }

    fn release(&self, model: ModelHandle) -> Result<(), BackendError> {
        let mut registry = self
            .registry
            .write()
            .map_err(|_| BackendError::Unavailable("model registry lock poisoned".into()))?;
        match registry.release(model)? {
            Some(model_id) => tracing::info!(path = %model_id, "released ONNX model"),
            None => tracing::debug!(?model, "session still referenced; keeping it loaded"),
        }
        Ok(())
    }
}
