//! In-memory backend for unit tests.

use crate::backend::{BackendError, InferenceBackend, ModelHandle, ModelOutputs, Tensor};
use ndarray::{Array2, Array3};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

type Handler = dyn Fn(&str, &Tensor) -> Result<ModelOutputs, BackendError> + Send + Sync;

/// Backend that answers every `run` with a closure over (model id, input tensor).
pub(crate) struct ScriptedBackend {
    handler: Box<Handler>,
    models: Mutex<Vec<String>>,
    pub runs: AtomicUsize,
    pub released: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new(
        handler: impl Fn(&str, &Tensor) -> Result<ModelOutputs, BackendError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            handler: Box::new(handler),
            models: Mutex::new(Vec::new()),
            runs: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
        }
    }
}

impl InferenceBackend for ScriptedBackend {
    fn load(&self, model_id: &str) -> Result<ModelHandle, BackendError> {
        let mut models = self.models.lock().unwrap();
        models.push(model_id.to_string());
        Ok(ModelHandle(models.len() as u64 - 1))
    }

    fn run(
        &self,
        model: ModelHandle,
        _input_name: &str,
        input: &Tensor,
    ) -> Result<ModelOutputs, BackendError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let model_id = self
            .models
            .lock()
            .unwrap()
            .get(model.0 as usize)
            .cloned()
            .ok_or(BackendError::UnknownModel(model))?;
        (self.handler)(&model_id, input)
    }

    fn release(&self, _model: ModelHandle) -> Result<(), BackendError> {
        self.released.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Detector output `[1, N, 6]` from `(x1, y1, x2, y2, score, class)` rows.
pub(crate) fn detector_rows(rows: &[[f32; 6]]) -> ModelOutputs {
    let flat: Vec<f32> = rows.iter().flatten().copied().collect();
    let tensor = Array3::from_shape_vec((1, rows.len(), 6), flat).unwrap();
    ModelOutputs::new().with("output0", tensor.into_dyn())
}

/// Classifier output `[1, 2]` as `[fake_logit, real_logit]`.
pub(crate) fn logits(fake: f32, real: f32) -> ModelOutputs {
    let tensor = Array2::from_shape_vec((1, 2), vec![fake, real]).unwrap();
    ModelOutputs::new().with("output", tensor.into_dyn())
}
