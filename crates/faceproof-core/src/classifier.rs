//! Binary real/fake classifier over an [`InferenceBackend`].
//!
//! Takes a face crop (or any image region), feeds a 128×128 ImageNet-normalised
//! tensor to the model, and turns the `[fake, real]` logits into probabilities.

use crate::backend::{BackendError, InferenceBackend, ModelHandle, Tensor};
use crate::tensor::{build_tensor, Normalization, TensorError};
use crate::types::{Classification, Label, PipelineConfig};
use image::RgbImage;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

// Output layout: index 0 = Fake, index 1 = Real.
const FAKE_INDEX: usize = 0;
const REAL_INDEX: usize = 1;

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("tensor: {0}")]
    Tensor(#[from] TensorError),
    #[error("backend: {0}")]
    Backend(#[from] BackendError),
    #[error("malformed classifier output: {0}")]
    MalformedOutput(String),
}

/// Real/fake image classifier.
pub struct Classifier {
    backend: Arc<dyn InferenceBackend>,
    model: ModelHandle,
    input_size: u32,
    input_name: String,
}

impl Classifier {
    /// Load the classification model through `backend`.
    pub fn load(
        backend: Arc<dyn InferenceBackend>,
        model_id: &str,
        config: &PipelineConfig,
    ) -> Result<Self, ClassifierError> {
        let model = backend.load(model_id)?;
        tracing::info!(model = model_id, input_size = config.classifier_input_size, "classifier ready");
        Ok(Self::new(backend, model, config))
    }

    pub fn new(backend: Arc<dyn InferenceBackend>, model: ModelHandle, config: &PipelineConfig) -> Self {
        Self {
            backend,
            model,
            input_size: config.classifier_input_size,
            input_name: config.classifier_input_name.clone(),
        }
    }

    pub fn model(&self) -> ModelHandle {
        self.model
    }

    /// Classify one image region. Ties between the two classes resolve to Fake.
    pub fn classify(&self, image: &RgbImage) -> Result<Classification, ClassifierError> {
        let started = Instant::now();
        let input = build_tensor(image, self.input_size, Normalization::imagenet())?.into_dyn();

        let outputs = self.backend.run(self.model, &self.input_name, &input)?;
        let raw = outputs
            .first()
            .ok_or_else(|| ClassifierError::MalformedOutput("model produced no outputs".into()))?;

        let (fake_logit, real_logit) = extract_logits(raw)?;
        let classification = decide(fake_logit, real_logit)?;

        tracing::debug!(
            fake_logit,
            real_logit,
            label = %classification.label,
            confidence = classification.confidence,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "classified region"
        );

        Ok(classification)
    }
}

/// Pull `[fake, real]` out of a `[1, 2]` output tensor.
fn extract_logits(raw: &Tensor) -> Result<(f32, f32), ClassifierError> {
    if raw.shape() != [1, 2] {
        return Err(ClassifierError::MalformedOutput(format!(
            "expected [1, 2] logits, got shape {:?}",
            raw.shape()
        )));
    }
    Ok((raw[[0, FAKE_INDEX]], raw[[0, REAL_INDEX]]))
}

/// Two-class softmax, computed with the larger logit subtracted for stability.
pub fn softmax2(a: f32, b: f32) -> (f32, f32) {
    let max = a.max(b);
    let ea = (a - max).exp();
    let eb = (b - max).exp();
    let sum = ea + eb;
    (ea / sum, eb / sum)
}

fn decide(fake_logit: f32, real_logit: f32) -> Result<Classification, ClassifierError> {
    if !fake_logit.is_finite() || !real_logit.is_finite() {
        return Err(ClassifierError::MalformedOutput(format!(
            "non-finite logits [{fake_logit}, {real_logit}]"
        )));
    }

    let (fake_probability, real_probability) = softmax2(fake_logit, real_logit);
    let (label, confidence) = if fake_probability >= real_probability {
        (Label::Fake, fake_probability)
    } else {
        (Label::Real, real_probability)
    };

    Ok(Classification {
        label,
        confidence,
        fake_probability,
        real_probability,
    })
}
