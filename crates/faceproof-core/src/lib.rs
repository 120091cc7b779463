//! faceproof-core — Deepfake detection pipeline.
//!
//! A YOLO face detector locates faces, each face is cropped with padding, and
//! a binary classifier labels every crop Real or Fake. Both models run through
//! the [`InferenceBackend`] capability; [`OrtBackend`] provides ONNX Runtime.

pub mod backend;
pub mod classifier;
pub mod detector;
pub mod orchestrator;
pub mod region;
pub mod tensor;
pub mod types;

#[cfg(test)]
mod testing;

pub use backend::{BackendError, InferenceBackend, ModelHandle, ModelOutputs, OrtBackend, Tensor};
pub use classifier::Classifier;
pub use detector::FaceDetector;
pub use orchestrator::{best_index, select_best, AnalysisOptions, CancelToken, DeepfakeDetector, PipelineError};
pub use tensor::{build_tensor, Normalization};
pub use types::{Classification, DetectionResult, FaceBox, Label, PipelineConfig};
