//! YOLO face detector over an [`InferenceBackend`].
//!
//! The model takes a `[1, 3, S, S]` tensor scaled to [0, 1] and emits
//! `[1, N, 6]` rows of `(x1, y1, x2, y2, score, class)` in input space.
//! Rows are rescaled to the source image, filtered by score, and passed
//! through greedy IoU suppression unless that step is disabled.

use crate::backend::{BackendError, InferenceBackend, ModelHandle, Tensor};
use crate::tensor::{build_tensor, Normalization, TensorError};
use crate::types::{FaceBox, PipelineConfig};
use image::RgbImage;
use ndarray::Ix3;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

const YOLO_ROW_WIDTH: usize = 6;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("tensor: {0}")]
    Tensor(#[from] TensorError),
    #[error("backend: {0}")]
    Backend(#[from] BackendError),
    #[error("malformed detector output: {0}")]
    MalformedOutput(String),
}

/// YOLO-based face detector.
pub struct FaceDetector {
    backend: Arc<dyn InferenceBackend>,
    model: ModelHandle,
    input_size: u32,
    input_name: String,
    nms_iou_threshold: Option<f32>,
}

impl FaceDetector {
    /// Load the detection model through `backend`.
    pub fn load(
        backend: Arc<dyn InferenceBackend>,
        model_id: &str,
        config: &PipelineConfig,
    ) -> Result<Self, DetectorError> {
        let model = backend.load(model_id)?;
        tracing::info!(model = model_id, input_size = config.detector_input_size, "face detector ready");
        Ok(Self::new(backend, model, config))
    }

    /// Wrap an already-loaded model.
    pub fn new(backend: Arc<dyn InferenceBackend>, model: ModelHandle, config: &PipelineConfig) -> Self {
        Self {
            backend,
            model,
            input_size: config.detector_input_size,
            input_name: config.detector_input_name.clone(),
            nms_iou_threshold: config.nms_iou_threshold,
        }
    }

    pub fn model(&self) -> ModelHandle {
        self.model
    }

    /// Detect faces scoring at least `confidence_threshold`, in image pixel space.
    ///
    /// Never fails: any tensor, backend, or decode error is logged and reported
    /// as "no faces". Boxes keep the model's row order.
    pub fn detect_faces(&self, image: &RgbImage, confidence_threshold: f32) -> Vec<FaceBox> {
        match self.try_detect_faces(image, confidence_threshold) {
            Ok(boxes) => boxes,
            Err(e) => {
                tracing::warn!(error = %e, "face detection failed; treating as no faces");
                Vec::new()
            }
        }
    }

    /// Like [`detect_faces`](Self::detect_faces) but surfaces the failure.
    pub fn try_detect_faces(
        &self,
        image: &RgbImage,
        confidence_threshold: f32,
    ) -> Result<Vec<FaceBox>, DetectorError> {
        let started = Instant::now();
        let input = build_tensor(image, self.input_size, Normalization::Scale01)?.into_dyn();

        let outputs = self.backend.run(self.model, &self.input_name, &input)?;
        let raw = outputs
            .first()
            .ok_or_else(|| DetectorError::MalformedOutput("model produced no outputs".into()))?;

        let scale_x = image.width() as f32 / self.input_size as f32;
        let scale_y = image.height() as f32 / self.input_size as f32;
        let candidates = decode_rows(raw, scale_x, scale_y, confidence_threshold)?;
        let candidate_count = candidates.len();

        let boxes = match self.nms_iou_threshold {
            Some(iou_threshold) => nms(candidates, iou_threshold),
            None => candidates,
        };

        tracing::debug!(
            candidates = candidate_count,
            kept = boxes.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "face detection complete"
        );

        Ok(boxes)
    }
}

/// Decode `[1, N, 6]` detector rows, rescale to image space, and drop rows
/// scoring below `threshold` or carrying non-finite values.
fn decode_rows(
    raw: &Tensor,
    scale_x: f32,
    scale_y: f32,
    threshold: f32,
) -> Result<Vec<FaceBox>, DetectorError> {
    let rows = raw.view().into_dimensionality::<Ix3>().map_err(|_| {
        DetectorError::MalformedOutput(format!("expected rank-3 output, got shape {:?}", raw.shape()))
    })?;

    let (batch, _, width) = rows.dim();
    if batch != 1 || width < YOLO_ROW_WIDTH {
        return Err(DetectorError::MalformedOutput(format!(
            "expected [1, N, {YOLO_ROW_WIDTH}] output, got shape {:?}",
            raw.shape()
        )));
    }

    let mut boxes = Vec::new();
    for row in rows.index_axis(ndarray::Axis(0), 0).outer_iter() {
        let score = row[4];
        if score < threshold {
            continue;
        }
        let decoded = FaceBox::new(
            row[0] * scale_x,
            row[1] * scale_y,
            row[2] * scale_x,
            row[3] * scale_y,
            score,
            row[5],
        );
        match decoded {
            Some(face) => boxes.push(face),
            None => tracing::debug!(?row, "skipping detection with non-finite values"),
        }
    }

    Ok(boxes)
}

/// Greedy Non-Maximum Suppression.
///
/// Visits boxes from highest to lowest score and suppresses any later box
/// whose IoU with a kept box exceeds `iou_threshold`. Survivors are returned
/// in their original order.
pub fn nms(boxes: Vec<FaceBox>, iou_threshold: f32) -> Vec<FaceBox> {
    let mut order: Vec<usize> = (0..boxes.len()).collect();
    order.sort_by(|&a, &b| {
        boxes[b]
            .score
            .partial_cmp(&boxes[a].score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut suppressed = vec![false; boxes.len()];
    for (pos, &i) in order.iter().enumerate() {
        if suppressed[i] {
            continue;
        }
        for &j in &order[pos + 1..] {
            if !suppressed[j] && boxes[i].iou(&boxes[j]) > iou_threshold {
                suppressed[j] = true;
            }
        }
    }

    boxes
        .into_iter()
        .zip(suppressed)
        .filter_map(|(face, dropped)| (!dropped).then_some(face))
        .collect()
}
