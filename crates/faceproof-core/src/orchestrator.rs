//! End-to-end deepfake analysis: detect faces, crop each one, classify the
//! crops, and aggregate.
//!
//! When the detector finds nothing, the whole image is classified instead and
//! reported with `face_index == -1`. Failures on individual faces are logged
//! and the face is dropped; once faces were found there is no whole-image
//! fallback.

use crate::backend::{BackendError, InferenceBackend};
use crate::classifier::{Classifier, ClassifierError};
use crate::detector::{DetectorError, FaceDetector};
use crate::region;
use crate::types::{ConfigError, DetectionResult, FaceBox, PipelineConfig};
use image::RgbImage;
use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("config: {0}")]
    Config(#[from] ConfigError),
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("classifier: {0}")]
    Classifier(#[from] ClassifierError),
}

/// Cooperative cancellation flag shared between a caller and a running analysis.
///
/// Checked before each face is classified; work already started runs to completion.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-call analysis parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnalysisOptions {
    pub confidence_threshold: f32,
    pub extend_ratio: f32,
    /// Classify faces on the rayon pool instead of the calling thread.
    pub parallel: bool,
}

impl AnalysisOptions {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            confidence_threshold: config.confidence_threshold,
            extend_ratio: config.extend_ratio,
            parallel: false,
        }
    }

    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }
}

/// Face detector + real/fake classifier pipeline.
pub struct DeepfakeDetector {
    detector: FaceDetector,
    classifier: Classifier,
    config: PipelineConfig,
}

impl DeepfakeDetector {
    /// Validate `config` and load both models through `backend`.
    pub fn load(
        backend: Arc<dyn InferenceBackend>,
        detector_model: &str,
        classifier_model: &str,
        config: PipelineConfig,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let detector = FaceDetector::load(Arc::clone(&backend), detector_model, &config)?;
        let classifier = Classifier::load(backend, classifier_model, &config)?;
        Ok(Self {
            detector,
            classifier,
            config,
        })
    }

    pub fn new(
        detector: FaceDetector,
        classifier: Classifier,
        config: PipelineConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            detector,
            classifier,
            config,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn detector(&self) -> &FaceDetector {
        &self.detector
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    /// Default options derived from the pipeline config.
    pub fn default_options(&self) -> AnalysisOptions {
        AnalysisOptions::from_config(&self.config)
    }

    /// Classify every detected face, in detection order, or the whole image
    /// when no face is found.
    pub fn analyze_all(
        &self,
        image: &RgbImage,
        confidence_threshold: f32,
        extend_ratio: f32,
    ) -> Vec<DetectionResult> {
        let options = AnalysisOptions {
            confidence_threshold,
            extend_ratio,
            parallel: false,
        };
        self.analyze_all_with(image, &options, &CancelToken::new())
    }

    /// The most confident result of [`analyze_all`](Self::analyze_all).
    /// Ties go to the earliest face.
    pub fn analyze_best(
        &self,
        image: &RgbImage,
        confidence_threshold: f32,
        extend_ratio: f32,
    ) -> Option<DetectionResult> {
        select_best(self.analyze_all(image, confidence_threshold, extend_ratio))
    }

    /// [`analyze_all`](Self::analyze_all) with explicit options and a cancellation token.
    ///
    /// On cancellation, returns the results completed so far.
    pub fn analyze_all_with(
        &self,
        image: &RgbImage,
        options: &AnalysisOptions,
        cancel: &CancelToken,
    ) -> Vec<DetectionResult> {
        let started = Instant::now();
        if cancel.is_cancelled() {
            tracing::info!("analysis cancelled before start");
            return Vec::new();
        }

        let options = self.sanitize(options);
        let boxes = self.detector.detect_faces(image, options.confidence_threshold);
        tracing::debug!(
            faces = boxes.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "detection stage done"
        );

        let results = if boxes.is_empty() {
            self.classify_whole_image(image, cancel)
        } else if options.parallel {
            self.classify_faces_parallel(image, &boxes, options.extend_ratio, cancel)
        } else {
            self.classify_faces(image, &boxes, options.extend_ratio, cancel)
        };

        tracing::info!(
            faces = boxes.len(),
            results = results.len(),
            cancelled = cancel.is_cancelled(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "analysis complete"
        );

        results
    }

    pub fn analyze_best_with(
        &self,
        image: &RgbImage,
        options: &AnalysisOptions,
        cancel: &CancelToken,
    ) -> Option<DetectionResult> {
        select_best(self.analyze_all_with(image, options, cancel))
    }

    /// Release both models held by this pipeline.
    pub fn release(self, backend: &dyn InferenceBackend) -> Result<(), BackendError> {
        backend.release(self.detector.model())?;
        backend.release(self.classifier.model())
    }

    /// Bring per-call parameters into the ranges `PipelineConfig::validate`
    /// enforces. Non-finite values fall back to the configured ones.
    fn sanitize(&self, options: &AnalysisOptions) -> AnalysisOptions {
        let mut checked = *options;
        if !checked.confidence_threshold.is_finite() {
            checked.confidence_threshold = self.config.confidence_threshold;
        }
        checked.confidence_threshold = checked.confidence_threshold.clamp(0.0, 1.0);
        if !checked.extend_ratio.is_finite() {
            checked.extend_ratio = self.config.extend_ratio;
        }
        checked.extend_ratio = checked.extend_ratio.max(0.0);

        if checked != *options {
            tracing::warn!(
                requested_threshold = options.confidence_threshold,
                requested_extend_ratio = options.extend_ratio,
                threshold = checked.confidence_threshold,
                extend_ratio = checked.extend_ratio,
                "analysis parameters out of range; adjusted"
            );
        }
        checked
    }

    fn classify_whole_image(&self, image: &RgbImage, cancel: &CancelToken) -> Vec<DetectionResult> {
        if cancel.is_cancelled() {
            return Vec::new();
        }
        match self.classifier.classify(image) {
            Ok(c) => vec![DetectionResult {
                face_index: DetectionResult::NO_FACE,
                label: c.label,
                confidence: c.confidence,
                cropped_image: image.clone(),
            }],
            Err(e) => {
                tracing::warn!(error = %e, "whole-image classification failed");
                Vec::new()
            }
        }
    }

    fn classify_faces(
        &self,
        image: &RgbImage,
        boxes: &[FaceBox],
        extend_ratio: f32,
        cancel: &CancelToken,
    ) -> Vec<DetectionResult> {
        let mut results = Vec::with_capacity(boxes.len());
        for (i, face) in boxes.iter().enumerate() {
            if cancel.is_cancelled() {
                tracing::info!(completed = results.len(), remaining = boxes.len() - i, "analysis cancelled");
                break;
            }
            if let Some(result) = self.classify_face(image, i, face, extend_ratio) {
                results.push(result);
            }
        }
        results
    }

    fn classify_faces_parallel(
        &self,
        image: &RgbImage,
        boxes: &[FaceBox],
        extend_ratio: f32,
        cancel: &CancelToken,
    ) -> Vec<DetectionResult> {
        let mut results: Vec<DetectionResult> = boxes
            .par_iter()
            .enumerate()
            .filter_map(|(i, face)| {
                if cancel.is_cancelled() {
                    return None;
                }
                self.classify_face(image, i, face, extend_ratio)
            })
            .collect();
        results.sort_by_key(|r| r.face_index);
        results
    }

    fn classify_face(
        &self,
        image: &RgbImage,
        index: usize,
        face: &FaceBox,
        extend_ratio: f32,
    ) -> Option<DetectionResult> {
        let cropped = region::expand(image, face, extend_ratio);
        match self.classifier.classify(&cropped) {
            Ok(c) => Some(DetectionResult {
                face_index: index as i32,
                label: c.label,
                confidence: c.confidence,
                cropped_image: cropped.into_owned(),
            }),
            Err(e) => {
                tracing::warn!(face_index = index, error = %e, "face classification failed; dropping face");
                None
            }
        }
    }
}

/// Position of the highest-confidence result; the first one wins ties.
pub fn best_index(results: &[DetectionResult]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (i, candidate) in results.iter().enumerate() {
        match best {
            Some(b) if results[b].confidence >= candidate.confidence => {}
            _ => best = Some(i),
        }
    }
    best
}

/// Highest-confidence result; the first one wins ties.
pub fn select_best(mut results: Vec<DetectionResult>) -> Option<DetectionResult> {
    best_index(&results).map(|i| results.swap_remove(i))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ModelOutputs;
    use crate::testing::{detector_rows, logits, ScriptedBackend};
    use crate::types::Label;
    use image::Rgb;
    use std::sync::atomic::AtomicUsize;

    const DETECTOR: &str = "yolov11n-face.onnx";
    const CLASSIFIER: &str = "deepfake_binary_s128.onnx";

    /// Classifier logits keyed on the crop's red level so each face gets a
    /// distinct, predictable verdict.
    fn red_keyed_logits(input: &crate::backend::Tensor) -> ModelOutputs {
        // Scale01 red 1.0 → ImageNet-normalised ~2.25; red 0 → ~-2.12.
        let red = input[[0, 0, 0, 0]];
        if red > 0.0 {
            logits(2.0, 0.5)
        } else {
            logits(0.0, 3.0)
        }
    }

    fn pipeline(
        rows: Vec<[f32; 6]>,
        classify: impl Fn(&crate::backend::Tensor) -> Result<ModelOutputs, BackendError> + Send + Sync + 'static,
    ) -> (DeepfakeDetector, Arc<ScriptedBackend>) {
        let backend = Arc::new(ScriptedBackend::new(move |model, input| {
            if model == DETECTOR {
                Ok(detector_rows(&rows))
            } else {
                classify(input)
            }
        }));
        let detector = DeepfakeDetector::load(
            backend.clone(),
            DETECTOR,
            CLASSIFIER,
            PipelineConfig::default(),
        )
        .unwrap();
        (detector, backend)
    }

    /// Left half red, right half black, 640×640 so detector space == image space.
    fn two_tone_image() -> RgbImage {
        RgbImage::from_fn(640, 640, |x, _| if x < 320 { Rgb([255, 0, 0]) } else { Rgb([0, 0, 0]) })
    }

    fn two_faces() -> Vec<[f32; 6]> {
        vec![
            [100.0, 100.0, 200.0, 200.0, 0.9, 0.0],
            [420.0, 300.0, 520.0, 400.0, 0.95, 0.0],
        ]
    }

    #[test]
    fn test_two_faces_in_order() {
        let (detector, _) = pipeline(two_faces(), |input| Ok(red_keyed_logits(input)));
        let results = detector.analyze_all(&two_tone_image(), 0.8, 0.5);

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].face_index, 0);
        assert_eq!(results[0].label, Label::Fake);
        assert!((results[0].confidence - 0.8176).abs() < 1e-3);
        assert_eq!(results[1].face_index, 1);
        assert_eq!(results[1].label, Label::Real);
        assert!(results[1].confidence > 0.95);
        // 100x100 face, ratio 0.5 → 170x185 crop
        assert_eq!(results[0].cropped_image.dimensions(), (170, 185));
    }

    #[test]
    fn test_best_is_most_confident() {
        let (detector, _) = pipeline(two_faces(), |input| Ok(red_keyed_logits(input)));
        let best = detector.analyze_best(&two_tone_image(), 0.8, 0.5).unwrap();
        assert_eq!(best.face_index, 1);
        assert_eq!(best.label, Label::Real);
    }

    #[test]
    fn test_low_score_falls_back_to_whole_image() {
        let rows = vec![[0.0, 0.0, 100.0, 100.0, 0.5, 0.0]];
        let (detector, _) = pipeline(rows, |_| Ok(logits(0.0, 1.0)));
        let image = RgbImage::from_pixel(50, 30, Rgb([4, 5, 6]));

        let results = detector.analyze_all(&image, 0.8, 0.5);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].face_index, -1);
        assert!(results[0].is_whole_image());
        assert_eq!(results[0].cropped_image, image);
    }

    #[test]
    fn test_failed_faces_are_dropped_without_fallback() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let (detector, _) = pipeline(two_faces(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(BackendError::ExecutionFailed("oom".into()))
        });
        let results = detector.analyze_all(&two_tone_image(), 0.8, 0.5);
        assert!(results.is_empty());
        // One attempt per face, no whole-image retry.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(detector.analyze_best(&two_tone_image(), 0.8, 0.5).is_none());
    }

    #[test]
    fn test_one_failed_face_keeps_the_other() {
        let (detector, _) = pipeline(two_faces(), |input| {
            if input[[0, 0, 0, 0]] > 0.0 {
                Ok(ModelOutputs::new())
            } else {
                Ok(logits(0.0, 3.0))
            }
        });
        let results = detector.analyze_all(&two_tone_image(), 0.8, 0.5);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].face_index, 1);
    }

    #[test]
    fn test_whole_image_failure_yields_empty() {
        let (detector, _) = pipeline(vec![], |_| Err(BackendError::Unavailable("down".into())));
        assert!(detector.analyze_all(&RgbImage::new(10, 10), 0.8, 0.5).is_empty());
    }

    #[test]
    fn test_detector_failure_falls_back_to_whole_image() {
        let backend = Arc::new(ScriptedBackend::new(|model, _| {
            if model == DETECTOR {
                Err(BackendError::ExecutionFailed("bad graph".into()))
            } else {
                Ok(logits(1.0, 0.0))
            }
        }));
        let detector =
            DeepfakeDetector::load(backend, DETECTOR, CLASSIFIER, PipelineConfig::default()).unwrap();
        let results = detector.analyze_all(&RgbImage::new(10, 10), 0.8, 0.5);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].face_index, -1);
        assert_eq!(results[0].label, Label::Fake);
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let rows: Vec<[f32; 6]> = (0..8)
            .map(|i| {
                let x = (i * 80) as f32;
                [x, 10.0, x + 40.0, 50.0, 0.9, 0.0]
            })
            .collect();
        let (detector, _) = pipeline(rows, |input| Ok(red_keyed_logits(input)));
        let image = two_tone_image();
        let options = detector.default_options();

        let sequential = detector.analyze_all_with(&image, &options, &CancelToken::new());
        let parallel = detector.analyze_all_with(&image, &options.parallel(true), &CancelToken::new());

        assert_eq!(sequential.len(), 8);
        let key = |r: &DetectionResult| (r.face_index, r.label, r.confidence);
        assert_eq!(
            sequential.iter().map(key).collect::<Vec<_>>(),
            parallel.iter().map(key).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_cancelled_before_start() {
        let (detector, backend) = pipeline(two_faces(), |_| Ok(logits(0.0, 1.0)));
        let cancel = CancelToken::new();
        cancel.cancel();
        let results = detector.analyze_all_with(&two_tone_image(), &detector.default_options(), &cancel);
        assert!(results.is_empty());
        assert_eq!(backend.runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cancel_mid_run_keeps_completed_faces() {
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let (detector, _) = pipeline(two_faces(), move |_| {
            // Cancel as soon as the first face is being classified.
            trigger.cancel();
            Ok(logits(0.0, 1.0))
        });
        let results = detector.analyze_all_with(&two_tone_image(), &detector.default_options(), &cancel);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].face_index, 0);
    }

    #[test]
    fn test_select_best_tie_goes_to_first() {
        let make = |i: i32, c: f32| DetectionResult {
            face_index: i,
            label: Label::Real,
            confidence: c,
            cropped_image: RgbImage::new(1, 1),
        };
        let results = vec![make(0, 0.7), make(1, 0.9), make(2, 0.9)];
        assert_eq!(best_index(&results), Some(1));
        let best = select_best(results).unwrap();
        assert_eq!(best.face_index, 1);
        assert!(select_best(vec![]).is_none());
        assert_eq!(best_index(&[make(0, 0.2)]), Some(0));
    }

    #[test]
    fn test_nan_threshold_uses_configured_one() {
        let rows = vec![
            [100.0, 100.0, 200.0, 200.0, 0.5, 0.0],
            [420.0, 300.0, 520.0, 400.0, 0.95, 0.0],
        ];
        let (detector, _) = pipeline(rows, |input| Ok(red_keyed_logits(input)));
        let results = detector.analyze_all(&two_tone_image(), f32::NAN, 0.5);
        // The 0.5 row stays below the configured 0.8 threshold.
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].face_index, 0);
        assert_eq!(results[0].label, Label::Real);
    }

    #[test]
    fn test_negative_extend_ratio_crops_the_plain_box() {
        let (detector, _) = pipeline(two_faces(), |input| Ok(red_keyed_logits(input)));
        let results = detector.analyze_all(&two_tone_image(), 0.8, -0.5);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].cropped_image.dimensions(), (100, 100));
    }

    #[test]
    fn test_load_rejects_invalid_config() {
        let backend = Arc::new(ScriptedBackend::new(|_, _| Ok(logits(0.0, 0.0))));
        let config = PipelineConfig { detector_input_size: 0, ..Default::default() };
        assert!(matches!(
            DeepfakeDetector::load(backend, DETECTOR, CLASSIFIER, config),
            Err(PipelineError::Config(_))
        ));
    }

    #[test]
    fn test_release_frees_both_models() {
        let (detector, backend) = pipeline(vec![], |_| Ok(logits(0.0, 0.0)));
        detector.release(backend.as_ref()).unwrap();
        assert_eq!(backend.released.load(Ordering::SeqCst), 2);
    }
}
