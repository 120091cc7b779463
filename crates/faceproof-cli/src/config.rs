use faceproof_core::PipelineConfig;
use std::path::PathBuf;

const DEFAULT_DETECTOR_MODEL: &str = "yolov11n-face.onnx";
const DEFAULT_CLASSIFIER_MODEL: &str = "deepfake_binary_s128_e5_early.onnx";

/// CLI configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// File name of the face detection model inside `model_dir`.
    pub detector_model: String,
    /// File name of the real/fake classification model inside `model_dir`.
    pub classifier_model: String,
    /// ONNX Runtime intra-op threads per session.
    pub intra_threads: usize,
    /// Timeout for fetching remote images.
    pub http_timeout_secs: u64,
    pub pipeline: PipelineConfig,
}

impl Config {
    /// Load configuration from `FACEPROOF_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let parse_or = |key: &str, default: f32| -> f32 {
            var(key).and_then(|v| v.parse().ok()).unwrap_or(default)
        };
        let parse_u32_or = |key: &str, default: u32| -> u32 {
            var(key).and_then(|v| v.parse().ok()).unwrap_or(default)
        };

        let model_dir = var("FACEPROOF_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| default_model_dir(&var));

        let defaults = PipelineConfig::default();
        let nms_iou_threshold = match var("FACEPROOF_NMS_IOU").as_deref() {
            Some("off") | Some("none") | Some("0") => None,
            Some(v) => v.parse().ok().or(defaults.nms_iou_threshold),
            None => defaults.nms_iou_threshold,
        };

        let pipeline = PipelineConfig {
            confidence_threshold: parse_or("FACEPROOF_CONFIDENCE_THRESHOLD", defaults.confidence_threshold),
            extend_ratio: parse_or("FACEPROOF_EXTEND_RATIO", defaults.extend_ratio),
            detector_input_size: parse_u32_or("FACEPROOF_DETECTOR_INPUT_SIZE", defaults.detector_input_size),
            classifier_input_size: parse_u32_or(
                "FACEPROOF_CLASSIFIER_INPUT_SIZE",
                defaults.classifier_input_size,
            ),
            nms_iou_threshold,
            ..defaults
        };

        Self {
            model_dir,
            detector_model: var("FACEPROOF_DETECTOR_MODEL")
                .unwrap_or_else(|| DEFAULT_DETECTOR_MODEL.to_string()),
            classifier_model: var("FACEPROOF_CLASSIFIER_MODEL")
                .unwrap_or_else(|| DEFAULT_CLASSIFIER_MODEL.to_string()),
            intra_threads: var("FACEPROOF_INTRA_THREADS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(2),
            http_timeout_secs: var("FACEPROOF_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            pipeline,
        }
    }

    /// Path to the face detection model.
    pub fn detector_model_path(&self) -> String {
        self.model_dir
            .join(&self.detector_model)
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the real/fake classification model.
    pub fn classifier_model_path(&self) -> String {
        self.model_dir
            .join(&self.classifier_model)
            .to_string_lossy()
            .into_owned()
    }
}

fn default_model_dir(var: &impl Fn(&str) -> Option<String>) -> PathBuf {
    var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = var("HOME").unwrap_or_else(|| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("faceproof")
        .join("models")
}
