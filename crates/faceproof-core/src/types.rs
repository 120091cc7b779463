use image::RgbImage;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use thiserror::Error;

/// Face bounding box in original image pixel space, as produced by the detector.
///
/// Boxes built with [`FaceBox::new`] have normalised corners (`x2 >= x1`,
/// `y2 >= y1`) and finite values. Struct literals skip that check, so
/// consumers such as the region expander still clamp.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FaceBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    /// Detector score in [0, 1].
    pub score: f32,
    pub class_id: f32,
}

impl FaceBox {
    /// Build a box from raw corners, swapping reversed corners.
    ///
    /// Returns `None` when any coordinate or the score is not finite.
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32, score: f32, class_id: f32) -> Option<Self> {
        if ![x1, y1, x2, y2, score].iter().all(|v| v.is_finite()) {
            return None;
        }
        Some(Self {
            x1: x1.min(x2),
            y1: y1.min(y2),
            x2: x1.max(x2),
            y2: y1.max(y2),
            score,
            class_id,
        })
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// Intersection-over-Union with another box, 0.0 when the union is empty.
    pub fn iou(&self, other: &FaceBox) -> f32 {
        let x1 = self.x1.max(other.x1);
        let y1 = self.y1.max(other.y1);
        let x2 = self.x2.min(other.x2);
        let y2 = self.y2.min(other.y2);

        let inter_area = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union_area = self.area() + other.area() - inter_area;

        if union_area > 0.0 {
            inter_area / union_area
        } else {
            0.0
        }
    }
}

/// Binary classifier verdict. Class index 0 is Fake, 1 is Real.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Label {
    Fake,
    Real,
}

impl Label {
    pub fn as_str(&self) -> &'static str {
        match self {
            Label::Fake => "Fake",
            Label::Real => "Real",
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Softmax output of the real/fake classifier for one region.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Classification {
    pub label: Label,
    /// Probability of `label`.
    pub confidence: f32,
    pub fake_probability: f32,
    pub real_probability: f32,
}

/// Outcome of classifying one face crop, or the whole image when no face was found.
#[derive(Debug, Clone, Serialize)]
pub struct DetectionResult {
    /// Index into the detector's box sequence, or -1 for the whole-image fallback.
    pub face_index: i32,
    pub label: Label,
    pub confidence: f32,
    /// Region that was classified. Equals the source image when `face_index == -1`.
    #[serde(rename = "crop", serialize_with = "serialize_dimensions")]
    pub cropped_image: RgbImage,
}

impl DetectionResult {
    /// Sentinel face index for the whole-image fallback.
    pub const NO_FACE: i32 = -1;

    pub fn is_whole_image(&self) -> bool {
        self.face_index == Self::NO_FACE
    }

    /// One-line human readable verdict, e.g. `Face 2 → Fake (81.76%)`.
    pub fn summary(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for DetectionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pct = self.confidence * 100.0;
        if self.is_whole_image() {
            write!(f, "No face detected → {} ({pct:.2}%)", self.label)
        } else {
            write!(f, "Face {} → {} ({pct:.2}%)", self.face_index + 1, self.label)
        }
    }
}

#[derive(Serialize)]
struct Dimensions {
    width: u32,
    height: u32,
}

fn serialize_dimensions<S: Serializer>(image: &RgbImage, serializer: S) -> Result<S::Ok, S::Error> {
    Dimensions {
        width: image.width(),
        height: image.height(),
    }
    .serialize(serializer)
}

/// Tunable pipeline parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Minimum detector score for a box to be kept.
    pub confidence_threshold: f32,
    /// Fraction of the face box size used to pad the crop region.
    pub extend_ratio: f32,
    pub detector_input_size: u32,
    pub classifier_input_size: u32,
    /// IoU above which the lower-scored of two boxes is suppressed.
    ///
    /// On by default at 0.45. `None` skips suppression and returns every
    /// row above the score threshold, trusting the model's own NMS.
    pub nms_iou_threshold: Option<f32>,
    pub detector_input_name: String,
    pub classifier_input_name: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.8,
            extend_ratio: 0.5,
            detector_input_size: 640,
            classifier_input_size: 128,
            nms_iou_threshold: Some(0.45),
            detector_input_name: "images".to_string(),
            classifier_input_name: "input".to_string(),
        }
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("invalid pipeline config: {0}")]
    Invalid(String),
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.detector_input_size == 0 || self.classifier_input_size == 0 {
            return Err(ConfigError::Invalid(format!(
                "input sizes must be positive (detector {}, classifier {})",
                self.detector_input_size, self.classifier_input_size
            )));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(ConfigError::Invalid(format!(
                "confidence_threshold {} outside [0, 1]",
                self.confidence_threshold
            )));
        }
        if !self.extend_ratio.is_finite() || self.extend_ratio < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "extend_ratio {} must be finite and non-negative",
                self.extend_ratio
            )));
        }
        if let Some(iou) = self.nms_iou_threshold {
            if !(iou > 0.0 && iou <= 1.0) {
                return Err(ConfigError::Invalid(format!(
                    "nms_iou_threshold {iou} outside (0, 1]"
                )));
            }
        }
        if self.detector_input_name.is_empty() || self.classifier_input_name.is_empty() {
            return Err(ConfigError::Invalid("model input names must not be empty".into()));
        }
        Ok(())
    }
}
