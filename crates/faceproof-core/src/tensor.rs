//! Image → NCHW float tensor conversion shared by the detector and classifier.

use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use std::borrow::Cow;
use thiserror::Error;

/// ImageNet channel statistics used by the real/fake classifier.
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

#[derive(Error, Debug, PartialEq)]
pub enum TensorError {
    #[error("invalid dimension: {0}")]
    InvalidDimension(String),
}

/// Per-channel normalization applied after scaling 8-bit values to [0, 1].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Normalization {
    /// `v / 255`.
    Scale01,
    /// `(v / 255 - mean[c]) / std[c]`.
    MeanStd { mean: [f32; 3], std: [f32; 3] },
}

impl Normalization {
    pub fn imagenet() -> Self {
        Normalization::MeanStd {
            mean: IMAGENET_MEAN,
            std: IMAGENET_STD,
        }
    }

    #[inline]
    fn apply(&self, channel: usize, value: u8) -> f32 {
        let v = value as f32 / 255.0;
        match self {
            Normalization::Scale01 => v,
            Normalization::MeanStd { mean, std } => (v - mean[channel]) / std[channel],
        }
    }
}

/// Resize `image` to `target_size`×`target_size` (bilinear) and lay it out as a
/// `[1, 3, target_size, target_size]` tensor in R, G, B channel order.
pub fn build_tensor(
    image: &RgbImage,
    target_size: u32,
    normalization: Normalization,
) -> Result<Array4<f32>, TensorError> {
    if target_size == 0 {
        return Err(TensorError::InvalidDimension(
            "target size must be positive".into(),
        ));
    }
    if image.width() == 0 || image.height() == 0 {
        return Err(TensorError::InvalidDimension(format!(
            "source image is {}x{}",
            image.width(),
            image.height()
        )));
    }
    if let Normalization::MeanStd { std, .. } = &normalization {
        if std.iter().any(|s| *s == 0.0 || !s.is_finite()) {
            return Err(TensorError::InvalidDimension(format!(
                "std must be finite and non-zero, got {std:?}"
            )));
        }
    }

    let resized = resize_square(image, target_size);
    let size = target_size as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

    for (x, y, pixel) in resized.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        for c in 0..3 {
            tensor[[0, c, y, x]] = normalization.apply(c, pixel.0[c]);
        }
    }

    Ok(tensor)
}

/// Bilinear resize, skipped when the image already has the requested size.
fn resize_square(image: &RgbImage, target_size: u32) -> Cow<'_, RgbImage> {
    if image.width() == target_size && image.height() == target_size {
        Cow::Borrowed(image)
    } else {
        Cow::Owned(imageops::resize(
            image,
            target_size,
            target_size,
            FilterType::Triangle,
        ))
    }
}
