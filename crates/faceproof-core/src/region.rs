//! Padded face crops.
//!
//! The crop grows by `extend_ratio` of the face size: the full ratio below
//! the chin, 70% of it above the forehead and on each side. Edges are clamped
//! to the image.

use crate::types::FaceBox;
use image::{imageops, RgbImage};
use std::borrow::Cow;

/// Share of the extension applied above and beside the face.
const SIDE_EXTENSION_FACTOR: f32 = 0.7;

/// Integer pixel rectangle inside an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRegion {
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
}

/// Compute the expanded, edge-clamped crop rectangle for `face`.
///
/// Returns `None` when the clamped region has no area.
pub fn crop_region(
    image_width: u32,
    image_height: u32,
    face: &FaceBox,
    extend_ratio: f32,
) -> Option<CropRegion> {
    let img_w = image_width as f32;
    let img_h = image_height as f32;
    let face_w = face.width();
    let face_h = face.height();

    let y1 = (face.y1 - face_h * extend_ratio * SIDE_EXTENSION_FACTOR).clamp(0.0, img_h);
    let y2 = (face.y2 + face_h * extend_ratio).clamp(0.0, img_h);

    let extend_w = face_w * extend_ratio * SIDE_EXTENSION_FACTOR;
    let x1 = (face.x1 - extend_w).clamp(0.0, img_w);
    let x2 = (face.x2 + extend_w).clamp(0.0, img_w);

    let left = x1 as u32;
    let top = y1 as u32;
    let width = ((x2 - x1) as u32).min(image_width.saturating_sub(left));
    let height = ((y2 - y1) as u32).min(image_height.saturating_sub(top));

    if width == 0 || height == 0 {
        return None;
    }

    Some(CropRegion {
        left,
        top,
        width,
        height,
    })
}

/// Extract the expanded region around `face`.
///
/// Falls back to borrowing `image` unchanged when the region would be empty.
pub fn expand<'a>(image: &'a RgbImage, face: &FaceBox, extend_ratio: f32) -> Cow<'a, RgbImage> {
    match crop_region(image.width(), image.height(), face, extend_ratio) {
        Some(r) => Cow::Owned(imageops::crop_imm(image, r.left, r.top, r.width, r.height).to_image()),
        None => {
            tracing::debug!(?face, "empty crop region; using full image");
            Cow::Borrowed(image)
        }
    }
}
