//! Authenticity stamp for images judged Real.

use image::codecs::jpeg::JpegEncoder;
use image::{imageops, DynamicImage, RgbImage, RgbaImage};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

const JPEG_QUALITY: u8 = 95;

/// Fraction of the mark that lands inside the image; the rest hangs off the
/// bottom-right corner.
const MARK_VISIBLE_FRACTION: f32 = 0.8;

/// Composite `mark` over the bottom-right corner of `image`, alpha-blended.
pub fn stamp(image: &RgbImage, mark: &RgbaImage) -> RgbImage {
    let (width, height) = image.dimensions();
    let x = width as f32 - mark.width() as f32 * MARK_VISIBLE_FRACTION;
    let y = height as f32 - mark.height() as f32 * MARK_VISIBLE_FRACTION;

    let mut canvas = DynamicImage::ImageRgb8(image.clone()).to_rgba8();
    imageops::overlay(&mut canvas, mark, x.round() as i64, y.round() as i64);
    DynamicImage::ImageRgba8(canvas).to_rgb8()
}

/// Stamp `image` and write it as `<out_dir>/<stem>_certified.jpg`.
pub fn save_certified(
    image: &RgbImage,
    mark: &RgbaImage,
    out_dir: &Path,
    stem: &str,
) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(out_dir)?;
    let path = out_dir.join(format!("{stem}_certified.jpg"));
    let stamped = stamp(image, mark);

    let writer = BufWriter::new(File::create(&path)?);
    let encoder = JpegEncoder::new_with_quality(writer, JPEG_QUALITY);
    stamped.write_with_encoder(encoder)?;

    tracing::info!(path = %path.display(), "certified image written");
    Ok(path)
}

/// Load a mark image (PNG with transparency, typically).
pub fn load_mark(path: &Path) -> anyhow::Result<RgbaImage> {
    Ok(image::open(path)?.to_rgba8())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, Rgba};

    #[test]
    fn test_stamp_position() {
        let image = RgbImage::from_pixel(100, 80, Rgb([0, 0, 0]));
        let mark = RgbaImage::from_pixel(20, 10, Rgba([255, 255, 255, 255]));
        let out = stamp(&image, &mark);

        assert_eq!(out.dimensions(), (100, 80));
        // Mark starts at (100 - 16, 80 - 8).
        assert_eq!(out.get_pixel(84, 72), &Rgb([255, 255, 255]));
        assert_eq!(out.get_pixel(99, 79), &Rgb([255, 255, 255]));
        assert_eq!(out.get_pixel(83, 72), &Rgb([0, 0, 0]));
        assert_eq!(out.get_pixel(84, 71), &Rgb([0, 0, 0]));
    }

    #[test]
    fn test_transparent_mark_leaves_image() {
        let image = RgbImage::from_pixel(50, 50, Rgb([10, 20, 30]));
        let mark = RgbaImage::from_pixel(20, 20, Rgba([255, 0, 0, 0]));
        assert_eq!(stamp(&image, &mark), image);
    }

    #[test]
    fn test_save_certified() {
        let dir = tempfile::tempdir().unwrap();
        let image = RgbImage::from_pixel(64, 48, Rgb([120, 130, 140]));
        let mark = RgbaImage::from_pixel(16, 16, Rgba([0, 200, 0, 255]));

        let path = save_certified(&image, &mark, &dir.path().join("out"), "portrait").unwrap();
        assert_eq!(path.file_name().unwrap(), "portrait_certified.jpg");

        let written = image::open(&path).unwrap();
        assert_eq!((written.width(), written.height()), (64, 48));
    }
}
