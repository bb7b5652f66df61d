//! Face crop preprocessing: decode, padded crop, resize, tensor normalization.

use crate::embedding::GenerationError;
use crate::snapshot::BoundingBox;
use image::imageops::FilterType;
use image::{DynamicImage, RgbImage};
use ndarray::Array4;

/// Side length of the square model input.
pub const FACE_INPUT_SIZE: u32 = 160;
/// Padding added around the face box on every side, as a fraction of face width.
pub const CROP_PADDING: f32 = 0.2;

const SYMMETRIC_MEAN: f32 = 127.5;
const SYMMETRIC_STD: f32 = 127.5;

/// Value range the pixel channels are normalized to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelRange {
    /// `v / 255` → [0, 1]. Used by the deterministic fallback.
    UnitInterval,
    /// `(v - 127.5) / 127.5` → [-1, 1]. Used by the embedding model.
    Symmetric,
}

/// Integer crop rectangle within the source image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// A face cropped and resized to the model input size.
#[derive(Debug, Clone)]
pub struct PreparedFace {
    pixels: RgbImage,
    pub region: CropRegion,
}

impl PreparedFace {
    /// Canonical RGB8 bytes of the resized crop, row-major.
    pub fn pixel_bytes(&self) -> &[u8] {
        self.pixels.as_raw()
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    /// NHWC float tensor `[1, H, W, 3]` in the requested range.
    pub fn tensor(&self, range: PixelRange) -> Array4<f32> {
        let (w, h) = (self.pixels.width() as usize, self.pixels.height() as usize);
        let mut tensor = Array4::<f32>::zeros((1, h, w, 3));

        for (x, y, pixel) in self.pixels.enumerate_pixels() {
            for c in 0..3 {
                let v = pixel.0[c] as f32;
                let normalized = match range {
                    PixelRange::UnitInterval => v / 255.0,
                    PixelRange::Symmetric => (v - SYMMETRIC_MEAN) / SYMMETRIC_STD,
                };
                tensor[[0, y as usize, x as usize, c]] = normalized;
            }
        }

        tensor
    }
}

/// Decode an encoded image (PNG, JPEG, ...) from memory.
pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage, GenerationError> {
    image::load_from_memory(bytes).map_err(|e| GenerationError::DecodeFailed(e.to_string()))
}

/// Expand the face box by [`CROP_PADDING`] and clamp it to the image.
///
/// Returns `None` when nothing of the box lies inside the image.
pub fn crop_region(bounds: &BoundingBox, image_width: u32, image_height: u32) -> Option<CropRegion> {
    if !bounds.is_finite() || bounds.width <= 0.0 || bounds.height <= 0.0 {
        return None;
    }

    let pad = bounds.width * CROP_PADDING;
    let x0 = (bounds.left - pad).floor().max(0.0);
    let y0 = (bounds.top - pad).floor().max(0.0);
    let x1 = (bounds.right() + pad).ceil().min(image_width as f32);
    let y1 = (bounds.bottom() + pad).ceil().min(image_height as f32);

    if x1 <= x0 || y1 <= y0 {
        return None;
    }

    Some(CropRegion {
        x: x0 as u32,
        y: y0 as u32,
        width: (x1 - x0) as u32,
        height: (y1 - y0) as u32,
    })
}

/// Crop the padded face region and resize it to `FACE_INPUT_SIZE` square.
pub fn prepare_face(image: &DynamicImage, bounds: &BoundingBox) -> Result<PreparedFace, GenerationError> {
    let region = crop_region(bounds, image.width(), image.height()).ok_or(GenerationError::EmptyCrop)?;

    let cropped = image.crop_imm(region.x, region.y, region.width, region.height).to_rgb8();
    let pixels = image::imageops::resize(&cropped, FACE_INPUT_SIZE, FACE_INPUT_SIZE, FilterType::CatmullRom);

    tracing::trace!(?region, "face region prepared");
    Ok(PreparedFace { pixels, region })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crop_region_padding() {
        let b = BoundingBox::new(100.0, 100.0, 50.0, 60.0);
        let r = crop_region(&b, 640, 480).unwrap();
        // pad = 10px on every side
        assert_eq!(r, CropRegion { x: 90, y: 90, width: 70, height: 80 });
    }

    #[test]
    fn test_crop_region_clamped_to_image() {
        let b = BoundingBox::new(-20.0, 400.0, 100.0, 100.0);
        let r = crop_region(&b, 640, 480).unwrap();
        assert_eq!(r.x, 0);
        assert_eq!(r.y, 380);
        assert_eq!(r.x + r.width, 100);
        assert_eq!(r.y + r.height, 480);
    }

    #[test]
    fn test_crop_region_outside_image() {
        let b = BoundingBox::new(700.0, 10.0, 50.0, 50.0);
        assert!(crop_region(&b, 640, 480).is_none());
        let degenerate = BoundingBox::new(10.0, 10.0, 0.0, 50.0);
        assert!(crop_region(&degenerate, 640, 480).is_none());
        let nan = BoundingBox::new(f32::NAN, 10.0, 50.0, 50.0);
        assert!(crop_region(&nan, 640, 480).is_none());
    }

    #[test]
    fn test_prepare_face_output_size() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(320, 240, image::Rgb([10, 20, 30])));
        let face = prepare_face(&img, &BoundingBox::new(100.0, 60.0, 80.0, 100.0)).unwrap();
        assert_eq!(face.width(), FACE_INPUT_SIZE);
        assert_eq!(face.height(), FACE_INPUT_SIZE);
        assert_eq!(face.pixel_bytes().len(), (FACE_INPUT_SIZE * FACE_INPUT_SIZE * 3) as usize);
    }

    #[test]
    fn test_prepare_face_rejects_empty_crop() {
        let img = DynamicImage::ImageRgb8(RgbImage::new(64, 64));
        let err = prepare_face(&img, &BoundingBox::new(100.0, 100.0, 10.0, 10.0)).unwrap_err();
        assert!(matches!(err, GenerationError::EmptyCrop));
    }

    #[test]
    fn test_tensor_shape_and_ranges() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(200, 200, image::Rgb([255, 0, 128])));
        let face = prepare_face(&img, &BoundingBox::new(50.0, 50.0, 100.0, 100.0)).unwrap();

        let unit = face.tensor(PixelRange::UnitInterval);
        assert_eq!(unit.shape(), &[1, 160, 160, 3]);
        // Resampling a uniform image may be off by one level at most.
        let tol = 1.0 / 127.0;
        assert!((unit[[0, 0, 0, 0]] - 1.0).abs() < tol);
        assert!(unit[[0, 5, 5, 1]].abs() < tol);

        let sym = face.tensor(PixelRange::Symmetric);
        assert!((sym[[0, 0, 0, 0]] - 1.0).abs() < tol);
        assert!((sym[[0, 10, 10, 1]] + 1.0).abs() < tol);
        let expected = (128.0 - SYMMETRIC_MEAN) / SYMMETRIC_STD;
        assert!((sym[[0, 159, 159, 2]] - expected).abs() < tol);
        assert!(sym.iter().all(|v| (-1.0..=1.0).contains(v)));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let err = decode_image(b"definitely not an image").unwrap_err();
        assert!(matches!(err, GenerationError::DecodeFailed(_)));
    }
}
