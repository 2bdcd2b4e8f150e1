//! Access to image pixels for detection crops.

mod fs;

pub use fs::FsCropSource;

use crate::domain::{BoundingBox, DetectionId, Image};
use crate::error::Result;
use image::RgbImage;

/// Decoded pixels of one detection's bounding box.
#[derive(Debug, Clone)]
pub struct Crop {
    /// Detection the crop was taken for.
    pub detection_id: DetectionId,
    /// RGB pixels.
    pub pixels: RgbImage,
}

impl Crop {
    /// Crop width in pixels.
    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    /// Crop height in pixels.
    pub fn height(&self) -> u32 {
        self.pixels.height()
    }
}

/// Produces decoded crops from stored images.
#[async_trait::async_trait]
pub trait CropSource: Send + Sync {
    /// Decode the region of `image` covered by `bbox`.
    async fn crop(&self, image: &Image, detection_id: DetectionId, bbox: &BoundingBox)
    -> Result<Crop>;
}

/// Clamp a box to image bounds, returning `(x, y, width, height)`.
///
/// Returns `None` when nothing of the box lies inside the image.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub(crate) fn clamp_to_image(
    bbox: &BoundingBox,
    image_width: u32,
    image_height: u32,
) -> Option<(u32, u32, u32, u32)> {
    let x0 = bbox.x_min.floor().max(0.0) as u32;
    let y0 = bbox.y_min.floor().max(0.0) as u32;
    let x1 = (bbox.x_max.ceil().max(0.0) as u32).min(image_width);
    let y1 = (bbox.y_max.ceil().max(0.0) as u32).min(image_height);

    if x1 <= x0 || y1 <= y0 {
        return None;
    }
    Some((x0, y0, x1 - x0, y1 - y0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_inside() {
        let b = BoundingBox::new(10.2, 20.7, 110.0, 80.0);
        assert_eq!(clamp_to_image(&b, 640, 480), Some((10, 20, 100, 60)));
    }

    #[test]
    fn test_clamp_overhanging_edges() {
        let b = BoundingBox::new(-15.0, -5.0, 700.0, 500.0);
        assert_eq!(clamp_to_image(&b, 640, 480), Some((0, 0, 640, 480)));
    }

    #[test]
    fn test_clamp_outside_image() {
        let b = BoundingBox::new(650.0, 10.0, 700.0, 60.0);
        assert_eq!(clamp_to_image(&b, 640, 480), None);
    }
}
