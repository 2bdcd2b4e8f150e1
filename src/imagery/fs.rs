//! Crops decoded from image files on disk.

use super::{Crop, CropSource, clamp_to_image};
use crate::domain::{BoundingBox, DetectionId, Image};
use crate::error::{Error, Result};
use image::imageops;
use std::path::PathBuf;
use tracing::debug;

/// Reads image files from the local filesystem.
///
/// Relative image paths are resolved against `root` when one is set.
#[derive(Debug, Clone, Default)]
pub struct FsCropSource {
    root: Option<PathBuf>,
}

impl FsCropSource {
    /// Create a source that uses image paths as given.
    pub const fn new() -> Self {
        Self { root: None }
    }

    /// Create a source resolving relative paths against `root`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    fn resolve(&self, image: &Image) -> PathBuf {
        match &self.root {
            Some(root) if image.path.is_relative() => root.join(&image.path),
            _ => image.path.clone(),
        }
    }
}

#[async_trait::async_trait]
impl CropSource for FsCropSource {
    async fn crop(
        &self,
        image: &Image,
        detection_id: DetectionId,
        bbox: &BoundingBox,
    ) -> Result<Crop> {
        let path = self.resolve(image);
        let bbox = *bbox;
        let image_id = image.id.0;

        // Decoding is CPU bound; keep it off the async workers.
        tokio::task::spawn_blocking(move || {
            let decoded = image::open(&path).map_err(|e| Error::ImageLoad {
                path: path.clone(),
                source: e,
            })?;
            let rgb = decoded.to_rgb8();

            let (x, y, w, h) = clamp_to_image(&bbox, rgb.width(), rgb.height()).ok_or_else(
                || Error::InvalidDetection {
                    image_id,
                    message: format!(
                        "bounding box {:?} lies outside the {}x{} image",
                        <[f32; 4]>::from(bbox),
                        rgb.width(),
                        rgb.height()
                    ),
                },
            )?;
            debug!("Cropping {}x{} at ({}, {}) from {}", w, h, x, y, path.display());

            Ok(Crop {
                detection_id,
                pixels: imageops::crop_imm(&rgb, x, y, w, h).to_image(),
            })
        })
        .await
        .map_err(|e| Error::Internal {
            message: format!("crop task failed: {e}"),
        })?
    }
}
