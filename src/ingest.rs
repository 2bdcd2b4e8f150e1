//! Detector output batch files.
//!
//! A batch is a JSON document listing images and the raw detections the
//! detector produced for each:
//!
//! ```json
//! {"images": [{"id": 1, "timestamp": "2024-06-01T04:12:09Z", "location": "cam-07",
//!              "path": "cam-07/IMG_0001.JPG",
//!              "detections": [{"bbox": [412, 300, 780, 610], "confidence": 0.93,
//!                              "label": "female-adult"}]}]}
//! ```
//!
//! Relative image paths are resolved against the batch file's directory.

use crate::domain::{BoundingBox, Classification, Image, ImageId, RawDetection};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// An image with its detector output, ready to store.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageRecord {
    /// Image metadata.
    pub image: Image,
    /// Detector output for the image.
    pub detections: Vec<RawDetection>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BatchFile {
    images: Vec<BatchImage>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BatchImage {
    id: u64,
    timestamp: DateTime<Utc>,
    location: String,
    path: PathBuf,
    #[serde(default)]
    detections: Vec<BatchDetection>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BatchDetection {
    bbox: BoundingBox,
    confidence: f32,
    label: Classification,
}

/// Read and validate one batch file.
pub fn read_batch(path: &Path) -> Result<Vec<ImageRecord>> {
    let content = std::fs::read_to_string(path).map_err(|e| Error::BatchRead {
        path: path.to_path_buf(),
        source: e,
    })?;
    let base = path.parent().filter(|p| !p.as_os_str().is_empty());
    let records = parse_batch(&content, path, base)?;
    info!(
        "Loaded {} image(s) from {}",
        records.len(),
        path.display()
    );
    Ok(records)
}

/// Parse batch JSON. `source` names the batch in errors; relative image
/// paths are joined onto `base` when given.
pub fn parse_batch(json: &str, source: &Path, base: Option<&Path>) -> Result<Vec<ImageRecord>> {
    let batch: BatchFile = serde_json::from_str(json).map_err(|e| Error::BatchParse {
        path: source.to_path_buf(),
        source: e,
    })?;

    let mut seen = HashSet::new();
    let mut records = Vec::with_capacity(batch.images.len());
    for entry in batch.images {
        if !seen.insert(entry.id) {
            warn!(
                "Image {} appears more than once in {}, keeping the first",
                entry.id,
                source.display()
            );
            continue;
        }
        records.push(into_record(entry, base)?);
    }
    Ok(records)
}

fn into_record(entry: BatchImage, base: Option<&Path>) -> Result<ImageRecord> {
    let invalid = |message: String| Error::InvalidDetection {
        image_id: entry.id,
        message,
    };

    if entry.location.trim().is_empty() {
        return Err(invalid("image has an empty location".to_string()));
    }

    let mut detections = Vec::with_capacity(entry.detections.len());
    for (n, d) in entry.detections.iter().enumerate() {
        if !(0.0..=1.0).contains(&d.confidence) {
            return Err(invalid(format!(
                "detection #{n} has confidence {} outside [0, 1]",
                d.confidence
            )));
        }
        let coords: [f32; 4] = d.bbox.into();
        if coords.iter().any(|c| !c.is_finite()) {
            return Err(invalid(format!("detection #{n} has a non-finite bounding box")));
        }
        detections.push(RawDetection {
            bbox: d.bbox,
            confidence: d.confidence,
            classification: d.label,
        });
    }

    let path = match base {
        Some(base) if entry.path.is_relative() => base.join(&entry.path),
        _ => entry.path,
    };

    Ok(ImageRecord {
        image: Image {
            id: ImageId(entry.id),
            timestamp: entry.timestamp,
            location: entry.location,
            path,
        },
        detections,
    })
}
