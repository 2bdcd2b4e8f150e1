//! Bounding box geometry.

use serde::{Deserialize, Serialize};

/// Axis-aligned bounding box in image pixel coordinates.
///
/// Serialized as `[x_min, y_min, x_max, y_max]`, the layout detectors emit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 4]", into = "[f32; 4]")]
pub struct BoundingBox {
    /// Left edge.
    pub x_min: f32,
    /// Top edge.
    pub y_min: f32,
    /// Right edge.
    pub x_max: f32,
    /// Bottom edge.
    pub y_max: f32,
}

impl BoundingBox {
    /// Create a box from its corner coordinates.
    pub const fn new(x_min: f32, y_min: f32, x_max: f32, y_max: f32) -> Self {
        Self {
            x_min,
            y_min,
            x_max,
            y_max,
        }
    }

    /// Width in pixels (negative for malformed boxes).
    pub fn width(&self) -> f32 {
        self.x_max - self.x_min
    }

    /// Height in pixels (negative for malformed boxes).
    pub fn height(&self) -> f32 {
        self.y_max - self.y_min
    }

    /// True when all coordinates are finite and the area is positive.
    pub fn is_valid(&self) -> bool {
        [self.x_min, self.y_min, self.x_max, self.y_max]
            .iter()
            .all(|v| v.is_finite())
            && self.width() > 0.0
            && self.height() > 0.0
    }

    /// Area in square pixels, zero for malformed boxes.
    pub fn area(&self) -> f32 {
        if self.is_valid() {
            self.width() * self.height()
        } else {
            0.0
        }
    }

    /// Intersection-over-union with another box.
    ///
    /// Malformed boxes overlap nothing, so the result is 0.0 whenever
    /// either side has zero or negative area.
    pub fn iou(&self, other: &Self) -> f32 {
        if !self.is_valid() || !other.is_valid() {
            return 0.0;
        }

        let ix = (self.x_max.min(other.x_max) - self.x_min.max(other.x_min)).max(0.0);
        let iy = (self.y_max.min(other.y_max) - self.y_min.max(other.y_min)).max(0.0);
        let intersection = ix * iy;
        let union = self.area() + other.area() - intersection;

        if union > 0.0 {
            intersection / union
        } else {
            0.0
        }
    }
}

impl From<[f32; 4]> for BoundingBox {
    fn from(v: [f32; 4]) -> Self {
        Self::new(v[0], v[1], v[2], v[3])
    }
}

impl From<BoundingBox> for [f32; 4] {
    fn from(b: BoundingBox) -> Self {
        [b.x_min, b.y_min, b.x_max, b.y_max]
    }
}
