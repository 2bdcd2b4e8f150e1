//! Core data model: detections, images, identities and partitions.

mod classification;
mod geometry;
mod types;

pub use classification::{Classification, PartitionKey, PartitionMap};
pub use geometry::BoundingBox;
pub use types::{
    BurstGroupId, Detection, DetectionId, DetectionState, Identity, IdentityId, Image, ImageId,
    RawDetection,
};
