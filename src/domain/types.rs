//! Entity type definitions.

use super::{BoundingBox, Classification, PartitionKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(
    /// Image identifier, assigned by the ingestion side.
    ImageId
);
id_type!(
    /// Detection identifier, assigned by the store.
    DetectionId
);
id_type!(
    /// Identity identifier, assigned by the store.
    IdentityId
);
id_type!(
    /// Burst group identifier, assigned by the store.
    BurstGroupId
);

/// Camera-trap image metadata. Never mutated by the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image {
    /// Image identifier.
    pub id: ImageId,
    /// Capture time.
    pub timestamp: DateTime<Utc>,
    /// Camera location identifier.
    pub location: String,
    /// Path to the image file.
    pub path: PathBuf,
}

/// One detector output tuple, before it is stored.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawDetection {
    /// Bounding box in pixels.
    pub bbox: BoundingBox,
    /// Detector confidence (0.0 - 1.0).
    pub confidence: f32,
    /// Classification label.
    pub classification: Classification,
}

/// Resolution progress of a detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DetectionState {
    /// Stored, suppression not yet run.
    Raw,
    /// Duplicate of a higher-confidence detection in the same image.
    Suppressed,
    /// Survived suppression, burst linking not yet run.
    Keeper,
    /// Identity reused from a burst mate.
    BurstResolved,
    /// No resolved burst mate, waiting for matching.
    BurstMiss,
    /// Matched an existing identity.
    Matched,
    /// Founded a new identity.
    Created,
    /// Matching failed transiently, eligible for retry.
    Failed,
    /// Permanently skipped (crop too small).
    Rejected,
}

impl DetectionState {
    /// Every state, in lifecycle order.
    pub const ALL: [Self; 9] = [
        Self::Raw,
        Self::Suppressed,
        Self::Keeper,
        Self::BurstResolved,
        Self::BurstMiss,
        Self::Matched,
        Self::Created,
        Self::Failed,
        Self::Rejected,
    ];

    /// State name as stored and displayed.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Suppressed => "suppressed",
            Self::Keeper => "keeper",
            Self::BurstResolved => "burst-resolved",
            Self::BurstMiss => "burst-miss",
            Self::Matched => "matched",
            Self::Created => "created",
            Self::Failed => "failed",
            Self::Rejected => "rejected",
        }
    }

    /// True for states no stage will move the detection out of.
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Suppressed | Self::BurstResolved | Self::Matched | Self::Created | Self::Rejected
        )
    }
}

impl std::fmt::Display for DetectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DetectionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown detection state: {s}"))
    }
}

/// One candidate animal observation inside one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Detection identifier.
    pub id: DetectionId,
    /// Owning image.
    pub image_id: ImageId,
    /// Bounding box in pixels.
    pub bbox: BoundingBox,
    /// Detector confidence (0.0 - 1.0).
    pub confidence: f32,
    /// Classification label.
    pub classification: Classification,
    /// Set by suppression when a better detection covers the same animal.
    pub is_duplicate: bool,
    /// Keeper this duplicate was folded into.
    pub duplicate_of: Option<DetectionId>,
    /// Burst group shared with linked burst mates.
    pub burst_group: Option<BurstGroupId>,
    /// Resolved identity. Never cleared once set.
    pub identity_id: Option<IdentityId>,
    /// Normalized embedding, present only if matching ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// Resolution progress.
    pub state: DetectionState,
    /// Matching attempts that ended in failure.
    pub attempts: u32,
    /// Most recent failure message.
    pub last_error: Option<String>,
}

impl Detection {
    /// Whether an identity has been assigned.
    pub const fn is_resolved(&self) -> bool {
        self.identity_id.is_some()
    }
}

/// A tracked individual animal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    /// Identity identifier.
    pub id: IdentityId,
    /// Partition fixed at creation.
    pub partition: PartitionKey,
    /// Representative (L2-normalized) embedding.
    #[serde(skip)]
    pub embedding: Vec<f32>,
    /// Earliest sighting.
    pub first_observed: DateTime<Utc>,
    /// Latest sighting.
    pub last_observed: DateTime<Utc>,
    /// Number of linked observations.
    pub observation_count: u64,
}
