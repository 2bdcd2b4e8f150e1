//! Persistence for images, detections and identities.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::config::EmbeddingUpdate;
use crate::domain::{
    BurstGroupId, Detection, DetectionId, Identity, IdentityId, Image, ImageId, PartitionKey,
    RawDetection,
};
use crate::error::Result;
use crate::index::cosine::running_mean;
use chrono::{DateTime, Utc};

/// Suppression verdict for one detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuppressionMark {
    /// Detection the verdict applies to.
    pub detection_id: DetectionId,
    /// Keeper it duplicates, `None` for keepers.
    pub duplicate_of: Option<DetectionId>,
}

impl SuppressionMark {
    /// Whether the detection was marked duplicate.
    pub const fn is_duplicate(&self) -> bool {
        self.duplicate_of.is_some()
    }
}

/// Parameters of a burst neighbour lookup.
#[derive(Debug, Clone, Copy)]
pub struct BurstQuery<'a> {
    /// Camera location to search.
    pub location: &'a str,
    /// Earliest capture time (inclusive).
    pub from: DateTime<Utc>,
    /// Latest capture time (inclusive).
    pub to: DateTime<Utc>,
    /// Image whose own detections are excluded.
    pub exclude_image: ImageId,
}

/// A resolved, non-duplicate detection found inside a burst window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BurstCandidate {
    /// Burst mate.
    pub detection_id: DetectionId,
    /// Its image.
    pub image_id: ImageId,
    /// Identity it resolved to.
    pub identity_id: IdentityId,
    /// Burst group it already belongs to.
    pub burst_group: Option<BurstGroupId>,
    /// Capture time of its image.
    pub timestamp: DateTime<Utc>,
}

/// A confirmed match to persist.
#[derive(Debug, Clone, Copy)]
pub struct MatchRecord<'a> {
    /// Matched identity.
    pub identity_id: IdentityId,
    /// Detection being linked.
    pub detection_id: DetectionId,
    /// Capture time of the detection's image.
    pub observed_at: DateTime<Utc>,
    /// Normalized embedding of the detection.
    pub embedding: &'a [f32],
    /// Representative embedding policy.
    pub update: EmbeddingUpdate,
}

/// A new identity to persist.
#[derive(Debug, Clone, Copy)]
pub struct NewIdentity<'a> {
    /// Founding detection.
    pub detection_id: DetectionId,
    /// Partition fixed for the identity's lifetime.
    pub partition: &'a PartitionKey,
    /// Normalized embedding of the founding detection.
    pub embedding: &'a [f32],
    /// Capture time of the founding detection's image.
    pub observed_at: DateTime<Utc>,
}

/// Result of linking a detection to an identity.
#[derive(Debug, Clone, PartialEq)]
pub struct Linked {
    /// Identity the detection is linked to after the call.
    pub identity: Identity,
    /// False when the detection was already linked and nothing changed.
    pub applied: bool,
}

/// Result of a burst link.
#[derive(Debug, Clone, PartialEq)]
pub struct BurstLinked {
    /// Burst group shared with the anchor.
    pub burst_group: BurstGroupId,
    /// Identity the detection is linked to after the call, with its
    /// sighting already counted.
    pub identity: Identity,
}

/// Storage operations used by the resolution pipeline.
///
/// Every mutating operation is atomic and safe to repeat: linking a detection
/// that already has an identity leaves it, and its identity, untouched.
/// Linking a keeper also links the duplicates folded into it.
#[async_trait::async_trait]
pub trait Store: Send + Sync {
    /// Store an image and its detector output.
    ///
    /// Re-inserting a known image id stores nothing and returns the ids of
    /// the detections already stored for it.
    async fn insert_image(&self, image: &Image, detections: &[RawDetection])
    -> Result<Vec<DetectionId>>;

    /// Fetch an image.
    async fn image(&self, id: ImageId) -> Result<Image>;

    /// Fetch a detection.
    async fn detection(&self, id: DetectionId) -> Result<Detection>;

    /// All detections of an image, ordered by id.
    async fn detections_for_image(&self, id: ImageId) -> Result<Vec<Detection>>;

    /// Persist suppression verdicts for an image's detections.
    async fn apply_suppression(&self, image_id: ImageId, marks: &[SuppressionMark]) -> Result<()>;

    /// Resolved non-duplicate detections of other images inside a burst window.
    async fn burst_candidates(&self, query: &BurstQuery<'_>) -> Result<Vec<BurstCandidate>>;

    /// Link a detection to a burst mate's identity and share its burst group.
    async fn link_burst(
        &self,
        detection_id: DetectionId,
        anchor: DetectionId,
        identity_id: IdentityId,
        observed_at: DateTime<Utc>,
    ) -> Result<BurstLinked>;

    /// Record that burst linking found nothing for a keeper.
    async fn mark_burst_miss(&self, detection_id: DetectionId) -> Result<()>;

    /// Record a failed matching attempt.
    ///
    /// Permanent failures move the detection to `rejected`, transient ones
    /// to `failed`; both increment the attempt counter.
    async fn record_failure(
        &self,
        detection_id: DetectionId,
        message: &str,
        permanent: bool,
    ) -> Result<()>;

    /// Link a detection to an existing identity and update the identity.
    async fn record_match(&self, record: MatchRecord<'_>) -> Result<Linked>;

    /// Create an identity founded by a detection.
    async fn create_identity(&self, new: NewIdentity<'_>) -> Result<Linked>;

    /// Fetch an identity.
    async fn identity(&self, id: IdentityId) -> Result<Identity>;

    /// All identities, ordered by id.
    async fn identities(&self) -> Result<Vec<Identity>>;

    /// Non-duplicate detections without an identity that are not rejected.
    async fn unresolved_detections(&self) -> Result<Vec<Detection>>;
}

/// Fold one sighting into an identity's lifecycle fields.
pub(crate) fn observe(
    identity: &mut Identity,
    observed_at: DateTime<Utc>,
    sample: Option<&[f32]>,
    update: EmbeddingUpdate,
) {
    if let (EmbeddingUpdate::RunningMean, Some(sample)) = (update, sample) {
        identity.embedding = running_mean(&identity.embedding, identity.observation_count, sample);
    }
    identity.observation_count += 1;
    identity.first_observed = identity.first_observed.min(observed_at);
    identity.last_observed = identity.last_observed.max(observed_at);
}

/// Whether suppression may still rewrite a detection's state.
pub(crate) const fn suppression_may_update(state: crate::domain::DetectionState) -> bool {
    use crate::domain::DetectionState;
    matches!(
        state,
        DetectionState::Raw | DetectionState::Suppressed | DetectionState::Keeper
    )
}
