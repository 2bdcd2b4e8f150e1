//! Appearance matching of unresolved detections against known identities.

use crate::config::ResolutionSettings;
use crate::domain::{Detection, IdentityId, Image, PartitionKey, PartitionMap};
use crate::embedding::Embedder;
use crate::error::{Error, Result};
use crate::imagery::CropSource;
use crate::index::{Neighbor, VectorIndex, cosine::l2_normalize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Outcome of a nearest-identity search.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MatchDecision {
    /// Best candidate met the similarity threshold.
    Match {
        /// Matched identity.
        identity_id: IdentityId,
        /// Cosine similarity to it.
        similarity: f32,
    },
    /// No candidate in the partition met the threshold.
    NoMatch,
}

/// Pick the best neighbour at or above `threshold`.
///
/// `neighbors` must already be ranked (see [`VectorIndex::search`]).
pub fn select_match(neighbors: &[Neighbor], threshold: f32) -> MatchDecision {
    neighbors
        .first()
        .filter(|best| best.similarity >= threshold)
        .map_or(MatchDecision::NoMatch, |best| MatchDecision::Match {
            identity_id: best.identity_id,
            similarity: best.similarity,
        })
}

/// Embeds detection crops and searches the identity index.
pub struct Matcher {
    embedder: Arc<dyn Embedder>,
    crops: Arc<dyn CropSource>,
    index: Arc<dyn VectorIndex>,
    partitions: PartitionMap,
    settings: ResolutionSettings,
    timeout: Duration,
}

impl Matcher {
    /// Create a matcher from its collaborators.
    pub fn new(
        embedder: Arc<dyn Embedder>,
        crops: Arc<dyn CropSource>,
        index: Arc<dyn VectorIndex>,
        partitions: PartitionMap,
        settings: ResolutionSettings,
        timeout: Duration,
    ) -> Self {
        Self {
            embedder,
            crops,
            index,
            partitions,
            settings,
            timeout,
        }
    }

    /// Partition a detection is searched in.
    pub fn partition_for(&self, detection: &Detection) -> &PartitionKey {
        self.partitions.partition_for(detection.classification)
    }

    /// Reject boxes too small to embed reliably.
    pub fn check_crop(&self, detection: &Detection) -> Result<()> {
        let min = f64::from(self.settings.min_crop_px);
        let width = detection.bbox.width();
        let height = detection.bbox.height();
        let too_small = |side: f32| side.is_nan() || f64::from(side) < min;

        if too_small(width) || too_small(height) {
            return Err(Error::CropTooSmall {
                detection_id: detection.id.0,
                width,
                height,
                min_px: self.settings.min_crop_px,
            });
        }
        Ok(())
    }

    /// Crop, embed and L2-normalise one detection.
    pub async fn embed(&self, image: &Image, detection: &Detection) -> Result<Vec<f32>> {
        self.check_crop(detection)?;

        let crop = self
            .crops
            .crop(image, detection.id, &detection.bbox)
            .await?;

        let mut vector = tokio::time::timeout(self.timeout, self.embedder.embed(&crop))
            .await
            .map_err(|_| Error::EmbeddingFailed {
                reason: format!(
                    "embedding detection {} timed out after {:?}",
                    detection.id, self.timeout
                ),
            })??;

        let expected = self.embedder.dimension();
        if vector.len() != expected {
            return Err(Error::EmbeddingFailed {
                reason: format!(
                    "expected {expected}-dimensional embedding, got {}",
                    vector.len()
                ),
            });
        }
        if !l2_normalize(&mut vector) {
            return Err(Error::EmbeddingFailed {
                reason: format!("embedding for detection {} has zero norm", detection.id),
            });
        }
        trace!("Embedded detection {} ({} dims)", detection.id, vector.len());
        Ok(vector)
    }

    /// Search `partition` for the identity closest to `embedding`.
    pub fn best_match(&self, partition: &PartitionKey, embedding: &[f32]) -> Result<MatchDecision> {
        let neighbors = self
            .index
            .search(partition, embedding, self.settings.search_top_k)?;
        let decision = select_match(&neighbors, self.settings.similarity_threshold);

        if let Some(best) = neighbors.first() {
            debug!(
                "Best candidate in {}: identity {} at {:.3} (threshold {:.3})",
                partition, best.identity_id, best.similarity, self.settings.similarity_threshold
            );
        }
        Ok(decision)
    }
}
