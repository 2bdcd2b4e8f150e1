//! Burst linking: reuse an identity resolved moments earlier or later at the
//! same camera.

use crate::domain::{BurstGroupId, Detection, DetectionId, IdentityId, Image};
use crate::index::{IndexEntry, VectorIndex};
use crate::store::{BurstCandidate, BurstQuery, Store};
use chrono::{DateTime, TimeDelta, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Outcome of a burst lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BurstDecision {
    /// The detection took a burst mate's identity.
    Reused {
        /// Identity assigned.
        identity_id: IdentityId,
        /// Burst group shared with the mate.
        burst_group: BurstGroupId,
        /// Mate the identity came from.
        anchor: DetectionId,
    },
    /// No resolved mate in the window; go on to matching.
    Miss,
}

/// Links keepers to identities already resolved inside the burst window.
///
/// A link counts as a sighting, so the identity's index entry is refreshed
/// with its new `last_observed`.
pub struct BurstLinker {
    store: Arc<dyn Store>,
    index: Arc<dyn VectorIndex>,
    window: TimeDelta,
}

impl BurstLinker {
    /// Create a linker with a symmetric window of `window` around each image.
    pub fn new(store: Arc<dyn Store>, index: Arc<dyn VectorIndex>, window: Duration) -> Self {
        Self {
            store,
            index,
            window: TimeDelta::from_std(window).unwrap_or(TimeDelta::MAX),
        }
    }

    /// Try to resolve `detection` by reuse.
    ///
    /// Storage errors degrade to [`BurstDecision::Miss`].
    pub async fn link(&self, detection: &Detection, image: &Image) -> BurstDecision {
        let query = BurstQuery {
            location: &image.location,
            from: image
                .timestamp
                .checked_sub_signed(self.window)
                .unwrap_or(DateTime::<Utc>::MIN_UTC),
            to: image
                .timestamp
                .checked_add_signed(self.window)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            exclude_image: image.id,
        };

        let candidates = match self.store.burst_candidates(&query).await {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(
                    "Burst query for detection {} failed, falling through to matching: {}",
                    detection.id, e
                );
                return BurstDecision::Miss;
            }
        };

        let Some(anchor) = closest(&candidates, image) else {
            debug!(
                "Detection {}: no resolved burst mate at {}",
                detection.id, image.location
            );
            return BurstDecision::Miss;
        };

        match self
            .store
            .link_burst(
                detection.id,
                anchor.detection_id,
                anchor.identity_id,
                image.timestamp,
            )
            .await
        {
            Ok(linked) => {
                let identity = linked.identity;
                if let Err(e) = self.index.upsert(
                    &identity.partition,
                    IndexEntry {
                        identity_id: identity.id,
                        vector: identity.embedding,
                        last_observed: identity.last_observed,
                    },
                ) {
                    warn!("Could not refresh identity {} in the index: {}", identity.id, e);
                }
                debug!(
                    "Detection {} reuses identity {} from detection {} (burst {})",
                    detection.id, identity.id, anchor.detection_id, linked.burst_group
                );
                BurstDecision::Reused {
                    identity_id: identity.id,
                    burst_group: linked.burst_group,
                    anchor: anchor.detection_id,
                }
            }
            Err(e) => {
                warn!(
                    "Burst link for detection {} failed, falling through to matching: {}",
                    detection.id, e
                );
                BurstDecision::Miss
            }
        }
    }
}

/// Nearest mate in time; ties go to the lowest detection id.
fn closest<'a>(candidates: &'a [BurstCandidate], image: &Image) -> Option<&'a BurstCandidate> {
    candidates
        .iter()
        .min_by_key(|c| ((c.timestamp - image.timestamp).abs(), c.detection_id))
}
