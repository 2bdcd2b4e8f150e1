//! In-memory store.

use super::{
    BurstCandidate, BurstLinked, BurstQuery, Linked, MatchRecord, NewIdentity, Store,
    SuppressionMark, observe, suppression_may_update,
};
use crate::config::EmbeddingUpdate;
use crate::domain::{
    BurstGroupId, Detection, DetectionId, DetectionState, Identity, IdentityId, Image, ImageId,
    RawDetection,
};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Default)]
struct State {
    images: BTreeMap<ImageId, Image>,
    detections: BTreeMap<DetectionId, Detection>,
    identities: BTreeMap<IdentityId, Identity>,
    next_detection: u64,
    next_identity: u64,
    next_burst_group: u64,
}

impl State {
    fn detection(&self, id: DetectionId) -> Result<&Detection> {
        self.detections
            .get(&id)
            .ok_or(Error::DetectionNotFound { id: id.0 })
    }

    fn detection_mut(&mut self, id: DetectionId) -> Result<&mut Detection> {
        self.detections
            .get_mut(&id)
            .ok_or(Error::DetectionNotFound { id: id.0 })
    }

    fn identity(&self, id: IdentityId) -> Result<&Identity> {
        self.identities
            .get(&id)
            .ok_or(Error::IdentityNotFound { id: id.0 })
    }

    fn propagate_to_duplicates(&mut self, keeper: DetectionId, identity: IdentityId) {
        for detection in self.detections.values_mut() {
            if detection.duplicate_of == Some(keeper) && detection.identity_id.is_none() {
                detection.identity_id = Some(identity);
            }
        }
    }

    fn already_linked(&self, detection: &Detection) -> Result<Option<Linked>> {
        detection
            .identity_id
            .map(|id| {
                self.identity(id).map(|identity| Linked {
                    identity: identity.clone(),
                    applied: false,
                })
            })
            .transpose()
    }
}

/// Store that keeps everything in process memory.
///
/// Used by tests and `--in-memory` runs. All operations take one lock, so
/// each is trivially atomic.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>> {
        self.state
            .read()
            .map_err(|_| Error::persistence("memory store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>> {
        self.state
            .write()
            .map_err(|_| Error::persistence("memory store lock poisoned"))
    }
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    async fn insert_image(
        &self,
        image: &Image,
        detections: &[RawDetection],
    ) -> Result<Vec<DetectionId>> {
        let mut state = self.write()?;

        if state.images.contains_key(&image.id) {
            return Ok(state
                .detections
                .values()
                .filter(|d| d.image_id == image.id)
                .map(|d| d.id)
                .collect());
        }

        state.images.insert(image.id, image.clone());
        let mut ids = Vec::with_capacity(detections.len());
        for raw in detections {
            state.next_detection += 1;
            let id = DetectionId(state.next_detection);
            state.detections.insert(
                id,
                Detection {
                    id,
                    image_id: image.id,
                    bbox: raw.bbox,
                    confidence: raw.confidence,
                    classification: raw.classification,
                    is_duplicate: false,
                    duplicate_of: None,
                    burst_group: None,
                    identity_id: None,
                    embedding: None,
                    state: DetectionState::Raw,
                    attempts: 0,
                    last_error: None,
                },
            );
            ids.push(id);
        }
        Ok(ids)
    }

    async fn image(&self, id: ImageId) -> Result<Image> {
        self.read()?
            .images
            .get(&id)
            .cloned()
            .ok_or(Error::ImageNotFound { id: id.0 })
    }

    async fn detection(&self, id: DetectionId) -> Result<Detection> {
        self.read()?.detection(id).cloned()
    }

    async fn detections_for_image(&self, id: ImageId) -> Result<Vec<Detection>> {
        Ok(self
            .read()?
            .detections
            .values()
            .filter(|d| d.image_id == id)
            .cloned()
            .collect())
    }

    async fn apply_suppression(&self, image_id: ImageId, marks: &[SuppressionMark]) -> Result<()> {
        let mut state = self.write()?;

        for mark in marks {
            let detection = state.detection(mark.detection_id)?;
            if detection.image_id != image_id {
                return Err(Error::Internal {
                    message: format!(
                        "detection {} does not belong to image {image_id}",
                        mark.detection_id
                    ),
                });
            }
            let keeper_identity = match mark.duplicate_of {
                Some(keeper) => state.detection(keeper)?.identity_id,
                None => None,
            };

            let detection = state.detection_mut(mark.detection_id)?;
            detection.is_duplicate = mark.is_duplicate();
            detection.duplicate_of = mark.duplicate_of;
            if suppression_may_update(detection.state) {
                detection.state = if mark.is_duplicate() {
                    DetectionState::Suppressed
                } else {
                    DetectionState::Keeper
                };
            }
            if detection.identity_id.is_none() {
                detection.identity_id = keeper_identity;
            }
        }
        Ok(())
    }

    async fn burst_candidates(&self, query: &BurstQuery<'_>) -> Result<Vec<BurstCandidate>> {
        let state = self.read()?;

        Ok(state
            .detections
            .values()
            .filter(|d| !d.is_duplicate && d.image_id != query.exclude_image)
            .filter_map(|d| {
                let identity_id = d.identity_id?;
                let image = state.images.get(&d.image_id)?;
                let in_window = image.location == query.location
                    && image.timestamp >= query.from
                    && image.timestamp <= query.to;
                in_window.then_some(BurstCandidate {
                    detection_id: d.id,
                    image_id: d.image_id,
                    identity_id,
                    burst_group: d.burst_group,
                    timestamp: image.timestamp,
                })
            })
            .collect())
    }

    async fn link_burst(
        &self,
        detection_id: DetectionId,
        anchor: DetectionId,
        identity_id: IdentityId,
        observed_at: DateTime<Utc>,
    ) -> Result<BurstLinked> {
        let mut state = self.write()?;

        let current = state.detection(detection_id)?;
        if let (Some(linked_to), Some(group)) = (current.identity_id, current.burst_group) {
            return Ok(BurstLinked {
                burst_group: group,
                identity: state.identity(linked_to)?.clone(),
            });
        }
        let linked_to = current.identity_id.unwrap_or(identity_id);
        let newly_linked = current.identity_id.is_none();
        let own_group = current.burst_group;
        let anchor_group = state.detection(anchor)?.burst_group;
        state.identity(linked_to)?;

        let group = match anchor_group.or(own_group) {
            Some(group) => group,
            None => {
                state.next_burst_group += 1;
                BurstGroupId(state.next_burst_group)
            }
        };

        state.detection_mut(anchor)?.burst_group.get_or_insert(group);
        let detection = state.detection_mut(detection_id)?;
        detection.burst_group = Some(group);
        if newly_linked {
            detection.identity_id = Some(identity_id);
            detection.state = DetectionState::BurstResolved;
            detection.last_error = None;
            state.propagate_to_duplicates(detection_id, identity_id);
            if let Some(identity) = state.identities.get_mut(&identity_id) {
                observe(identity, observed_at, None, EmbeddingUpdate::Keep);
            }
        }
        Ok(BurstLinked {
            burst_group: group,
            identity: state.identity(linked_to)?.clone(),
        })
    }

    async fn mark_burst_miss(&self, detection_id: DetectionId) -> Result<()> {
        let mut state = self.write()?;
        let detection = state.detection_mut(detection_id)?;
        if detection.identity_id.is_none() && detection.state == DetectionState::Keeper {
            detection.state = DetectionState::BurstMiss;
        }
        Ok(())
    }

    async fn record_failure(
        &self,
        detection_id: DetectionId,
        message: &str,
        permanent: bool,
    ) -> Result<()> {
        let mut state = self.write()?;
        let detection = state.detection_mut(detection_id)?;
        if detection.identity_id.is_some() {
            return Ok(());
        }
        detection.attempts += 1;
        detection.last_error = Some(message.to_string());
        detection.state = if permanent {
            DetectionState::Rejected
        } else {
            DetectionState::Failed
        };
        Ok(())
    }

    async fn record_match(&self, record: MatchRecord<'_>) -> Result<Linked> {
        let mut state = self.write()?;

        if let Some(linked) = state.already_linked(state.detection(record.detection_id)?)? {
            return Ok(linked);
        }

        let identity = state
            .identities
            .get_mut(&record.identity_id)
            .ok_or(Error::IdentityNotFound {
                id: record.identity_id.0,
            })?;
        observe(
            identity,
            record.observed_at,
            Some(record.embedding),
            record.update,
        );
        let identity = identity.clone();

        let detection = state.detection_mut(record.detection_id)?;
        detection.identity_id = Some(identity.id);
        detection.embedding = Some(record.embedding.to_vec());
        detection.state = DetectionState::Matched;
        detection.last_error = None;
        state.propagate_to_duplicates(record.detection_id, identity.id);

        Ok(Linked {
            identity,
            applied: true,
        })
    }

    async fn create_identity(&self, new: NewIdentity<'_>) -> Result<Linked> {
        let mut state = self.write()?;

        if let Some(linked) = state.already_linked(state.detection(new.detection_id)?)? {
            return Ok(linked);
        }

        state.next_identity += 1;
        let identity = Identity {
            id: IdentityId(state.next_identity),
            partition: new.partition.clone(),
            embedding: new.embedding.to_vec(),
            first_observed: new.observed_at,
            last_observed: new.observed_at,
            observation_count: 1,
        };
        state.identities.insert(identity.id, identity.clone());

        let detection = state.detection_mut(new.detection_id)?;
        detection.identity_id = Some(identity.id);
        detection.embedding = Some(new.embedding.to_vec());
        detection.state = DetectionState::Created;
        detection.last_error = None;
        state.propagate_to_duplicates(new.detection_id, identity.id);

        Ok(Linked {
            identity,
            applied: true,
        })
    }

    async fn identity(&self, id: IdentityId) -> Result<Identity> {
        self.read()?.identity(id).cloned()
    }

    async fn identities(&self) -> Result<Vec<Identity>> {
        Ok(self.read()?.identities.values().cloned().collect())
    }

    async fn unresolved_detections(&self) -> Result<Vec<Detection>> {
        Ok(self
            .read()?
            .detections
            .values()
            .filter(|d| {
                d.identity_id.is_none() && !d.is_duplicate && d.state != DetectionState::Rejected
            })
            .cloned()
            .collect())
    }
}
