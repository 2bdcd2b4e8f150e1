//! Identity creation and updates.
//!
//! This is the only place that writes identities. Resolution at one location
//! is serialized by a location-scoped async mutex, under which the burst is
//! checked again before matching, so burst mates that race each other still
//! converge on one identity. Creation within one partition is serialized by a
//! partition-scoped mutex, and the index is searched again under it so that
//! two concurrent first sightings of the same animal produce one identity.
//!
//! Locks are always taken location first, then partition.

use super::burst::{BurstDecision, BurstLinker};
use super::matcher::{MatchDecision, Matcher, select_match};
use crate::config::ResolutionSettings;
use crate::domain::{
    BurstGroupId, Detection, Identity, IdentityId, Image, PartitionKey, PartitionMap,
};
use crate::error::{Error, Result};
use crate::index::{IndexEntry, VectorIndex};
use crate::store::{MatchRecord, NewIdentity, Store};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as SyncMutex};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// How a detection ended up linked to an identity.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Linked to an existing identity by appearance.
    Matched {
        /// Identity after the update.
        identity: Identity,
        /// Similarity that justified the match.
        similarity: f32,
    },
    /// A new identity was founded.
    Created {
        /// The new identity.
        identity: Identity,
    },
    /// A burst mate resolved first; its identity was reused.
    Reused {
        /// Reused identity.
        identity_id: IdentityId,
        /// Shared burst group.
        burst_group: BurstGroupId,
    },
}

impl Resolution {
    /// Identity the detection is linked to.
    pub const fn identity_id(&self) -> IdentityId {
        match self {
            Self::Matched { identity, .. } | Self::Created { identity } => identity.id,
            Self::Reused { identity_id, .. } => *identity_id,
        }
    }
}

/// One creation mutex per partition, fixed at startup.
#[derive(Debug, Default)]
pub struct PartitionLocks {
    locks: HashMap<PartitionKey, Arc<Mutex<()>>>,
}

impl PartitionLocks {
    /// Build a lock for every partition the map can produce.
    pub fn new(partitions: &PartitionMap) -> Self {
        Self {
            locks: partitions
                .partitions()
                .into_iter()
                .map(|p| (p.clone(), Arc::new(Mutex::new(()))))
                .collect(),
        }
    }

    fn get(&self, partition: &PartitionKey) -> Result<Arc<Mutex<()>>> {
        self.locks
            .get(partition)
            .cloned()
            .ok_or_else(|| Error::Internal {
                message: format!("no creation lock for partition '{partition}'"),
            })
    }
}

/// One resolution mutex per camera location, created on first use.
#[derive(Debug, Default)]
pub struct LocationLocks {
    locks: SyncMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LocationLocks {
    fn get(&self, location: &str) -> Result<Arc<Mutex<()>>> {
        let mut locks = self.locks.lock().map_err(|e| Error::Internal {
            message: format!("location locks poisoned: {e}"),
        })?;
        Ok(Arc::clone(locks.entry(location.to_string()).or_default()))
    }
}

/// Owns identity writes and keeps the vector index in step with the store.
pub struct IdentityStore {
    store: Arc<dyn Store>,
    index: Arc<dyn VectorIndex>,
    burst: BurstLinker,
    locations: LocationLocks,
    locks: PartitionLocks,
    settings: ResolutionSettings,
}

impl IdentityStore {
    /// Create an identity store over `store` and `index`.
    pub fn new(
        store: Arc<dyn Store>,
        index: Arc<dyn VectorIndex>,
        partitions: &PartitionMap,
        settings: ResolutionSettings,
    ) -> Self {
        Self {
            burst: BurstLinker::new(
                Arc::clone(&store),
                Arc::clone(&index),
                settings.burst_window,
            ),
            store,
            index,
            locations: LocationLocks::default(),
            locks: PartitionLocks::new(partitions),
            settings,
        }
    }

    /// Resolve an embedded detection: reuse a burst mate's identity, match an
    /// existing identity, or found a new one.
    ///
    /// Runs under the mutex of the image's location, so a burst mate resolved
    /// by a concurrent task is always seen here before matching.
    pub async fn resolve(
        &self,
        matcher: &Matcher,
        detection: &Detection,
        image: &Image,
        embedding: &[f32],
    ) -> Result<Resolution> {
        let lock = self.locations.get(&image.location)?;
        let _guard = lock.lock().await;

        if let BurstDecision::Reused {
            identity_id,
            burst_group,
            ..
        } = self.burst.link(detection, image).await
        {
            return Ok(Resolution::Reused {
                identity_id,
                burst_group,
            });
        }

        let partition = matcher.partition_for(detection);
        match matcher.best_match(partition, embedding)? {
            MatchDecision::Match {
                identity_id,
                similarity,
            } => {
                self.record_match(detection, image, identity_id, similarity, embedding)
                    .await
            }
            MatchDecision::NoMatch => {
                self.create_identity(detection, image, embedding, partition)
                    .await
            }
        }
    }

    /// Link `detection` to an identity it matched.
    ///
    /// Repeating the call for an already linked detection changes nothing.
    pub async fn record_match(
        &self,
        detection: &Detection,
        image: &Image,
        identity_id: IdentityId,
        similarity: f32,
        embedding: &[f32],
    ) -> Result<Resolution> {
        let linked = self
            .store
            .record_match(MatchRecord {
                identity_id,
                detection_id: detection.id,
                observed_at: image.timestamp,
                embedding,
                update: self.settings.embedding_update,
            })
            .await?;

        self.index_identity(&linked.identity)?;
        if linked.applied {
            debug!(
                "Detection {} matched identity {} ({:.3}), {} sightings",
                detection.id, linked.identity.id, similarity, linked.identity.observation_count
            );
        }
        Ok(Resolution::Matched {
            identity: linked.identity,
            similarity,
        })
    }

    /// Found a new identity for `detection`, unless a competitor got there
    /// first.
    ///
    /// Under the partition mutex the index is searched again; a competitor
    /// created since the caller's search turns this into a match.
    pub async fn create_identity(
        &self,
        detection: &Detection,
        image: &Image,
        embedding: &[f32],
        partition: &PartitionKey,
    ) -> Result<Resolution> {
        let lock = self.locks.get(partition)?;
        let _guard = lock.lock().await;

        let neighbors = self
            .index
            .search(partition, embedding, self.settings.search_top_k)?;
        if let MatchDecision::Match {
            identity_id,
            similarity,
        } = select_match(&neighbors, self.settings.similarity_threshold)
        {
            debug!(
                "Detection {}: identity {} appeared in {} while waiting, matching instead",
                detection.id, identity_id, partition
            );
            return self
                .record_match(detection, image, identity_id, similarity, embedding)
                .await;
        }

        let linked = self
            .store
            .create_identity(NewIdentity {
                detection_id: detection.id,
                partition,
                embedding,
                observed_at: image.timestamp,
            })
            .await?;
        self.index_identity(&linked.identity)?;

        if linked.applied {
            info!(
                "New identity {} in {} from detection {}",
                linked.identity.id, partition, detection.id
            );
        }
        Ok(Resolution::Created {
            identity: linked.identity,
        })
    }

    fn index_identity(&self, identity: &Identity) -> Result<()> {
        self.index.upsert(
            &identity.partition,
            IndexEntry {
                identity_id: identity.id,
                vector: identity.embedding.clone(),
                last_observed: identity.last_observed,
            },
        )
    }
}

/// Load every stored identity into `index`. Returns the number loaded.
pub async fn rebuild_index(store: &dyn Store, index: &dyn VectorIndex) -> Result<usize> {
    let identities = store.identities().await?;
    for identity in &identities {
        index.upsert(
            &identity.partition,
            IndexEntry {
                identity_id: identity.id,
                vector: identity.embedding.clone(),
                last_observed: identity.last_observed,
            },
        )?;
    }
    Ok(identities.len())
}
