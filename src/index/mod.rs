//! Searchable identity embeddings, partitioned by partition key.

pub mod cosine;
mod memory;

pub use memory::MemoryIndex;

use crate::domain::{IdentityId, PartitionKey};
use crate::error::Result;
use chrono::{DateTime, Utc};

/// One identity's searchable embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    /// Identity the vector represents.
    pub identity_id: IdentityId,
    /// Unit-length representative embedding.
    pub vector: Vec<f32>,
    /// Latest sighting, used to break similarity ties.
    pub last_observed: DateTime<Utc>,
}

/// A search hit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    /// Matched identity.
    pub identity_id: IdentityId,
    /// Cosine similarity to the query.
    pub similarity: f32,
    /// Latest sighting of the identity.
    pub last_observed: DateTime<Utc>,
}

/// Nearest-neighbour search over identity embeddings.
///
/// Searches never cross partitions. Results are ordered by descending
/// similarity, then most recent `last_observed`, then identity id, so equal
/// similarities resolve toward the identity seen most recently.
///
/// Implementations must be safe for concurrent use, and an `upsert` must be
/// visible to every search that starts after it returns.
pub trait VectorIndex: Send + Sync {
    /// Add or replace an identity's entry in a partition.
    fn upsert(&self, partition: &PartitionKey, entry: IndexEntry) -> Result<()>;

    /// Return up to `top_k` nearest identities within a partition.
    fn search(&self, partition: &PartitionKey, query: &[f32], top_k: usize)
    -> Result<Vec<Neighbor>>;

    /// Number of identities indexed in a partition.
    fn len(&self, partition: &PartitionKey) -> usize;

    /// Return true if the partition has no identities.
    fn is_empty(&self, partition: &PartitionKey) -> bool {
        self.len(partition) == 0
    }
}

/// Order search hits: similarity desc, recency desc, id asc.
pub(crate) fn rank(neighbors: &mut [Neighbor]) {
    neighbors.sort_by(|a, b| {
        b.similarity
            .total_cmp(&a.similarity)
            .then_with(|| b.last_observed.cmp(&a.last_observed))
            .then_with(|| a.identity_id.cmp(&b.identity_id))
    });
}
