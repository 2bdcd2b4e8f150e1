//! Exact in-memory vector index.

use std::collections::HashMap;
use std::sync::RwLock;

use super::cosine::cosine_similarity;
use super::{IndexEntry, Neighbor, VectorIndex, rank};
use crate::domain::{IdentityId, PartitionKey};
use crate::error::{Error, Result};

type Partition = HashMap<IdentityId, IndexEntry>;

/// In-memory index using exhaustive cosine comparison per partition.
///
/// Exact search is the degenerate case of approximate search, and partition
/// sizes (individuals of one sex at one site) stay small enough for it.
pub struct MemoryIndex {
    dimension: usize,
    partitions: RwLock<HashMap<PartitionKey, Partition>>,
}

impl MemoryIndex {
    /// Create an empty index for vectors of the given dimension.
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            partitions: RwLock::new(HashMap::new()),
        }
    }

    fn check_dimension(&self, len: usize) -> Result<()> {
        if len == self.dimension {
            Ok(())
        } else {
            Err(Error::DimensionMismatch {
                expected: self.dimension,
                actual: len,
            })
        }
    }
}

fn poisoned() -> Error {
    Error::Internal {
        message: "vector index lock poisoned".to_string(),
    }
}

impl VectorIndex for MemoryIndex {
    fn upsert(&self, partition: &PartitionKey, entry: IndexEntry) -> Result<()> {
        self.check_dimension(entry.vector.len())?;
        let mut partitions = self.partitions.write().map_err(|_| poisoned())?;
        partitions
            .entry(partition.clone())
            .or_default()
            .insert(entry.identity_id, entry);
        Ok(())
    }

    fn search(
        &self,
        partition: &PartitionKey,
        query: &[f32],
        top_k: usize,
    ) -> Result<Vec<Neighbor>> {
        self.check_dimension(query.len())?;
        let partitions = self.partitions.read().map_err(|_| poisoned())?;
        let Some(entries) = partitions.get(partition) else {
            return Ok(Vec::new());
        };
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let mut neighbors: Vec<Neighbor> = entries
            .values()
            .map(|entry| Neighbor {
                identity_id: entry.identity_id,
                similarity: cosine_similarity(query, &entry.vector),
                last_observed: entry.last_observed,
            })
            .collect();

        rank(&mut neighbors);
        neighbors.truncate(top_k);
        Ok(neighbors)
    }

    fn len(&self, partition: &PartitionKey) -> usize {
        self.partitions
            .read()
            .map(|p| p.get(partition).map_or(0, HashMap::len))
            .unwrap_or(0)
    }
}
