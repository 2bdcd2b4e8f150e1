//! Classification labels and the label → partition mapping.
//!
//! The label set is closed. Every label must be assigned a partition
//! explicitly; a table with a missing label is rejected when the
//! configuration is validated, never patched up with a fallback at
//! resolution time.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Detector classification label.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum Classification {
    /// Adult female of the target species.
    FemaleAdult,
    /// Sub-adult female of the target species.
    FemaleSubadult,
    /// Adult male of the target species.
    MaleAdult,
    /// Sub-adult male of the target species.
    MaleSubadult,
    /// Juvenile of the target species, sex not assessable.
    Juvenile,
    /// Target species, sex and age not assessable.
    Indeterminate,
    /// Any other species.
    NonTarget,
}

impl Classification {
    /// Number of labels in the closed set.
    pub const COUNT: usize = 7;

    /// Every label, in declaration order.
    pub const ALL: [Self; Self::COUNT] = [
        Self::FemaleAdult,
        Self::FemaleSubadult,
        Self::MaleAdult,
        Self::MaleSubadult,
        Self::Juvenile,
        Self::Indeterminate,
        Self::NonTarget,
    ];

    /// Label as written in detector output and config files.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::FemaleAdult => "female-adult",
            Self::FemaleSubadult => "female-subadult",
            Self::MaleAdult => "male-adult",
            Self::MaleSubadult => "male-subadult",
            Self::Juvenile => "juvenile",
            Self::Indeterminate => "indeterminate",
            Self::NonTarget => "non-target",
        }
    }

    /// Partition shipped in the default configuration.
    pub const fn default_partition(self) -> &'static str {
        match self {
            Self::FemaleAdult | Self::FemaleSubadult => "female",
            Self::MaleAdult | Self::MaleSubadult => "male",
            Self::Juvenile => "juvenile",
            Self::Indeterminate => "indeterminate",
            Self::NonTarget => "non-target",
        }
    }

    const fn index(self) -> usize {
        self as usize
    }
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Classification {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown classification label: {s}"))
    }
}

/// Coarse category that restricts which identities a detection may match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionKey(String);

impl PartitionKey {
    /// Create a partition key.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Total mapping from every classification label to a partition.
///
/// Can only be built from a table that covers the whole label set, so
/// [`PartitionMap::partition_for`] has no failure case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionMap {
    entries: [PartitionKey; Classification::COUNT],
}

impl PartitionMap {
    /// Build the mapping from a `label = "partition"` table.
    ///
    /// Fails with [`Error::PartitionMappingIncomplete`] naming every label
    /// without an entry, and with [`Error::ConfigValidation`] for unknown
    /// labels or blank partition names.
    pub fn from_table(table: &BTreeMap<String, String>) -> Result<Self> {
        let unknown: Vec<&str> = table
            .keys()
            .filter(|label| label.parse::<Classification>().is_err())
            .map(String::as_str)
            .collect();
        if !unknown.is_empty() {
            return Err(Error::ConfigValidation {
                message: format!(
                    "partition table names unknown label(s): {}",
                    unknown.join(", ")
                ),
            });
        }

        let mut keys = Vec::with_capacity(Classification::COUNT);
        let mut missing = Vec::new();
        for label in Classification::ALL {
            match table.get(label.as_str()) {
                Some(partition) if partition.trim().is_empty() => {
                    return Err(Error::ConfigValidation {
                        message: format!("partition for label '{label}' is blank"),
                    });
                }
                Some(partition) => keys.push(PartitionKey::new(partition.trim())),
                None => missing.push(label.as_str().to_string()),
            }
        }
        if !missing.is_empty() {
            return Err(Error::PartitionMappingIncomplete { missing });
        }

        let entries = keys.try_into().map_err(|_| Error::Internal {
            message: "partition table length does not match label set".to_string(),
        })?;
        Ok(Self { entries })
    }

    /// The default `label = "partition"` table.
    pub fn default_table() -> BTreeMap<String, String> {
        Classification::ALL
            .into_iter()
            .map(|c| (c.as_str().to_string(), c.default_partition().to_string()))
            .collect()
    }

    /// Partition for a classification label.
    pub fn partition_for(&self, label: Classification) -> &PartitionKey {
        &self.entries[label.index()]
    }

    /// Distinct partitions named by the mapping.
    pub fn partitions(&self) -> BTreeSet<&PartitionKey> {
        self.entries.iter().collect()
    }
}

impl Default for PartitionMap {
    fn default() -> Self {
        Self {
            entries: Classification::ALL.map(|c| PartitionKey::new(c.default_partition())),
        }
    }
}
