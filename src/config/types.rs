//! Configuration type definitions.

use crate::constants::{
    DEFAULT_BURST_WINDOW_SECS, DEFAULT_IOU_THRESHOLD, DEFAULT_MIN_CROP_PX, DEFAULT_SEARCH_TOP_K,
    TEMPLATE_SIMILARITY_THRESHOLD, embedding, pipeline,
};
use crate::domain::PartitionMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Complete application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Identity resolution settings.
    pub resolution: ResolutionConfig,

    /// Embedding service settings.
    pub embedder: EmbedderConfig,

    /// Storage settings.
    pub storage: StorageConfig,

    /// Task scheduling settings.
    pub pipeline: PipelineConfig,

    /// Classification label → partition table. Must name every label.
    pub partitions: BTreeMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            resolution: ResolutionConfig::default(),
            embedder: EmbedderConfig::default(),
            storage: StorageConfig::default(),
            pipeline: PipelineConfig::default(),
            partitions: PartitionMap::default_table(),
        }
    }
}

impl Config {
    /// Configuration written by `config init`.
    ///
    /// Identical to the defaults except that the similarity threshold is
    /// spelled out, so the file documents the value in force.
    pub fn template() -> Self {
        let mut config = Self::default();
        config.resolution.similarity_threshold = Some(TEMPLATE_SIMILARITY_THRESHOLD);
        config
    }
}

/// Identity resolution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolutionConfig {
    /// IoU above which a lower-confidence detection is marked duplicate.
    pub iou_threshold: f32,

    /// Burst window in seconds either side of the capture time.
    pub burst_window_secs: u64,

    /// Minimum bounding box side length in pixels.
    pub min_crop_px: u32,

    /// Cosine similarity needed to accept a match. Required.
    pub similarity_threshold: Option<f32>,

    /// Number of nearest identities inspected per search.
    pub search_top_k: usize,

    /// How an identity's representative embedding changes on a match.
    pub embedding_update: EmbeddingUpdate,
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            iou_threshold: DEFAULT_IOU_THRESHOLD,
            burst_window_secs: DEFAULT_BURST_WINDOW_SECS,
            min_crop_px: DEFAULT_MIN_CROP_PX,
            similarity_threshold: None,
            search_top_k: DEFAULT_SEARCH_TOP_K,
            embedding_update: EmbeddingUpdate::default(),
        }
    }
}

/// Representative embedding maintenance policy.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum EmbeddingUpdate {
    /// Keep the embedding the identity was founded with.
    #[default]
    Keep,
    /// Fold each matched embedding into a count-weighted mean.
    RunningMean,
}

/// Embedding service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbedderConfig {
    /// URL that accepts a PNG crop and returns `{"embedding": [...]}`.
    pub endpoint: Option<String>,

    /// Expected embedding dimension.
    pub dimension: usize,

    /// Extraction timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for EmbedderConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            dimension: embedding::DEFAULT_DIMENSION,
            timeout_secs: embedding::DEFAULT_TIMEOUT_SECS,
        }
    }
}

/// Storage settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database path (default: platform data directory).
    pub database: Option<PathBuf>,
}

/// Task scheduling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Maximum number of tasks running at once.
    pub concurrency: usize,

    /// Matching attempts before a detection is left for manual retry.
    pub max_attempts: u32,

    /// Initial retry backoff in milliseconds, doubled per attempt.
    pub retry_backoff_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency: pipeline::DEFAULT_CONCURRENCY,
            max_attempts: pipeline::DEFAULT_MAX_ATTEMPTS,
            retry_backoff_ms: pipeline::DEFAULT_RETRY_BACKOFF_MS,
        }
    }
}
