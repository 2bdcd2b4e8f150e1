//! Validated runtime settings.
//!
//! [`Settings`] is what the pipeline consumes. It can only be obtained through
//! [`crate::config::build_settings`], so every value in it has been range
//! checked and the partition mapping is known to be total.

use crate::config::EmbeddingUpdate;
use crate::domain::PartitionMap;
use std::time::Duration;

/// Validated settings for one resolution run.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Suppression, burst and matching parameters.
    pub resolution: ResolutionSettings,
    /// Embedding service parameters.
    pub embedder: EmbedderSettings,
    /// Task scheduling parameters.
    pub pipeline: PipelineSettings,
    /// Classification label → partition mapping.
    pub partitions: PartitionMap,
}

/// Suppression, burst and matching parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolutionSettings {
    /// IoU above which a detection is a duplicate.
    pub iou_threshold: f32,
    /// Burst window either side of the capture time.
    pub burst_window: Duration,
    /// Minimum bounding box side length in pixels.
    pub min_crop_px: u32,
    /// Cosine similarity needed to accept a match.
    pub similarity_threshold: f32,
    /// Number of nearest identities inspected per search.
    pub search_top_k: usize,
    /// Representative embedding maintenance policy.
    pub embedding_update: EmbeddingUpdate,
}

/// Embedding service parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbedderSettings {
    /// Service URL, if configured.
    pub endpoint: Option<String>,
    /// Expected embedding dimension.
    pub dimension: usize,
    /// Extraction timeout.
    pub timeout: Duration,
}

/// Task scheduling parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSettings {
    /// Maximum number of tasks running at once.
    pub concurrency: usize,
    /// Matching attempts before giving up.
    pub max_attempts: u32,
    /// Delay before the first retry, doubled for each further attempt.
    pub retry_backoff: Duration,
}
