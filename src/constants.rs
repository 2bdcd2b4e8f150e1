//! Application-wide constants.
//!
//! All magic numbers and strings are defined here to ensure consistency
//! and make changes easy to track.

/// Application name used for config/data directories and user-facing messages.
pub const APP_NAME: &str = "wildid";

/// Default IoU above which a lower-confidence detection is a duplicate.
pub const DEFAULT_IOU_THRESHOLD: f32 = 0.5;

/// Default burst window in seconds (either side of the capture time).
pub const DEFAULT_BURST_WINDOW_SECS: u64 = 5;

/// Default minimum bounding box side length in pixels.
pub const DEFAULT_MIN_CROP_PX: u32 = 50;

/// Similarity threshold written by `config init`.
///
/// This is only a template value. The runtime never falls back to it: the
/// threshold must be present in the config file or given on the command line.
pub const TEMPLATE_SIMILARITY_THRESHOLD: f32 = 0.85;

/// Default number of nearest identities inspected per search.
pub const DEFAULT_SEARCH_TOP_K: usize = 10;

/// Embedding settings.
pub mod embedding {
    /// Default embedding dimension.
    pub const DEFAULT_DIMENSION: usize = 512;

    /// Default embedding extraction timeout in seconds.
    pub const DEFAULT_TIMEOUT_SECS: u64 = 10;

    /// Content type used when posting crops to the embedding service.
    pub const CROP_CONTENT_TYPE: &str = "image/png";
}

/// Pipeline scheduling settings.
pub mod pipeline {
    /// Default number of tasks run concurrently.
    pub const DEFAULT_CONCURRENCY: usize = 8;

    /// Default number of matching attempts per detection.
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

    /// Default initial retry backoff in milliseconds.
    pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 500;

    /// Upper bound on a single retry delay in milliseconds.
    pub const MAX_RETRY_BACKOFF_MS: u64 = 60_000;
}

/// Threshold value bounds.
pub mod threshold {
    /// Minimum valid threshold.
    pub const MIN: f32 = 0.0;
    /// Maximum valid threshold.
    pub const MAX: f32 = 1.0;
}

/// Default database file name inside the data directory.
pub const DATABASE_FILE_NAME: &str = "wildid.sqlite3";

/// Lock file extension appended to the database path.
pub const LOCK_FILE_EXTENSION: &str = ".wildid.lock";
