//! Error types for wildid.

use std::path::PathBuf;

/// Result type alias for wildid operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for wildid.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration directory could not be determined.
    #[error("could not determine configuration directory for this platform")]
    ConfigDirNotFound,

    /// Data directory could not be determined.
    #[error("could not determine data directory for this platform")]
    DataDirNotFound,

    /// Failed to read configuration file.
    #[error("failed to read config file '{path}'")]
    ConfigRead {
        /// Path to the config file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse configuration file.
    #[error("failed to parse config file '{path}'")]
    ConfigParse {
        /// Path to the config file.
        path: PathBuf,
        /// Underlying parse error.
        #[source]
        source: toml::de::Error,
    },

    /// Configuration validation failed.
    #[error("configuration validation failed: {message}")]
    ConfigValidation {
        /// Description of the validation failure.
        message: String,
    },

    /// Failed to write configuration file.
    #[error("failed to write config file '{path}'")]
    ConfigWrite {
        /// Path to the config file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to serialize configuration.
    #[error("failed to serialize config")]
    ConfigSerialize {
        /// Underlying serialization error.
        #[source]
        source: toml::ser::Error,
    },

    /// One or more classification labels have no partition assigned.
    #[error("partition mapping is incomplete, no partition for label(s): {}", .missing.join(", "))]
    PartitionMappingIncomplete {
        /// Labels without an entry in the mapping table.
        missing: Vec<String>,
    },

    /// Bounding box is too small to embed reliably.
    #[error(
        "crop for detection {detection_id} is too small ({width:.0}x{height:.0}, minimum {min_px}px per side)"
    )]
    CropTooSmall {
        /// Detection whose crop was rejected.
        detection_id: u64,
        /// Bounding box width in pixels.
        width: f32,
        /// Bounding box height in pixels.
        height: f32,
        /// Configured minimum side length.
        min_px: u32,
    },

    /// Embedding extraction failed or timed out.
    #[error("embedding extraction failed: {reason}")]
    EmbeddingFailed {
        /// Description of the failure.
        reason: String,
    },

    /// Storage layer failure.
    #[error("persistence failed: {reason}")]
    PersistenceFailed {
        /// Description of the failure.
        reason: String,
    },

    /// Vector dimension does not match the index.
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Dimension the index was built for.
        expected: usize,
        /// Dimension that was supplied.
        actual: usize,
    },

    /// Image is not known to the store.
    #[error("image {id} not found")]
    ImageNotFound {
        /// Image identifier.
        id: u64,
    },

    /// Detection is not known to the store.
    #[error("detection {id} not found")]
    DetectionNotFound {
        /// Detection identifier.
        id: u64,
    },

    /// Identity is not known to the store.
    #[error("identity {id} not found")]
    IdentityNotFound {
        /// Identity identifier.
        id: u64,
    },

    /// Failed to decode an image file.
    #[error("failed to load image '{path}'")]
    ImageLoad {
        /// Path to the image file.
        path: PathBuf,
        /// Underlying decode error.
        #[source]
        source: image::ImageError,
    },

    /// Failed to read a detector batch file.
    #[error("failed to read batch file '{path}'")]
    BatchRead {
        /// Path to the batch file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse a detector batch file.
    #[error("failed to parse batch file '{path}'")]
    BatchParse {
        /// Path to the batch file.
        path: PathBuf,
        /// Underlying parse error.
        #[source]
        source: serde_json::Error,
    },

    /// Detector output violates its contract.
    #[error("invalid detection in image {image_id}: {message}")]
    InvalidDetection {
        /// Image the detection belongs to.
        image_id: u64,
        /// Description of the problem.
        message: String,
    },

    /// Another process holds the database lock.
    #[error("database is locked by another process: {path}")]
    DatabaseLocked {
        /// Path to the lock file.
        path: PathBuf,
    },

    /// Failed to create lock file.
    #[error("failed to create lock file '{path}'")]
    LockCreate {
        /// Path to the lock file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to serialize output.
    #[error("failed to serialize output")]
    OutputSerialize {
        /// Underlying serialization error.
        #[source]
        source: serde_json::Error,
    },

    /// Internal error (for unexpected failures).
    #[error("internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
    },
}

impl Error {
    /// Whether the failure is transient and the work may be retried.
    ///
    /// Only embedding and storage failures qualify. A retryable failure is
    /// never evidence that a detection has no matching identity.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::EmbeddingFailed { .. } | Self::PersistenceFailed { .. }
        )
    }

    pub(crate) fn persistence(err: impl std::fmt::Display) -> Self {
        Self::PersistenceFailed {
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(
            Error::EmbeddingFailed {
                reason: "timeout".to_string()
            }
            .is_retryable()
        );
        assert!(Error::persistence("disk full").is_retryable());
        assert!(
            !Error::CropTooSmall {
                detection_id: 1,
                width: 20.0,
                height: 30.0,
                min_px: 50,
            }
            .is_retryable()
        );
        assert!(
            !Error::PartitionMappingIncomplete {
                missing: vec!["juvenile".to_string()]
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_partition_mapping_message_lists_labels() {
        let err = Error::PartitionMappingIncomplete {
            missing: vec!["juvenile".to_string(), "non-target".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "partition mapping is incomplete, no partition for label(s): juvenile, non-target"
        );
    }
}
