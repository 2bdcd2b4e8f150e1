//! Appearance embedding extraction.

mod http;

pub use http::HttpEmbedder;

use crate::error::Result;
use crate::imagery::Crop;

/// Converts a detection crop into a fixed-length appearance vector.
///
/// Constructed once per process and injected into the matcher.
/// Implementations must be safe for concurrent use (Send + Sync).
#[async_trait::async_trait]
pub trait Embedder: Send + Sync {
    /// Return the embedding vector for one crop.
    ///
    /// Failures must be reported as [`crate::Error::EmbeddingFailed`].
    async fn embed(&self, crop: &Crop) -> Result<Vec<f32>>;

    /// Return the dimensionality of the output vectors.
    fn dimension(&self) -> usize;
}
