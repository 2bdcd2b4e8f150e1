//! Embedding extraction over HTTP.

use super::Embedder;
use crate::constants::embedding::CROP_CONTENT_TYPE;
use crate::error::{Error, Result};
use crate::imagery::Crop;
use reqwest::Client;
use serde::Deserialize;
use std::io::Cursor;
use std::time::Duration;
use tracing::trace;

/// Client for an embedding service that accepts a PNG crop in the request
/// body and answers with `{"embedding": [f32, ...]}`.
pub struct HttpEmbedder {
    client: Client,
    endpoint: String,
    dimension: usize,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

impl HttpEmbedder {
    /// Create a client for `endpoint` producing `dimension`-length vectors.
    pub fn new(endpoint: &str, dimension: usize, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::EmbeddingFailed {
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            dimension,
        })
    }
}

fn failed(reason: impl std::fmt::Display) -> Error {
    Error::EmbeddingFailed {
        reason: reason.to_string(),
    }
}

pub(crate) fn encode_png(crop: &Crop) -> Result<Vec<u8>> {
    let mut buf = Cursor::new(Vec::new());
    crop.pixels
        .write_to(&mut buf, image::ImageFormat::Png)
        .map_err(|e| failed(format!("failed to encode crop: {e}")))?;
    Ok(buf.into_inner())
}

pub(crate) fn parse_response(body: &[u8], dimension: usize) -> Result<Vec<f32>> {
    let parsed: EmbeddingResponse = serde_json::from_slice(body)
        .map_err(|e| failed(format!("malformed embedding response: {e}")))?;
    if parsed.embedding.len() != dimension {
        return Err(failed(format!(
            "expected {dimension}-dimensional embedding, got {}",
            parsed.embedding.len()
        )));
    }
    Ok(parsed.embedding)
}

#[async_trait::async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, crop: &Crop) -> Result<Vec<f32>> {
        let body = encode_png(crop)?;
        trace!(
            "Posting {}x{} crop for detection {} ({} bytes)",
            crop.width(),
            crop.height(),
            crop.detection_id,
            body.len()
        );

        let response = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, CROP_CONTENT_TYPE)
            .body(body)
            .send()
            .await
            .map_err(failed)?;

        let status = response.status();
        if !status.is_success() {
            return Err(failed(format!("embedding service returned {status}")));
        }

        let bytes = response.bytes().await.map_err(failed)?;
        parse_response(&bytes, self.dimension)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}
