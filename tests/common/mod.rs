//! Shared fixtures for pipeline integration tests.

#![allow(dead_code, clippy::unwrap_used)]

use chrono::{DateTime, Duration as TimeDelta, TimeZone, Utc};
use image::RgbImage;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wildid::config::{Config, Settings, build_settings};
use wildid::domain::{
    BoundingBox, Classification, Detection, DetectionId, Identity, IdentityId, Image, ImageId,
    RawDetection,
};
use wildid::embedding::Embedder;
use wildid::imagery::{Crop, CropSource};
use wildid::index::MemoryIndex;
use wildid::ingest::ImageRecord;
use wildid::pipeline::{Orchestrator, RunSummary};
use wildid::store::{
    BurstCandidate, BurstLinked, BurstQuery, Linked, MatchRecord, MemoryStore, NewIdentity, Store,
    SuppressionMark,
};
use wildid::{Error, Result};

pub const DIM: usize = 4;

/// Capture time `secs` after a fixed night-time origin.
pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 2, 0, 0).unwrap() + TimeDelta::seconds(secs)
}

/// Settings for tests: tiny embeddings, fast retries.
pub fn settings(threshold: f32) -> Settings {
    let mut config = Config::default();
    config.resolution.similarity_threshold = Some(threshold);
    config.embedder.dimension = DIM;
    config.pipeline.concurrency = 4;
    config.pipeline.max_attempts = 4;
    config.pipeline.retry_backoff_ms = 1;
    build_settings(&config).unwrap()
}

pub fn bbox(x: f32, y: f32, w: f32, h: f32) -> BoundingBox {
    BoundingBox::new(x, y, x + w, y + h)
}

pub fn raw(bbox: BoundingBox, confidence: f32, classification: Classification) -> RawDetection {
    RawDetection {
        bbox,
        confidence,
        classification,
    }
}

pub fn record(id: u64, location: &str, secs: i64, detections: Vec<RawDetection>) -> ImageRecord {
    ImageRecord {
        image: Image {
            id: ImageId(id),
            timestamp: at(secs),
            location: location.to_string(),
            path: PathBuf::from(format!("{location}/{id}.jpg")),
        },
        detections,
    }
}

/// Unit vector at `similarity` cosine from the first axis, in the plane of
/// the first two axes.
pub fn at_similarity(similarity: f32) -> Vec<f32> {
    let rest = (1.0 - similarity * similarity).max(0.0).sqrt();
    vec![similarity, rest, 0.0, 0.0]
}

pub fn axis(n: usize) -> Vec<f32> {
    let mut v = vec![0.0; DIM];
    v[n] = 1.0;
    v
}

/// Embedder returning preset vectors per detection.
#[derive(Default)]
pub struct FakeEmbedder {
    vectors: Mutex<HashMap<DetectionId, Vec<f32>>>,
    calls: AtomicUsize,
    failures_left: AtomicUsize,
    delay: Mutex<Option<Duration>>,
}

impl FakeEmbedder {
    pub fn set(&self, detection: DetectionId, vector: Vec<f32>) {
        self.vectors.lock().unwrap().insert(detection, vector);
    }

    pub fn fail_next(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Embedder for FakeEmbedder {
    async fn embed(&self, crop: &Crop) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::EmbeddingFailed {
                reason: "service unavailable".to_string(),
            });
        }
        self.vectors
            .lock()
            .unwrap()
            .get(&crop.detection_id)
            .cloned()
            .ok_or_else(|| Error::EmbeddingFailed {
                reason: format!("no vector for detection {}", crop.detection_id),
            })
    }

    fn dimension(&self) -> usize {
        DIM
    }
}

/// Crop source that never touches the filesystem.
#[derive(Default)]
pub struct FakeCrops {
    calls: AtomicUsize,
}

impl FakeCrops {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl CropSource for FakeCrops {
    async fn crop(
        &self,
        _image: &Image,
        detection_id: DetectionId,
        _bbox: &BoundingBox,
    ) -> Result<Crop> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Crop {
            detection_id,
            pixels: RgbImage::new(2, 2),
        })
    }
}

/// Store wrapper whose burst queries fail.
pub struct BurstlessStore {
    pub inner: MemoryStore,
}

#[async_trait::async_trait]
impl Store for BurstlessStore {
    async fn insert_image(
        &self,
        image: &Image,
        detections: &[RawDetection],
    ) -> Result<Vec<DetectionId>> {
        self.inner.insert_image(image, detections).await
    }

    async fn image(&self, id: ImageId) -> Result<Image> {
        self.inner.image(id).await
    }

    async fn detection(&self, id: DetectionId) -> Result<Detection> {
        self.inner.detection(id).await
    }

    async fn detections_for_image(&self, id: ImageId) -> Result<Vec<Detection>> {
        self.inner.detections_for_image(id).await
    }

    async fn apply_suppression(&self, image_id: ImageId, marks: &[SuppressionMark]) -> Result<()> {
        self.inner.apply_suppression(image_id, marks).await
    }

    async fn burst_candidates(&self, _query: &BurstQuery<'_>) -> Result<Vec<BurstCandidate>> {
        Err(Error::PersistenceFailed {
            reason: "burst index offline".to_string(),
        })
    }

    async fn link_burst(
        &self,
        detection_id: DetectionId,
        anchor: DetectionId,
        identity_id: IdentityId,
        observed_at: DateTime<Utc>,
    ) -> Result<BurstLinked> {
        self.inner
            .link_burst(detection_id, anchor, identity_id, observed_at)
            .await
    }

    async fn mark_burst_miss(&self, detection_id: DetectionId) -> Result<()> {
        self.inner.mark_burst_miss(detection_id).await
    }

    async fn record_failure(
        &self,
        detection_id: DetectionId,
        message: &str,
        permanent: bool,
    ) -> Result<()> {
        self.inner
            .record_failure(detection_id, message, permanent)
            .await
    }

    async fn record_match(&self, record: MatchRecord<'_>) -> Result<Linked> {
        self.inner.record_match(record).await
    }

    async fn create_identity(&self, new: NewIdentity<'_>) -> Result<Linked> {
        self.inner.create_identity(new).await
    }

    async fn identity(&self, id: IdentityId) -> Result<Identity> {
        self.inner.identity(id).await
    }

    async fn identities(&self) -> Result<Vec<Identity>> {
        self.inner.identities().await
    }

    async fn unresolved_detections(&self) -> Result<Vec<Detection>> {
        self.inner.unresolved_detections().await
    }
}

/// A fully wired pipeline over fakes.
pub struct Harness {
    pub store: Arc<dyn Store>,
    pub index: Arc<MemoryIndex>,
    pub embedder: Arc<FakeEmbedder>,
    pub crops: Arc<FakeCrops>,
    pub orchestrator: Arc<Orchestrator>,
}

impl Harness {
    pub fn new(settings: &Settings) -> Self {
        Self::with_store(settings, Arc::new(MemoryStore::new()))
    }

    pub fn with_store(settings: &Settings, store: Arc<dyn Store>) -> Self {
        let index = Arc::new(MemoryIndex::new(DIM));
        let embedder = Arc::new(FakeEmbedder::default());
        let crops = Arc::new(FakeCrops::default());
        let orchestrator = Arc::new(Orchestrator::new(
            settings,
            Arc::clone(&store),
            index.clone(),
            embedder.clone(),
            crops.clone(),
        ));
        Self {
            store,
            index,
            embedder,
            crops,
            orchestrator,
        }
    }

    /// Store records and return their detections, in image order.
    pub async fn ingest(&self, records: &[ImageRecord]) -> Vec<Detection> {
        self.orchestrator.ingest(records).await.unwrap();
        let mut all = Vec::new();
        for r in records {
            all.extend(self.store.detections_for_image(r.image.id).await.unwrap());
        }
        all
    }

    /// Run suppression for `records` and everything after it.
    pub async fn run(&self, records: &[ImageRecord]) -> RunSummary {
        let tasks = self.orchestrator.ingest(records).await.unwrap();
        Arc::clone(&self.orchestrator).run(tasks, None).await
    }

    pub async fn detection(&self, id: DetectionId) -> Detection {
        self.store.detection(id).await.unwrap()
    }
}
