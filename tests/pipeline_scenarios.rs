//! End-to-end pipeline behaviour over in-process fakes.

#![allow(clippy::unwrap_used)]

mod common;

use common::{BurstlessStore, Harness, at, at_similarity, axis, bbox, raw, record, settings};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use wildid::Error;
use wildid::config::{Config, build_settings};
use wildid::domain::{Classification, DetectionState, IdentityId, PartitionKey};
use wildid::index::{IndexEntry, MemoryIndex, VectorIndex};
use wildid::pipeline::{MatchDecision, Outcome, Task, rebuild_index, select_match};
use wildid::store::{MemoryStore, SqliteStore};

const FEMALE: Classification = Classification::FemaleAdult;
const MALE: Classification = Classification::MaleAdult;

fn one(id: u64, location: &str, secs: i64, label: Classification) -> wildid::ingest::ImageRecord {
    record(id, location, secs, vec![raw(bbox(100.0, 100.0, 200.0, 200.0), 0.9, label)])
}

#[tokio::test]
async fn test_overlapping_boxes_lower_confidence_is_duplicate() {
    let h = Harness::new(&settings(0.85));
    // 100x100 boxes offset by 10px horizontally: IoU = 9000/11000 ≈ 0.82
    let records = vec![record(
        1,
        "cam-1",
        0,
        vec![
            raw(bbox(100.0, 100.0, 100.0, 100.0), 0.7, FEMALE),
            raw(bbox(110.0, 100.0, 100.0, 100.0), 0.9, FEMALE),
        ],
    )];
    let detections = h.ingest(&records).await;
    h.embedder.set(detections[0].id, axis(0));
    h.embedder.set(detections[1].id, axis(0));

    let summary = h.run(&records).await;

    assert_eq!(summary.images, 1);
    assert_eq!(summary.keepers, 1);
    assert_eq!(summary.duplicates, 1);
    assert_eq!(summary.created, 1);

    let low = h.detection(detections[0].id).await;
    let high = h.detection(detections[1].id).await;
    assert!(low.is_duplicate);
    assert_eq!(low.duplicate_of, Some(high.id));
    assert!(!high.is_duplicate);
    // The duplicate follows its keeper's identity.
    assert!(high.identity_id.is_some());
    assert_eq!(low.identity_id, high.identity_id);
    assert_eq!(h.embedder.calls(), 1);
}

#[tokio::test]
async fn test_burst_mate_reuses_identity_without_embedding() {
    let h = Harness::new(&settings(0.85));
    let first = vec![one(1, "cam-1", 0, FEMALE)];
    let d1 = h.ingest(&first).await[0].id;
    h.embedder.set(d1, axis(0));
    let summary = h.run(&first).await;
    assert_eq!(summary.created, 1);
    assert_eq!(h.embedder.calls(), 1);

    let second = vec![one(2, "cam-1", 2, FEMALE)];
    let d2 = h.ingest(&second).await[0].id;
    let summary = h.run(&second).await;

    assert_eq!(summary.burst_reused, 1);
    assert_eq!(h.embedder.calls(), 1, "burst reuse must not embed");

    let a = h.detection(d1).await;
    let b = h.detection(d2).await;
    assert_eq!(a.identity_id, b.identity_id);
    assert_eq!(b.state, DetectionState::BurstResolved);
    assert!(b.burst_group.is_some());
    assert_eq!(a.burst_group, b.burst_group);

    let identity = h.store.identity(a.identity_id.unwrap()).await.unwrap();
    assert_eq!(identity.observation_count, 2);
    assert_eq!(identity.last_observed, at(2));
}

#[tokio::test]
async fn test_outside_burst_window_goes_to_matcher() {
    let h = Harness::new(&settings(0.85));
    let first = vec![one(1, "cam-1", 0, FEMALE)];
    let d1 = h.ingest(&first).await[0].id;
    h.embedder.set(d1, axis(0));
    h.run(&first).await;

    let later = vec![one(2, "cam-1", 60, FEMALE)];
    let d2 = h.ingest(&later).await[0].id;
    h.embedder.set(d2, axis(1));
    let summary = h.run(&later).await;

    assert_eq!(summary.burst_reused, 0);
    assert_eq!(summary.created, 1);
    assert_eq!(h.embedder.calls(), 2);
    assert_eq!(h.store.identities().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_match_above_threshold_extends_identity() {
    let h = Harness::new(&settings(0.85));
    let first = vec![one(1, "cam-1", 0, MALE)];
    let d1 = h.ingest(&first).await[0].id;
    h.embedder.set(d1, axis(0));
    h.run(&first).await;
    let y = h.detection(d1).await.identity_id.unwrap();

    // Different camera, so no burst: the matcher must find Y.
    let second = vec![one(2, "cam-9", 3600, MALE)];
    let d2 = h.ingest(&second).await[0].id;
    h.embedder.set(d2, at_similarity(0.91));
    let summary = h.run(&second).await;

    assert_eq!(summary.matched, 1);
    assert_eq!(summary.created, 0);
    let matched = h.detection(d2).await;
    assert_eq!(matched.identity_id, Some(y));
    assert_eq!(matched.state, DetectionState::Matched);

    let identity = h.store.identity(y).await.unwrap();
    assert_eq!(identity.observation_count, 2);
    assert_eq!(identity.first_observed, at(0));
    assert_eq!(identity.last_observed, at(3600));
    assert_eq!(identity.partition, PartitionKey::new("male"));
}

#[tokio::test]
async fn test_below_threshold_creates_new_identity() {
    let h = Harness::new(&settings(0.95));
    let first = vec![one(1, "cam-1", 0, MALE)];
    let d1 = h.ingest(&first).await[0].id;
    h.embedder.set(d1, axis(0));
    h.run(&first).await;

    let second = vec![one(2, "cam-9", 3600, MALE)];
    let d2 = h.ingest(&second).await[0].id;
    h.embedder.set(d2, at_similarity(0.91));
    let summary = h.run(&second).await;

    assert_eq!(summary.created, 1);
    assert_ne!(
        h.detection(d1).await.identity_id,
        h.detection(d2).await.identity_id
    );
}

#[tokio::test]
async fn test_partitions_never_cross() {
    let h = Harness::new(&settings(0.5));
    let first = vec![one(1, "cam-1", 0, MALE)];
    let d1 = h.ingest(&first).await[0].id;
    h.embedder.set(d1, axis(0));
    h.run(&first).await;

    // Identical appearance but a female label.
    let second = vec![one(2, "cam-9", 3600, FEMALE)];
    let d2 = h.ingest(&second).await[0].id;
    h.embedder.set(d2, axis(0));
    let summary = h.run(&second).await;

    assert_eq!(summary.matched, 0);
    assert_eq!(summary.created, 1);
    let identities = h.store.identities().await.unwrap();
    assert_eq!(identities.len(), 2);
    assert_eq!(identities[1].partition, PartitionKey::new("female"));
}

#[tokio::test]
async fn test_small_crop_rejected_without_embedding() {
    let h = Harness::new(&settings(0.85));
    let records = vec![record(
        1,
        "cam-1",
        0,
        vec![raw(bbox(10.0, 10.0, 20.0, 30.0), 0.8, FEMALE)],
    )];
    let d = h.ingest(&records).await[0].id;
    let summary = h.run(&records).await;

    assert_eq!(summary.rejected, 1);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.retries, 0);
    assert_eq!(h.embedder.calls(), 0);
    assert_eq!(h.crops.calls(), 0);

    let detection = h.detection(d).await;
    assert_eq!(detection.state, DetectionState::Rejected);
    assert!(detection.identity_id.is_none());
    assert!(
        detection
            .last_error
            .as_deref()
            .is_some_and(|m| m.contains("20"))
    );

    // Rejected detections are not picked up again.
    assert!(h.orchestrator.pending_tasks().await.unwrap().is_empty());
}

#[test]
fn test_incomplete_partition_table_refused() {
    let mut config = Config::default();
    config.resolution.similarity_threshold = Some(0.85);
    config.partitions.remove("juvenile");

    let err = build_settings(&config).unwrap_err();
    assert!(matches!(
        &err,
        Error::PartitionMappingIncomplete { missing } if missing.iter().any(|m| m == "juvenile")
    ));
}

#[test]
fn test_missing_threshold_refused() {
    let config = Config::default();
    let err = build_settings(&config).unwrap_err();
    assert!(matches!(err, Error::ConfigValidation { .. }));
    assert!(err.to_string().contains("similarity_threshold"));
}

#[tokio::test]
async fn test_concurrent_first_sightings_create_one_identity() {
    let h = Harness::new(&settings(0.85));
    h.embedder.set_delay(Duration::from_millis(30));
    // Different cameras, so burst linking cannot merge them.
    let records = vec![one(1, "cam-1", 0, FEMALE), one(2, "cam-2", 0, FEMALE)];
    let detections = h.ingest(&records).await;
    for d in &detections {
        h.embedder.set(d.id, axis(0));
    }

    let summary = h.run(&records).await;

    assert_eq!(summary.created, 1);
    assert_eq!(summary.matched, 1);
    assert_eq!(h.store.identities().await.unwrap().len(), 1);
    let a = h.detection(detections[0].id).await;
    let b = h.detection(detections[1].id).await;
    assert_eq!(a.identity_id, b.identity_id);
    let identity = h.store.identity(a.identity_id.unwrap()).await.unwrap();
    assert_eq!(identity.observation_count, 2);
}

#[tokio::test]
async fn test_burst_linked_in_one_run_share_identity() {
    let h = Harness::new(&settings(0.85));
    h.embedder.set_delay(Duration::from_millis(10));
    let records = vec![
        one(1, "cam-1", 0, FEMALE),
        one(2, "cam-1", 2, FEMALE),
        one(3, "cam-1", 4, FEMALE),
    ];
    let detections = h.ingest(&records).await;
    // Orthogonal appearance: only burst linking can merge them.
    for (n, d) in detections.iter().enumerate() {
        h.embedder.set(d.id, axis(n));
    }

    let summary = h.run(&records).await;

    assert_eq!(summary.failed, 0);
    assert_eq!(summary.created, 1);
    assert_eq!(summary.resolved(), 3);
    assert_eq!(h.store.identities().await.unwrap().len(), 1);
    let mut ids = Vec::new();
    for d in &detections {
        ids.push(h.detection(d.id).await.identity_id.unwrap());
    }
    assert!(ids.iter().all(|id| *id == ids[0]));
}

#[tokio::test]
async fn test_burst_mates_matching_different_identities_converge() {
    let h = Harness::new(&settings(0.85));
    for (id, secs, vector) in [(1, 0, axis(0)), (2, 7200, axis(1))] {
        let seed = vec![one(id, "cam-9", secs, FEMALE)];
        let d = h.ingest(&seed).await[0].id;
        h.embedder.set(d, vector);
        h.run(&seed).await;
    }
    assert_eq!(h.store.identities().await.unwrap().len(), 2);

    // Each burst member alone would match a different known identity.
    h.embedder.set_delay(Duration::from_millis(20));
    let records = vec![
        one(3, "cam-1", 10_000, FEMALE),
        one(4, "cam-1", 10_002, FEMALE),
    ];
    let detections = h.ingest(&records).await;
    h.embedder.set(detections[0].id, axis(0));
    h.embedder.set(detections[1].id, axis(1));

    let summary = h.run(&records).await;

    assert_eq!(summary.failed, 0);
    assert_eq!(summary.matched, 1);
    assert_eq!(summary.burst_reused, 1);
    assert_eq!(summary.created, 0);
    let a = h.detection(detections[0].id).await;
    let b = h.detection(detections[1].id).await;
    assert!(a.identity_id.is_some());
    assert_eq!(a.identity_id, b.identity_id);
    assert_eq!(h.store.identities().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_burst_mates_across_partitions_converge() {
    let h = Harness::new(&settings(0.85));
    let seeds = [(1, "cam-8", FEMALE, axis(0)), (2, "cam-9", MALE, axis(1))];
    for (id, location, label, vector) in seeds {
        let seed = vec![one(id, location, 0, label)];
        let d = h.ingest(&seed).await[0].id;
        h.embedder.set(d, vector);
        h.run(&seed).await;
    }

    h.embedder.set_delay(Duration::from_millis(20));
    let records = vec![one(3, "cam-1", 600, FEMALE), one(4, "cam-1", 601, MALE)];
    let detections = h.ingest(&records).await;
    h.embedder.set(detections[0].id, axis(0));
    h.embedder.set(detections[1].id, axis(1));

    let summary = h.run(&records).await;

    assert_eq!(summary.resolved(), 2);
    assert_eq!(
        h.detection(detections[0].id).await.identity_id,
        h.detection(detections[1].id).await.identity_id
    );
}

#[tokio::test]
async fn test_burst_link_refreshes_index_recency() {
    let h = Harness::new(&settings(0.85));
    let x = vec![one(1, "cam-1", 0, FEMALE)];
    let dx = h.ingest(&x).await[0].id;
    h.embedder.set(dx, axis(0));
    h.run(&x).await;
    let y = vec![one(2, "cam-5", 10, FEMALE)];
    let dy = h.ingest(&y).await[0].id;
    h.embedder.set(dy, axis(1));
    h.run(&y).await;
    let x_id = h.detection(dx).await.identity_id.unwrap();
    let y_id = h.detection(dy).await.identity_id.unwrap();
    assert_ne!(x_id, y_id);

    // A chain of burst sightings keeps X in view until t=16.
    for (n, secs) in [4, 8, 12, 16].into_iter().enumerate() {
        let burst = vec![one(10 + n as u64, "cam-1", secs, FEMALE)];
        let summary = h.run(&burst).await;
        assert_eq!(summary.burst_reused, 1);
    }
    assert_eq!(h.store.identity(x_id).await.unwrap().last_observed, at(16));

    // Equally similar to X and Y: the more recently seen identity wins.
    let half = std::f32::consts::FRAC_1_SQRT_2;
    let neighbors = h
        .index
        .search(&PartitionKey::new("female"), &[half, half, 0.0, 0.0], 5)
        .unwrap();
    assert_eq!(neighbors[0].similarity, neighbors[1].similarity);
    assert_eq!(
        select_match(&neighbors, 0.5),
        MatchDecision::Match {
            identity_id: x_id,
            similarity: neighbors[0].similarity,
        }
    );
}

#[tokio::test]
async fn test_redelivered_suppression_keeps_rejected_detection() {
    let h = Harness::new(&settings(0.85));
    let small = vec![record(
        1,
        "cam-1",
        0,
        vec![raw(bbox(10.0, 10.0, 20.0, 30.0), 0.8, FEMALE)],
    )];
    let rejected = h.ingest(&small).await[0].id;
    assert_eq!(h.run(&small).await.rejected, 1);

    let mate = vec![one(2, "cam-1", 2, FEMALE)];
    let d = h.ingest(&mate).await[0].id;
    h.embedder.set(d, axis(0));
    assert_eq!(h.run(&mate).await.created, 1);

    let summary = h.run(&small).await;

    assert_eq!(summary.resolved(), 0);
    let detection = h.detection(rejected).await;
    assert_eq!(detection.state, DetectionState::Rejected);
    assert!(detection.identity_id.is_none());
    assert!(detection.burst_group.is_none());
    let step = h
        .orchestrator
        .handle(Task::Link {
            detection_id: rejected,
        })
        .await
        .unwrap();
    assert_eq!(step.outcome, Outcome::Skipped);
}

#[test]
fn test_raising_threshold_never_adds_matches() {
    let index = MemoryIndex::new(4);
    let partition = PartitionKey::new("female");
    for (n, similarity) in [0.99_f32, 0.9, 0.8, 0.6, 0.3].into_iter().enumerate() {
        index
            .upsert(
                &partition,
                IndexEntry {
                    identity_id: IdentityId(n as u64 + 1),
                    vector: at_similarity(similarity),
                    last_observed: at(0),
                },
            )
            .unwrap();
    }

    let queries = [axis(0), at_similarity(0.7), axis(1), axis(2)];
    let thresholds = [0.0_f32, 0.25, 0.5, 0.75, 0.85, 0.95, 1.0];
    for query in &queries {
        let neighbors = index.search(&partition, query, 10).unwrap();
        let matched: Vec<bool> = thresholds
            .iter()
            .map(|t| matches!(select_match(&neighbors, *t), MatchDecision::Match { .. }))
            .collect();
        for pair in matched.windows(2) {
            assert!(
                pair[0] || !pair[1],
                "higher threshold matched where a lower one did not"
            );
        }
    }
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let h = Harness::new(&settings(0.85));
    let records = vec![one(1, "cam-1", 0, FEMALE)];
    let d = h.ingest(&records).await[0].id;
    h.embedder.set(d, axis(0));
    h.embedder.fail_next(2);

    let summary = h.run(&records).await;

    assert_eq!(summary.retries, 2);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.created, 1);
    let detection = h.detection(d).await;
    assert_eq!(detection.state, DetectionState::Created);
    assert_eq!(detection.attempts, 2);
    assert_eq!(h.embedder.calls(), 3);
}

#[tokio::test]
async fn test_exhausted_retries_resume_later() {
    let h = Harness::new(&settings(0.85));
    let records = vec![one(1, "cam-1", 0, FEMALE)];
    let d = h.ingest(&records).await[0].id;
    h.embedder.set(d, axis(0));
    h.embedder.fail_next(100);

    let summary = h.run(&records).await;

    assert_eq!(summary.failed, 1);
    assert_eq!(summary.retries, 3);
    let detection = h.detection(d).await;
    assert_eq!(detection.state, DetectionState::Failed);
    assert_eq!(detection.attempts, 4);
    assert!(detection.identity_id.is_none());

    let pending = h.orchestrator.pending_tasks().await.unwrap();
    assert_eq!(pending, vec![Task::Match { detection_id: d }]);

    h.embedder.fail_next(0);
    let summary = Arc::clone(&h.orchestrator).run(pending, None).await;
    assert_eq!(summary.created, 1);
    assert_eq!(h.detection(d).await.state, DetectionState::Created);
    assert!(h.orchestrator.pending_tasks().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_pending_tasks_resume_from_last_stage() {
    let h = Harness::new(&settings(0.85));
    let records = vec![one(1, "cam-1", 0, FEMALE)];
    let d = h.ingest(&records).await[0].id;
    h.embedder.set(d, axis(0));

    // Ingested but never suppressed.
    assert_eq!(
        h.orchestrator.pending_tasks().await.unwrap(),
        vec![Task::Suppress {
            image_id: records[0].image.id
        }]
    );

    let step = h
        .orchestrator
        .handle(Task::Suppress {
            image_id: records[0].image.id,
        })
        .await
        .unwrap();
    assert_eq!(step.next, vec![Task::Link { detection_id: d }]);
    assert_eq!(
        h.orchestrator.pending_tasks().await.unwrap(),
        vec![Task::Link { detection_id: d }]
    );

    let step = h.orchestrator.handle(Task::Link { detection_id: d }).await.unwrap();
    assert_eq!(step.outcome, Outcome::BurstMiss);
    assert_eq!(
        h.orchestrator.pending_tasks().await.unwrap(),
        vec![Task::Match { detection_id: d }]
    );
}

#[tokio::test]
async fn test_burst_query_failure_falls_through_to_matching() {
    let store = Arc::new(BurstlessStore {
        inner: MemoryStore::new(),
    });
    let h = Harness::with_store(&settings(0.85), store);

    let first = vec![one(1, "cam-1", 0, FEMALE)];
    let d1 = h.ingest(&first).await[0].id;
    h.embedder.set(d1, axis(0));
    let summary = h.run(&first).await;
    assert_eq!(summary.created, 1);

    // A burst mate that cannot be found by burst linking still matches by
    // appearance.
    let second = vec![one(2, "cam-1", 1, FEMALE)];
    let d2 = h.ingest(&second).await[0].id;
    h.embedder.set(d2, axis(0));
    let summary = h.run(&second).await;

    assert_eq!(summary.failed, 0);
    assert_eq!(summary.burst_reused, 0);
    assert_eq!(summary.matched, 1);
    assert_eq!(
        h.detection(d1).await.identity_id,
        h.detection(d2).await.identity_id
    );
}

#[tokio::test]
async fn test_handlers_are_idempotent() {
    let h = Harness::new(&settings(0.85));
    let records = vec![one(1, "cam-1", 0, FEMALE)];
    let d = h.ingest(&records).await[0].id;
    h.embedder.set(d, axis(0));
    h.run(&records).await;
    let before = h.store.identities().await.unwrap();

    let step = h.orchestrator.handle(Task::Match { detection_id: d }).await.unwrap();
    assert_eq!(step.outcome, Outcome::Skipped);
    let step = h.orchestrator.handle(Task::Link { detection_id: d }).await.unwrap();
    assert_eq!(step.outcome, Outcome::Skipped);

    // Re-ingesting and re-suppressing the same image changes nothing.
    let summary = h.run(&records).await;
    assert_eq!(summary.resolved(), 0);
    assert_eq!(h.store.identities().await.unwrap(), before);
    assert_eq!(h.embedder.calls(), 1);
}

#[tokio::test]
async fn test_sqlite_store_survives_restart() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("wildid.db");

    let d1 = {
        let store = Arc::new(SqliteStore::open(&db).unwrap());
        let h = Harness::with_store(&settings(0.85), store);
        let records = vec![one(1, "cam-1", 0, MALE)];
        let d1 = h.ingest(&records).await[0].id;
        h.embedder.set(d1, axis(0));
        let summary = h.run(&records).await;
        assert_eq!(summary.created, 1);
        d1
    };

    let store = Arc::new(SqliteStore::open(&db).unwrap());
    let h = Harness::with_store(&settings(0.85), store);
    let loaded = rebuild_index(h.store.as_ref(), h.index.as_ref())
        .await
        .unwrap();
    assert_eq!(loaded, 1);

    let records = vec![one(2, "cam-4", 86_400, MALE)];
    let d2 = h.ingest(&records).await[0].id;
    h.embedder.set(d2, at_similarity(0.95));
    let summary = h.run(&records).await;

    assert_eq!(summary.matched, 1);
    let y = h.detection(d1).await.identity_id.unwrap();
    assert_eq!(h.detection(d2).await.identity_id, Some(y));
    assert_eq!(h.store.identity(y).await.unwrap().observation_count, 2);
}
