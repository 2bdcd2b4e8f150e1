//! SQLite-backed store.

use super::{
    BurstCandidate, BurstLinked, BurstQuery, Linked, MatchRecord, NewIdentity, Store,
    SuppressionMark, observe, suppression_may_update,
};
use crate::config::EmbeddingUpdate;
use crate::domain::{
    BoundingBox, BurstGroupId, Classification, Detection, DetectionId, DetectionState, Identity,
    IdentityId, Image, ImageId, PartitionKey, RawDetection,
};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, Transaction, params};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS images (
    id INTEGER PRIMARY KEY,
    timestamp_ms INTEGER NOT NULL,
    location TEXT NOT NULL,
    path TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS identities (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    partition TEXT NOT NULL,
    embedding BLOB NOT NULL,
    first_observed_ms INTEGER NOT NULL,
    last_observed_ms INTEGER NOT NULL,
    observation_count INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS detections (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    image_id INTEGER NOT NULL REFERENCES images(id),
    x_min REAL NOT NULL,
    y_min REAL NOT NULL,
    x_max REAL NOT NULL,
    y_max REAL NOT NULL,
    confidence REAL NOT NULL,
    classification TEXT NOT NULL,
    is_duplicate INTEGER NOT NULL DEFAULT 0,
    duplicate_of INTEGER REFERENCES detections(id),
    burst_group INTEGER,
    identity_id INTEGER REFERENCES identities(id),
    embedding BLOB,
    state TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT
);
CREATE INDEX IF NOT EXISTS idx_detections_image ON detections(image_id);
CREATE INDEX IF NOT EXISTS idx_detections_identity ON detections(identity_id);
CREATE INDEX IF NOT EXISTS idx_images_location_time ON images(location, timestamp_ms);
";

const DETECTION_COLUMNS: &str = "id, image_id, x_min, y_min, x_max, y_max, confidence, \
     classification, is_duplicate, duplicate_of, burst_group, identity_id, embedding, state, \
     attempts, last_error";

const IDENTITY_COLUMNS: &str =
    "id, partition, embedding, first_observed_ms, last_observed_ms, observation_count";

/// Store persisted in a single SQLite database file.
///
/// Statements run on the blocking pool; each trait operation is one
/// transaction.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Open (and create if needed) the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(Error::persistence)?;
        debug!("Opened database {}", path.display());
        Self::init(conn, Some(path.to_path_buf()))
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(Error::persistence)?;
        Self::init(conn, None)
    }

    fn init(conn: Connection, path: Option<PathBuf>) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(Error::persistence)?;
        conn.execute_batch(SCHEMA).map_err(Error::persistence)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    /// Run `f` inside a transaction on the blocking pool.
    async fn transact<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Transaction<'_>) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| Error::persistence("database connection lock poisoned"))?;
            let tx = conn.transaction().map_err(Error::persistence)?;
            let value = f(&tx)?;
            tx.commit().map_err(Error::persistence)?;
            Ok(value)
        })
        .await
        .map_err(|e| Error::Internal {
            message: format!("database task failed: {e}"),
        })?
    }
}

fn conversion_error(column: usize, kind: Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, kind, Box::from(message))
}

fn millis_to_time(column: usize, ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| conversion_error(column, Type::Integer, format!("bad timestamp {ms}")))
}

fn encode_vector(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|x| x.to_le_bytes()).collect()
}

fn decode_vector(column: usize, bytes: &[u8]) -> rusqlite::Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(conversion_error(
            column,
            Type::Blob,
            format!("embedding blob of {} bytes", bytes.len()),
        ));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

fn row_to_image(row: &Row<'_>) -> rusqlite::Result<Image> {
    let path: String = row.get(3)?;
    Ok(Image {
        id: ImageId(row.get(0)?),
        timestamp: millis_to_time(1, row.get(1)?)?,
        location: row.get(2)?,
        path: PathBuf::from(path),
    })
}

fn row_to_detection(row: &Row<'_>) -> rusqlite::Result<Detection> {
    let classification: String = row.get(7)?;
    let state: String = row.get(13)?;
    let embedding: Option<Vec<u8>> = row.get(12)?;

    Ok(Detection {
        id: DetectionId(row.get(0)?),
        image_id: ImageId(row.get(1)?),
        bbox: BoundingBox::new(row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?),
        confidence: row.get(6)?,
        classification: classification
            .parse::<Classification>()
            .map_err(|e| conversion_error(7, Type::Text, e))?,
        is_duplicate: row.get(8)?,
        duplicate_of: row.get::<_, Option<u64>>(9)?.map(DetectionId),
        burst_group: row.get::<_, Option<u64>>(10)?.map(BurstGroupId),
        identity_id: row.get::<_, Option<u64>>(11)?.map(IdentityId),
        embedding: embedding.map(|b| decode_vector(12, &b)).transpose()?,
        state: state
            .parse::<DetectionState>()
            .map_err(|e| conversion_error(13, Type::Text, e))?,
        attempts: row.get(14)?,
        last_error: row.get(15)?,
    })
}

fn row_to_identity(row: &Row<'_>) -> rusqlite::Result<Identity> {
    let partition: String = row.get(1)?;
    let embedding: Vec<u8> = row.get(2)?;
    Ok(Identity {
        id: IdentityId(row.get(0)?),
        partition: PartitionKey::new(partition),
        embedding: decode_vector(2, &embedding)?,
        first_observed: millis_to_time(3, row.get(3)?)?,
        last_observed: millis_to_time(4, row.get(4)?)?,
        observation_count: row.get(5)?,
    })
}

fn load_detection(tx: &Transaction<'_>, id: DetectionId) -> Result<Detection> {
    tx.query_row(
        &format!("SELECT {DETECTION_COLUMNS} FROM detections WHERE id = ?1"),
        params![id.0],
        row_to_detection,
    )
    .optional()
    .map_err(Error::persistence)?
    .ok_or(Error::DetectionNotFound { id: id.0 })
}

fn load_identity(tx: &Transaction<'_>, id: IdentityId) -> Result<Identity> {
    tx.query_row(
        &format!("SELECT {IDENTITY_COLUMNS} FROM identities WHERE id = ?1"),
        params![id.0],
        row_to_identity,
    )
    .optional()
    .map_err(Error::persistence)?
    .ok_or(Error::IdentityNotFound { id: id.0 })
}

fn save_identity(tx: &Transaction<'_>, identity: &Identity) -> Result<()> {
    tx.execute(
        "UPDATE identities SET embedding = ?2, first_observed_ms = ?3, last_observed_ms = ?4, \
         observation_count = ?5 WHERE id = ?1",
        params![
            identity.id.0,
            encode_vector(&identity.embedding),
            identity.first_observed.timestamp_millis(),
            identity.last_observed.timestamp_millis(),
            identity.observation_count,
        ],
    )
    .map_err(Error::persistence)?;
    Ok(())
}

fn propagate_to_duplicates(
    tx: &Transaction<'_>,
    keeper: DetectionId,
    identity: IdentityId,
) -> Result<()> {
    tx.execute(
        "UPDATE detections SET identity_id = ?2 WHERE duplicate_of = ?1 AND identity_id IS NULL",
        params![keeper.0, identity.0],
    )
    .map_err(Error::persistence)?;
    Ok(())
}

fn link_detection(
    tx: &Transaction<'_>,
    detection: DetectionId,
    identity: IdentityId,
    embedding: Option<&[f32]>,
    state: DetectionState,
) -> Result<()> {
    tx.execute(
        "UPDATE detections SET identity_id = ?2, embedding = COALESCE(?3, embedding), \
         state = ?4, last_error = NULL WHERE id = ?1",
        params![
            detection.0,
            identity.0,
            embedding.map(encode_vector),
            state.as_str()
        ],
    )
    .map_err(Error::persistence)?;
    propagate_to_duplicates(tx, detection, identity)
}

fn already_linked(tx: &Transaction<'_>, detection: &Detection) -> Result<Option<Linked>> {
    detection
        .identity_id
        .map(|id| {
            load_identity(tx, id).map(|identity| Linked {
                identity,
                applied: false,
            })
        })
        .transpose()
}

#[async_trait::async_trait]
impl Store for SqliteStore {
    async fn insert_image(
        &self,
        image: &Image,
        detections: &[RawDetection],
    ) -> Result<Vec<DetectionId>> {
        let image = image.clone();
        let detections = detections.to_vec();

        self.transact(move |tx| {
            let inserted = tx
                .execute(
                    "INSERT OR IGNORE INTO images (id, timestamp_ms, location, path) \
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        image.id.0,
                        image.timestamp.timestamp_millis(),
                        image.location,
                        image.path.to_string_lossy(),
                    ],
                )
                .map_err(Error::persistence)?;

            if inserted == 0 {
                let mut stmt = tx
                    .prepare("SELECT id FROM detections WHERE image_id = ?1 ORDER BY id")
                    .map_err(Error::persistence)?;
                let ids = stmt
                    .query_map(params![image.id.0], |row| row.get(0).map(DetectionId))
                    .map_err(Error::persistence)?
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(Error::persistence)?;
                return Ok(ids);
            }

            let mut stmt = tx
                .prepare(
                    "INSERT INTO detections (image_id, x_min, y_min, x_max, y_max, confidence, \
                     classification, state) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                )
                .map_err(Error::persistence)?;
            let mut ids = Vec::with_capacity(detections.len());
            for raw in &detections {
                stmt.execute(params![
                    image.id.0,
                    raw.bbox.x_min,
                    raw.bbox.y_min,
                    raw.bbox.x_max,
                    raw.bbox.y_max,
                    raw.confidence,
                    raw.classification.as_str(),
                    DetectionState::Raw.as_str(),
                ])
                .map_err(Error::persistence)?;
                let id = u64::try_from(tx.last_insert_rowid()).map_err(Error::persistence)?;
                ids.push(DetectionId(id));
            }
            Ok(ids)
        })
        .await
    }

    async fn image(&self, id: ImageId) -> Result<Image> {
        self.transact(move |tx| {
            tx.query_row(
                "SELECT id, timestamp_ms, location, path FROM images WHERE id = ?1",
                params![id.0],
                row_to_image,
            )
            .optional()
            .map_err(Error::persistence)?
            .ok_or(Error::ImageNotFound { id: id.0 })
        })
        .await
    }

    async fn detection(&self, id: DetectionId) -> Result<Detection> {
        self.transact(move |tx| load_detection(tx, id)).await
    }

    async fn detections_for_image(&self, id: ImageId) -> Result<Vec<Detection>> {
        self.transact(move |tx| {
            let mut stmt = tx
                .prepare(&format!(
                    "SELECT {DETECTION_COLUMNS} FROM detections WHERE image_id = ?1 ORDER BY id"
                ))
                .map_err(Error::persistence)?;
            stmt.query_map(params![id.0], row_to_detection)
                .map_err(Error::persistence)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(Error::persistence)
        })
        .await
    }

    async fn apply_suppression(&self, image_id: ImageId, marks: &[SuppressionMark]) -> Result<()> {
        let marks = marks.to_vec();

        self.transact(move |tx| {
            for mark in &marks {
                let detection = load_detection(tx, mark.detection_id)?;
                if detection.image_id != image_id {
                    return Err(Error::Internal {
                        message: format!(
                            "detection {} does not belong to image {image_id}",
                            mark.detection_id
                        ),
                    });
                }
                let keeper_identity = match mark.duplicate_of {
                    Some(keeper) => load_detection(tx, keeper)?.identity_id,
                    None => None,
                };
                let state = if !suppression_may_update(detection.state) {
                    detection.state
                } else if mark.is_duplicate() {
                    DetectionState::Suppressed
                } else {
                    DetectionState::Keeper
                };
                let identity = detection.identity_id.or(keeper_identity);

                tx.execute(
                    "UPDATE detections SET is_duplicate = ?2, duplicate_of = ?3, state = ?4, \
                     identity_id = ?5 WHERE id = ?1",
                    params![
                        mark.detection_id.0,
                        mark.is_duplicate(),
                        mark.duplicate_of.map(|d| d.0),
                        state.as_str(),
                        identity.map(|i| i.0),
                    ],
                )
                .map_err(Error::persistence)?;
            }
            Ok(())
        })
        .await
    }

    async fn burst_candidates(&self, query: &BurstQuery<'_>) -> Result<Vec<BurstCandidate>> {
        let location = query.location.to_string();
        let from = query.from.timestamp_millis();
        let to = query.to.timestamp_millis();
        let exclude = query.exclude_image.0;

        self.transact(move |tx| {
            let mut stmt = tx
                .prepare(
                    "SELECT d.id, d.image_id, d.identity_id, d.burst_group, i.timestamp_ms \
                     FROM detections d JOIN images i ON i.id = d.image_id \
                     WHERE i.location = ?1 AND i.timestamp_ms BETWEEN ?2 AND ?3 \
                     AND d.image_id != ?4 AND d.is_duplicate = 0 AND d.identity_id IS NOT NULL \
                     ORDER BY d.id",
                )
                .map_err(Error::persistence)?;
            stmt.query_map(params![location, from, to, exclude], |row| {
                Ok(BurstCandidate {
                    detection_id: DetectionId(row.get(0)?),
                    image_id: ImageId(row.get(1)?),
                    identity_id: IdentityId(row.get(2)?),
                    burst_group: row.get::<_, Option<u64>>(3)?.map(BurstGroupId),
                    timestamp: millis_to_time(4, row.get(4)?)?,
                })
            })
            .map_err(Error::persistence)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Error::persistence)
        })
        .await
    }

    async fn link_burst(
        &self,
        detection_id: DetectionId,
        anchor: DetectionId,
        identity_id: IdentityId,
        observed_at: DateTime<Utc>,
    ) -> Result<BurstLinked> {
        self.transact(move |tx| {
            let current = load_detection(tx, detection_id)?;
            if let (Some(linked_to), Some(group)) = (current.identity_id, current.burst_group) {
                return Ok(BurstLinked {
                    burst_group: group,
                    identity: load_identity(tx, linked_to)?,
                });
            }
            let anchor_detection = load_detection(tx, anchor)?;
            let mut identity = load_identity(tx, current.identity_id.unwrap_or(identity_id))?;

            let group = match anchor_detection.burst_group.or(current.burst_group) {
                Some(group) => group,
                None => {
                    let next: u64 = tx
                        .query_row(
                            "SELECT COALESCE(MAX(burst_group), 0) + 1 FROM detections",
                            [],
                            |row| row.get(0),
                        )
                        .map_err(Error::persistence)?;
                    BurstGroupId(next)
                }
            };

            tx.execute(
                "UPDATE detections SET burst_group = ?2 WHERE id = ?1 AND burst_group IS NULL",
                params![anchor.0, group.0],
            )
            .map_err(Error::persistence)?;
            tx.execute(
                "UPDATE detections SET burst_group = ?2 WHERE id = ?1",
                params![detection_id.0, group.0],
            )
            .map_err(Error::persistence)?;

            if current.identity_id.is_none() {
                link_detection(
                    tx,
                    detection_id,
                    identity_id,
                    None,
                    DetectionState::BurstResolved,
                )?;
                observe(&mut identity, observed_at, None, EmbeddingUpdate::Keep);
                save_identity(tx, &identity)?;
            }
            Ok(BurstLinked {
                burst_group: group,
                identity,
            })
        })
        .await
    }

    async fn mark_burst_miss(&self, detection_id: DetectionId) -> Result<()> {
        self.transact(move |tx| {
            load_detection(tx, detection_id)?;
            tx.execute(
                "UPDATE detections SET state = ?2 \
                 WHERE id = ?1 AND identity_id IS NULL AND state = ?3",
                params![
                    detection_id.0,
                    DetectionState::BurstMiss.as_str(),
                    DetectionState::Keeper.as_str()
                ],
            )
            .map_err(Error::persistence)?;
            Ok(())
        })
        .await
    }

    async fn record_failure(
        &self,
        detection_id: DetectionId,
        message: &str,
        permanent: bool,
    ) -> Result<()> {
        let message = message.to_string();
        let state = if permanent {
            DetectionState::Rejected
        } else {
            DetectionState::Failed
        };

        self.transact(move |tx| {
            load_detection(tx, detection_id)?;
            tx.execute(
                "UPDATE detections SET attempts = attempts + 1, last_error = ?2, state = ?3 \
                 WHERE id = ?1 AND identity_id IS NULL",
                params![detection_id.0, message, state.as_str()],
            )
            .map_err(Error::persistence)?;
            Ok(())
        })
        .await
    }

    async fn record_match(&self, record: MatchRecord<'_>) -> Result<Linked> {
        let MatchRecord {
            identity_id,
            detection_id,
            observed_at,
            update,
            ..
        } = record;
        let embedding = record.embedding.to_vec();

        self.transact(move |tx| {
            let detection = load_detection(tx, detection_id)?;
            if let Some(linked) = already_linked(tx, &detection)? {
                return Ok(linked);
            }

            let mut identity = load_identity(tx, identity_id)?;
            observe(&mut identity, observed_at, Some(&embedding), update);
            save_identity(tx, &identity)?;
            link_detection(
                tx,
                detection_id,
                identity_id,
                Some(&embedding),
                DetectionState::Matched,
            )?;

            Ok(Linked {
                identity,
                applied: true,
            })
        })
        .await
    }

    async fn create_identity(&self, new: NewIdentity<'_>) -> Result<Linked> {
        let detection_id = new.detection_id;
        let partition = new.partition.clone();
        let embedding = new.embedding.to_vec();
        let observed_at = new.observed_at;

        self.transact(move |tx| {
            let detection = load_detection(tx, detection_id)?;
            if let Some(linked) = already_linked(tx, &detection)? {
                return Ok(linked);
            }

            let ms = observed_at.timestamp_millis();
            tx.execute(
                "INSERT INTO identities (partition, embedding, first_observed_ms, \
                 last_observed_ms, observation_count) VALUES (?1, ?2, ?3, ?4, 1)",
                params![partition.as_str(), encode_vector(&embedding), ms, ms],
            )
            .map_err(Error::persistence)?;
            let id = IdentityId(u64::try_from(tx.last_insert_rowid()).map_err(Error::persistence)?);
            link_detection(
                tx,
                detection_id,
                id,
                Some(&embedding),
                DetectionState::Created,
            )?;

            Ok(Linked {
                identity: Identity {
                    id,
                    partition,
                    embedding,
                    first_observed: observed_at,
                    last_observed: observed_at,
                    observation_count: 1,
                },
                applied: true,
            })
        })
        .await
    }

    async fn identity(&self, id: IdentityId) -> Result<Identity> {
        self.transact(move |tx| load_identity(tx, id)).await
    }

    async fn identities(&self) -> Result<Vec<Identity>> {
        self.transact(|tx| {
            let mut stmt = tx
                .prepare(&format!(
                    "SELECT {IDENTITY_COLUMNS} FROM identities ORDER BY id"
                ))
                .map_err(Error::persistence)?;
            stmt.query_map([], row_to_identity)
                .map_err(Error::persistence)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(Error::persistence)
        })
        .await
    }

    async fn unresolved_detections(&self) -> Result<Vec<Detection>> {
        self.transact(|tx| {
            let mut stmt = tx
                .prepare(&format!(
                    "SELECT {DETECTION_COLUMNS} FROM detections \
                     WHERE identity_id IS NULL AND is_duplicate = 0 AND state != ?1 ORDER BY id"
                ))
                .map_err(Error::persistence)?;
            stmt.query_map(params![DetectionState::Rejected.as_str()], row_to_detection)
                .map_err(Error::persistence)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(Error::persistence)
        })
        .await
    }
}
