//! Stage sequencing, scheduling and retries.
//!
//! Every stage transition is a [`Task`]. Handlers are idempotent and return
//! the tasks that follow them, so a task delivered twice does no harm and a
//! failure in one detection never blocks the others.

use super::burst::{BurstDecision, BurstLinker};
use super::identity::{IdentityStore, Resolution};
use super::matcher::Matcher;
use super::suppressor::Suppressor;
use crate::config::{PipelineSettings, Settings};
use crate::constants::pipeline::MAX_RETRY_BACKOFF_MS;
use crate::domain::{DetectionId, DetectionState, ImageId};
use crate::embedding::Embedder;
use crate::error::{Error, Result};
use crate::imagery::CropSource;
use crate::index::VectorIndex;
use crate::ingest::ImageRecord;
use crate::store::Store;
use indicatif::ProgressBar;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// One independently schedulable unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "kebab-case")]
pub enum Task {
    /// Suppress duplicates among all detections of an image.
    Suppress {
        /// Image to process.
        image_id: ImageId,
    },
    /// Try to resolve a keeper from its burst.
    Link {
        /// Keeper to link.
        detection_id: DetectionId,
    },
    /// Embed and match a burst miss.
    Match {
        /// Detection to match.
        detection_id: DetectionId,
    },
}

/// What a successfully handled task did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Suppression finished for an image.
    Suppressed {
        /// Surviving keepers.
        keepers: usize,
        /// Detections folded into a keeper.
        duplicates: usize,
    },
    /// Detection resolved from a burst mate.
    Reused,
    /// No burst mate; matching scheduled.
    BurstMiss,
    /// Detection matched an existing identity.
    Matched,
    /// Detection founded a new identity.
    Created,
    /// Detection permanently rejected.
    Rejected,
    /// Nothing left to do for this task.
    Skipped,
}

/// Result of one handler call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    /// What happened.
    pub outcome: Outcome,
    /// Tasks to schedule next.
    pub next: Vec<Task>,
}

impl Step {
    fn done(outcome: Outcome) -> Self {
        Self {
            outcome,
            next: Vec::new(),
        }
    }
}

/// Counters for one pipeline run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Images suppressed.
    pub images: usize,
    /// Keepers that survived suppression.
    pub keepers: usize,
    /// Detections marked duplicate.
    pub duplicates: usize,
    /// Detections resolved by burst reuse.
    pub burst_reused: usize,
    /// Detections matched to an existing identity.
    pub matched: usize,
    /// Identities created.
    pub created: usize,
    /// Detections rejected for good.
    pub rejected: usize,
    /// Tasks that failed after their last attempt.
    pub failed: usize,
    /// Retries scheduled.
    pub retries: usize,
}

impl RunSummary {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Suppressed {
                keepers,
                duplicates,
            } => {
                self.images += 1;
                self.keepers += keepers;
                self.duplicates += duplicates;
            }
            Outcome::Reused => self.burst_reused += 1,
            Outcome::Matched => self.matched += 1,
            Outcome::Created => self.created += 1,
            Outcome::Rejected => self.rejected += 1,
            Outcome::BurstMiss | Outcome::Skipped => {}
        }
    }

    /// Detections linked to an identity during the run.
    pub const fn resolved(&self) -> usize {
        self.burst_reused + self.matched + self.created
    }
}

#[derive(Debug, Clone, Copy)]
struct Job {
    task: Task,
    attempt: u32,
}

/// Delay before retry number `attempt + 1`.
fn backoff(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt))
        .min(Duration::from_millis(MAX_RETRY_BACKOFF_MS))
}

/// Runs the resolution pipeline.
pub struct Orchestrator {
    store: Arc<dyn Store>,
    suppressor: Suppressor,
    burst: BurstLinker,
    matcher: Matcher,
    identities: IdentityStore,
    pipeline: PipelineSettings,
}

impl Orchestrator {
    /// Wire the pipeline stages from validated settings and collaborators.
    pub fn new(
        settings: &Settings,
        store: Arc<dyn Store>,
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn Embedder>,
        crops: Arc<dyn CropSource>,
    ) -> Self {
        let resolution = settings.resolution;
        Self {
            suppressor: Suppressor::new(resolution.iou_threshold),
            burst: BurstLinker::new(
                Arc::clone(&store),
                Arc::clone(&index),
                resolution.burst_window,
            ),
            matcher: Matcher::new(
                embedder,
                crops,
                Arc::clone(&index),
                settings.partitions.clone(),
                resolution,
                settings.embedder.timeout,
            ),
            identities: IdentityStore::new(
                Arc::clone(&store),
                index,
                &settings.partitions,
                resolution,
            ),
            store,
            pipeline: settings.pipeline,
        }
    }

    /// Store images with their detector output and return one suppression
    /// task per image.
    pub async fn ingest(&self, records: &[ImageRecord]) -> Result<Vec<Task>> {
        let mut tasks = Vec::with_capacity(records.len());
        for ImageRecord { image, detections } in records {
            let ids = self.store.insert_image(image, detections).await?;
            debug!(
                "Stored image {} at {} with {} detection(s)",
                image.id,
                image.location,
                ids.len()
            );
            tasks.push(Task::Suppress { image_id: image.id });
        }
        Ok(tasks)
    }

    /// Rebuild the task list for every unresolved detection from its last
    /// persisted stage.
    pub async fn pending_tasks(&self) -> Result<Vec<Task>> {
        let mut suppress = BTreeSet::new();
        let mut tasks = Vec::new();

        for detection in self.store.unresolved_detections().await? {
            match detection.state {
                DetectionState::Raw => {
                    suppress.insert(detection.image_id);
                }
                DetectionState::Keeper => tasks.push(Task::Link {
                    detection_id: detection.id,
                }),
                DetectionState::BurstMiss | DetectionState::Failed => tasks.push(Task::Match {
                    detection_id: detection.id,
                }),
                other => debug!("Detection {} left in state {}", detection.id, other),
            }
        }

        let mut all: Vec<Task> = suppress
            .into_iter()
            .map(|image_id| Task::Suppress { image_id })
            .collect();
        all.extend(tasks);
        Ok(all)
    }

    /// Handle a single task.
    pub async fn handle(&self, task: Task) -> Result<Step> {
        match task {
            Task::Suppress { image_id } => self.suppress(image_id).await,
            Task::Link { detection_id } => self.link(detection_id).await,
            Task::Match { detection_id } => self.match_detection(detection_id).await,
        }
    }

    async fn suppress(&self, image_id: ImageId) -> Result<Step> {
        let detections = self.store.detections_for_image(image_id).await?;
        let marks = self.suppressor.suppress(&detections);
        self.store.apply_suppression(image_id, &marks).await?;

        let duplicates = marks.iter().filter(|m| m.is_duplicate()).count();
        let next: Vec<Task> = detections
            .iter()
            .zip(&marks)
            .filter(|(d, m)| {
                !m.is_duplicate()
                    && d.identity_id.is_none()
                    && d.state != DetectionState::Rejected
            })
            .map(|(d, _)| Task::Link { detection_id: d.id })
            .collect();

        debug!(
            "Image {}: {} keeper(s), {} duplicate(s)",
            image_id,
            marks.len() - duplicates,
            duplicates
        );
        Ok(Step {
            outcome: Outcome::Suppressed {
                keepers: marks.len() - duplicates,
                duplicates,
            },
            next,
        })
    }

    async fn link(&self, detection_id: DetectionId) -> Result<Step> {
        let detection = self.store.detection(detection_id).await?;
        if detection.is_resolved() || detection.is_duplicate || detection.state.is_terminal() {
            return Ok(Step::done(Outcome::Skipped));
        }
        let image = self.store.image(detection.image_id).await?;

        match self.burst.link(&detection, &image).await {
            BurstDecision::Reused { .. } => Ok(Step::done(Outcome::Reused)),
            BurstDecision::Miss => {
                if let Err(e) = self.store.mark_burst_miss(detection_id).await {
                    warn!("Could not record burst miss for {}: {}", detection_id, e);
                }
                Ok(Step {
                    outcome: Outcome::BurstMiss,
                    next: vec![Task::Match { detection_id }],
                })
            }
        }
    }

    async fn match_detection(&self, detection_id: DetectionId) -> Result<Step> {
        let detection = self.store.detection(detection_id).await?;
        if detection.is_resolved() || detection.is_duplicate || detection.state.is_terminal() {
            return Ok(Step::done(Outcome::Skipped));
        }
        let image = self.store.image(detection.image_id).await?;

        let embedding = match self.matcher.embed(&image, &detection).await {
            Ok(embedding) => embedding,
            Err(e @ Error::CropTooSmall { .. }) => {
                info!("Rejecting detection {}: {}", detection_id, e);
                self.store
                    .record_failure(detection_id, &e.to_string(), true)
                    .await?;
                return Ok(Step::done(Outcome::Rejected));
            }
            Err(e) => return Err(e),
        };

        let resolution = self
            .identities
            .resolve(&self.matcher, &detection, &image, &embedding)
            .await?;

        Ok(Step::done(match resolution {
            Resolution::Matched { .. } => Outcome::Matched,
            Resolution::Created { .. } => Outcome::Created,
            Resolution::Reused { .. } => Outcome::Reused,
        }))
    }

    /// Run `tasks` and everything they lead to until the queue drains.
    ///
    /// At most `concurrency` tasks run at once. Transient failures are
    /// retried with exponential backoff up to `max_attempts`; failures are
    /// recorded on the detection and never abort the run.
    pub async fn run(self: Arc<Self>, tasks: Vec<Task>, progress: Option<ProgressBar>) -> RunSummary {
        let semaphore = Arc::new(Semaphore::new(self.pipeline.concurrency));
        let mut set: JoinSet<(Job, Result<Step>)> = JoinSet::new();
        let mut summary = RunSummary::default();

        let spawn = |set: &mut JoinSet<(Job, Result<Step>)>, job: Job, delay: Duration| {
            let this = Arc::clone(&self);
            let semaphore = Arc::clone(&semaphore);
            set.spawn(async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => this.handle(job.task).await,
                    Err(e) => Err(Error::Internal {
                        message: format!("scheduler closed: {e}"),
                    }),
                };
                (job, result)
            });
        };

        if let Some(pb) = &progress {
            pb.inc_length(tasks.len() as u64);
        }
        for task in tasks {
            spawn(&mut set, Job { task, attempt: 0 }, Duration::ZERO);
        }

        while let Some(joined) = set.join_next().await {
            let (job, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    error!("Pipeline task panicked or was cancelled: {e}");
                    summary.failed += 1;
                    if let Some(pb) = &progress {
                        pb.inc(1);
                    }
                    continue;
                }
            };

            match result {
                Ok(step) => {
                    summary.record(step.outcome);
                    if let Some(pb) = &progress {
                        pb.inc_length(step.next.len() as u64);
                    }
                    for task in step.next {
                        spawn(&mut set, Job { task, attempt: 0 }, Duration::ZERO);
                    }
                }
                Err(e) => {
                    self.note_failure(job.task, &e).await;
                    let attempts = job.attempt + 1;
                    if e.is_retryable() && attempts < self.pipeline.max_attempts {
                        let delay = backoff(self.pipeline.retry_backoff, job.attempt);
                        warn!(
                            "{:?} failed (attempt {}/{}), retrying in {:?}: {}",
                            job.task, attempts, self.pipeline.max_attempts, delay, e
                        );
                        summary.retries += 1;
                        spawn(
                            &mut set,
                            Job {
                                task: job.task,
                                attempt: attempts,
                            },
                            delay,
                        );
                        continue;
                    }
                    error!(
                        "{:?} failed after {} attempt(s): {}",
                        job.task, attempts, e
                    );
                    summary.failed += 1;
                }
            }
            if let Some(pb) = &progress {
                pb.inc(1);
            }
        }

        summary
    }

    async fn note_failure(&self, task: Task, err: &Error) {
        let Task::Match { detection_id } = task else {
            return;
        };
        if let Err(e) = self
            .store
            .record_failure(detection_id, &err.to_string(), false)
            .await
        {
            warn!("Could not record failure for {}: {}", detection_id, e);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let base = Duration::from_millis(500);
        assert_eq!(backoff(base, 0), Duration::from_millis(500));
        assert_eq!(backoff(base, 1), Duration::from_millis(1000));
        assert_eq!(backoff(base, 3), Duration::from_millis(4000));
        assert_eq!(
            backoff(base, 40),
            Duration::from_millis(MAX_RETRY_BACKOFF_MS)
        );
    }

    #[test]
    fn test_task_wire_format() {
        let task = Task::Match {
            detection_id: DetectionId(42),
        };
        let json = serde_json::to_string(&task).unwrap();
        assert_eq!(json, r#"{"stage":"match","detection_id":42}"#);
        assert_eq!(serde_json::from_str::<Task>(&json).unwrap(), task);
    }

    #[test]
    fn test_summary_counts() {
        let mut summary = RunSummary::default();
        summary.record(Outcome::Suppressed {
            keepers: 2,
            duplicates: 1,
        });
        summary.record(Outcome::Reused);
        summary.record(Outcome::Created);
        summary.record(Outcome::BurstMiss);
        assert_eq!(summary.images, 1);
        assert_eq!(summary.duplicates, 1);
        assert_eq!(summary.resolved(), 2);
    }
}
