//! Model ingestion: a durable job queue and the worker that drains it.
//!
//! Uploading a model enqueues an `ingestion_jobs` row and wakes the worker.
//! The worker claims queued jobs, fetches the file from the blob store, runs
//! the [`ModelParser`], and records the resulting elements together with the
//! file and job status in one transaction. Attempts run under a deadline;
//! failed attempts are re-queued with exponential backoff until
//! `max_attempts` is reached, after which the job is failed and the file is
//! flagged `error`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value as JsonValue};
use sqlx::{types::Json, Executor, Sqlite};
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    config::IngestConfig,
    db::{
        models::{IngestionJob, JobStatus},
        Database,
    },
    error::{AppError, Result},
    services::storage::BlobStore,
};

/// Extra time past a job's deadline before the supervisor reclaims it.
const REAP_GRACE_SECS: i64 = 5;

/// Upper bound for the delay before a retried attempt.
const MAX_RETRY_DELAY_MS: u64 = 5 * 60 * 1000;

/// Delay before attempt `attempt + 1`, doubling per failed attempt.
pub fn retry_delay(base_ms: u64, attempt: i64) -> Duration {
    let exponent = attempt.saturating_sub(1).clamp(0, 20) as u32;
    let delay = base_ms.saturating_mul(1u64 << exponent);
    Duration::from_millis(delay.min(MAX_RETRY_DELAY_MS))
}

/// One element extracted from a model file.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedElement {
    pub element_id: String,
    pub name: String,
    pub element_type: String,
    pub category: Option<String>,
    pub properties: JsonValue,
}

/// Parser output for one model file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedModel {
    /// Id of the model in an external viewer, stored on the building.
    pub model_id: Option<String>,
    pub elements: Vec<ParsedElement>,
}

#[async_trait]
pub trait ModelParser: Send + Sync {
    async fn parse(&self, data: &[u8]) -> Result<ParsedModel>;
}

/// Stand-in for a real IFC parser.
///
/// Waits `delay` to simulate parse latency and then returns the same three
/// elements (a wall, a door, a window) regardless of the file contents.
/// It produces no external model.
pub struct PlaceholderParser {
    delay: Duration,
}

impl PlaceholderParser {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl ModelParser for PlaceholderParser {
    async fn parse(&self, data: &[u8]) -> Result<ParsedModel> {
        debug!(size = data.len(), "Placeholder parser ignoring file contents");
        sleep(self.delay).await;

        let elements = vec![
            ParsedElement {
                element_id: "wall_001".to_string(),
                name: "Exterior wall".to_string(),
                element_type: "Wall".to_string(),
                category: Some("Structural".to_string()),
                properties: json!({
                    "material": "Brick",
                    "thickness": 250,
                    "height": 3000,
                    "area": 15.5,
                }),
            },
            ParsedElement {
                element_id: "door_001".to_string(),
                name: "Entrance door".to_string(),
                element_type: "Door".to_string(),
                category: Some("Opening".to_string()),
                properties: json!({
                    "width": 900,
                    "height": 2100,
                    "material": "Metal",
                }),
            },
            ParsedElement {
                element_id: "window_001".to_string(),
                name: "Window".to_string(),
                element_type: "Window".to_string(),
                category: Some("Opening".to_string()),
                properties: json!({
                    "width": 1200,
                    "height": 1500,
                    "glazing": "Double",
                }),
            },
        ];

        Ok(ParsedModel {
            model_id: None,
            elements,
        })
    }
}

/// Producer side of the ingestion queue, held in application state.
#[derive(Clone)]
pub struct IngestQueue {
    notify: Arc<Notify>,
    max_attempts: i64,
}

impl IngestQueue {
    pub fn new(max_attempts: i64) -> Self {
        Self {
            notify: Arc::new(Notify::new()),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Insert a queued job. Call [`IngestQueue::wake`] once the write is committed.
    pub async fn enqueue<'e, E>(
        &self,
        executor: E,
        building_id: &str,
        file_id: &str,
        storage_id: &str,
    ) -> Result<String>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let job_id = Uuid::new_v4().to_string();

        sqlx::query(
            "INSERT INTO ingestion_jobs (id, building_id, file_id, storage_id, status, attempts, max_attempts, created_at) VALUES (?, ?, ?, ?, ?, 0, ?, ?)",
        )
        .bind(&job_id)
        .bind(building_id)
        .bind(file_id)
        .bind(storage_id)
        .bind(JobStatus::Queued)
        .bind(self.max_attempts)
        .bind(Utc::now())
        .execute(executor)
        .await?;

        debug!(%job_id, %building_id, %file_id, "Queued ingestion job");

        Ok(job_id)
    }

    pub fn wake(&self) {
        self.notify.notify_one();
    }
}

#[derive(Debug, Clone)]
pub enum IngestEvent {
    WorkerStarted,
    JobStarted {
        job_id: String,
        file_id: String,
        attempt: i64,
    },
    JobSucceeded {
        job_id: String,
        file_id: String,
        elements: usize,
    },
    JobRetrying {
        job_id: String,
        file_id: String,
        attempt: i64,
        retry_in: Duration,
    },
    /// `error` is the outward message; the cause is stored on the file row.
    JobFailed {
        job_id: String,
        file_id: String,
        error: String,
    },
    WorkerStopped,
}

/// Handle for controlling a running worker.
pub struct WorkerHandle {
    shutdown_tx: mpsc::Sender<()>,
    event_rx: broadcast::Receiver<IngestEvent>,
}

impl WorkerHandle {
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| AppError::Internal("Failed to send shutdown signal".to_string()))
    }

    pub fn events(&self) -> broadcast::Receiver<IngestEvent> {
        self.event_rx.resubscribe()
    }
}

#[derive(Clone)]
pub struct IngestWorker {
    db: Database,
    blobs: Arc<dyn BlobStore>,
    parser: Arc<dyn ModelParser>,
    config: IngestConfig,
    notify: Arc<Notify>,
    event_tx: broadcast::Sender<IngestEvent>,
}

impl IngestWorker {
    pub fn new(
        db: Database,
        blobs: Arc<dyn BlobStore>,
        parser: Arc<dyn ModelParser>,
        config: IngestConfig,
        queue: &IngestQueue,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self {
            db,
            blobs,
            parser,
            config,
            notify: queue.notify.clone(),
            event_tx,
        }
    }

    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let event_rx = self.event_tx.subscribe();

        tokio::spawn(async move {
            self.run(&mut shutdown_rx).await;
        });

        WorkerHandle {
            shutdown_tx,
            event_rx,
        }
    }

    #[instrument(skip(self, shutdown_rx))]
    async fn run(&self, shutdown_rx: &mut mpsc::Receiver<()>) {
        if !self.config.enabled {
            info!("Ingestion worker is disabled, not starting");
            return;
        }

        info!(
            poll_interval_ms = self.config.poll_interval_ms,
            max_concurrent = self.config.max_concurrent,
            max_attempts = self.config.max_attempts,
            "Ingestion worker started"
        );
        let _ = self.event_tx.send(IngestEvent::WorkerStarted);

        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        let mut tasks = tokio::task::JoinSet::new();

        loop {
            if shutdown_rx.try_recv().is_ok() {
                info!("Ingestion worker received shutdown signal");
                break;
            }

            if let Err(e) = self.reap_expired().await {
                error!(error = %e, "Failed to reap expired ingestion jobs");
            }

            // Fill free slots; running jobs keep theirs
            while tasks.len() < self.config.max_concurrent {
                match self.claim_next().await {
                    Ok(Some(job)) => {
                        let worker = self.clone();
                        tasks.spawn(async move { worker.execute(job).await });
                    }
                    Ok(None) => break,
                    Err(e) => {
                        error!(error = %e, "Failed to claim ingestion job");
                        break;
                    }
                }
            }

            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Ingestion worker received shutdown signal");
                    break;
                }
                Some(result) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = result {
                        error!(error = ?e, "Ingestion task panicked");
                    }
                }
                _ = self.notify.notified() => {}
                _ = sleep(poll_interval) => {}
            }
        }

        // In-flight attempts finish before the worker reports it stopped
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!(error = ?e, "Ingestion task panicked");
            }
        }

        let _ = self.event_tx.send(IngestEvent::WorkerStopped);
        info!("Ingestion worker stopped");
    }

    /// Atomically move the oldest queued job to `running` and mark its file `processing`.
    async fn claim_next(&self) -> Result<Option<IngestionJob>> {
        let now = Utc::now();
        let deadline = now + chrono::Duration::seconds(self.config.timeout_secs as i64);

        let job = sqlx::query_as::<_, IngestionJob>(
            r#"
            UPDATE ingestion_jobs
            SET status = 'running', attempts = attempts + 1, started_at = ?, deadline_at = ?
            WHERE id = (
                SELECT id FROM ingestion_jobs
                WHERE status = 'queued' AND (not_before IS NULL OR not_before <= ?)
                ORDER BY created_at ASC, rowid ASC
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(deadline)
        .bind(now)
        .fetch_optional(&self.db.pool)
        .await?;

        if let Some(job) = &job {
            sqlx::query(
                "UPDATE building_files SET status = 'processing', error_message = NULL, processed_at = NULL WHERE id = ?",
            )
            .bind(&job.file_id)
            .execute(&self.db.pool)
            .await?;
        }

        Ok(job)
    }

    /// Fail jobs left `running` past their deadline, e.g. by a crashed process.
    async fn reap_expired(&self) -> Result<()> {
        let cutoff = Utc::now() - chrono::Duration::seconds(REAP_GRACE_SECS);

        let expired = sqlx::query_as::<_, IngestionJob>(
            "SELECT * FROM ingestion_jobs WHERE status = 'running' AND deadline_at < ?",
        )
        .bind(cutoff)
        .fetch_all(&self.db.pool)
        .await?;

        for job in expired {
            warn!(job_id = %job.id, "Reclaiming ingestion job past its deadline");
            self.record_failure(&job, "Ingestion attempt exceeded its deadline")
                .await;
        }

        Ok(())
    }

    async fn execute(&self, job: IngestionJob) {
        let start = Instant::now();
        info!(job_id = %job.id, file_id = %job.file_id, attempt = job.attempts, "Processing model file");

        let _ = self.event_tx.send(IngestEvent::JobStarted {
            job_id: job.id.clone(),
            file_id: job.file_id.clone(),
            attempt: job.attempts,
        });

        let timeout = Duration::from_secs(self.config.timeout_secs);
        let outcome = match tokio::time::timeout(timeout, self.extract(&job)).await {
            Ok(Ok(model)) => self.complete(&job, &model).await.map(|_| model.elements.len()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(AppError::Internal(format!(
                "Processing exceeded timeout of {}s",
                self.config.timeout_secs
            ))),
        };

        match outcome {
            Ok(count) => {
                info!(
                    job_id = %job.id,
                    elements = count,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Model file processed"
                );
                let _ = self.event_tx.send(IngestEvent::JobSucceeded {
                    job_id: job.id.clone(),
                    file_id: job.file_id.clone(),
                    elements: count,
                });
            }
            Err(e) => {
                let cause = match e {
                    AppError::Internal(msg) => msg,
                    other => other.to_string(),
                };
                warn!(
                    job_id = %job.id,
                    error = %cause,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Model file processing failed"
                );
                self.record_failure(&job, &cause).await;
            }
        }
    }

    async fn extract(&self, job: &IngestionJob) -> Result<ParsedModel> {
        let url = self
            .blobs
            .get_url(&job.storage_id)
            .await?
            .ok_or_else(|| AppError::NotFound("File not found".to_string()))?;
        debug!(job_id = %job.id, %url, "Fetching model file");

        let data = self.blobs.fetch(&job.storage_id).await?;
        self.parser.parse(&data).await
    }

    /// Record elements, complete the file, and finish the job as one unit.
    async fn complete(&self, job: &IngestionJob, model: &ParsedModel) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.db.pool.begin().await?;

        let owned = sqlx::query(
            "UPDATE ingestion_jobs SET status = 'succeeded', finished_at = ?, error_message = NULL WHERE id = ? AND status = 'running' AND attempts = ?",
        )
        .bind(now)
        .bind(&job.id)
        .bind(job.attempts)
        .execute(&mut *tx)
        .await?;

        if owned.rows_affected() == 0 {
            warn!(job_id = %job.id, "Job was reclaimed before completion, discarding results");
            tx.rollback().await?;
            return Ok(());
        }

        for element in &model.elements {
            sqlx::query(
                "INSERT INTO building_elements (id, building_id, element_id, name, element_type, category, properties, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(Uuid::new_v4().to_string())
            .bind(&job.building_id)
            .bind(&element.element_id)
            .bind(&element.name)
            .bind(&element.element_type)
            .bind(&element.category)
            .bind(Json(&element.properties))
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        if let Some(model_id) = &model.model_id {
            set_external_model(&mut *tx, &job.building_id, model_id).await?;
        }

        sqlx::query(
            "UPDATE building_files SET status = 'completed', processed_at = ?, error_message = NULL WHERE id = ?",
        )
        .bind(now)
        .bind(&job.file_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Re-queue the job while attempts remain, otherwise fail it and flag the file.
    async fn record_failure(&self, job: &IngestionJob, cause: &str) {
        let retry = job.attempts < job.max_attempts;
        let now = Utc::now();
        let retry_in = retry_delay(self.config.retry_backoff_ms, job.attempts);

        let updated = if retry {
            let not_before = now
                + chrono::Duration::from_std(retry_in).unwrap_or_else(|_| chrono::Duration::zero());
            sqlx::query(
                "UPDATE ingestion_jobs SET status = 'queued', error_message = ?, deadline_at = NULL, not_before = ? WHERE id = ? AND status = 'running' AND attempts = ?",
            )
            .bind(cause)
            .bind(not_before)
            .bind(&job.id)
            .bind(job.attempts)
            .execute(&self.db.pool)
            .await
        } else {
            sqlx::query(
                "UPDATE ingestion_jobs SET status = 'failed', error_message = ?, finished_at = ? WHERE id = ? AND status = 'running' AND attempts = ?",
            )
            .bind(cause)
            .bind(now)
            .bind(&job.id)
            .bind(job.attempts)
            .execute(&self.db.pool)
            .await
        };

        match updated {
            Ok(result) if result.rows_affected() == 0 => {
                debug!(job_id = %job.id, "Job already transitioned, skipping failure update");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Failed to record job failure");
                return;
            }
        }

        if retry {
            info!(
                job_id = %job.id,
                attempt = job.attempts,
                max_attempts = job.max_attempts,
                retry_in_ms = retry_in.as_millis() as u64,
                "Re-queued ingestion job"
            );
            let _ = self.event_tx.send(IngestEvent::JobRetrying {
                job_id: job.id.clone(),
                file_id: job.file_id.clone(),
                attempt: job.attempts,
                retry_in,
            });
            return;
        }

        if let Err(e) = sqlx::query(
            "UPDATE building_files SET status = 'error', error_message = ?, processed_at = NULL WHERE id = ?",
        )
        .bind(cause)
        .bind(&job.file_id)
        .execute(&self.db.pool)
        .await
        {
            error!(file_id = %job.file_id, error = %e, "Failed to update file status");
        }

        let _ = self.event_tx.send(IngestEvent::JobFailed {
            job_id: job.id.clone(),
            file_id: job.file_id.clone(),
            error: AppError::IngestionFailure(cause.to_string()).to_string(),
        });
    }
}

/// Link a building to the model produced for it by an external viewer.
pub async fn set_external_model<'e, E>(executor: E, building_id: &str, model_id: &str) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("UPDATE buildings SET external_model_id = ? WHERE id = ?")
        .bind(model_id)
        .bind(building_id)
        .execute(executor)
        .await?;

    debug!(%building_id, %model_id, "Linked external model");
    Ok(())
}
