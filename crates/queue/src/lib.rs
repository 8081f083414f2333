use std::{sync::Arc, time::Duration as StdDuration};

use chrono::{Duration, Utc};
use db::{DBService, models::job::JobRow};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

/// A claimed unit of work. `correlation_id` is propagated by workers into every log line and
/// every hosting-service request for this job, per §4.4.
#[derive(Debug, Clone)]
pub struct Job {
    pub job_id: String,
    pub kind: String,
    pub payload: serde_json::Value,
    pub attempts: i64,
    pub correlation_id: String,
}

impl From<JobRow> for Job {
    fn from(row: JobRow) -> Self {
        Job { job_id: row.job_id, kind: row.kind, payload: row.payload, attempts: row.attempts, correlation_id: row.correlation_id }
    }
}

#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    pub job_id: String,
    pub delay: Option<StdDuration>,
    pub max_attempts: i64,
    pub backoff_base_ms: i64,
    pub correlation_id: Option<String>,
}

impl EnqueueOptions {
    pub fn new(job_id: impl Into<String>) -> Self {
        EnqueueOptions {
            job_id: job_id.into(),
            delay: None,
            max_attempts: 5,
            backoff_base_ms: 1000,
            correlation_id: None,
        }
    }

    pub fn with_delay(mut self, delay: StdDuration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// Durable FIFO-with-delay queue backed by the `jobs` table: `add`'s jobId dedup is a unique
/// constraint, `consume` claims the oldest ready row per queue name.
#[derive(Clone)]
pub struct Queue {
    db: DBService,
}

impl Queue {
    pub fn new(db: DBService) -> Self {
        Queue { db }
    }

    /// Enqueues `payload` under `queue_name`. A job already queued under the same `job_id` is
    /// silently dropped (returns `Ok(false)`), per the Queue's at-most-one-per-jobId rule.
    pub async fn add(
        &self,
        queue_name: &str,
        kind: &str,
        payload: serde_json::Value,
        opts: EnqueueOptions,
    ) -> Result<bool, QueueError> {
        let delay_until = opts.delay.map(|d| {
            Utc::now() + Duration::from_std(d).unwrap_or(Duration::zero())
        });
        let correlation_id = opts.correlation_id.unwrap_or_else(|| Uuid::new_v4().to_string());

        let inserted = JobRow::enqueue(
            &self.db.pool,
            &opts.job_id,
            queue_name,
            kind,
            &payload,
            delay_until,
            opts.max_attempts,
            opts.backoff_base_ms,
            &correlation_id,
        )
        .await?;

        if inserted {
            info!(job_id = %opts.job_id, queue = queue_name, "enqueued job");
        } else {
            info!(job_id = %opts.job_id, queue = queue_name, "job already queued, dropped");
        }
        Ok(inserted)
    }

    /// Requeues `job`'s same payload and kind under a fresh job id, delayed by `delay`. Used for
    /// the `UsageLimit` short-circuit (§4.7 step 6) where the per-fingerprint dedup invariant
    /// requires a fresh, timestamp-salted jobId on every requeue.
    pub async fn requeue_delayed(
        &self,
        queue_name: &str,
        job: &Job,
        fresh_job_id: String,
        delay: StdDuration,
    ) -> Result<bool, QueueError> {
        self.add(
            queue_name,
            &job.kind,
            job.payload.clone(),
            EnqueueOptions::new(fresh_job_id)
                .with_delay(delay),
        )
        .await
    }

    /// Dispatches ready jobs to `handler` with up to `concurrency` running at once. On handler
    /// error, the job is retried up to `max_attempts` with exponential backoff; on exhaustion it
    /// enters the terminal `failed` state. Runs until `shutdown` resolves.
    pub async fn consume<F, Fut>(
        &self,
        queue_name: &str,
        concurrency: usize,
        poll_interval: StdDuration,
        handler: F,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut interval = tokio::time::interval(poll_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(queue = queue_name, "queue consumer shutting down");
                        return;
                    }
                }
            }

            let Ok(permit) = semaphore.clone().try_acquire_owned() else { continue };

            match JobRow::claim_next(&self.db.pool, queue_name).await {
                Ok(Some(row)) => {
                    let job: Job = row.into();
                    let db = self.db.clone();
                    let handler = handler.clone();
                    let queue_name = queue_name.to_string();
                    tokio::spawn(async move {
                        let _permit = permit;
                        let job_id = job.job_id.clone();
                        let correlation_id = job.correlation_id.clone();
                        match handler(job).await {
                            Ok(()) => {
                                if let Err(e) = JobRow::mark_done(&db.pool, &job_id).await {
                                    error!(%job_id, %correlation_id, queue = %queue_name, "failed to mark job done: {e}");
                                }
                            }
                            Err(e) => {
                                warn!(%job_id, %correlation_id, queue = %queue_name, "job handler failed: {e:#}");
                                if let Err(db_err) =
                                    JobRow::record_failure(&db.pool, &job_id, &e.to_string()).await
                                {
                                    error!(%job_id, "failed to record job failure: {db_err}");
                                }
                            }
                        }
                    });
                }
                Ok(None) => drop(permit),
                Err(e) => {
                    drop(permit);
                    error!(queue = queue_name, "failed to claim next job: {e}");
                }
            }
        }
    }

    /// Re-claims jobs stuck `running` past `stale_threshold`, for recovery after an unclean
    /// process restart (the Queue-side analogue of the State Store's `listResumable`).
    pub async fn recover_stale(&self, stale_threshold: StdDuration) -> Result<u64, QueueError> {
        Ok(JobRow::requeue_stale_running(
            &self.db.pool,
            Duration::from_std(stale_threshold).unwrap_or(Duration::zero()),
        )
        .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_db() -> DBService {
        let dir = tempfile::tempdir().unwrap();
        let url = DBService::default_database_url(&dir.path().to_path_buf());
        let db = DBService::new(&url).await.unwrap();
        std::mem::forget(dir);
        db
    }

    #[tokio::test]
    async fn duplicate_job_id_is_dropped() {
        let queue = Queue::new(test_db().await);
        let payload = serde_json::json!({"n": 1});
        let first = queue
            .add("issues", "issue", payload.clone(), EnqueueOptions::new("job-1"))
            .await
            .unwrap();
        let second = queue
            .add("issues", "issue", payload, EnqueueOptions::new("job-1"))
            .await
            .unwrap();
        assert!(first);
        assert!(!second);
    }

    #[tokio::test]
    async fn claim_next_respects_delay() {
        let db = test_db().await;
        let queue = Queue::new(db.clone());
        queue
            .add(
                "issues",
                "issue",
                serde_json::json!({}),
                EnqueueOptions::new("job-delayed").with_delay(StdDuration::from_secs(3600)),
            )
            .await
            .unwrap();

        let claimed = JobRow::claim_next(&db.pool, "issues").await.unwrap();
        assert!(claimed.is_none());
    }
}
