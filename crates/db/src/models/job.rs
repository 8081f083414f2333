use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => JobStatus::Pending,
            "running" => JobStatus::Running,
            "done" => JobStatus::Done,
            "failed" => JobStatus::Failed,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRow {
    pub job_id: String,
    pub queue_name: String,
    pub kind: String,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub attempts: i64,
    pub max_attempts: i64,
    pub backoff_base_ms: i64,
    pub delay_until: Option<DateTime<Utc>>,
    pub correlation_id: String,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(FromRow)]
struct RawJobRow {
    job_id: String,
    queue_name: String,
    kind: String,
    payload: String,
    status: String,
    attempts: i64,
    max_attempts: i64,
    backoff_base_ms: i64,
    delay_until: Option<String>,
    correlation_id: String,
    last_error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RawJobRow {
    fn into_job(self) -> Result<JobRow, sqlx::Error> {
        let dec = |e: serde_json::Error| sqlx::Error::Decode(Box::new(e));
        let dt = |s: &str| -> Result<DateTime<Utc>, sqlx::Error> {
            s.parse().map_err(|e: chrono::ParseError| sqlx::Error::Decode(Box::new(e)))
        };
        Ok(JobRow {
            job_id: self.job_id,
            queue_name: self.queue_name,
            kind: self.kind,
            payload: serde_json::from_str(&self.payload).map_err(dec)?,
            status: JobStatus::parse(&self.status)
                .ok_or_else(|| sqlx::Error::Decode(format!("bad status {}", self.status).into()))?,
            attempts: self.attempts,
            max_attempts: self.max_attempts,
            backoff_base_ms: self.backoff_base_ms,
            delay_until: self.delay_until.as_deref().map(dt).transpose()?,
            correlation_id: self.correlation_id,
            last_error: self.last_error,
            created_at: dt(&self.created_at)?,
            updated_at: dt(&self.updated_at)?,
        })
    }
}

const COLUMNS: &str = "job_id, queue_name, kind, payload, status, attempts, max_attempts, \
    backoff_base_ms, delay_until, correlation_id, last_error, created_at, updated_at";

impl JobRow {
    /// Enqueues a job. If `job_id` already exists, this is a silent no-op (returns `Ok(false)`),
    /// enforcing the Queue's "adding the same jobId is a no-op" rule via a unique constraint
    /// rather than an in-memory set.
    #[allow(clippy::too_many_arguments)]
    pub async fn enqueue(
        pool: &SqlitePool,
        job_id: &str,
        queue_name: &str,
        kind: &str,
        payload: &serde_json::Value,
        delay_until: Option<DateTime<Utc>>,
        max_attempts: i64,
        backoff_base_ms: i64,
        correlation_id: &str,
    ) -> Result<bool, sqlx::Error> {
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO jobs (job_id, queue_name, kind, payload, status, attempts, \
             max_attempts, backoff_base_ms, delay_until, correlation_id, created_at, updated_at) \
             VALUES (?,?,?,?,?,0,?,?,?,?,?,?) ON CONFLICT(job_id) DO NOTHING",
        )
        .bind(job_id)
        .bind(queue_name)
        .bind(kind)
        .bind(serde_json::to_string(payload).unwrap())
        .bind(JobStatus::Pending.as_str())
        .bind(max_attempts)
        .bind(backoff_base_ms)
        .bind(delay_until.map(|d| d.to_rfc3339()))
        .bind(correlation_id)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Atomically claims the oldest ready job (pending, `delay_until` elapsed) for `queue_name`
    /// and marks it running. Returns `None` if nothing is ready.
    pub async fn claim_next(pool: &SqlitePool, queue_name: &str) -> Result<Option<JobRow>, sqlx::Error> {
        let mut tx = pool.begin().await?;
        let now = Utc::now().to_rfc3339();
        let row: Option<RawJobRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM jobs WHERE queue_name = ? AND status = 'pending' \
             AND (delay_until IS NULL OR delay_until <= ?) ORDER BY row_id ASC LIMIT 1",
        ))
        .bind(queue_name)
        .bind(&now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(raw) = row else {
            tx.commit().await?;
            return Ok(None);
        };

        sqlx::query("UPDATE jobs SET status = 'running', updated_at = ? WHERE job_id = ?")
            .bind(&now)
            .bind(&raw.job_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        raw.into_job().map(Some)
    }

    pub async fn mark_done(pool: &SqlitePool, job_id: &str) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE jobs SET status = 'done', updated_at = ? WHERE job_id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(job_id)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Records a handler failure. If attempts remain, requeues with exponential backoff
    /// (`backoff_base_ms * 2^attempts`); otherwise the job enters the terminal `failed` state.
    pub async fn record_failure(
        pool: &SqlitePool,
        job_id: &str,
        error: &str,
    ) -> Result<JobStatus, sqlx::Error> {
        let Some(job) = JobRow::get(pool, job_id).await? else {
            return Err(sqlx::Error::RowNotFound);
        };
        let attempts = job.attempts + 1;
        let now = Utc::now();

        if attempts >= job.max_attempts {
            sqlx::query(
                "UPDATE jobs SET status = 'failed', attempts = ?, last_error = ?, updated_at = ? \
                 WHERE job_id = ?",
            )
            .bind(attempts)
            .bind(error)
            .bind(now.to_rfc3339())
            .bind(job_id)
            .execute(pool)
            .await?;
            Ok(JobStatus::Failed)
        } else {
            let backoff_ms = job.backoff_base_ms * (1i64 << attempts.min(20));
            let delay_until = now + Duration::milliseconds(backoff_ms);
            sqlx::query(
                "UPDATE jobs SET status = 'pending', attempts = ?, last_error = ?, \
                 delay_until = ?, updated_at = ? WHERE job_id = ?",
            )
            .bind(attempts)
            .bind(error)
            .bind(delay_until.to_rfc3339())
            .bind(now.to_rfc3339())
            .bind(job_id)
            .execute(pool)
            .await?;
            Ok(JobStatus::Pending)
        }
    }

    pub async fn get(pool: &SqlitePool, job_id: &str) -> Result<Option<JobRow>, sqlx::Error> {
        let row: Option<RawJobRow> =
            sqlx::query_as(&format!("SELECT {COLUMNS} FROM jobs WHERE job_id = ?"))
                .bind(job_id)
                .fetch_optional(pool)
                .await?;
        row.map(RawJobRow::into_job).transpose()
    }

    /// Re-claims jobs stuck `running` past `stale_threshold` back to `pending`, for recovery
    /// after an unclean process restart.
    pub async fn requeue_stale_running(
        pool: &SqlitePool,
        stale_threshold: Duration,
    ) -> Result<u64, sqlx::Error> {
        let cutoff = (Utc::now() - stale_threshold).to_rfc3339();
        let result = sqlx::query(
            "UPDATE jobs SET status = 'pending', updated_at = ? \
             WHERE status = 'running' AND updated_at < ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(cutoff)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }
}
