use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStateKind {
    Pending,
    Processing,
    ClaudeExecution,
    PostProcessing,
    CompletedWithPr,
    CompletedNoChanges,
    Failed,
    Requeued,
}

impl TaskStateKind {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStateKind::CompletedWithPr
                | TaskStateKind::CompletedNoChanges
                | TaskStateKind::Failed
                | TaskStateKind::Requeued
        )
    }

    pub fn is_resumable(self) -> bool {
        matches!(
            self,
            TaskStateKind::Processing | TaskStateKind::ClaudeExecution | TaskStateKind::PostProcessing
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStateKind::Pending => "PENDING",
            TaskStateKind::Processing => "PROCESSING",
            TaskStateKind::ClaudeExecution => "CLAUDE_EXECUTION",
            TaskStateKind::PostProcessing => "POST_PROCESSING",
            TaskStateKind::CompletedWithPr => "COMPLETED_WITH_PR",
            TaskStateKind::CompletedNoChanges => "COMPLETED_NO_CHANGES",
            TaskStateKind::Failed => "FAILED",
            TaskStateKind::Requeued => "REQUEUED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "PENDING" => TaskStateKind::Pending,
            "PROCESSING" => TaskStateKind::Processing,
            "CLAUDE_EXECUTION" => TaskStateKind::ClaudeExecution,
            "POST_PROCESSING" => TaskStateKind::PostProcessing,
            "COMPLETED_WITH_PR" => TaskStateKind::CompletedWithPr,
            "COMPLETED_NO_CHANGES" => TaskStateKind::CompletedNoChanges,
            "FAILED" => TaskStateKind::Failed,
            "REQUEUED" => TaskStateKind::Requeued,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    Issue,
    PrComment,
    TaskImport,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::Issue => "issue",
            JobKind::PrComment => "pr-comment",
            JobKind::TaskImport => "task-import",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "issue" => JobKind::Issue,
            "pr-comment" => JobKind::PrComment,
            "task-import" => JobKind::TaskImport,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub state: TaskStateKind,
    pub reason: String,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub category: String,
    pub message: String,
    pub stage: String,
    pub branch: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrResultInfo {
    pub number: i64,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskState {
    pub task_id: String,
    pub owner: String,
    pub repo: String,
    pub issue_number: i64,
    pub model: String,
    pub kind: JobKind,
    pub state: TaskStateKind,
    pub attempts: i64,
    pub history: Vec<HistoryEntry>,
    pub session_id: Option<String>,
    pub conversation_id: Option<String>,
    pub container_id: Option<String>,
    pub container_name: Option<String>,
    pub last_error: Option<ErrorInfo>,
    pub pr_result: Option<PrResultInfo>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskState {
    pub fn fingerprint(owner: &str, repo: &str, issue_number: i64, model: &str) -> String {
        format!("{owner}-{repo}-{issue_number}-{model}")
    }
}

#[derive(FromRow)]
struct TaskRow {
    task_id: String,
    owner: String,
    repo: String,
    issue_number: i64,
    model: String,
    kind: String,
    state: String,
    attempts: i64,
    history: String,
    session_id: Option<String>,
    conversation_id: Option<String>,
    container_id: Option<String>,
    container_name: Option<String>,
    last_error: Option<String>,
    pr_result: Option<String>,
    created_at: String,
    updated_at: String,
}

impl TaskRow {
    fn into_task_state(self) -> Result<TaskState, sqlx::Error> {
        let parse_err = |e: serde_json::Error| sqlx::Error::Decode(Box::new(e));
        Ok(TaskState {
            task_id: self.task_id,
            owner: self.owner,
            repo: self.repo,
            issue_number: self.issue_number,
            model: self.model,
            kind: JobKind::parse(&self.kind).ok_or_else(|| {
                sqlx::Error::Decode(format!("unknown job kind {}", self.kind).into())
            })?,
            state: TaskStateKind::parse(&self.state).ok_or_else(|| {
                sqlx::Error::Decode(format!("unknown task state {}", self.state).into())
            })?,
            attempts: self.attempts,
            history: serde_json::from_str(&self.history).map_err(parse_err)?,
            session_id: self.session_id,
            conversation_id: self.conversation_id,
            container_id: self.container_id,
            container_name: self.container_name,
            last_error: self
                .last_error
                .map(|s| serde_json::from_str(&s))
                .transpose()
                .map_err(parse_err)?,
            pr_result: self
                .pr_result
                .map(|s| serde_json::from_str(&s))
                .transpose()
                .map_err(parse_err)?,
            created_at: self.created_at.parse().map_err(|e: chrono::ParseError| {
                sqlx::Error::Decode(Box::new(e))
            })?,
            updated_at: self.updated_at.parse().map_err(|e: chrono::ParseError| {
                sqlx::Error::Decode(Box::new(e))
            })?,
        })
    }
}

const SELECT_COLUMNS: &str = "task_id, owner, repo, issue_number, model, kind, state, attempts, \
     history, session_id, conversation_id, container_id, container_name, last_error, pr_result, \
     created_at, updated_at";

impl TaskState {
    pub async fn create(
        pool: &SqlitePool,
        owner: &str,
        repo: &str,
        issue_number: i64,
        model: &str,
        kind: JobKind,
    ) -> Result<TaskState, sqlx::Error> {
        let task_id = TaskState::fingerprint(owner, repo, issue_number, model);
        let now = Utc::now();
        let history = vec![HistoryEntry {
            state: TaskStateKind::Pending,
            reason: "created".to_string(),
            at: now,
            metadata: serde_json::Value::Null,
        }];
        let history_json = serde_json::to_string(&history).unwrap();

        sqlx::query(
            "INSERT INTO tasks (task_id, owner, repo, issue_number, model, kind, state, \
             attempts, history, created_at, updated_at) VALUES (?,?,?,?,?,?,?,0,?,?,?) \
             ON CONFLICT(task_id) DO UPDATE SET \
             state = excluded.state, attempts = 0, history = excluded.history, \
             updated_at = excluded.updated_at",
        )
        .bind(&task_id)
        .bind(owner)
        .bind(repo)
        .bind(issue_number)
        .bind(model)
        .bind(kind.as_str())
        .bind(TaskStateKind::Pending.as_str())
        .bind(&history_json)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(pool)
        .await?;

        Ok(TaskState {
            task_id,
            owner: owner.to_string(),
            repo: repo.to_string(),
            issue_number,
            model: model.to_string(),
            kind,
            state: TaskStateKind::Pending,
            attempts: 0,
            history,
            session_id: None,
            conversation_id: None,
            container_id: None,
            container_name: None,
            last_error: None,
            pr_result: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub async fn get(pool: &SqlitePool, task_id: &str) -> Result<Option<TaskState>, sqlx::Error> {
        let row: Option<TaskRow> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM tasks WHERE task_id = ?"
        ))
        .bind(task_id)
        .fetch_optional(pool)
        .await?;
        row.map(TaskRow::into_task_state).transpose()
    }

    /// Appends a new `history[]` entry for `new_state` (append-only, per the state machine in
    /// §4.7) and updates the denormalized `state`/`updated_at` columns.
    pub async fn update_state(
        pool: &SqlitePool,
        task_id: &str,
        new_state: TaskStateKind,
        reason: &str,
        metadata: serde_json::Value,
    ) -> Result<(), sqlx::Error> {
        let Some(mut task) = TaskState::get(pool, task_id).await? else {
            return Err(sqlx::Error::RowNotFound);
        };
        let now = Utc::now();
        task.history.push(HistoryEntry { state: new_state, reason: reason.to_string(), at: now, metadata });
        let history_json = serde_json::to_string(&task.history).unwrap();

        sqlx::query(
            "UPDATE tasks SET state = ?, history = ?, updated_at = ? WHERE task_id = ?",
        )
        .bind(new_state.as_str())
        .bind(history_json)
        .bind(now.to_rfc3339())
        .bind(task_id)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Merges `metadata` into the most recent `history[]` entry without appending a new one -
    /// used to attach a late-arriving `containerId`/`sessionId` to the entry already recording
    /// the current state.
    pub async fn update_history_metadata(
        pool: &SqlitePool,
        task_id: &str,
        metadata: serde_json::Value,
    ) -> Result<(), sqlx::Error> {
        let Some(mut task) = TaskState::get(pool, task_id).await? else {
            return Err(sqlx::Error::RowNotFound);
        };
        if let Some(last) = task.history.last_mut() {
            merge_json(&mut last.metadata, metadata);
        }
        let history_json = serde_json::to_string(&task.history).unwrap();
        sqlx::query("UPDATE tasks SET history = ?, updated_at = ? WHERE task_id = ?")
            .bind(history_json)
            .bind(Utc::now().to_rfc3339())
            .bind(task_id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn set_session(
        pool: &SqlitePool,
        task_id: &str,
        session_id: &str,
        conversation_id: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE tasks SET session_id = ?, conversation_id = ?, updated_at = ? WHERE task_id = ?",
        )
        .bind(session_id)
        .bind(conversation_id)
        .bind(Utc::now().to_rfc3339())
        .bind(task_id)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn set_container(
        pool: &SqlitePool,
        task_id: &str,
        container_id: &str,
        container_name: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE tasks SET container_id = ?, container_name = ?, updated_at = ? WHERE task_id = ?",
        )
        .bind(container_id)
        .bind(container_name)
        .bind(Utc::now().to_rfc3339())
        .bind(task_id)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn mark_failed(
        pool: &SqlitePool,
        task_id: &str,
        error: ErrorInfo,
    ) -> Result<(), sqlx::Error> {
        let metadata = serde_json::to_value(&error).unwrap_or(serde_json::Value::Null);
        TaskState::update_state(pool, task_id, TaskStateKind::Failed, "failed", metadata).await?;
        sqlx::query("UPDATE tasks SET last_error = ?, updated_at = ? WHERE task_id = ?")
            .bind(serde_json::to_string(&error).unwrap())
            .bind(Utc::now().to_rfc3339())
            .bind(task_id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn mark_requeued(
        pool: &SqlitePool,
        task_id: &str,
        reason: &str,
        metadata: serde_json::Value,
    ) -> Result<(), sqlx::Error> {
        TaskState::update_state(pool, task_id, TaskStateKind::Requeued, reason, metadata).await
    }

    pub async fn mark_completed(
        pool: &SqlitePool,
        task_id: &str,
        terminal: TaskStateKind,
        pr_result: Option<PrResultInfo>,
    ) -> Result<(), sqlx::Error> {
        debug_assert!(
            matches!(terminal, TaskStateKind::CompletedWithPr | TaskStateKind::CompletedNoChanges)
        );
        TaskState::update_state(pool, task_id, terminal, "completed", serde_json::Value::Null)
            .await?;
        if let Some(pr) = pr_result {
            sqlx::query("UPDATE tasks SET pr_result = ?, updated_at = ? WHERE task_id = ?")
                .bind(serde_json::to_string(&pr).unwrap())
                .bind(Utc::now().to_rfc3339())
                .bind(task_id)
                .execute(pool)
                .await?;
        }
        Ok(())
    }

    /// Tasks left in a non-terminal, resumable state, with staleness flagged relative to
    /// `stale_threshold` (typically 30 minutes). Recovery policy (mark failed / requeue) is
    /// left to the caller, per §4.3.
    pub async fn list_resumable(
        pool: &SqlitePool,
        stale_threshold: Duration,
    ) -> Result<Vec<(TaskState, bool)>, sqlx::Error> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM tasks WHERE state IN (?,?,?)"
        ))
        .bind(TaskStateKind::Processing.as_str())
        .bind(TaskStateKind::ClaudeExecution.as_str())
        .bind(TaskStateKind::PostProcessing.as_str())
        .fetch_all(pool)
        .await?;

        let now = Utc::now();
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let task = row.into_task_state()?;
            let stale = now - task.updated_at > stale_threshold;
            out.push((task, stale));
        }
        Ok(out)
    }

    pub async fn get_resumable(
        pool: &SqlitePool,
        task_id: &str,
        stale_threshold: Duration,
    ) -> Result<Option<(TaskState, bool)>, sqlx::Error> {
        let Some(task) = TaskState::get(pool, task_id).await? else { return Ok(None) };
        if !task.state.is_resumable() {
            return Ok(None);
        }
        let stale = Utc::now() - task.updated_at > stale_threshold;
        Ok(Some((task, stale)))
    }

    pub async fn cleanup_old_tasks(pool: &SqlitePool, max_age: Duration) -> Result<u64, sqlx::Error> {
        let cutoff = (Utc::now() - max_age).to_rfc3339();
        let result = sqlx::query("DELETE FROM tasks WHERE updated_at < ?")
            .bind(cutoff)
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }
}

fn merge_json(base: &mut serde_json::Value, patch: serde_json::Value) {
    match (base, patch) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(patch_map)) => {
            for (k, v) in patch_map {
                base_map.insert(k, v);
            }
        }
        (base_slot, patch) => *base_slot = patch,
    }
}
