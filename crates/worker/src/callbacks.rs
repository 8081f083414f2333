use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use container::RunCallbacks;
use gitops::git_cli::GitCli;
use tracing::warn;

/// Wires the container runner's notifications into the State Store: updates `TaskState`'s
/// `sessionId`/`containerId` columns, writes the placeholder conversation file and records its
/// path in the task's history metadata, fans stdout/stderr chunks into the task's `log` channel,
/// and snapshots the working-tree diff into the `diff` channel on every tick.
pub struct TaskCallbacks {
    pub state: Arc<state::StateStore>,
    pub task_id: String,
    pub worktree_path: PathBuf,
    pub log_dir: PathBuf,
    pub issue_number: i64,
}

#[async_trait]
impl RunCallbacks for TaskCallbacks {
    async fn on_session_id(&self, session_id: &str, conversation_id: Option<&str>) {
        if let Err(e) = self.state.set_session(&self.task_id, session_id, conversation_id).await {
            warn!(task_id = %self.task_id, "failed to record session id: {e}");
        }

        let log_key = self.write_conversation_placeholder(session_id, conversation_id);
        let metadata = serde_json::json!({
            "log_key": log_key,
            "log_keys_by": {
                "session_id": session_id,
                "conversation_id": conversation_id,
                "issue_number": self.issue_number,
            },
        });
        if let Err(e) = self.state.update_history_metadata(&self.task_id, metadata).await {
            warn!(task_id = %self.task_id, "failed to record log-file key: {e}");
        }
    }

    async fn on_container_id(&self, container_id: &str, container_name: &str) {
        if let Err(e) = self.state.set_container(&self.task_id, container_id, container_name).await {
            warn!(task_id = %self.task_id, "failed to record container id: {e}");
        }
    }

    async fn on_log_chunk(&self, chunk: &str) {
        self.state.channel(&self.task_id).await.push_log(chunk);
    }

    async fn on_tick(&self) {
        let cli = GitCli::new();
        let diff = cli
            .git(&self.worktree_path, ["diff", "HEAD"])
            .unwrap_or_else(|e| {
                warn!(task_id = %self.task_id, "failed to snapshot working-tree diff: {e}");
                String::new()
            });
        self.state.channel(&self.task_id).await.push_diff(diff);
    }
}

impl TaskCallbacks {
    /// Writes the placeholder conversation file the session-id transcript will eventually be
    /// written to, and returns its path as a string for the State Store's log-key record.
    fn write_conversation_placeholder(&self, session_id: &str, conversation_id: Option<&str>) -> String {
        let ts = chrono::Utc::now().timestamp();
        let path = self.log_dir.join(format!("issue-{}-{ts}-conversation.json", self.issue_number));

        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!(task_id = %self.task_id, "failed to create log dir: {e}");
            }
        }

        let placeholder = serde_json::json!({
            "task_id": self.task_id,
            "issue_number": self.issue_number,
            "session_id": session_id,
            "conversation_id": conversation_id,
            "messages": [],
        });
        if let Err(e) = std::fs::write(&path, placeholder.to_string()) {
            warn!(task_id = %self.task_id, "failed to write conversation placeholder: {e}");
        }

        path.to_string_lossy().into_owned()
    }
}
