use std::{path::PathBuf, process::Stdio, sync::Arc, time::Duration};

use async_trait::async_trait;
use command_group::{AsyncCommandGroup, AsyncGroupChild};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::Command,
    sync::Mutex,
};
use tracing::{info, warn};

use crate::{
    error::ContainerError,
    kill::kill_process_group,
    protocol::{parse_line, usage_limit_reset_at, LineKind},
};

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub worktree_path: PathBuf,
    pub clone_base: PathBuf,
    pub config_dir: PathBuf,
    pub hosting_token: String,
    pub prompt: String,
    pub model: Option<String>,
    pub max_turns: Option<u32>,
    pub timeout: Duration,
    pub container_user_uid: u32,
    pub container_name: String,
    pub image: String,
    pub workspace_mount: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct RunOutcome {
    pub num_turns: u32,
    pub cost_usd: f64,
    pub result_text: String,
    pub session_id: Option<String>,
    pub conversation_id: Option<String>,
    pub model: Option<String>,
}

/// Notifications fired during a run; the worker wires these into the State Store's `MsgStore`
/// channels and `TaskState` updates.
#[async_trait]
pub trait RunCallbacks: Send + Sync {
    async fn on_session_id(&self, session_id: &str, conversation_id: Option<&str>);
    async fn on_container_id(&self, container_id: &str, container_name: &str);
    async fn on_log_chunk(&self, chunk: &str);
    async fn on_tick(&self);
}

pub struct ContainerRunner;

impl ContainerRunner {
    pub fn new() -> Self {
        ContainerRunner
    }

    fn fixup_ownership(&self, worktree_path: &PathBuf, uid: u32) {
        #[cfg(unix)]
        {
            use std::os::unix::fs::chown;
            fn walk(path: &std::path::Path, uid: u32) {
                let _ = chown(path, Some(uid), None);
                if let Ok(entries) = std::fs::read_dir(path) {
                    for entry in entries.flatten() {
                        let p = entry.path();
                        if p.is_dir() {
                            walk(&p, uid);
                        } else {
                            let _ = chown(&p, Some(uid), None);
                        }
                    }
                }
            }
            walk(worktree_path, uid);
        }
        #[cfg(not(unix))]
        let _ = (worktree_path, uid);
    }

    fn build_command(&self, req: &RunRequest) -> Command {
        let mut cmd = Command::new("docker");
        cmd.arg("run")
            .arg("--rm")
            .arg("--cap-drop=ALL")
            .arg("--security-opt")
            .arg("no-new-privileges")
            .arg("--name")
            .arg(&req.container_name)
            .arg("-e")
            .arg(format!("GITHUB_TOKEN={}", req.hosting_token))
            .arg("-v")
            .arg(format!("{}:{}", req.worktree_path.display(), req.workspace_mount.display()))
            .arg("-v")
            .arg(format!("{0}:{0}", req.clone_base.display()))
            .arg("-v")
            .arg(format!("{0}:{0}", req.config_dir.display()))
            .arg("-w")
            .arg(&req.workspace_mount)
            .arg(&req.image)
            .arg("-p")
            .arg("--verbose")
            .arg("--output-format=stream-json");

        if let Some(model) = &req.model {
            cmd.arg("--model").arg(model);
        }
        if let Some(max_turns) = req.max_turns {
            cmd.arg("--max-turns").arg(max_turns.to_string());
        }

        cmd.kill_on_drop(true).stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd
    }

    /// Runs the subprocess to completion (or timeout), streaming stdout/stderr into `callbacks`
    /// as it arrives.
    pub async fn run(&self, req: RunRequest, callbacks: Arc<dyn RunCallbacks>) -> Result<RunOutcome, ContainerError> {
        self.fixup_ownership(&req.worktree_path, req.container_user_uid);

        let mut command = self.build_command(&req);
        let mut child: AsyncGroupChild = command.group_spawn()?;

        if let Some(mut stdin) = child.inner().stdin.take() {
            stdin.write_all(req.prompt.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let stdout = child.inner().stdout.take().expect("stdout piped");
        let stderr = child.inner().stderr.take().expect("stderr piped");

        let outcome = Arc::new(Mutex::new(RunOutcome::default()));
        let mut session_announced = false;
        let mut result_seen = false;

        let discovery_callbacks = callbacks.clone();
        let container_name = req.container_name.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            discovery_callbacks.on_container_id(&container_name, &container_name).await;
        });

        let stderr_callbacks = callbacks.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => stderr_callbacks.on_log_chunk(&line).await,
                    Ok(None) => break,
                    Err(e) => {
                        warn!("stderr forwarder failed to decode a chunk: {e}");
                        continue;
                    }
                }
            }
        });

        let run_future = async {
            let mut lines = BufReader::new(stdout).lines();
            let mut tick = tokio::time::interval(Duration::from_secs(5));
            loop {
                tokio::select! {
                    line = lines.next_line() => {
                        match line {
                            Ok(Some(raw_line)) => {
                                callbacks.on_log_chunk(&raw_line).await;
                                let Some(parsed) = parse_line(&raw_line) else { continue };

                                if !session_announced {
                                    if let Some(session_id) = &parsed.session_id {
                                        callbacks.on_session_id(session_id, parsed.conversation_id.as_deref()).await;
                                        session_announced = true;
                                        let mut out = outcome.lock().await;
                                        out.session_id = Some(session_id.clone());
                                        out.conversation_id = parsed.conversation_id.clone();
                                    }
                                }

                                match parsed.kind {
                                    LineKind::Message { model, .. } => {
                                        if let Some(model) = model {
                                            outcome.lock().await.model = Some(model);
                                        }
                                    }
                                    LineKind::Result { success, num_turns, cost_usd, result_text } => {
                                        result_seen = true;
                                        if let Some(reset_at) = usage_limit_reset_at(&result_text) {
                                            return Err(ContainerError::UsageLimit { reset_at });
                                        }
                                        let mut out = outcome.lock().await;
                                        out.num_turns = num_turns;
                                        out.cost_usd = cost_usd;
                                        out.result_text = result_text;
                                        if !success {
                                            return Err(ContainerError::NonZeroExit { code: None, stderr: out.result_text.clone() });
                                        }
                                    }
                                    LineKind::Other => {}
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                warn!("stdout forwarder failed to decode a chunk: {e}");
                                continue;
                            }
                        }
                    }
                    _ = tick.tick() => {
                        callbacks.on_tick().await;
                    }
                }
            }
            Ok(())
        };

        let result = tokio::time::timeout(req.timeout, run_future).await;

        let run_result = match result {
            Ok(inner) => inner,
            Err(_) => {
                kill_process_group(&mut child).await?;
                return Err(ContainerError::Timeout);
            }
        };

        let status = child.wait().await?;

        if let Err(e) = run_result {
            return Err(e);
        }

        if !result_seen {
            return Err(ContainerError::ProtocolError("subprocess exited with no result frame".to_string()));
        }

        if !status.success() {
            let out = outcome.lock().await;
            return Err(ContainerError::NonZeroExit { code: status.code(), stderr: out.result_text.clone() });
        }

        info!(container = %req.container_name, "container run completed");
        Ok(Arc::try_unwrap(outcome).map(Mutex::into_inner).unwrap_or_default())
    }
}

impl Default for ContainerRunner {
    fn default() -> Self {
        Self::new()
    }
}
