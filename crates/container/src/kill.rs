use command_group::AsyncGroupChild;
#[cfg(unix)]
use nix::{
    sys::signal::{killpg, Signal},
    unistd::{getpgid, Pid},
};
use tokio::time::Duration;

use crate::error::ContainerError;

/// Escalates SIGTERM then SIGKILL to the whole process group (the container's `docker run`
/// child can itself spawn the agent process, so killing only the leader PID leaves it running).
pub async fn kill_process_group(child: &mut AsyncGroupChild) -> Result<(), ContainerError> {
    #[cfg(unix)]
    {
        if let Some(pid) = child.inner().id() {
            let pgid = getpgid(Some(Pid::from_raw(pid as i32))).map_err(|e| ContainerError::KillFailed(std::io::Error::other(e)))?;

            for sig in [Signal::SIGTERM, Signal::SIGKILL] {
                if let Err(e) = killpg(pgid, sig) {
                    tracing::warn!("failed to send {sig:?} to process group {pgid}: {e}");
                }
                tokio::time::sleep(Duration::from_secs(5)).await;
                if child.inner().try_wait().map_err(ContainerError::KillFailed)?.is_some() {
                    break;
                }
            }
        }
    }

    let _ = child.kill().await;
    let _ = child.wait().await;
    Ok(())
}
