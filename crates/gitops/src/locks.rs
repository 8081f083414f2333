use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use tokio::sync::Mutex;

/// Guards a single parent clone with a process-local exclusive lock, per §5: "the Clone/Worktree
/// Store MUST guard the parent clone with a per-clone mutex to prevent concurrent git index
/// mutations." Open Question #1 (DESIGN.md) resolves the lock's scope as process-local only.
#[derive(Clone, Default)]
pub struct CloneLocks {
    locks: Arc<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>>,
}

impl CloneLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock_for(&self, clone_path: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(clone_path.to_path_buf()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }
}
