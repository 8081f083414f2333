use std::{collections::HashMap, sync::Arc};

use tokio::sync::RwLock;
use utils::msg_store::MsgStore;

/// One `MsgStore` per task, in-process only - evicted alongside the task's durable row, never
/// persisted itself (the log/diff/state stream is best-effort, not survivable across restart).
#[derive(Clone, Default)]
pub struct ChannelRegistry {
    stores: Arc<RwLock<HashMap<String, Arc<MsgStore>>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_or_create(&self, task_id: &str) -> Arc<MsgStore> {
        if let Some(store) = self.stores.read().await.get(task_id) {
            return store.clone();
        }
        let mut stores = self.stores.write().await;
        stores.entry(task_id.to_string()).or_insert_with(|| Arc::new(MsgStore::new())).clone()
    }

    pub async fn get(&self, task_id: &str) -> Option<Arc<MsgStore>> {
        self.stores.read().await.get(task_id).cloned()
    }

    pub async fn remove(&self, task_id: &str) {
        self.stores.write().await.remove(task_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_or_create_returns_same_store_for_same_task() {
        let registry = ChannelRegistry::new();
        let a = registry.get_or_create("task-1").await;
        let b = registry.get_or_create("task-1").await;
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn remove_drops_the_store() {
        let registry = ChannelRegistry::new();
        registry.get_or_create("task-1").await;
        registry.remove("task-1").await;
        assert!(registry.get("task-1").await.is_none());
    }
}
