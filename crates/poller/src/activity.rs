use std::{collections::VecDeque, sync::Mutex};

const MAX_ENTRIES: usize = 1000;

#[derive(Debug, Clone, serde::Serialize)]
pub struct ActivityEntry {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub message: String,
}

/// Dashboard-facing sweep log, trimmed to the most recent `MAX_ENTRIES`.
#[derive(Default)]
pub struct ActivityLog {
    entries: Mutex<VecDeque<ActivityEntry>>,
}

impl ActivityLog {
    pub fn new() -> Self {
        ActivityLog::default()
    }

    pub fn record(&self, message: impl Into<String>) {
        let mut entries = self.entries.lock().unwrap();
        entries.push_back(ActivityEntry { timestamp: chrono::Utc::now(), message: message.into() });
        while entries.len() > MAX_ENTRIES {
            entries.pop_front();
        }
    }

    pub fn recent(&self) -> Vec<ActivityEntry> {
        self.entries.lock().unwrap().iter().cloned().collect()
    }
}
