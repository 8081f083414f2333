use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const EV_LOG: &str = "log";
pub const EV_DIFF: &str = "diff";
pub const EV_STATE: &str = "state";
pub const EV_FINISHED: &str = "finished";

/// One frame on a task's multiplexed stream. `Diff` always carries the complete current
/// working-tree diff, not a delta - subscribers replace rather than patch.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChannelMsg {
    Log { data: String, timestamp: DateTime<Utc> },
    Diff { data: String, timestamp: DateTime<Utc> },
    State { data: serde_json::Value, timestamp: DateTime<Utc> },
    Finished,
}

impl ChannelMsg {
    pub fn log(data: impl Into<String>) -> Self {
        ChannelMsg::Log { data: data.into(), timestamp: Utc::now() }
    }

    pub fn diff(data: impl Into<String>) -> Self {
        ChannelMsg::Diff { data: data.into(), timestamp: Utc::now() }
    }

    pub fn state(data: serde_json::Value) -> Self {
        ChannelMsg::State { data, timestamp: Utc::now() }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ChannelMsg::Log { .. } => EV_LOG,
            ChannelMsg::Diff { .. } => EV_DIFF,
            ChannelMsg::State { .. } => EV_STATE,
            ChannelMsg::Finished => EV_FINISHED,
        }
    }

    /// Rough size accounting for the byte-budgeted history ring.
    pub fn approx_bytes(&self) -> usize {
        const OVERHEAD: usize = 16;
        match self {
            ChannelMsg::Log { data, .. } => data.len() + OVERHEAD,
            ChannelMsg::Diff { data, .. } => data.len() + OVERHEAD,
            ChannelMsg::State { data, .. } => {
                serde_json::to_string(data).map(|s| s.len()).unwrap_or(2) + OVERHEAD
            }
            ChannelMsg::Finished => OVERHEAD,
        }
    }
}
