use chrono::{DateTime, Utc};
use perimeter_model::{GroupKey, RunId};
use serde::{Deserialize, Serialize};

/// Lifecycle notifications for per-group discovery loops. Every event names
/// the run it belongs to, so a late event from an old run never touches the
/// status held by a newer one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DispatchEvent {
    GroupStarted {
        key: GroupKey,
        run_id: RunId,
        started_at: DateTime<Utc>,
        seeded: usize,
    },
    /// The frontier reached a fixed point and the group was notified as
    /// complete.
    GroupCompleted {
        key: GroupKey,
        run_id: RunId,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        processed: u64,
    },
    /// Cancelled by `stop`, shutdown, a pause/delete observed mid-run, or
    /// loss of the status lock.
    GroupStopped {
        key: GroupKey,
        run_id: RunId,
        reason: String,
    },
    /// Shared store or persistence failures exhausted their retries.
    GroupFailed {
        key: GroupKey,
        run_id: RunId,
        error: String,
    },
}

impl DispatchEvent {
    pub fn key(&self) -> GroupKey {
        match self {
            DispatchEvent::GroupStarted { key, .. }
            | DispatchEvent::GroupCompleted { key, .. }
            | DispatchEvent::GroupStopped { key, .. }
            | DispatchEvent::GroupFailed { key, .. } => *key,
        }
    }

    pub fn run_id(&self) -> RunId {
        match self {
            DispatchEvent::GroupStarted { run_id, .. }
            | DispatchEvent::GroupCompleted { run_id, .. }
            | DispatchEvent::GroupStopped { run_id, .. }
            | DispatchEvent::GroupFailed { run_id, .. } => *run_id,
        }
    }

    /// Whether the event ends the group's loop.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DispatchEvent::GroupStarted { .. })
    }
}
