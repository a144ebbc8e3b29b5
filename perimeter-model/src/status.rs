use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::ModelError;

/// Cluster-wide run state of a scan group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum GroupStatus {
    #[default]
    Stopped,
    Started,
}

impl GroupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupStatus::Stopped => "stopped",
            GroupStatus::Started => "started",
        }
    }
}

impl fmt::Display for GroupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GroupStatus {
    type Err = ModelError;

    /// Accepts the names as well as the legacy numeric codes.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stopped" | "1" => Ok(GroupStatus::Stopped),
            "started" | "2" => Ok(GroupStatus::Started),
            other => Err(ModelError::InvalidStatus(other.to_string())),
        }
    }
}

/// Identity of one Started period of a group. Minted when the status lock
/// is taken; heartbeats and releases only act on the matching run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for RunId {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(RunId)
            .map_err(|err| ModelError::InvalidId(format!("run id '{s}': {err}")))
    }
}

/// Status plus the time it last changed and, while Started, the run that
/// holds it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GroupStatusRecord {
    pub status: GroupStatus,
    pub modified_at: DateTime<Utc>,
    /// Last sign of life from the owning run. Equals `modified_at` until
    /// the first heartbeat.
    pub heartbeat_at: DateTime<Utc>,
    pub run_id: Option<RunId>,
}

impl GroupStatusRecord {
    pub fn new(status: GroupStatus) -> Self {
        let now = Utc::now();
        Self {
            status,
            modified_at: now,
            heartbeat_at: now,
            run_id: None,
        }
    }

    /// A fresh Started record owned by `run`.
    pub fn started(run: RunId) -> Self {
        Self {
            run_id: Some(run),
            ..Self::new(GroupStatus::Started)
        }
    }

    pub fn is_started(&self) -> bool {
        self.status == GroupStatus::Started
    }

    /// Started and held by `run`.
    pub fn is_held_by(&self, run: RunId) -> bool {
        self.is_started() && self.run_id == Some(run)
    }

    /// Time since the owning run last reported in.
    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.heartbeat_at
    }
}
