//! Shared state store contract.
//!
//! Everything the pipeline shares between dispatcher instances lives behind
//! these traits: the per-group work queue and seen set, the group status
//! lock, the stored group configuration with its invalidation channel, and
//! the rate gates analyzers use to avoid re-probing the same zone or host.
//! Every entry is sharded by [`GroupKey`].

use std::{fmt, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use perimeter_model::{
    Address, AddressHash, GroupKey, GroupStatusRecord, RunId, ScanGroup,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;

pub mod memory;
#[cfg(feature = "redis-store")]
pub mod redis;

pub use self::memory::MemoryStateStore;
#[cfg(feature = "redis-store")]
pub use self::redis::{RedisKeys, RedisStateStore};

/// Self-feeding frontier of a scan group.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Enqueue addresses. Hashes already queued are skipped, so the return
    /// value counts only newly queued items.
    async fn push_addresses(
        &self,
        key: GroupKey,
        addresses: &[Address],
    ) -> Result<usize>;

    /// Remove and return up to `limit` queued addresses.
    async fn pop_addresses(
        &self,
        key: GroupKey,
        limit: usize,
    ) -> Result<Vec<Address>>;

    async fn queue_len(&self, key: GroupKey) -> Result<usize>;

    /// Atomic check-and-set against the group's seen set. Returns the
    /// candidates that were not seen before, each at most once, in input
    /// order.
    async fn filter_new(
        &self,
        key: GroupKey,
        candidates: &[AddressHash],
    ) -> Result<Vec<AddressHash>>;

    /// Drop queued work and the seen set for the group.
    async fn clear_frontier(&self, key: GroupKey) -> Result<()>;
}

/// Group status lock and stored group configuration.
#[async_trait]
pub trait GroupStateStore: Send + Sync {
    async fn group_status(
        &self,
        key: GroupKey,
    ) -> Result<Option<GroupStatusRecord>>;

    /// Atomically transition Stopped (or absent) to Started under a freshly
    /// minted run id. Returns `None` when the group is already Started.
    async fn try_start(&self, key: GroupKey) -> Result<Option<RunId>>;

    /// Refresh `heartbeat_at` while `run` still holds the Started status.
    /// Returns false once the status belongs to someone else or is Stopped.
    async fn heartbeat(&self, key: GroupKey, run: RunId) -> Result<bool>;

    /// Set Stopped only if `run` still holds the Started status.
    async fn release(&self, key: GroupKey, run: RunId) -> Result<bool>;

    /// Unconditionally set Stopped. Operator escape hatch.
    async fn stop(&self, key: GroupKey) -> Result<()>;

    /// Store a group configuration and publish an invalidation for it.
    async fn put_group(&self, group: &ScanGroup) -> Result<()>;

    /// Store `group` only when no copy is stored or the stored copy has an
    /// older `modified_time`. Publishes an invalidation when it writes.
    async fn put_group_if_newer(&self, group: &ScanGroup) -> Result<bool>;

    async fn get_group(&self, key: GroupKey) -> Result<Option<ScanGroup>>;

    /// Remove a stored configuration and publish an invalidation for it.
    async fn delete_group(&self, key: GroupKey) -> Result<()>;
}

/// Invalidation message for one group configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInvalidation {
    pub key: GroupKey,
    /// `modified_time` of the configuration that triggered the message.
    pub modified_time: DateTime<Utc>,
}

impl GroupInvalidation {
    pub fn new(key: GroupKey, modified_time: DateTime<Utc>) -> Self {
        Self { key, modified_time }
    }

    pub fn for_group(group: &ScanGroup) -> Self {
        Self::new(group.key(), group.modified_time)
    }
}

/// Live invalidation subscription. The subscription is established before
/// it is returned, so no message published afterwards is missed.
pub struct InvalidationSubscription {
    rx: mpsc::Receiver<GroupInvalidation>,
}

impl InvalidationSubscription {
    pub fn new(rx: mpsc::Receiver<GroupInvalidation>) -> Self {
        Self { rx }
    }

    /// Next message, or `None` once the publisher side is gone.
    pub async fn recv(&mut self) -> Option<GroupInvalidation> {
        self.rx.recv().await
    }
}

impl fmt::Debug for InvalidationSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvalidationSubscription")
            .field("closed", &self.rx.is_closed())
            .finish()
    }
}

#[async_trait]
pub trait InvalidationBus: Send + Sync {
    async fn publish_invalidation(
        &self,
        message: GroupInvalidation,
    ) -> Result<()>;

    async fn subscribe_invalidations(
        &self,
        buffer: usize,
    ) -> Result<InvalidationSubscription>;
}

/// Families of "may I probe this again" gates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateKind {
    NsZone,
    BruteEtld,
    BigDataDomain,
    WebHost,
    PortHost,
}

impl GateKind {
    pub const ALL: [GateKind; 5] = [
        GateKind::NsZone,
        GateKind::BruteEtld,
        GateKind::BigDataDomain,
        GateKind::WebHost,
        GateKind::PortHost,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            GateKind::NsZone => "ns_zone",
            GateKind::BruteEtld => "brute_etld",
            GateKind::BigDataDomain => "bigdata_domain",
            GateKind::WebHost => "web_host",
            GateKind::PortHost => "port_host",
        }
    }
}

impl fmt::Display for GateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for GateKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        GateKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s.trim())
            .ok_or_else(|| format!("unknown gate kind '{s}'"))
    }
}

#[async_trait]
pub trait RateGate: Send + Sync {
    /// True exactly once per (kind, group, subject) within `ttl`.
    async fn try_acquire_gate(
        &self,
        kind: GateKind,
        key: GroupKey,
        ttl: Duration,
        subject: &str,
    ) -> Result<bool>;
}

/// Everything the pipeline needs from the shared store.
pub trait StateStore:
    WorkQueue + GroupStateStore + InvalidationBus + RateGate
{
}

impl<T> StateStore for T where
    T: WorkQueue + GroupStateStore + InvalidationBus + RateGate
{
}

/// Drop duplicate hashes while keeping the first occurrence's position.
pub(crate) fn dedup_in_order(candidates: &[AddressHash]) -> Vec<AddressHash> {
    let mut seen = std::collections::HashSet::with_capacity(candidates.len());
    candidates
        .iter()
        .filter(|hash| seen.insert(*hash))
        .cloned()
        .collect()
}
