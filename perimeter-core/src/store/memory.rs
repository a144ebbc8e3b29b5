use std::{
    collections::{HashMap, HashSet, VecDeque},
    fmt,
    time::Duration,
};

use async_trait::async_trait;
use perimeter_model::{
    Address, AddressHash, GroupKey, GroupStatus, GroupStatusRecord, RunId,
    ScanGroup,
};
use tokio::{
    sync::{Mutex, mpsc},
    time::Instant,
};
use tracing::{debug, warn};

use super::{
    GateKind, GroupInvalidation, GroupStateStore, InvalidationBus,
    InvalidationSubscription, RateGate, WorkQueue, dedup_in_order,
};
use crate::error::Result;

#[derive(Default)]
struct Frontier {
    order: VecDeque<AddressHash>,
    items: HashMap<AddressHash, Address>,
    seen: HashSet<AddressHash>,
}

#[derive(Default)]
struct Inner {
    frontiers: HashMap<GroupKey, Frontier>,
    status: HashMap<GroupKey, GroupStatusRecord>,
    groups: HashMap<GroupKey, ScanGroup>,
    gates: HashMap<(GateKind, GroupKey, String), Instant>,
}

/// Process-local state store. Suitable for tests and single-instance
/// deployments; every operation holds one mutex so multi-step updates are
/// atomic.
#[derive(Default)]
pub struct MemoryStateStore {
    inner: Mutex<Inner>,
    subscribers: std::sync::Mutex<Vec<mpsc::Sender<GroupInvalidation>>>,
}

impl fmt::Debug for MemoryStateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let subscribers = self
            .subscribers
            .lock()
            .map(|subs| subs.len())
            .unwrap_or_default();
        f.debug_struct("MemoryStateStore")
            .field("subscribers", &subscribers)
            .finish()
    }
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn broadcast(&self, message: GroupInvalidation) {
        let Ok(mut subscribers) = self.subscribers.lock() else {
            warn!(target: "scan::store", "invalidation subscriber list poisoned");
            return;
        };
        subscribers.retain(|tx| match tx.try_send(message.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    target: "scan::store",
                    key = %message.key,
                    "invalidation subscriber lagging; message dropped"
                );
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

#[async_trait]
impl WorkQueue for MemoryStateStore {
    async fn push_addresses(
        &self,
        key: GroupKey,
        addresses: &[Address],
    ) -> Result<usize> {
        let mut inner = self.inner.lock().await;
        let frontier = inner.frontiers.entry(key).or_default();
        let mut queued = 0;
        for address in addresses {
            if frontier.items.contains_key(&address.address_hash) {
                continue;
            }
            frontier.order.push_back(address.address_hash.clone());
            frontier
                .items
                .insert(address.address_hash.clone(), address.clone());
            queued += 1;
        }
        Ok(queued)
    }

    async fn pop_addresses(
        &self,
        key: GroupKey,
        limit: usize,
    ) -> Result<Vec<Address>> {
        let mut inner = self.inner.lock().await;
        let Some(frontier) = inner.frontiers.get_mut(&key) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::with_capacity(limit.min(frontier.order.len()));
        while out.len() < limit {
            let Some(hash) = frontier.order.pop_front() else {
                break;
            };
            if let Some(address) = frontier.items.remove(&hash) {
                out.push(address);
            }
        }
        Ok(out)
    }

    async fn queue_len(&self, key: GroupKey) -> Result<usize> {
        let inner = self.inner.lock().await;
        Ok(inner
            .frontiers
            .get(&key)
            .map(|frontier| frontier.items.len())
            .unwrap_or(0))
    }

    async fn filter_new(
        &self,
        key: GroupKey,
        candidates: &[AddressHash],
    ) -> Result<Vec<AddressHash>> {
        let mut inner = self.inner.lock().await;
        let frontier = inner.frontiers.entry(key).or_default();
        Ok(dedup_in_order(candidates)
            .into_iter()
            .filter(|hash| frontier.seen.insert(hash.clone()))
            .collect())
    }

    async fn clear_frontier(&self, key: GroupKey) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.frontiers.remove(&key).is_some() {
            debug!(target: "scan::store", %key, "frontier cleared");
        }
        Ok(())
    }
}

#[async_trait]
impl GroupStateStore for MemoryStateStore {
    async fn group_status(
        &self,
        key: GroupKey,
    ) -> Result<Option<GroupStatusRecord>> {
        Ok(self.inner.lock().await.status.get(&key).copied())
    }

    async fn try_start(&self, key: GroupKey) -> Result<Option<RunId>> {
        let mut inner = self.inner.lock().await;
        if inner.status.get(&key).is_some_and(|record| record.is_started()) {
            return Ok(None);
        }
        let run = RunId::new();
        inner.status.insert(key, GroupStatusRecord::started(run));
        Ok(Some(run))
    }

    async fn heartbeat(&self, key: GroupKey, run: RunId) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        match inner.status.get_mut(&key) {
            Some(record) if record.is_held_by(run) => {
                record.heartbeat_at = chrono::Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, key: GroupKey, run: RunId) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        if !inner.status.get(&key).is_some_and(|record| record.is_held_by(run))
        {
            return Ok(false);
        }
        inner
            .status
            .insert(key, GroupStatusRecord::new(GroupStatus::Stopped));
        Ok(true)
    }

    async fn stop(&self, key: GroupKey) -> Result<()> {
        self.inner
            .lock()
            .await
            .status
            .insert(key, GroupStatusRecord::new(GroupStatus::Stopped));
        Ok(())
    }

    async fn put_group(&self, group: &ScanGroup) -> Result<()> {
        self.inner
            .lock()
            .await
            .groups
            .insert(group.key(), group.clone());
        self.broadcast(GroupInvalidation::for_group(group));
        Ok(())
    }

    async fn put_group_if_newer(&self, group: &ScanGroup) -> Result<bool> {
        {
            let mut inner = self.inner.lock().await;
            if inner
                .groups
                .get(&group.key())
                .is_some_and(|stored| stored.modified_time >= group.modified_time)
            {
                return Ok(false);
            }
            inner.groups.insert(group.key(), group.clone());
        }
        self.broadcast(GroupInvalidation::for_group(group));
        Ok(true)
    }

    async fn get_group(&self, key: GroupKey) -> Result<Option<ScanGroup>> {
        Ok(self.inner.lock().await.groups.get(&key).cloned())
    }

    async fn delete_group(&self, key: GroupKey) -> Result<()> {
        let removed = self.inner.lock().await.groups.remove(&key);
        let modified_time = removed
            .map(|group| group.modified_time)
            .unwrap_or_else(chrono::Utc::now);
        self.broadcast(GroupInvalidation::new(key, modified_time));
        Ok(())
    }
}

#[async_trait]
impl InvalidationBus for MemoryStateStore {
    async fn publish_invalidation(
        &self,
        message: GroupInvalidation,
    ) -> Result<()> {
        self.broadcast(message);
        Ok(())
    }

    async fn subscribe_invalidations(
        &self,
        buffer: usize,
    ) -> Result<InvalidationSubscription> {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(tx);
        }
        Ok(InvalidationSubscription::new(rx))
    }
}

#[async_trait]
impl RateGate for MemoryStateStore {
    async fn try_acquire_gate(
        &self,
        kind: GateKind,
        key: GroupKey,
        ttl: Duration,
        subject: &str,
    ) -> Result<bool> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        inner.gates.retain(|_, expires| *expires > now);
        let gate = (kind, key, subject.trim().to_ascii_lowercase());
        if inner.gates.contains_key(&gate) {
            return Ok(false);
        }
        inner.gates.insert(gate, now + ttl);
        Ok(true)
    }
}
