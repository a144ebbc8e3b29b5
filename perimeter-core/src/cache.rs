//! Read-through cache of scan-group configuration.
//!
//! Entries are replaced wholesale (never edited in place) when an
//! invalidation arrives, and every read hands out a deep copy. Freshness is
//! bounded only by invalidation delivery: a lost message leaves the entry
//! stale until the next invalidation or restart. Callers that need a hard
//! guarantee compare `modified_time` against an authoritative read.

use std::{collections::HashMap, fmt, sync::Arc};

use chrono::{DateTime, Utc};
use perimeter_model::{GroupKey, ScanGroup, UserContext};
use tokio::{sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::{CacheConfig, RetryConfig},
    error::Result,
    retry::retry_with_backoff,
    services::ScanGroupService,
    store::{GroupInvalidation, InvalidationSubscription, StateStore},
};

/// How much a returned snapshot can be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Read from the backing store during this call.
    Fresh,
    /// Served from memory; as current as the last delivered invalidation.
    PossiblyStale,
}

/// Deep copy of a cached group handed to callers.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupSnapshot {
    pub group: ScanGroup,
    pub freshness: Freshness,
}

impl GroupSnapshot {
    pub fn is_fresh(&self) -> bool {
        self.freshness == Freshness::Fresh
    }
}

/// Read-throughs that lose a race against newer invalidations are retried
/// this many times before the result is served uncached.
const READ_THROUGH_ATTEMPTS: usize = 3;

#[derive(Default)]
struct CacheState {
    entries: HashMap<GroupKey, Arc<ScanGroup>>,
    /// Highest `modified_time` announced by an invalidation since a copy was
    /// last installed. A read-through copy older than a floor that rose
    /// while it was loading is discarded.
    floors: HashMap<GroupKey, DateTime<Utc>>,
}

pub struct GroupConfigCache<S> {
    store: Arc<S>,
    groups: Arc<dyn ScanGroupService>,
    state: RwLock<CacheState>,
    config: CacheConfig,
    retry: RetryConfig,
}

impl<S> fmt::Debug for GroupConfigCache<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self
            .state
            .try_read()
            .map(|state| state.entries.len())
            .ok();
        f.debug_struct("GroupConfigCache")
            .field("store", &std::any::type_name::<S>())
            .field("entries", &entries)
            .field("config", &self.config)
            .finish()
    }
}

impl<S> GroupConfigCache<S>
where
    S: StateStore + 'static,
{
    pub fn new(
        store: Arc<S>,
        groups: Arc<dyn ScanGroupService>,
        config: CacheConfig,
        retry: RetryConfig,
    ) -> Self {
        Self {
            store,
            groups,
            state: RwLock::new(CacheState::default()),
            config,
            retry,
        }
    }

    /// Cached copy if present, otherwise read through the shared store and
    /// then the scan-group service. `None` when the group does not exist.
    pub async fn get_group_by_ids(
        &self,
        ctx: &UserContext,
        key: GroupKey,
    ) -> Result<Option<GroupSnapshot>> {
        if let Some(entry) = self.state.read().await.entries.get(&key) {
            return Ok(Some(GroupSnapshot {
                group: ScanGroup::clone(entry),
                freshness: Freshness::PossiblyStale,
            }));
        }
        self.read_through(ctx, key).await
    }

    /// Skip the in-memory copy and reload from the backing stores.
    pub async fn refresh(
        &self,
        ctx: &UserContext,
        key: GroupKey,
    ) -> Result<Option<GroupSnapshot>> {
        self.read_through(ctx, key).await
    }

    pub async fn evict(&self, key: GroupKey) {
        if self.state.write().await.entries.remove(&key).is_some() {
            debug!(target: "scan::cache", %key, "evicted");
        }
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn read_through(
        &self,
        ctx: &UserContext,
        key: GroupKey,
    ) -> Result<Option<GroupSnapshot>> {
        for attempt in 1..=READ_THROUGH_ATTEMPTS {
            let floor = self.state.read().await.floors.get(&key).copied();
            let Some(group) = self.load(ctx, key, floor).await? else {
                return Ok(None);
            };

            let mut state = self.state.write().await;
            let latest = state.floors.get(&key).copied();
            if latest != floor
                && latest.is_some_and(|raised| group.modified_time < raised)
            {
                debug!(
                    target: "scan::cache",
                    %key,
                    attempt,
                    loaded = %group.modified_time,
                    "newer version announced while loading; reading again"
                );
                continue;
            }
            state.floors.remove(&key);
            let entry = state
                .entries
                .entry(key)
                .and_modify(|current| {
                    if !group.is_stale_against(current) {
                        *current = Arc::new(group.clone());
                    }
                })
                .or_insert_with(|| Arc::new(group.clone()));
            return Ok(Some(GroupSnapshot {
                group: ScanGroup::clone(entry),
                freshness: Freshness::Fresh,
            }));
        }

        warn!(target: "scan::cache", %key, "configuration kept changing during read-through; serving uncached");
        let floor = self.state.read().await.floors.get(&key).copied();
        Ok(self.load(ctx, key, floor).await?.map(|group| GroupSnapshot {
            group,
            freshness: Freshness::PossiblyStale,
        }))
    }

    /// Current configuration from the shared store, or from the scan-group
    /// service when the store has none or lags `floor`. A service copy is
    /// written back unless the store already holds one at least as new.
    async fn load(
        &self,
        ctx: &UserContext,
        key: GroupKey,
        floor: Option<DateTime<Utc>>,
    ) -> Result<Option<ScanGroup>> {
        let stored = retry_with_backoff(&self.retry, "cache.get_group", || {
            self.store.get_group(key)
        })
        .await?;

        match stored {
            Some(group)
                if floor.is_none_or(|floor| group.modified_time >= floor) =>
            {
                Ok(Some(group))
            }
            stored => {
                let Some(group) = self.load_authoritative(ctx, key).await?
                else {
                    if stored.is_some() {
                        debug!(target: "scan::cache", %key, "group gone upstream; dropping stored copy");
                        self.store.delete_group(key).await?;
                    }
                    return Ok(None);
                };
                if stored.is_none_or(|old| old.is_stale_against(&group))
                    && !self.store.put_group_if_newer(&group).await?
                {
                    debug!(target: "scan::cache", %key, "store gained a newer copy meanwhile; write-back skipped");
                }
                Ok(Some(group))
            }
        }
    }

    async fn load_authoritative(
        &self,
        ctx: &UserContext,
        key: GroupKey,
    ) -> Result<Option<ScanGroup>> {
        let loaded = retry_with_backoff(&self.retry, "groups.get", || {
            self.groups.get(ctx, key.group_id)
        })
        .await?;
        Ok(loaded.filter(|group| group.key() == key))
    }

    /// Apply one invalidation: raise the key's floor to the announced
    /// version, then replace the entry with the store's current copy when
    /// that copy is at least as new as the message, otherwise evict so the
    /// next read goes through.
    pub async fn apply_invalidation(
        &self,
        message: &GroupInvalidation,
    ) -> Result<()> {
        let key = message.key;
        let stored = retry_with_backoff(&self.retry, "cache.refetch", || {
            self.store.get_group(key)
        })
        .await?;

        let mut state = self.state.write().await;
        raise_floor(&mut state, key, message.modified_time);
        match stored {
            Some(group) if group.modified_time >= message.modified_time => {
                if let Some(current) = state.entries.get(&key)
                    && group.is_stale_against(current)
                {
                    return Ok(());
                }
                if state.entries.contains_key(&key) {
                    debug!(target: "scan::cache", %key, modified = %group.modified_time, "entry replaced");
                    state.entries.insert(key, Arc::new(group));
                }
            }
            Some(_) => {
                state.entries.remove(&key);
                debug!(target: "scan::cache", %key, "store behind invalidation; evicted");
            }
            None => {
                state.entries.remove(&key);
                debug!(target: "scan::cache", %key, "group removed; evicted");
            }
        }
        Ok(())
    }

    /// Subscribe to invalidations and keep the cache current until `cancel`
    /// fires. Resolves once the subscription is live.
    pub async fn spawn_subscriber(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<()>> {
        let subscription = self
            .store
            .subscribe_invalidations(self.config.invalidation_buffer)
            .await?;
        info!(target: "scan::cache", "group config subscriber started");
        let cache = Arc::clone(self);
        Ok(tokio::spawn(async move {
            cache.run_subscriber(subscription, cancel).await;
        }))
    }

    async fn run_subscriber(
        &self,
        mut subscription: InvalidationSubscription,
        cancel: CancellationToken,
    ) {
        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => break,
                message = subscription.recv() => message,
            };
            let Some(message) = message else {
                warn!(target: "scan::cache", "invalidation channel closed; cache may go stale");
                break;
            };
            if let Err(err) = self.apply_invalidation(&message).await {
                warn!(
                    target: "scan::cache",
                    key = %message.key,
                    error = %err,
                    "refetch failed; evicting"
                );
                let mut state = self.state.write().await;
                state.entries.remove(&message.key);
                raise_floor(&mut state, message.key, message.modified_time);
            }
        }
        debug!(target: "scan::cache", "group config subscriber stopped");
    }
}

fn raise_floor(state: &mut CacheState, key: GroupKey, to: DateTime<Utc>) {
    state
        .floors
        .entry(key)
        .and_modify(|floor| *floor = (*floor).max(to))
        .or_insert(to);
}
