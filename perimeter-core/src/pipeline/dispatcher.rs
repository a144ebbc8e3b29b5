//! Per-group discovery engine.
//!
//! `push_addresses` seeds a group's frontier from its persisted addresses
//! and spawns a loop that drives the frontier to a fixed point:
//!
//! 1. pop a bounded batch from the shared work queue,
//! 2. run every address through the analyzer chain (addresses in parallel,
//!    modules in pass order),
//! 3. merge discoveries, check-and-set them against the seen set,
//! 4. push expandable survivors back onto the queue and hand every survivor
//!    plus the analyzed originals to the batcher,
//! 5. repeat until the queue is empty and nothing is in flight.
//!
//! Each loop runs under the [`RunId`] that took the group's status lock. A
//! side task refreshes the status heartbeat for that run and cancels the
//! loop if the status turns out to belong to someone else.
//!
//! Loops for different groups share nothing but the dispatcher's counters,
//! so one group's failure never touches another group's pipeline.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    panic::AssertUnwindSafe,
    sync::Arc,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{FutureExt, StreamExt, stream};
use perimeter_model::{
    Address, AddressHash, GroupId, GroupKey, RunId, ScanGroup, UserContext,
};
use tokio::{
    sync::{Mutex, broadcast},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::{
    activity::{ActivityCounters, GroupActivity, GroupCounters},
    batcher::Batcher,
    events::DispatchEvent,
};
use crate::{
    analyzer::{AnalyzerChain, ChainOutcome},
    cache::GroupConfigCache,
    config::PipelineConfig,
    error::{Result, ScanError},
    retry::retry_with_backoff,
    services::{AddressFilter, AddressService, EventService},
    store::StateStore,
};

/// What the control loop needs from a dispatcher, local or remote.
#[async_trait]
pub trait ScanDispatcher: Send + Sync {
    /// Seed the group's frontier and start its loop under `run`. Returns
    /// once the loop is running, not when it finishes.
    async fn push_addresses(
        &self,
        ctx: &UserContext,
        group_id: GroupId,
        run: RunId,
    ) -> Result<()>;

    /// Best-effort cooperative cancellation.
    async fn stop(&self, ctx: &UserContext, group_id: GroupId) -> Result<()>;

    async fn is_running(&self, key: GroupKey) -> bool;

    fn subscribe(&self) -> broadcast::Receiver<DispatchEvent>;
}

struct GroupHandle {
    run: RunId,
    cancel: CancellationToken,
    counters: Arc<GroupCounters>,
    started_at: DateTime<Utc>,
    task: Option<JoinHandle<()>>,
}

struct DispatcherInner<S> {
    store: Arc<S>,
    cache: Arc<GroupConfigCache<S>>,
    addresses: Arc<dyn AddressService>,
    events: Arc<dyn EventService>,
    chain: Arc<AnalyzerChain>,
    config: PipelineConfig,
    activity: ActivityCounters,
    groups: Mutex<HashMap<GroupKey, GroupHandle>>,
    bus: broadcast::Sender<DispatchEvent>,
    shutdown: CancellationToken,
}

pub struct Dispatcher<S> {
    inner: Arc<DispatcherInner<S>>,
}

impl<S> Clone for Dispatcher<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S> fmt::Debug for Dispatcher<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("store", &std::any::type_name::<S>())
            .field("chain", &self.inner.chain)
            .field("active_groups", &self.inner.activity.active_groups())
            .field("active_addresses", &self.inner.activity.active_addresses())
            .field("subscribers", &self.inner.bus.receiver_count())
            .finish()
    }
}

/// How a group's loop ended.
enum LoopExit {
    Quiescent,
    Cancelled(String),
    Failed(ScanError),
}

impl<S> Dispatcher<S>
where
    S: StateStore + 'static,
{
    pub fn new(
        store: Arc<S>,
        cache: Arc<GroupConfigCache<S>>,
        addresses: Arc<dyn AddressService>,
        events: Arc<dyn EventService>,
        chain: Arc<AnalyzerChain>,
        config: PipelineConfig,
    ) -> Self {
        let (bus, _) =
            broadcast::channel(config.dispatcher.event_channel_capacity.max(1));
        Self {
            inner: Arc::new(DispatcherInner {
                store,
                cache,
                addresses,
                events,
                chain,
                config,
                activity: ActivityCounters::default(),
                groups: Mutex::new(HashMap::new()),
                bus,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Addresses queued or being analyzed across every group in this
    /// instance.
    pub fn get_active_addresses(&self) -> usize {
        self.inner.activity.active_addresses()
    }

    /// Group loops currently running in this instance.
    pub fn get_active_groups(&self) -> usize {
        self.inner.activity.active_groups()
    }

    pub async fn group_activity(&self, key: GroupKey) -> Option<GroupActivity> {
        self.inner
            .groups
            .lock()
            .await
            .get(&key)
            .map(|handle| handle.counters.snapshot())
    }

    pub async fn is_running(&self, key: GroupKey) -> bool {
        self.inner.groups.lock().await.contains_key(&key)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.inner.bus.subscribe()
    }

    pub async fn push_addresses(
        &self,
        ctx: &UserContext,
        group_id: GroupId,
        run: RunId,
    ) -> Result<()> {
        let inner = &self.inner;
        let key = ctx.group_key(group_id);
        if inner.shutdown.is_cancelled() {
            return Err(ScanError::Cancelled("dispatcher shutting down".into()));
        }
        if self.is_running(key).await {
            return Err(ScanError::AlreadyStarted(key));
        }

        let group = inner
            .cache
            .get_group_by_ids(ctx, key)
            .await?
            .ok_or(ScanError::GroupNotFound(key))?
            .group;
        if group.deleted {
            return Err(ScanError::GroupDeleted(key));
        }
        if group.paused {
            return Err(ScanError::GroupPaused(key));
        }

        let started_at = Utc::now();
        let counters = inner.activity.group_started();
        inner.chain.add_group(ctx, &group).await;

        let seeded = match self.seed_frontier(ctx, key, started_at, &counters).await
        {
            Ok(seeded) => seeded,
            Err(err) => {
                inner.chain.remove_group(ctx, key).await;
                inner.activity.group_finished(&counters);
                error!(target: "scan::dispatch", %key, error = %err, "seeding failed");
                return Err(err);
            }
        };

        let cancel = inner.shutdown.child_token();
        let mut groups = inner.groups.lock().await;
        if groups.contains_key(&key) {
            // Lost a race with a concurrent push for the same group.
            drop(groups);
            inner.chain.remove_group(ctx, key).await;
            inner.activity.group_finished(&counters);
            return Err(ScanError::AlreadyStarted(key));
        }

        let span = info_span!(
            "scan_group",
            org_id = %key.org_id,
            group_id = %key.group_id,
            run_id = %run,
            trace_id = %ctx.trace_id
        );
        let task = tokio::spawn(
            run_group(
                Arc::clone(inner),
                ctx.child(),
                key,
                run,
                started_at,
                Arc::clone(&counters),
                cancel.clone(),
            )
            .instrument(span),
        );
        groups.insert(
            key,
            GroupHandle {
                run,
                cancel,
                counters,
                started_at,
                task: Some(task),
            },
        );
        // Announce while holding the map so the start precedes any
        // terminal event from the loop.
        let _ = inner.bus.send(DispatchEvent::GroupStarted {
            key,
            run_id: run,
            started_at,
            seeded,
        });
        drop(groups);

        info!(target: "scan::dispatch", %key, %run, seeded, "group loop started");
        Ok(())
    }

    /// Load the persisted address set, page by page, into the frontier.
    async fn seed_frontier(
        &self,
        ctx: &UserContext,
        key: GroupKey,
        started_at: DateTime<Utc>,
        counters: &GroupCounters,
    ) -> Result<usize> {
        let inner = &self.inner;
        let retry = &inner.config.retry;
        retry_with_backoff(retry, "store.clear_frontier", || {
            inner.store.clear_frontier(key)
        })
        .await?;

        let page_size = inner.config.dispatcher.seed_page_size.max(1);
        let mut filter = AddressFilter::for_group(key, page_size);
        filter.scanned_before = Some(started_at);

        let mut seeded = 0;
        loop {
            let page = retry_with_backoff(retry, "addresses.get", || {
                inner.addresses.get(ctx, &filter)
            })
            .await?;
            let short = page.len() < page_size;
            filter.after = page.last().map(|address| address.address_hash.clone());

            let queued = enqueue_new(inner, key, page).await?;
            inner.activity.add(counters, queued);
            seeded += queued;

            if short {
                break;
            }
        }
        debug!(target: "scan::dispatch", %key, seeded, "frontier seeded");
        Ok(seeded)
    }

    /// Cancel the group's loop. In-flight module calls are interrupted and
    /// buffered writes are still flushed.
    pub async fn stop(&self, ctx: &UserContext, group_id: GroupId) -> Result<()> {
        let key = ctx.group_key(group_id);
        match self.inner.groups.lock().await.get(&key) {
            Some(handle) => {
                info!(
                    target: "scan::dispatch",
                    %key,
                    run = %handle.run,
                    since = %handle.started_at,
                    "stop requested"
                );
                handle.cancel.cancel();
            }
            None => {
                debug!(target: "scan::dispatch", %key, "stop requested for idle group");
            }
        }
        Ok(())
    }

    /// Cancel every loop and wait for them to wind down.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let tasks: Vec<_> = self
            .inner
            .groups
            .lock()
            .await
            .values_mut()
            .filter_map(|handle| handle.task.take())
            .collect();
        info!(target: "scan::dispatch", groups = tasks.len(), "dispatcher shutting down");
        for task in tasks {
            if let Err(err) = task.await {
                warn!(target: "scan::dispatch", error = %err, "group task ended abnormally");
            }
        }
    }
}

#[async_trait]
impl<S> ScanDispatcher for Dispatcher<S>
where
    S: StateStore + 'static,
{
    async fn push_addresses(
        &self,
        ctx: &UserContext,
        group_id: GroupId,
        run: RunId,
    ) -> Result<()> {
        Dispatcher::push_addresses(self, ctx, group_id, run).await
    }

    async fn stop(&self, ctx: &UserContext, group_id: GroupId) -> Result<()> {
        Dispatcher::stop(self, ctx, group_id).await
    }

    async fn is_running(&self, key: GroupKey) -> bool {
        Dispatcher::is_running(self, key).await
    }

    fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        Dispatcher::subscribe(self)
    }
}

/// Check-and-set `addresses` against the seen set and queue the survivors.
/// Returns how many were newly queued.
async fn enqueue_new<S: StateStore>(
    inner: &DispatcherInner<S>,
    key: GroupKey,
    addresses: Vec<Address>,
) -> Result<usize> {
    if addresses.is_empty() {
        return Ok(0);
    }
    let retry = &inner.config.retry;
    let hashes: Vec<AddressHash> =
        addresses.iter().map(|a| a.address_hash.clone()).collect();
    let fresh: HashSet<AddressHash> =
        retry_with_backoff(retry, "store.filter_new", || {
            inner.store.filter_new(key, &hashes)
        })
        .await?
        .into_iter()
        .collect();
    let survivors: Vec<Address> = addresses
        .into_iter()
        .filter(|address| fresh.contains(&address.address_hash))
        .collect();
    if survivors.is_empty() {
        return Ok(0);
    }
    retry_with_backoff(retry, "store.push_addresses", || {
        inner.store.push_addresses(key, &survivors)
    })
    .await
}

/// Refresh the status heartbeat for `run` until `done` fires. Returns true
/// after cancelling the group's loop because the status is no longer held
/// by `run`.
async fn keep_alive<S: StateStore>(
    inner: Arc<DispatcherInner<S>>,
    key: GroupKey,
    run: RunId,
    group_cancel: CancellationToken,
    done: CancellationToken,
) -> bool {
    let period = inner.config.dispatcher.heartbeat_interval();
    let mut ticker =
        tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = done.cancelled() => return false,
            _ = ticker.tick() => {}
        }
        match inner.store.heartbeat(key, run).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(
                    target: "scan::dispatch",
                    %key,
                    %run,
                    "status no longer held by this run; stopping loop"
                );
                group_cancel.cancel();
                return true;
            }
            // The next tick retries; recovery only kicks in after the
            // whole stale window passes without one.
            Err(err) => {
                warn!(target: "scan::dispatch", %key, error = %err, "heartbeat failed");
            }
        }
    }
}

async fn run_group<S: StateStore + 'static>(
    inner: Arc<DispatcherInner<S>>,
    ctx: UserContext,
    key: GroupKey,
    run: RunId,
    started_at: DateTime<Utc>,
    counters: Arc<GroupCounters>,
    cancel: CancellationToken,
) {
    let batcher = Batcher::spawn(
        ctx.clone(),
        Arc::clone(&inner.addresses),
        inner.config.batcher.clone(),
        inner.config.retry,
    );
    let lease_done = CancellationToken::new();
    let lease = tokio::spawn(keep_alive(
        Arc::clone(&inner),
        key,
        run,
        cancel.clone(),
        lease_done.clone(),
    ));

    let exit = AssertUnwindSafe(discovery_loop(
        &inner, &ctx, key, &counters, &batcher, &cancel,
    ))
    .catch_unwind()
    .await
    .unwrap_or_else(|_| {
        LoopExit::Failed(ScanError::Internal("group loop panicked".into()))
    });
    lease_done.cancel();
    let lock_lost = lease.await.unwrap_or(false);

    if let Err(err) = batcher.done().await {
        warn!(target: "scan::dispatch", %key, error = %err, "batcher did not shut down cleanly");
    }
    let stats = batcher.stats();
    let processed = counters.snapshot().processed;

    let event = match exit {
        LoopExit::Quiescent => {
            finish_quiescent(&inner, &ctx, key, run, started_at, processed).await
        }
        LoopExit::Cancelled(reason) => {
            let reason = if lock_lost {
                "status lock lost".to_string()
            } else {
                reason
            };
            info!(target: "scan::dispatch", %key, %reason, processed, "group loop stopped");
            DispatchEvent::GroupStopped {
                key,
                run_id: run,
                reason,
            }
        }
        LoopExit::Failed(err) => {
            error!(target: "scan::dispatch", %key, error = %err, processed, "group loop failed");
            DispatchEvent::GroupFailed {
                key,
                run_id: run,
                error: err.to_string(),
            }
        }
    };
    debug!(
        target: "scan::dispatch",
        %key,
        flushes = stats.flushes,
        persisted = stats.persisted,
        dropped = stats.dropped,
        "batcher drained"
    );

    inner.chain.remove_group(&ctx, key).await;
    inner.activity.group_finished(&counters);
    inner.groups.lock().await.remove(&key);
    let _ = inner.bus.send(event);
}

async fn finish_quiescent<S: StateStore>(
    inner: &DispatcherInner<S>,
    ctx: &UserContext,
    key: GroupKey,
    run: RunId,
    started_at: DateTime<Utc>,
    processed: u64,
) -> DispatchEvent {
    let retry = &inner.config.retry;
    if let Err(err) = retry_with_backoff(retry, "store.clear_frontier", || {
        inner.store.clear_frontier(key)
    })
    .await
    {
        warn!(target: "scan::dispatch", %key, error = %err, "frontier not cleared");
    }
    if let Err(err) = retry_with_backoff(retry, "events.notify_complete", || {
        inner.events.notify_complete(ctx, started_at, key)
    })
    .await
    {
        return DispatchEvent::GroupFailed {
            key,
            run_id: run,
            error: format!("completion notification failed: {err}"),
        };
    }
    let finished_at = Utc::now();
    info!(
        target: "scan::dispatch",
        %key,
        processed,
        elapsed_ms = (finished_at - started_at).num_milliseconds(),
        "group reached quiescence"
    );
    DispatchEvent::GroupCompleted {
        key,
        run_id: run,
        started_at,
        finished_at,
        processed,
    }
}

async fn discovery_loop<S: StateStore + 'static>(
    inner: &DispatcherInner<S>,
    ctx: &UserContext,
    key: GroupKey,
    counters: &GroupCounters,
    batcher: &Batcher,
    cancel: &CancellationToken,
) -> LoopExit {
    let retry = &inner.config.retry;
    let pop_size = inner.config.dispatcher.pop_batch_size.max(1);
    let mut drift_seen = false;

    loop {
        if cancel.is_cancelled() {
            return LoopExit::Cancelled("stop requested".into());
        }

        let group = match inner.cache.get_group_by_ids(ctx, key).await {
            Ok(Some(snapshot)) => snapshot.group,
            Ok(None) => return LoopExit::Cancelled("group no longer exists".into()),
            Err(err) => return LoopExit::Failed(err),
        };
        if group.deleted {
            return LoopExit::Cancelled("group deleted".into());
        }
        if group.paused {
            return LoopExit::Cancelled("group paused".into());
        }

        let popped = match retry_with_backoff(retry, "store.pop_addresses", || {
            inner.store.pop_addresses(key, pop_size)
        })
        .await
        {
            Ok(popped) => popped,
            Err(err) => return LoopExit::Failed(err),
        };

        if popped.is_empty() {
            let queued = match retry_with_backoff(retry, "store.queue_len", || {
                inner.store.queue_len(key)
            })
            .await
            {
                Ok(queued) => queued,
                Err(err) => return LoopExit::Failed(err),
            };
            if queued == 0 && counters.active() == 0 {
                return LoopExit::Quiescent;
            }
            if queued == 0 && drift_seen {
                warn!(
                    target: "scan::dispatch",
                    %key,
                    active = counters.active(),
                    "queue drained but counter non-zero; resetting"
                );
                inner.activity.reset(counters);
                return LoopExit::Quiescent;
            }
            drift_seen = queued == 0;
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(inner.config.dispatcher.idle_poll()) => {}
            }
            continue;
        }
        drift_seen = false;

        if let Err(err) =
            process_batch(inner, ctx, key, &group, counters, batcher, cancel, popped)
                .await
        {
            return LoopExit::Failed(err);
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn process_batch<S: StateStore + 'static>(
    inner: &DispatcherInner<S>,
    ctx: &UserContext,
    key: GroupKey,
    group: &ScanGroup,
    counters: &GroupCounters,
    batcher: &Batcher,
    cancel: &CancellationToken,
    popped: Vec<Address>,
) -> Result<()> {
    let popped_count = popped.len();
    let chain = &inner.chain;
    let outcomes: Vec<ChainOutcome> = stream::iter(popped)
        .map(|address| chain.analyze(ctx, address, cancel))
        .buffer_unordered(inner.config.dispatcher.address_concurrency.max(1))
        .collect()
        .await;

    // First path to a hash wins provenance; any module asking for expansion
    // makes it expandable.
    let mut merged: HashMap<AddressHash, (Address, bool)> = HashMap::new();
    for outcome in &outcomes {
        for (hash, candidate) in &outcome.discovered {
            let expandable = !outcome.observed_only.contains(hash);
            merged
                .entry(hash.clone())
                .and_modify(|(_, flag)| *flag |= expandable)
                .or_insert_with(|| (candidate.clone(), expandable));
        }
    }
    // The analyzed addresses themselves are already in the graph.
    for outcome in &outcomes {
        merged.remove(&outcome.address.address_hash);
    }

    let now = Utc::now();
    let mut survivors = Vec::new();
    if !merged.is_empty() {
        let candidates: Vec<AddressHash> = merged.keys().cloned().collect();
        let fresh = retry_with_backoff(&inner.config.retry, "store.filter_new", || {
            inner.store.filter_new(key, &candidates)
        })
        .await?;
        for hash in fresh {
            if let Some((mut address, expandable)) = merged.remove(&hash) {
                address.mark_seen(now);
                survivors.push((address, expandable));
            }
        }
    }

    let policy = chain.policy();
    let to_queue: Vec<Address> = survivors
        .iter()
        .filter(|(address, expandable)| {
            *expandable && policy.should_expand(address, group)
        })
        .map(|(address, _)| address.clone())
        .collect();
    if !to_queue.is_empty() {
        let queued =
            retry_with_backoff(&inner.config.retry, "store.push_addresses", || {
                inner.store.push_addresses(key, &to_queue)
            })
            .await?;
        inner.activity.add(counters, queued);
    }
    if !survivors.is_empty() {
        debug!(
            target: "scan::dispatch",
            %key,
            discovered = survivors.len(),
            queued = to_queue.len(),
            "new addresses"
        );
    }

    for (address, _) in survivors {
        hand_off(batcher, address).await?;
    }
    for outcome in outcomes {
        let mut address = outcome.address;
        if outcome.interrupted {
            address.mark_seen(now);
        } else {
            address.mark_scanned(now);
        }
        hand_off(batcher, address).await?;
    }

    inner.activity.complete(counters, popped_count);
    Ok(())
}

/// Try the non-blocking path first; a full buffer means wait for the drain
/// loop, which throttles this group's popping.
async fn hand_off(batcher: &Batcher, address: Address) -> Result<()> {
    match batcher.try_add(address.clone()) {
        Err(ScanError::BatcherFull) => {
            debug!(target: "scan::batcher", "buffer full; applying backpressure");
            batcher.add(address).await
        }
        other => other,
    }
}
