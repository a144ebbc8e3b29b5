//! Cluster-level control loop.
//!
//! The coordinator owns the group status lock. Starting a group is gated by
//! an atomic Stopped -> Started transition in the shared store, so exactly
//! one instance wins a concurrent start. The winner's [`RunId`] travels with
//! the loop; the status goes back to Stopped on that run's terminal event
//! and on any failure after the transition, and never on behalf of another
//! run.

use std::{collections::BTreeSet, fmt, sync::Arc};

use chrono::Utc;
use perimeter_model::{GroupId, GroupKey, RunId, UserContext, UserId};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{dispatcher::ScanDispatcher, events::DispatchEvent};
use crate::{
    config::{CoordinatorConfig, RetryConfig},
    error::{Result, ScanError},
    retry::retry_with_backoff,
    services::{GroupFilter, ScanGroupService},
    store::StateStore,
};

/// Result of a start request that did not fail outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyStarted,
    Paused,
    Deleted,
}

/// Tally of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub started: Vec<GroupKey>,
    pub already_started: usize,
    /// Started groups whose run stopped heartbeating, reset and restarted.
    pub recovered: Vec<GroupKey>,
    pub skipped: usize,
    pub failed: Vec<GroupKey>,
}

pub struct Coordinator<S> {
    store: Arc<S>,
    groups: Arc<dyn ScanGroupService>,
    dispatcher: Arc<dyn ScanDispatcher>,
    config: CoordinatorConfig,
    retry: RetryConfig,
    system_user: UserId,
}

impl<S> fmt::Debug for Coordinator<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coordinator")
            .field("store", &std::any::type_name::<S>())
            .field("config", &self.config)
            .field("system_user", &self.system_user)
            .finish()
    }
}

impl<S> Coordinator<S>
where
    S: StateStore + 'static,
{
    pub fn new(
        store: Arc<S>,
        groups: Arc<dyn ScanGroupService>,
        dispatcher: Arc<dyn ScanDispatcher>,
        config: CoordinatorConfig,
        retry: RetryConfig,
        system_user: UserId,
    ) -> Self {
        Self {
            store,
            groups,
            dispatcher,
            config,
            retry,
            system_user,
        }
    }

    /// Start a scan of `group_id` on behalf of `ctx`.
    ///
    /// Domain refusals (already running, paused, deleted) come back as an
    /// outcome. Infrastructure failures and authorization problems are
    /// errors, and leave the status lock released.
    pub async fn start_group(
        &self,
        ctx: &UserContext,
        group_id: GroupId,
    ) -> Result<StartOutcome> {
        let key = ctx.group_key(group_id);
        let status = retry_with_backoff(&self.retry, "store.group_status", || {
            self.store.group_status(key)
        })
        .await?;
        if status.is_some_and(|record| record.is_started()) {
            debug!(target: "scan::coordinator", %key, "already started");
            return Ok(StartOutcome::AlreadyStarted);
        }

        let group = retry_with_backoff(&self.retry, "groups.get", || {
            self.groups.get(ctx, group_id)
        })
        .await?
        .ok_or(ScanError::GroupNotFound(key))?;
        if group.key() != key {
            warn!(
                target: "scan::coordinator",
                %key,
                owner = %group.key(),
                caller = %ctx.org_id,
                "group does not belong to caller's organization"
            );
            return Err(ScanError::OrgMismatch {
                key: group.key(),
                caller: ctx.org_id,
            });
        }
        if group.deleted {
            return Ok(StartOutcome::Deleted);
        }
        if group.paused {
            return Ok(StartOutcome::Paused);
        }

        // Make sure workers see the authoritative configuration before any
        // address for this run is queued.
        let stored = retry_with_backoff(&self.retry, "store.get_group", || {
            self.store.get_group(key)
        })
        .await?;
        match stored {
            Some(stored) if stored.is_stale_against(&group) => {
                info!(
                    target: "scan::coordinator",
                    %key,
                    stored = %stored.modified_time,
                    authoritative = %group.modified_time,
                    "replacing stale stored configuration"
                );
                retry_with_backoff(&self.retry, "store.delete_group", || {
                    self.store.delete_group(key)
                })
                .await?;
                retry_with_backoff(&self.retry, "store.put_group", || {
                    self.store.put_group(&group)
                })
                .await?;
            }
            Some(_) => {}
            None => {
                retry_with_backoff(&self.retry, "store.put_group", || {
                    self.store.put_group(&group)
                })
                .await?;
            }
        }

        let acquired = retry_with_backoff(&self.retry, "store.try_start", || {
            self.store.try_start(key)
        })
        .await?;
        let Some(run) = acquired else {
            debug!(target: "scan::coordinator", %key, "lost start race");
            return Ok(StartOutcome::AlreadyStarted);
        };

        match self.dispatcher.push_addresses(ctx, group_id, run).await {
            Ok(()) => {
                info!(target: "scan::coordinator", %key, %run, "group started");
                Ok(StartOutcome::Started)
            }
            // An earlier loop is still winding down here. It no longer holds
            // the status, so hand the lock back and let it finish.
            Err(ScanError::AlreadyStarted(_)) => {
                self.release(key, run).await;
                Ok(StartOutcome::AlreadyStarted)
            }
            Err(err) => {
                error!(target: "scan::coordinator", %key, error = %err, "dispatch failed; releasing status");
                self.release(key, run).await;
                Err(err)
            }
        }
    }

    pub async fn stop_group(
        &self,
        ctx: &UserContext,
        group_id: GroupId,
    ) -> Result<()> {
        let key = ctx.group_key(group_id);
        self.dispatcher.stop(ctx, group_id).await?;
        retry_with_backoff(&self.retry, "store.stop", || self.store.stop(key))
            .await?;
        info!(target: "scan::coordinator", %key, "group stopped");
        Ok(())
    }

    /// One pass over every runnable group. Started statuses whose run has
    /// not sent a heartbeat within the stale window are reset and retried.
    pub async fn reconcile_once(&self) -> Result<ReconcileReport> {
        let system = UserContext::new(Default::default(), self.system_user);
        let filter = GroupFilter::default();
        let groups = retry_with_backoff(&self.retry, "groups.all_groups", || {
            self.groups.all_groups(&system, &filter)
        })
        .await?;

        let mut report = ReconcileReport::default();
        let orgs: BTreeSet<_> = groups.iter().map(|g| g.org_id).collect();
        debug!(target: "scan::coordinator", groups = groups.len(), orgs = orgs.len(), "reconciling");

        for group in groups {
            let key = group.key();
            if !group.is_runnable() {
                report.skipped += 1;
                continue;
            }
            let ctx = UserContext::new(group.org_id, self.system_user);
            match self.start_group(&ctx, group.group_id).await {
                Ok(StartOutcome::Started) => report.started.push(key),
                Ok(StartOutcome::AlreadyStarted) => {
                    if self.recover_orphan(&ctx, key).await {
                        report.recovered.push(key);
                    } else {
                        report.already_started += 1;
                    }
                }
                Ok(StartOutcome::Paused | StartOutcome::Deleted) => {
                    report.skipped += 1;
                }
                Err(err) => {
                    warn!(target: "scan::coordinator", %key, error = %err, "start failed during reconcile");
                    report.failed.push(key);
                }
            }
        }

        info!(
            target: "scan::coordinator",
            started = report.started.len(),
            already_started = report.already_started,
            recovered = report.recovered.len(),
            skipped = report.skipped,
            failed = report.failed.len(),
            "reconcile pass finished"
        );
        Ok(report)
    }

    /// Reset a Started status whose run stopped heartbeating and start the
    /// group again. Returns true when the group was restarted here.
    async fn recover_orphan(&self, ctx: &UserContext, key: GroupKey) -> bool {
        if self.config.stale_started_secs < 0
            || self.dispatcher.is_running(key).await
        {
            return false;
        }
        let record = match self.store.group_status(key).await {
            Ok(Some(record)) if record.is_started() => record,
            _ => return false,
        };
        let silent = record.heartbeat_age(Utc::now());
        if silent < self.config.stale_started() {
            return false;
        }
        warn!(
            target: "scan::coordinator",
            %key,
            run = ?record.run_id,
            silent_secs = silent.num_seconds(),
            "run stopped heartbeating; recovering"
        );
        match record.run_id {
            Some(run) => {
                if !self.release(key, run).await {
                    return false;
                }
            }
            // Written before run ids existed; nothing to compare against.
            None => {
                if let Err(err) = retry_with_backoff(&self.retry, "store.stop", || {
                    self.store.stop(key)
                })
                .await
                {
                    error!(target: "scan::coordinator", %key, error = %err, "failed to reset group status");
                    return false;
                }
            }
        }
        matches!(
            self.start_group(ctx, key.group_id).await,
            Ok(StartOutcome::Started)
        )
    }

    /// Set Stopped if `run` still holds the status. Returns whether it did.
    async fn release(&self, key: GroupKey, run: RunId) -> bool {
        match retry_with_backoff(&self.retry, "store.release", || {
            self.store.release(key, run)
        })
        .await
        {
            Ok(true) => true,
            Ok(false) => {
                debug!(target: "scan::coordinator", %key, %run, "status held by another run; left alone");
                false
            }
            Err(err) => {
                error!(target: "scan::coordinator", %key, %run, error = %err, "failed to reset group status");
                false
            }
        }
    }

    /// Reset the status lock whenever a group's loop ends.
    async fn on_dispatch_event(&self, event: &DispatchEvent) {
        if !event.is_terminal() {
            return;
        }
        let key = event.key();
        debug!(target: "scan::coordinator", %key, ?event, "loop ended; releasing status");
        self.release(key, event.run_id()).await;
    }

    /// Run the event listener and the periodic reconcile until `cancel`
    /// fires. The first reconcile pass runs one poll interval after start.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut events = self.dispatcher.subscribe();
        let period = self.config.poll_interval();
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            target: "scan::coordinator",
            poll_ms = self.config.poll_interval_ms,
            "coordinator running"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = events.recv() => match received {
                    Ok(event) => self.on_dispatch_event(&event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(target: "scan::coordinator", skipped, "dispatch events lagged");
                    }
                    Err(RecvError::Closed) => {
                        warn!(target: "scan::coordinator", "dispatch event bus closed");
                        break;
                    }
                },
                _ = ticker.tick() => {
                    if let Err(err) = self.reconcile_once().await {
                        error!(target: "scan::coordinator", error = %err, "reconcile pass failed");
                    }
                }
            }
        }
        info!(target: "scan::coordinator", "coordinator stopped");
    }
}
