//! Shared harness for pipeline integration tests.
#![allow(dead_code)]

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use perimeter_core::{
    analyzer::{Analysis, Analyzer, AnalyzerChain, AnalyzerKind},
    cache::GroupConfigCache,
    config::{AnalyzerLimits, PipelineConfig, RetryConfig},
    error::{Result, ScanError},
    model::{
        Address, DiscoveryMethod, GroupKey, GroupStatus, OrgId, ScanGroup,
        UserContext, UserId,
    },
    pipeline::{Coordinator, DispatchEvent, Dispatcher},
    services::{
        MemoryAddressService, MemoryScanGroupService, RecordingEventService,
    },
    store::{GroupStateStore, MemoryStateStore},
};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

pub const WAIT: Duration = Duration::from_secs(10);

pub fn ctx(org: i32) -> UserContext {
    UserContext::new(OrgId(org), UserId(1))
}

/// Collaborators shared by every pipeline instance in a test.
#[derive(Clone)]
pub struct Shared {
    pub store: Arc<MemoryStateStore>,
    pub addresses: Arc<MemoryAddressService>,
    pub groups: Arc<MemoryScanGroupService>,
    pub events: RecordingEventService,
}

impl Shared {
    pub fn new() -> Self {
        Self {
            store: Arc::new(MemoryStateStore::new()),
            addresses: Arc::new(MemoryAddressService::new()),
            groups: Arc::new(MemoryScanGroupService::new()),
            events: RecordingEventService::new(),
        }
    }

    /// Register a group with throttling disabled.
    pub async fn add_group(&self, key: GroupKey) -> ScanGroup {
        let mut group = ScanGroup::new(key, format!("group-{key}"), UserId(1));
        group.modules.ns.requests_per_second = 0;
        group.modules.brute.requests_per_second = 0;
        group.modules.web.requests_per_second = 0;
        group.modules.port.requests_per_second = 0;
        self.groups.upsert(group.clone()).await;
        group
    }

    pub async fn seed_hosts(&self, key: GroupKey, hosts: &[&str]) {
        self.addresses
            .seed(hosts.iter().map(|host| {
                Address::new(key, "", *host, DiscoveryMethod::InputList)
            }))
            .await;
    }

    pub async fn status(&self, key: GroupKey) -> Option<GroupStatus> {
        self.store
            .group_status(key)
            .await
            .unwrap()
            .map(|record| record.status)
    }

    /// Poll until the status lock reaches `expected`.
    pub async fn wait_for_status(&self, key: GroupKey, expected: GroupStatus) {
        tokio::time::timeout(WAIT, async {
            while self.status(key).await != Some(expected) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("{key} never reached {expected}"));
    }
}

pub fn test_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.dispatcher.idle_poll_ms = 10;
    config.dispatcher.pop_batch_size = 16;
    config.dispatcher.heartbeat_interval_ms = 50;
    config.batcher.flush_interval_ms = 20;
    config.coordinator.poll_interval_ms = 60_000;
    config.retry = RetryConfig {
        max_attempts: 3,
        backoff_base_ms: 1,
        backoff_max_ms: 5,
        jitter_ratio: 0.0,
    };
    config.analyzers = AnalyzerLimits {
        call_timeout_ms: 2_000,
        burst: 1,
    };
    config
}

/// One pipeline instance: cache, dispatcher and a running coordinator.
pub struct Instance {
    pub shared: Shared,
    pub cache: Arc<GroupConfigCache<MemoryStateStore>>,
    pub dispatcher: Dispatcher<MemoryStateStore>,
    pub coordinator: Arc<Coordinator<MemoryStateStore>>,
    cancel: CancellationToken,
}

impl Instance {
    pub async fn start(
        shared: &Shared,
        analyzers: Vec<Arc<dyn Analyzer>>,
    ) -> Self {
        Self::start_with(shared, analyzers, test_config()).await
    }

    pub async fn start_with(
        shared: &Shared,
        analyzers: Vec<Arc<dyn Analyzer>>,
        config: PipelineConfig,
    ) -> Self {
        let cancel = CancellationToken::new();
        let cache = Arc::new(GroupConfigCache::new(
            Arc::clone(&shared.store),
            shared.groups.clone(),
            config.cache.clone(),
            config.retry,
        ));
        cache
            .spawn_subscriber(cancel.child_token())
            .await
            .expect("subscriber starts");

        let chain = Arc::new(AnalyzerChain::new(analyzers, config.analyzers));
        let dispatcher = Dispatcher::new(
            Arc::clone(&shared.store),
            Arc::clone(&cache),
            shared.addresses.clone(),
            Arc::new(shared.events.clone()),
            chain,
            config.clone(),
        );
        let coordinator = Arc::new(Coordinator::new(
            Arc::clone(&shared.store),
            shared.groups.clone(),
            Arc::new(dispatcher.clone()),
            config.coordinator.clone(),
            config.retry,
            UserId(0),
        ));
        tokio::spawn(Arc::clone(&coordinator).run(cancel.child_token()));

        Self {
            shared: shared.clone(),
            cache,
            dispatcher,
            coordinator,
            cancel,
        }
    }

    pub async fn shutdown(&self) {
        self.dispatcher.shutdown().await;
        self.cancel.cancel();
    }
}

/// Wait for the next terminal event for `key`.
pub async fn wait_terminal(
    rx: &mut broadcast::Receiver<DispatchEvent>,
    key: GroupKey,
) -> DispatchEvent {
    tokio::time::timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(event) if event.is_terminal() && event.key() == key => {
                    return event;
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(err) => panic!("dispatch bus closed: {err}"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no terminal event for {key}"))
}

/// DNS-style resolver: reports the resolved (ip, host) pair of a bare
/// hostname as a new address.
pub struct Resolver {
    pub table: HashMap<&'static str, &'static str>,
}

impl Resolver {
    pub fn new(entries: &[(&'static str, &'static str)]) -> Arc<dyn Analyzer> {
        Arc::new(Self {
            table: entries.iter().copied().collect(),
        })
    }
}

#[async_trait]
impl Analyzer for Resolver {
    fn name(&self) -> &'static str {
        "resolver"
    }

    fn kind(&self) -> AnalyzerKind {
        AnalyzerKind::Ns
    }

    async fn analyze(
        &self,
        _ctx: &UserContext,
        address: Address,
    ) -> Result<Analysis> {
        let ip = address
            .ip_address
            .is_empty()
            .then(|| self.table.get(address.host_address.as_str()))
            .flatten()
            .copied();
        let mut analysis = Analysis::unchanged(address.clone());
        if let Some(ip) = ip {
            analysis.discover(Address::derive(
                &address,
                ip,
                address.host_address.clone(),
                DiscoveryMethod::NsQueryNameToIp,
                Address::MAX_CONFIDENCE,
            ));
        }
        Ok(analysis)
    }
}

/// Static host graph: every host links to the hosts listed for it.
pub struct Linker {
    pub edges: HashMap<&'static str, Vec<&'static str>>,
    pub method: DiscoveryMethod,
}

impl Linker {
    /// `edges` lists (parent, child) host pairs.
    pub fn new(
        method: DiscoveryMethod,
        edges: &[(&'static str, &'static str)],
    ) -> Arc<dyn Analyzer> {
        let mut graph: HashMap<&'static str, Vec<&'static str>> =
            HashMap::new();
        for (parent, child) in edges {
            graph.entry(*parent).or_default().push(*child);
        }
        Arc::new(Self {
            edges: graph,
            method,
        })
    }
}

#[async_trait]
impl Analyzer for Linker {
    fn name(&self) -> &'static str {
        "linker"
    }

    fn kind(&self) -> AnalyzerKind {
        AnalyzerKind::Web
    }

    async fn analyze(
        &self,
        _ctx: &UserContext,
        address: Address,
    ) -> Result<Analysis> {
        let children: Vec<Address> = self
            .edges
            .get(address.host_address.as_str())
            .into_iter()
            .flatten()
            .map(|child| {
                Address::derive(
                    &address,
                    "",
                    *child,
                    self.method,
                    Address::MAX_CONFIDENCE,
                )
            })
            .collect();
        let mut analysis = Analysis::unchanged(address);
        for child in children {
            analysis.discover(child);
        }
        Ok(analysis)
    }
}

/// Zone walker: fills in the IP of a known host on the address itself and
/// reports the zone's other names as new addresses.
pub struct ZoneWalker {
    pub zones: HashMap<&'static str, (&'static str, Vec<&'static str>)>,
}

impl ZoneWalker {
    /// `zones` lists (host, ip, names found in the zone).
    pub fn new(
        zones: &[(&'static str, &'static str, &[&'static str])],
    ) -> Arc<dyn Analyzer> {
        Arc::new(Self {
            zones: zones
                .iter()
                .map(|(host, ip, names)| (*host, (*ip, names.to_vec())))
                .collect(),
        })
    }
}

#[async_trait]
impl Analyzer for ZoneWalker {
    fn name(&self) -> &'static str {
        "zone_walker"
    }

    fn kind(&self) -> AnalyzerKind {
        AnalyzerKind::Ns
    }

    async fn analyze(
        &self,
        _ctx: &UserContext,
        mut address: Address,
    ) -> Result<Analysis> {
        let Some((ip, names)) = self.zones.get(address.host_address.as_str())
        else {
            return Ok(Analysis::unchanged(address));
        };
        if address.ip_address.is_empty() {
            address.ip_address = ip.to_string();
        }
        let found: Vec<Address> = names
            .iter()
            .map(|name| {
                Address::derive(
                    &address,
                    "",
                    *name,
                    DiscoveryMethod::NsAxfr,
                    Address::MAX_CONFIDENCE,
                )
            })
            .collect();
        let mut analysis = Analysis::unchanged(address);
        for name in found {
            analysis.discover(name);
        }
        Ok(analysis)
    }
}

/// Always fails.
pub struct Broken;

#[async_trait]
impl Analyzer for Broken {
    fn name(&self) -> &'static str {
        "broken"
    }

    fn kind(&self) -> AnalyzerKind {
        AnalyzerKind::Brute
    }

    async fn analyze(
        &self,
        _ctx: &UserContext,
        _address: Address,
    ) -> Result<Analysis> {
        Err(ScanError::analyzer("broken", "resolver unreachable"))
    }
}

/// Holds every call for `delay`.
pub struct Sluggish {
    pub delay: Duration,
}

#[async_trait]
impl Analyzer for Sluggish {
    fn name(&self) -> &'static str {
        "sluggish"
    }

    fn kind(&self) -> AnalyzerKind {
        AnalyzerKind::Port
    }

    async fn analyze(
        &self,
        _ctx: &UserContext,
        address: Address,
    ) -> Result<Analysis> {
        tokio::time::sleep(self.delay).await;
        Ok(Analysis::unchanged(address))
    }
}

pub fn broken() -> Arc<dyn Analyzer> {
    Arc::new(Broken)
}

pub fn sluggish(delay: Duration) -> Arc<dyn Analyzer> {
    Arc::new(Sluggish { delay })
}
