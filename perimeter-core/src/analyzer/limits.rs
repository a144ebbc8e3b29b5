use std::{
    collections::HashMap, fmt, num::NonZeroU32, sync::Arc,
};

use governor::{
    Quota, RateLimiter,
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
};
use perimeter_model::{GroupKey, ScanGroup};
use tokio::sync::RwLock;
use tracing::debug;

use super::AnalyzerKind;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Token buckets per (group, module), built from each group's module
/// configuration. Modules without a bucket run unthrottled.
pub struct GroupRateLimits {
    limiters: RwLock<HashMap<(GroupKey, AnalyzerKind), Arc<DirectLimiter>>>,
    burst: NonZeroU32,
}

impl fmt::Debug for GroupRateLimits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let buckets = self.limiters.try_read().map(|map| map.len()).ok();
        f.debug_struct("GroupRateLimits")
            .field("buckets", &buckets)
            .field("burst", &self.burst)
            .finish()
    }
}

impl GroupRateLimits {
    pub fn new(burst: u32) -> Self {
        Self {
            limiters: RwLock::new(HashMap::new()),
            burst: NonZeroU32::new(burst).unwrap_or(NonZeroU32::MIN),
        }
    }

    /// (Re)build the buckets for `group` from its module configuration.
    pub async fn configure(&self, group: &ScanGroup) {
        let key = group.key();
        let mut limiters = self.limiters.write().await;
        for kind in AnalyzerKind::PASS_ORDER {
            match NonZeroU32::new(kind.requests_per_second(&group.modules)) {
                Some(rps) => {
                    let quota = Quota::per_second(rps).allow_burst(self.burst);
                    limiters
                        .insert((key, kind), Arc::new(RateLimiter::direct(quota)));
                    debug!(target: "scan::dispatch", %key, analyzer = %kind, rps = rps.get(), "rate limit configured");
                }
                None => {
                    limiters.remove(&(key, kind));
                }
            }
        }
    }

    pub async fn remove(&self, key: GroupKey) {
        self.limiters
            .write()
            .await
            .retain(|(group, _), _| *group != key);
    }

    /// Wait until the bucket for (group, module) admits one call.
    pub async fn acquire(&self, key: GroupKey, kind: AnalyzerKind) {
        let limiter = self.limiters.read().await.get(&(key, kind)).cloned();
        if let Some(limiter) = limiter {
            limiter.until_ready().await;
        }
    }

    pub async fn is_limited(&self, key: GroupKey, kind: AnalyzerKind) -> bool {
        self.limiters.read().await.contains_key(&(key, kind))
    }
}
