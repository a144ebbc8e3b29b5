use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::Arc,
    time::Duration,
};

use perimeter_model::{Address, AddressHash, GroupKey, ScanGroup, UserContext};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Analyzer, ConfidencePolicy, DecayConfidence, GroupRateLimits};
use crate::config::AnalyzerLimits;

/// Merged result of every module pass over one address.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainOutcome {
    /// The address after the last module ran.
    pub address: Address,
    /// Candidates from all modules, scored; the first module to report a
    /// hash wins.
    pub discovered: HashMap<AddressHash, Address>,
    /// Discovered hashes no module asked to expand.
    pub observed_only: HashSet<AddressHash>,
    /// Modules that errored or timed out on this address.
    pub failed: Vec<&'static str>,
    /// Cancellation cut the pass short.
    pub interrupted: bool,
}

/// Runs the registered analyzers in their fixed pass order.
pub struct AnalyzerChain {
    analyzers: Vec<Arc<dyn Analyzer>>,
    policy: Arc<dyn ConfidencePolicy>,
    limits: GroupRateLimits,
    call_timeout: Duration,
}

impl fmt::Debug for AnalyzerChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<_> = self.analyzers.iter().map(|a| a.name()).collect();
        f.debug_struct("AnalyzerChain")
            .field("analyzers", &names)
            .field("policy", &self.policy)
            .field("call_timeout", &self.call_timeout)
            .finish()
    }
}

impl AnalyzerChain {
    pub fn new(
        analyzers: Vec<Arc<dyn Analyzer>>,
        limits: AnalyzerLimits,
    ) -> Self {
        Self::with_policy(analyzers, limits, Arc::new(DecayConfidence::new()))
    }

    pub fn with_policy(
        mut analyzers: Vec<Arc<dyn Analyzer>>,
        limits: AnalyzerLimits,
        policy: Arc<dyn ConfidencePolicy>,
    ) -> Self {
        // Stable: analyzers of the same kind keep registration order.
        analyzers.sort_by_key(|analyzer| analyzer.kind());
        Self {
            analyzers,
            policy,
            limits: GroupRateLimits::new(limits.burst),
            call_timeout: limits.call_timeout(),
        }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.analyzers.iter().map(|a| a.name()).collect()
    }

    pub fn policy(&self) -> &dyn ConfidencePolicy {
        self.policy.as_ref()
    }

    pub fn rate_limits(&self) -> &GroupRateLimits {
        &self.limits
    }

    /// Prime every module and the rate buckets for `group`. A module hook
    /// failure is logged and does not prevent the others from priming.
    pub async fn add_group(&self, ctx: &UserContext, group: &ScanGroup) {
        self.limits.configure(group).await;
        for analyzer in &self.analyzers {
            if let Err(err) = analyzer.add_group(ctx, group).await {
                warn!(
                    target: "scan::dispatch",
                    key = %group.key(),
                    analyzer = analyzer.name(),
                    error = %err,
                    "add_group hook failed"
                );
            }
        }
    }

    pub async fn remove_group(&self, ctx: &UserContext, key: GroupKey) {
        for analyzer in &self.analyzers {
            if let Err(err) = analyzer.remove_group(ctx, key).await {
                warn!(
                    target: "scan::dispatch",
                    %key,
                    analyzer = analyzer.name(),
                    error = %err,
                    "remove_group hook failed"
                );
            }
        }
        self.limits.remove(key).await;
    }

    /// Pass `address` through every module in order. Failures are isolated
    /// per module; the address carries forward whatever the last successful
    /// module returned.
    pub async fn analyze(
        &self,
        ctx: &UserContext,
        address: Address,
        cancel: &CancellationToken,
    ) -> ChainOutcome {
        let key = address.group_key();
        let mut current = address;
        let mut discovered: HashMap<AddressHash, Address> = HashMap::new();
        let mut expandable: HashSet<AddressHash> = HashSet::new();
        let mut failed = Vec::new();
        let mut interrupted = false;

        for analyzer in &self.analyzers {
            let name = analyzer.name();
            let call = async {
                self.limits.acquire(key, analyzer.kind()).await;
                timeout(self.call_timeout, analyzer.analyze(ctx, current.clone()))
                    .await
            };
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    interrupted = true;
                    break;
                }
                result = call => result,
            };

            let analysis = match result {
                Ok(Ok(analysis)) => analysis,
                Ok(Err(err)) => {
                    warn!(
                        target: "scan::dispatch",
                        hash = %current.address_hash,
                        analyzer = name,
                        error = %err,
                        "analyzer failed; address terminal for module"
                    );
                    failed.push(name);
                    continue;
                }
                Err(_) => {
                    warn!(
                        target: "scan::dispatch",
                        hash = %current.address_hash,
                        analyzer = name,
                        timeout_ms = self.call_timeout.as_millis() as u64,
                        "analyzer timed out; address terminal for module"
                    );
                    failed.push(name);
                    continue;
                }
            };

            let mut updated = analysis.address;
            if updated.address_hash != current.address_hash {
                warn!(
                    target: "scan::dispatch",
                    analyzer = name,
                    expected = %current.address_hash,
                    got = %updated.address_hash,
                    "analyzer changed address identity; keeping original hash"
                );
                updated.address_hash = current.address_hash.clone();
            }
            current = updated;

            let found = analysis.discovered.len();
            for (hash, mut candidate) in analysis.discovered {
                if hash == current.address_hash
                    || candidate.group_key() != key
                {
                    continue;
                }
                if !analysis.observed_only.contains(&hash) {
                    expandable.insert(hash.clone());
                }
                if discovered.contains_key(&hash) {
                    continue;
                }
                let ceiling = self.policy.score(&current, candidate.discovered_by);
                candidate.confidence_score =
                    candidate.confidence_score.min(ceiling);
                candidate.found_from = Some(current.address_hash.clone());
                discovered.insert(hash, candidate);
            }
            if found > 0 {
                debug!(
                    target: "scan::dispatch",
                    hash = %current.address_hash,
                    analyzer = name,
                    found,
                    "module pass produced candidates"
                );
            }
        }

        let observed_only = discovered
            .keys()
            .filter(|hash| !expandable.contains(*hash))
            .cloned()
            .collect();

        ChainOutcome {
            address: current,
            discovered,
            observed_only,
            failed,
            interrupted,
        }
    }
}
