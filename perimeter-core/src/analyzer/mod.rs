//! Discovery module contract.
//!
//! Each module (DNS, certificate transparency, brute force, web crawl,
//! port scan) implements [`Analyzer`]. The dispatcher never talks to a
//! module directly; it goes through an [`AnalyzerChain`], which fixes the
//! pass order, applies rate limits and timeouts, and scores discoveries.

use std::{
    collections::{HashMap, HashSet},
    fmt,
};

use async_trait::async_trait;
use perimeter_model::{
    Address, AddressHash, GroupKey, ModuleConfigurations, ScanGroup,
    UserContext,
};

use crate::error::Result;

mod chain;
mod confidence;
mod limits;

pub use chain::{AnalyzerChain, ChainOutcome};
pub use confidence::{ConfidencePolicy, DecayConfidence};
pub use limits::GroupRateLimits;

/// Module families. The declaration order is the pass order within one
/// address: later modules see the mutations of earlier ones.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord,
    serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum AnalyzerKind {
    Ns,
    BigData,
    Brute,
    Web,
    Port,
}

impl AnalyzerKind {
    pub const PASS_ORDER: [AnalyzerKind; 5] = [
        AnalyzerKind::Ns,
        AnalyzerKind::BigData,
        AnalyzerKind::Brute,
        AnalyzerKind::Web,
        AnalyzerKind::Port,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AnalyzerKind::Ns => "ns",
            AnalyzerKind::BigData => "bigdata",
            AnalyzerKind::Brute => "brute",
            AnalyzerKind::Web => "web",
            AnalyzerKind::Port => "port",
        }
    }

    /// Configured request rate for this module. Zero means unthrottled;
    /// certificate-transparency lookups are throttled through store gates
    /// instead of a local bucket.
    pub fn requests_per_second(&self, modules: &ModuleConfigurations) -> u32 {
        match self {
            AnalyzerKind::Ns => modules.ns.requests_per_second,
            AnalyzerKind::BigData => 0,
            AnalyzerKind::Brute => modules.brute.requests_per_second,
            AnalyzerKind::Web => modules.web.requests_per_second,
            AnalyzerKind::Port => modules.port.requests_per_second,
        }
    }
}

impl fmt::Display for AnalyzerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one module pass over one address.
#[derive(Debug, Clone, PartialEq)]
pub struct Analysis {
    /// The analyzed address, possibly mutated (e.g. a resolved IP). Its
    /// hash must not change.
    pub address: Address,
    /// New candidates keyed by hash. Empty, never absent, when nothing was
    /// found.
    pub discovered: HashMap<AddressHash, Address>,
    /// Discovered hashes to persist but not expand further.
    pub observed_only: HashSet<AddressHash>,
}

impl Analysis {
    pub fn unchanged(address: Address) -> Self {
        Self {
            address,
            discovered: HashMap::new(),
            observed_only: HashSet::new(),
        }
    }

    /// Record a candidate that downstream modules should expand.
    pub fn discover(&mut self, address: Address) {
        self.discovered
            .insert(address.address_hash.clone(), address);
    }

    /// Record a candidate that is persisted but never expanded.
    pub fn observe(&mut self, address: Address) {
        self.observed_only.insert(address.address_hash.clone());
        self.discovered
            .insert(address.address_hash.clone(), address);
    }

    pub fn is_empty(&self) -> bool {
        self.discovered.is_empty()
    }
}

#[async_trait]
pub trait Analyzer: Send + Sync {
    fn name(&self) -> &'static str;

    fn kind(&self) -> AnalyzerKind;

    /// Analyze one address. Must not panic on malformed input.
    async fn analyze(
        &self,
        ctx: &UserContext,
        address: Address,
    ) -> Result<Analysis>;

    /// Called once before a group's address stream begins.
    async fn add_group(
        &self,
        _ctx: &UserContext,
        _group: &ScanGroup,
    ) -> Result<()> {
        Ok(())
    }

    /// Called once after a group's address stream ends.
    async fn remove_group(
        &self,
        _ctx: &UserContext,
        _key: GroupKey,
    ) -> Result<()> {
        Ok(())
    }
}
