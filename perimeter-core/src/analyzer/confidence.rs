use std::{collections::HashMap, fmt};

use perimeter_model::{Address, DiscoveryMethod, ScanGroup};

/// Scores derived addresses and decides whether they are worth expanding.
pub trait ConfidencePolicy: Send + Sync + fmt::Debug {
    /// Confidence of an address found from `parent` by `method`.
    fn score(&self, parent: &Address, method: DiscoveryMethod) -> f32;

    fn should_expand(&self, address: &Address, group: &ScanGroup) -> bool {
        address.effective_confidence() >= group.expand_confidence_floor
    }
}

/// Multiplicative decay: each hop multiplies the parent's effective score
/// by a per-method factor.
#[derive(Debug, Clone, Default)]
pub struct DecayConfidence {
    overrides: HashMap<DiscoveryMethod, f32>,
}

impl DecayConfidence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_factor(mut self, method: DiscoveryMethod, factor: f32) -> Self {
        self.overrides.insert(method, factor.clamp(0.0, 1.0));
        self
    }

    pub fn factor(&self, method: DiscoveryMethod) -> f32 {
        if let Some(factor) = self.overrides.get(&method) {
            return *factor;
        }
        match method {
            DiscoveryMethod::InputList
            | DiscoveryMethod::NsQueryNameToIp
            | DiscoveryMethod::NsAxfr
            | DiscoveryMethod::NsSecWalk
            | DiscoveryMethod::PortScan => 1.0,
            DiscoveryMethod::BigDataCt | DiscoveryMethod::BruteForce => 0.9,
            DiscoveryMethod::NsQueryIpToName | DiscoveryMethod::WebCrawl => {
                0.75
            }
            DiscoveryMethod::Other => 0.5,
        }
    }
}

impl ConfidencePolicy for DecayConfidence {
    fn score(&self, parent: &Address, method: DiscoveryMethod) -> f32 {
        (parent.effective_confidence() * self.factor(method))
            .clamp(0.0, Address::MAX_CONFIDENCE)
    }
}
