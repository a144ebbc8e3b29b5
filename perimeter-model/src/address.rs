use std::fmt;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::error::{ModelError, Result};
use crate::ids::{GroupId, GroupKey, OrgId};

/// Content hash of an (ip, host) pair. This is the dedup key of the
/// discovered-asset graph and is unique within a scan group.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct AddressHash(String);

impl AddressHash {
    /// Hash an (ip, host) pair. Components are trimmed and the host is
    /// lowercased so that cosmetic differences collapse to one record.
    pub fn of(ip: &str, host: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(ip.trim().as_bytes());
        hasher.update([0u8]);
        hasher.update(host.trim().to_ascii_lowercase().as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// Wrap an already computed hash, e.g. one read back from a store.
    pub fn from_hex(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        if value.len() != 64 || !value.bytes().all(|b| b.is_ascii_hexdigit())
        {
            return Err(ModelError::InvalidAddress(format!(
                "'{value}' is not a sha256 hex digest"
            )));
        }
        Ok(Self(value.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AddressHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for AddressHash {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// How an address entered the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum DiscoveryMethod {
    #[default]
    InputList,
    NsQueryNameToIp,
    NsQueryIpToName,
    NsAxfr,
    NsSecWalk,
    BigDataCt,
    BruteForce,
    WebCrawl,
    PortScan,
    Other,
}

impl DiscoveryMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscoveryMethod::InputList => "input_list",
            DiscoveryMethod::NsQueryNameToIp => "ns_query_name_to_ip",
            DiscoveryMethod::NsQueryIpToName => "ns_query_ip_to_name",
            DiscoveryMethod::NsAxfr => "ns_query_axfr",
            DiscoveryMethod::NsSecWalk => "ns_query_nsec_walk",
            DiscoveryMethod::BigDataCt => "bigdata_certificate_transparency",
            DiscoveryMethod::BruteForce => "dns_brute_forcer",
            DiscoveryMethod::WebCrawl => "web_crawler",
            DiscoveryMethod::PortScan => "port_scan",
            DiscoveryMethod::Other => "other",
        }
    }
}

impl fmt::Display for DiscoveryMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// DNS record type that produced the address, when it came from a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum NsRecordType {
    #[default]
    None,
    A,
    Aaaa,
    Cname,
    Ns,
    Mx,
    Ptr,
    Txt,
    Soa,
}

/// The unit of work and the unit of the discovered graph.
///
/// `address_hash` is computed once at construction from the (ip, host) pair
/// and is never recomputed: a module that resolves an IP onto an existing
/// host mutates the record in place and it keeps its identity.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Address {
    pub address_hash: AddressHash,
    pub org_id: OrgId,
    pub group_id: GroupId,
    pub ip_address: String,
    pub host_address: String,
    pub discovery_time: DateTime<Utc>,
    pub discovered_by: DiscoveryMethod,
    pub last_seen_time: Option<DateTime<Utc>>,
    pub last_scanned_time: Option<DateTime<Utc>>,
    /// System computed confidence, 0..=100.
    pub confidence_score: f32,
    /// Human override, 0..=100. Zero means unset.
    pub user_confidence_score: f32,
    pub is_wildcard_zone: bool,
    pub is_hosted_service: bool,
    pub ns_record: NsRecordType,
    /// Hash of the address whose module pass produced this one. Provenance
    /// only; the first path to reach a hash wins.
    pub found_from: Option<AddressHash>,
}

impl Address {
    pub const MAX_CONFIDENCE: f32 = 100.0;

    pub fn new(
        key: GroupKey,
        ip: impl Into<String>,
        host: impl Into<String>,
        discovered_by: DiscoveryMethod,
    ) -> Self {
        let ip_address = ip.into().trim().to_string();
        let host_address = host.into().trim().to_ascii_lowercase();
        let now = Utc::now();
        Self {
            address_hash: AddressHash::of(&ip_address, &host_address),
            org_id: key.org_id,
            group_id: key.group_id,
            ip_address,
            host_address,
            discovery_time: now,
            discovered_by,
            last_seen_time: Some(now),
            last_scanned_time: None,
            confidence_score: Self::MAX_CONFIDENCE,
            user_confidence_score: 0.0,
            is_wildcard_zone: false,
            is_hosted_service: false,
            ns_record: NsRecordType::None,
            found_from: None,
        }
    }

    /// Build a child of `parent` discovered by `method`. The child inherits
    /// the parent's group and flags and records the parent as provenance; the
    /// caller decides the confidence.
    pub fn derive(
        parent: &Address,
        ip: impl Into<String>,
        host: impl Into<String>,
        method: DiscoveryMethod,
        confidence_score: f32,
    ) -> Self {
        let mut child = Self::new(parent.group_key(), ip, host, method);
        child.found_from = Some(parent.address_hash.clone());
        child.is_hosted_service = parent.is_hosted_service;
        child.confidence_score = clamp_score(confidence_score);
        child
    }

    pub fn validate(&self) -> Result<()> {
        if self.ip_address.is_empty() && self.host_address.is_empty() {
            return Err(ModelError::InvalidAddress(
                "address must carry an ip or a host".into(),
            ));
        }
        Ok(())
    }

    pub fn group_key(&self) -> GroupKey {
        GroupKey {
            org_id: self.org_id,
            group_id: self.group_id,
        }
    }

    /// The confidence used for expansion decisions: the user override when
    /// one is set, otherwise the system score.
    pub fn effective_confidence(&self) -> f32 {
        if self.user_confidence_score > 0.0 {
            clamp_score(self.user_confidence_score)
        } else {
            clamp_score(self.confidence_score)
        }
    }

    pub fn mark_seen(&mut self, at: DateTime<Utc>) {
        self.last_seen_time = Some(at);
    }

    pub fn mark_scanned(&mut self, at: DateTime<Utc>) {
        self.last_scanned_time = Some(at);
        self.last_seen_time = Some(at);
    }
}

fn clamp_score(score: f32) -> f32 {
    if score.is_nan() {
        return 0.0;
    }
    score.clamp(0.0, Address::MAX_CONFIDENCE)
}

/// An address enqueued for analysis. The shared work queue is keyed by the
/// address hash so pushing an already queued hash is a no-op.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct WorkItem {
    pub address: Address,
}

impl WorkItem {
    pub fn hash(&self) -> &AddressHash {
        &self.address.address_hash
    }
}

impl From<Address> for WorkItem {
    fn from(address: Address) -> Self {
        Self { address }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> GroupKey {
        GroupKey::new(1, 1)
    }

    #[test]
    fn hash_is_stable_and_normalized() {
        let a = AddressHash::of("", "a.com");
        let b = AddressHash::of(" ", " A.COM ");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
        assert_ne!(a, AddressHash::of("1.2.3.4", "a.com"));
    }

    #[test]
    fn ip_and_host_do_not_bleed_into_each_other() {
        assert_ne!(AddressHash::of("a", "b.com"), AddressHash::of("", "ab.com"));
    }

    #[test]
    fn resolving_in_place_keeps_identity() {
        let mut address =
            Address::new(key(), "", "a.com", DiscoveryMethod::InputList);
        let before = address.address_hash.clone();
        address.ip_address = "1.2.3.4".into();
        assert_eq!(address.address_hash, before);
        assert_eq!(before, AddressHash::of("", "a.com"));
    }

    #[test]
    fn derive_records_provenance() {
        let parent =
            Address::new(key(), "", "a.com", DiscoveryMethod::InputList);
        let child = Address::derive(
            &parent,
            "1.2.3.4",
            "b.a.com",
            DiscoveryMethod::NsQueryNameToIp,
            140.0,
        );
        assert_eq!(child.found_from.as_ref(), Some(&parent.address_hash));
        assert_eq!(child.confidence_score, 100.0);
        assert_eq!(child.group_key(), parent.group_key());
    }

    #[test]
    fn user_override_wins_when_set() {
        let mut address =
            Address::new(key(), "1.1.1.1", "", DiscoveryMethod::InputList);
        address.confidence_score = 40.0;
        assert_eq!(address.effective_confidence(), 40.0);
        address.user_confidence_score = 90.0;
        assert_eq!(address.effective_confidence(), 90.0);
    }

    #[test]
    fn from_hex_validates_digest() {
        let hash = AddressHash::of("1.1.1.1", "");
        assert_eq!(AddressHash::from_hex(hash.as_str()).unwrap(), hash);
        assert!(AddressHash::from_hex("nope").is_err());
    }

    #[test]
    fn empty_address_is_invalid() {
        let address = Address::new(key(), "", "", DiscoveryMethod::Other);
        assert!(address.validate().is_err());
    }
}
