use chrono::{DateTime, Utc};

use crate::ids::{GroupId, GroupKey, OrgId, UserId};

/// Confidence below which discovered addresses are kept but not expanded.
pub const DEFAULT_EXPAND_CONFIDENCE_FLOOR: f32 = 75.0;

/// A named scan configuration owned by an organization.
///
/// `modified_time` is the logical clock used for every staleness decision:
/// a cached or queued copy is stale exactly when its `modified_time` is older
/// than the authoritative one. Consumers never mutate a shared copy in place.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ScanGroup {
    pub org_id: OrgId,
    pub group_id: GroupId,
    pub group_name: String,
    pub creation_time: DateTime<Utc>,
    pub created_by: UserId,
    pub modified_time: DateTime<Utc>,
    pub modified_by: UserId,
    /// Opaque reference to the uploaded seed list.
    pub original_input_s3_url: String,
    pub paused: bool,
    pub deleted: bool,
    #[cfg_attr(feature = "serde", serde(default = "default_floor"))]
    pub expand_confidence_floor: f32,
    #[cfg_attr(feature = "serde", serde(default))]
    pub modules: ModuleConfigurations,
}

#[cfg(feature = "serde")]
fn default_floor() -> f32 {
    DEFAULT_EXPAND_CONFIDENCE_FLOOR
}

impl ScanGroup {
    pub fn new(key: GroupKey, name: impl Into<String>, owner: UserId) -> Self {
        let now = Utc::now();
        Self {
            org_id: key.org_id,
            group_id: key.group_id,
            group_name: name.into(),
            creation_time: now,
            created_by: owner,
            modified_time: now,
            modified_by: owner,
            original_input_s3_url: String::new(),
            paused: false,
            deleted: false,
            expand_confidence_floor: DEFAULT_EXPAND_CONFIDENCE_FLOOR,
            modules: ModuleConfigurations::default(),
        }
    }

    pub fn key(&self) -> GroupKey {
        GroupKey {
            org_id: self.org_id,
            group_id: self.group_id,
        }
    }

    /// Whether the group may be started at all.
    pub fn is_runnable(&self) -> bool {
        !self.paused && !self.deleted
    }

    /// True when `self` is older than `other` by the logical clock.
    pub fn is_stale_against(&self, other: &ScanGroup) -> bool {
        self.modified_time < other.modified_time
    }
}

/// Per-module configuration blocks. Each module reads only its own block.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ModuleConfigurations {
    pub ns: NsModuleConfig,
    pub brute: BruteModuleConfig,
    pub port: PortModuleConfig,
    pub web: WebModuleConfig,
    pub keyword: KeywordModuleConfig,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct NsModuleConfig {
    /// Zero disables throttling for the module.
    pub requests_per_second: u32,
}

impl Default for NsModuleConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct BruteModuleConfig {
    pub requests_per_second: u32,
    pub custom_subdomains: Vec<String>,
    pub max_depth: u32,
}

impl Default for BruteModuleConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 50,
            custom_subdomains: Vec::new(),
            max_depth: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PortModuleConfig {
    pub requests_per_second: u32,
    pub custom_ports: Vec<u16>,
}

impl Default for PortModuleConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 50,
            custom_ports: vec![80, 443],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct WebModuleConfig {
    pub requests_per_second: u32,
    pub max_links: u32,
    pub extract_js: bool,
    pub take_screenshots: bool,
}

impl Default for WebModuleConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 10,
            max_links: 1,
            extract_js: true,
            take_screenshots: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct KeywordModuleConfig {
    pub requests_per_second: u32,
    pub keywords: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn staleness_uses_modified_time_only() {
        let key = GroupKey::new(1, 2);
        let older = ScanGroup::new(key, "corp", UserId(1));
        let mut newer = older.clone();
        newer.modified_time = older.modified_time + Duration::seconds(5);
        newer.group_name = "renamed".into();

        assert!(older.is_stale_against(&newer));
        assert!(!newer.is_stale_against(&older));
        assert!(!older.is_stale_against(&older.clone()));
    }

    #[test]
    fn paused_and_deleted_groups_are_not_runnable() {
        let mut group = ScanGroup::new(GroupKey::new(1, 2), "g", UserId(1));
        assert!(group.is_runnable());
        group.paused = true;
        assert!(!group.is_runnable());
        group.paused = false;
        group.deleted = true;
        assert!(!group.is_runnable());
    }

    #[cfg(feature = "serde")]
    #[test]
    fn module_block_defaults_when_missing() {
        let group = ScanGroup::new(GroupKey::new(3, 4), "g", UserId(9));
        let mut value = serde_json::to_value(&group).unwrap();
        let obj = value.as_object_mut().unwrap();
        obj.remove("modules");
        obj.remove("expand_confidence_floor");
        let parsed: ScanGroup = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.modules, ModuleConfigurations::default());
        assert_eq!(
            parsed.expand_confidence_floor,
            DEFAULT_EXPAND_CONFIDENCE_FLOOR
        );
    }
}
