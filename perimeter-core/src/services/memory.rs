use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use perimeter_model::{
    Address, AddressHash, GroupId, GroupKey, ScanGroup, UserContext,
};
use tokio::sync::Mutex;

use super::{
    AddressFilter, AddressService, EventService, GroupFilter, ScanGroupService,
};
use crate::error::{Result, ScanError};

/// In-memory address persistence. Records every `update` call so tests can
/// assert on batching behaviour.
#[derive(Debug, Default)]
pub struct MemoryAddressService {
    addresses: Mutex<HashMap<GroupKey, BTreeMap<AddressHash, Address>>>,
    update_calls: Mutex<Vec<usize>>,
    fail_updates: AtomicUsize,
}

impl MemoryAddressService {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed(&self, addresses: impl IntoIterator<Item = Address>) {
        let mut guard = self.addresses.lock().await;
        for address in addresses {
            guard
                .entry(address.group_key())
                .or_default()
                .insert(address.address_hash.clone(), address);
        }
    }

    pub async fn snapshot(&self, key: GroupKey) -> Vec<Address> {
        self.addresses
            .lock()
            .await
            .get(&key)
            .map(|group| group.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn find(
        &self,
        key: GroupKey,
        hash: &AddressHash,
    ) -> Option<Address> {
        self.addresses
            .lock()
            .await
            .get(&key)
            .and_then(|group| group.get(hash).cloned())
    }

    /// Sizes of every successful `update` call, in order.
    pub async fn update_calls(&self) -> Vec<usize> {
        self.update_calls.lock().await.clone()
    }

    /// Make the next `n` updates fail with a transient error.
    pub fn fail_next_updates(&self, n: usize) {
        self.fail_updates.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl AddressService for MemoryAddressService {
    async fn get(
        &self,
        _ctx: &UserContext,
        filter: &AddressFilter,
    ) -> Result<Vec<Address>> {
        let guard = self.addresses.lock().await;
        let Some(group) = guard.get(&filter.key()) else {
            return Ok(Vec::new());
        };
        Ok(group
            .values()
            .filter(|address| filter.matches(address))
            .take(filter.limit)
            .cloned()
            .collect())
    }

    async fn update(
        &self,
        _ctx: &UserContext,
        addresses: HashMap<AddressHash, Address>,
    ) -> Result<usize> {
        let pending = self.fail_updates.load(Ordering::SeqCst);
        if pending > 0 {
            self.fail_updates.store(pending - 1, Ordering::SeqCst);
            return Err(ScanError::service("address", "update unavailable"));
        }
        let written = addresses.len();
        let mut guard = self.addresses.lock().await;
        for (hash, address) in addresses {
            guard.entry(address.group_key()).or_default().insert(hash, address);
        }
        self.update_calls.lock().await.push(written);
        Ok(written)
    }

    async fn count(&self, _ctx: &UserContext, key: GroupKey) -> Result<usize> {
        Ok(self
            .addresses
            .lock()
            .await
            .get(&key)
            .map(BTreeMap::len)
            .unwrap_or(0))
    }
}

/// In-memory scan-group metadata keyed by (org, group).
#[derive(Debug, Default)]
pub struct MemoryScanGroupService {
    groups: Mutex<BTreeMap<GroupKey, ScanGroup>>,
}

impl MemoryScanGroupService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a group, as the owning CRUD service would.
    pub async fn upsert(&self, group: ScanGroup) {
        self.groups.lock().await.insert(group.key(), group);
    }

    /// Apply `edit` to a stored group and bump its `modified_time`.
    pub async fn modify(
        &self,
        key: GroupKey,
        edit: impl FnOnce(&mut ScanGroup),
    ) -> Option<ScanGroup> {
        let mut guard = self.groups.lock().await;
        let group = guard.get_mut(&key)?;
        edit(group);
        let now = Utc::now();
        group.modified_time = if now > group.modified_time {
            now
        } else {
            group.modified_time + chrono::Duration::milliseconds(1)
        };
        Some(group.clone())
    }
}

#[async_trait]
impl ScanGroupService for MemoryScanGroupService {
    async fn get(
        &self,
        ctx: &UserContext,
        group_id: GroupId,
    ) -> Result<Option<ScanGroup>> {
        Ok(self
            .groups
            .lock()
            .await
            .get(&ctx.group_key(group_id))
            .cloned())
    }

    async fn get_by_name(
        &self,
        ctx: &UserContext,
        name: &str,
    ) -> Result<Option<ScanGroup>> {
        Ok(self
            .groups
            .lock()
            .await
            .values()
            .find(|group| group.org_id == ctx.org_id && group.group_name == name)
            .cloned())
    }

    async fn all_groups(
        &self,
        _ctx: &UserContext,
        filter: &GroupFilter,
    ) -> Result<Vec<ScanGroup>> {
        Ok(self
            .groups
            .lock()
            .await
            .values()
            .filter(|group| filter.matches(group))
            .cloned()
            .collect())
    }
}

/// Completion notification recorded in place of a real event bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRecord {
    pub key: GroupKey,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Default, Clone)]
pub struct RecordingEventService {
    completions: Arc<Mutex<Vec<CompletionRecord>>>,
}

impl RecordingEventService {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn completions(&self) -> Vec<CompletionRecord> {
        self.completions.lock().await.clone()
    }

    pub async fn completions_for(&self, key: GroupKey) -> usize {
        self.completions
            .lock()
            .await
            .iter()
            .filter(|record| record.key == key)
            .count()
    }
}

#[async_trait]
impl EventService for RecordingEventService {
    async fn notify_complete(
        &self,
        _ctx: &UserContext,
        started_at: DateTime<Utc>,
        key: GroupKey,
    ) -> Result<()> {
        self.completions
            .lock()
            .await
            .push(CompletionRecord { key, started_at });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use perimeter_model::{DiscoveryMethod, OrgId, UserId};

    fn ctx() -> UserContext {
        UserContext::new(OrgId(1), UserId(1))
    }

    #[tokio::test]
    async fn pages_by_hash_cursor() {
        let service = MemoryAddressService::new();
        let key = GroupKey::new(1, 1);
        service
            .seed((0..5).map(|i| {
                Address::new(key, "", format!("h{i}.com"), DiscoveryMethod::InputList)
            }))
            .await;

        let mut filter = AddressFilter::for_group(key, 2);
        let mut seen = Vec::new();
        loop {
            let page = service.get(&ctx(), &filter).await.unwrap();
            seen.extend(page.iter().map(|a| a.address_hash.clone()));
            if page.len() < filter.limit {
                break;
            }
            filter.after = page.last().map(|a| a.address_hash.clone());
        }
        assert_eq!(seen.len(), 5);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn scanned_before_filters_recent_scans() {
        let service = MemoryAddressService::new();
        let key = GroupKey::new(1, 1);
        let mut fresh =
            Address::new(key, "", "fresh.com", DiscoveryMethod::InputList);
        let cutoff = Utc::now();
        fresh.mark_scanned(cutoff + chrono::Duration::seconds(1));
        let never = Address::new(key, "", "never.com", DiscoveryMethod::InputList);
        service.seed([fresh, never.clone()]).await;

        let mut filter = AddressFilter::for_group(key, 10);
        filter.scanned_before = Some(cutoff);
        let page = service.get(&ctx(), &filter).await.unwrap();
        assert_eq!(page, vec![never]);
    }

    #[tokio::test]
    async fn group_filter_hides_paused_and_deleted() {
        let service = MemoryScanGroupService::new();
        let mut paused = ScanGroup::new(GroupKey::new(1, 1), "p", UserId(1));
        paused.paused = true;
        let mut deleted = ScanGroup::new(GroupKey::new(1, 2), "d", UserId(1));
        deleted.deleted = true;
        let live = ScanGroup::new(GroupKey::new(2, 3), "l", UserId(1));
        for group in [paused, deleted, live.clone()] {
            service.upsert(group).await;
        }
        let groups = service
            .all_groups(&ctx(), &GroupFilter::default())
            .await
            .unwrap();
        assert_eq!(groups, vec![live]);
        assert!(service.get_by_name(&ctx(), "p").await.unwrap().is_some());
        assert!(service.get_by_name(&ctx(), "l").await.unwrap().is_none());
    }
}
