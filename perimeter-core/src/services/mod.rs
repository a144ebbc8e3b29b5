//! Contracts for the collaborators the pipeline consumes but does not own:
//! address persistence, scan-group metadata, and completion events.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use perimeter_model::{
    Address, AddressHash, GroupId, GroupKey, OrgId, ScanGroup, UserContext,
};

use crate::error::Result;

pub mod memory;

pub use memory::{
    CompletionRecord, MemoryAddressService, MemoryScanGroupService,
    RecordingEventService,
};

/// One page of a group's persisted addresses.
///
/// Pages are ordered by address hash; callers continue with `after` set to
/// the last hash of the previous page until a short page comes back.
#[derive(Debug, Clone, PartialEq)]
pub struct AddressFilter {
    pub org_id: OrgId,
    pub group_id: GroupId,
    /// Only addresses never scanned, or last scanned before this instant.
    pub scanned_before: Option<DateTime<Utc>>,
    pub after: Option<AddressHash>,
    pub limit: usize,
}

impl AddressFilter {
    pub fn for_group(key: GroupKey, limit: usize) -> Self {
        Self {
            org_id: key.org_id,
            group_id: key.group_id,
            scanned_before: None,
            after: None,
            limit,
        }
    }

    pub fn key(&self) -> GroupKey {
        GroupKey {
            org_id: self.org_id,
            group_id: self.group_id,
        }
    }

    pub fn matches(&self, address: &Address) -> bool {
        if address.org_id != self.org_id || address.group_id != self.group_id
        {
            return false;
        }
        if let Some(after) = &self.after
            && address.address_hash <= *after
        {
            return false;
        }
        match (self.scanned_before, address.last_scanned_time) {
            (Some(cutoff), Some(scanned)) => scanned < cutoff,
            _ => true,
        }
    }
}

#[async_trait]
pub trait AddressService: Send + Sync {
    async fn get(
        &self,
        ctx: &UserContext,
        filter: &AddressFilter,
    ) -> Result<Vec<Address>>;

    /// Upsert by hash. Returns the number of records written.
    async fn update(
        &self,
        ctx: &UserContext,
        addresses: HashMap<AddressHash, Address>,
    ) -> Result<usize>;

    async fn count(&self, ctx: &UserContext, key: GroupKey) -> Result<usize>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupFilter {
    pub include_paused: bool,
    pub include_deleted: bool,
}

impl GroupFilter {
    pub fn matches(&self, group: &ScanGroup) -> bool {
        (self.include_paused || !group.paused)
            && (self.include_deleted || !group.deleted)
    }
}

#[async_trait]
pub trait ScanGroupService: Send + Sync {
    /// Authoritative read of one group in the caller's organization.
    async fn get(
        &self,
        ctx: &UserContext,
        group_id: GroupId,
    ) -> Result<Option<ScanGroup>>;

    async fn get_by_name(
        &self,
        ctx: &UserContext,
        name: &str,
    ) -> Result<Option<ScanGroup>>;

    /// Every group across organizations that passes `filter`. Used by the
    /// control loop, which runs with a system context.
    async fn all_groups(
        &self,
        ctx: &UserContext,
        filter: &GroupFilter,
    ) -> Result<Vec<ScanGroup>>;
}

#[async_trait]
pub trait EventService: Send + Sync {
    async fn notify_complete(
        &self,
        ctx: &UserContext,
        started_at: DateTime<Utc>,
        key: GroupKey,
    ) -> Result<()>;
}
