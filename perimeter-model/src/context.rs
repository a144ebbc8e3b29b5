use uuid::Uuid;

use crate::ids::{GroupId, GroupKey, OrgId, UserId};

/// Tenant/user context attached to every request crossing a service boundary.
/// Used for authorization by collaborators and for log correlation here.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct UserContext {
    pub org_id: OrgId,
    pub user_id: UserId,
    /// Opaque customer id for the organization.
    pub org_cid: String,
    pub trace_id: Uuid,
}

impl UserContext {
    pub fn new(org_id: OrgId, user_id: UserId) -> Self {
        Self {
            org_id,
            user_id,
            org_cid: String::new(),
            trace_id: Uuid::now_v7(),
        }
    }

    /// Same principal, fresh trace id. Used when a long-running loop issues
    /// follow-up calls on behalf of the original request.
    pub fn child(&self) -> Self {
        Self {
            trace_id: Uuid::now_v7(),
            ..self.clone()
        }
    }

    pub fn group_key(&self, group_id: GroupId) -> GroupKey {
        GroupKey {
            org_id: self.org_id,
            group_id,
        }
    }
}
