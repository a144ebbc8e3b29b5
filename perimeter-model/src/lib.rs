//! Core data model definitions shared across Perimeter crates.
#![allow(missing_docs)]

pub use ::chrono;

pub mod address;
pub mod context;
pub mod error;
pub mod group;
pub mod ids;
pub mod status;

// Intentionally curated re-exports for downstream consumers.
pub use address::{
    Address, AddressHash, DiscoveryMethod, NsRecordType, WorkItem,
};
pub use context::UserContext;
pub use error::{ModelError, Result as ModelResult};
pub use group::{
    BruteModuleConfig, DEFAULT_EXPAND_CONFIDENCE_FLOOR, KeywordModuleConfig,
    ModuleConfigurations, NsModuleConfig, PortModuleConfig, ScanGroup,
    WebModuleConfig,
};
pub use ids::{GroupId, GroupKey, OrgId, UserId};
pub use status::{GroupStatus, GroupStatusRecord, RunId};
