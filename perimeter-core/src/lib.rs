//! Scan orchestration for the Perimeter asset discovery pipeline.
//!
//! A scan group's seed addresses are expanded into a discovered graph by
//! repeatedly running them through the analyzer modules until no new
//! address appears. Work is coordinated through a shared state store so
//! several instances can serve the same groups:
//!
//! - [`store`]: work queue, seen sets, group status lock, stored group
//!   configuration and invalidation fan-out (in-memory or Redis).
//! - [`cache`]: per-instance group configuration cache kept coherent by
//!   invalidation messages.
//! - [`analyzer`]: module contract, pass order, rate limits, confidence.
//! - [`pipeline`]: the per-group dispatcher loop, write batching, and the
//!   coordinator that owns start/stop and reconciliation.
//!
//! # Features
//!
//! - `redis-store` (default): the Redis-backed [`store::RedisStateStore`].
#![allow(missing_docs)]

pub mod analyzer;
pub mod cache;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod retry;
pub mod services;
pub mod store;

pub use analyzer::{Analysis, Analyzer, AnalyzerChain, AnalyzerKind};
pub use cache::{Freshness, GroupConfigCache, GroupSnapshot};
pub use config::PipelineConfig;
pub use error::{Result, ScanError};
pub use pipeline::{
    Coordinator, DispatchEvent, Dispatcher, ScanDispatcher, StartOutcome,
};
pub use store::{MemoryStateStore, StateStore};
#[cfg(feature = "redis-store")]
pub use store::RedisStateStore;

pub use perimeter_model as model;
