//! Per-group discovery loops and the control loop that starts them.

pub mod activity;
pub mod batcher;
pub mod coordinator;
pub mod dispatcher;
pub mod events;

pub use activity::{ActivityCounters, GroupActivity, GroupCounters};
pub use batcher::{Batcher, BatcherStats};
pub use coordinator::{Coordinator, ReconcileReport, StartOutcome};
pub use dispatcher::{Dispatcher, ScanDispatcher};
pub use events::DispatchEvent;
