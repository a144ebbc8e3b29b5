use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Global knobs that tune pipeline behaviour.
///
/// All fields carry defaults so deployments can override a single value
/// without supplying a full configuration payload.
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Frontier batch sizing and per-address concurrency.
    pub dispatcher: DispatcherConfig,
    /// Write batching towards the address persistence service.
    pub batcher: BatcherConfig,
    /// Reconciliation loop cadence and staleness thresholds.
    pub coordinator: CoordinatorConfig,
    /// Group configuration cache behaviour.
    pub cache: CacheConfig,
    /// Retry/backoff policy shared by every store and service call.
    pub retry: RetryConfig,
    /// Limits applied around each analyzer invocation.
    pub analyzers: AnalyzerLimits,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Maximum work items popped from the shared queue per iteration.
    pub pop_batch_size: usize,
    /// Addresses analyzed concurrently within one popped batch.
    pub address_concurrency: usize,
    /// Page size used when loading the persisted seed frontier.
    pub seed_page_size: usize,
    /// Sleep between polls when the queue is empty but work is in flight
    /// elsewhere (milliseconds).
    pub idle_poll_ms: u64,
    /// Capacity of the dispatch event broadcast channel.
    pub event_channel_capacity: usize,
    /// How often a running loop refreshes its group's status record
    /// (milliseconds). Keep it well below
    /// `coordinator.stale_started_secs`.
    pub heartbeat_interval_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            pop_batch_size: 250,
            address_concurrency: 16,
            seed_page_size: 1_000,
            idle_poll_ms: 500,
            event_channel_capacity: 256,
            heartbeat_interval_ms: 30_000,
        }
    }
}

impl DispatcherConfig {
    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms.max(1))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BatcherConfig {
    /// Flush once this many unique addresses are buffered.
    pub batch_size: usize,
    /// Flush buffered addresses at least this often (milliseconds).
    pub flush_interval_ms: u64,
    /// Bounded channel size. A full channel is the backpressure signal.
    pub channel_capacity: usize,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            flush_interval_ms: 1_000,
            channel_capacity: 4_096,
        }
    }
}

impl BatcherConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Reconciliation pass cadence (milliseconds).
    pub poll_interval_ms: u64,
    /// A Started group whose run has not sent a heartbeat for this long is
    /// reset and restarted by the poller. A negative value disables
    /// recovery.
    pub stale_started_secs: i64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 60_000,
            stale_started_secs: 600,
        }
    }
}

impl CoordinatorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn stale_started(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_started_secs.max(0))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Buffer for invalidation messages between the subscriber and the
    /// refresh task.
    pub invalidation_buffer: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            invalidation_buffer: 1_024,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u16,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Percentage-based jitter to spread out retries.
    pub jitter_ratio: f32,
}

impl RetryConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    /// Single attempt, no sleeping. Handy for tests.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff_base_ms: 0,
            backoff_max_ms: 0,
            jitter_ratio: 0.0,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base_ms: 200,
            backoff_max_ms: 10_000,
            jitter_ratio: 0.25,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AnalyzerLimits {
    /// Upper bound for a single analyzer call (milliseconds).
    pub call_timeout_ms: u64,
    /// Burst allowance on top of each module's requests-per-second.
    pub burst: u32,
}

impl Default for AnalyzerLimits {
    fn default() -> Self {
        Self {
            call_timeout_ms: 60_000,
            burst: 1,
        }
    }
}

impl AnalyzerLimits {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms.max(1))
    }
}
