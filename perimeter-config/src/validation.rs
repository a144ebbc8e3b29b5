use thiserror::Error;
use url::Url;

use crate::models::Config;

const MAX_SANE_POP_BATCH: usize = 10_000;

#[derive(Debug, Error)]
pub enum ConfigGuardRailError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
    #[error("invalid Redis URL '{url}': {reason}")]
    InvalidRedisUrl { url: String, reason: String },
    #[error("Redis key prefix must not be empty or contain ':'")]
    InvalidRedisPrefix,
}

#[derive(Debug, Clone)]
pub struct ConfigWarning {
    pub message: String,
    pub hint: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct ConfigWarnings {
    pub items: Vec<ConfigWarning>,
}

impl ConfigWarnings {
    pub fn push<S: Into<String>>(&mut self, message: S) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: None,
        });
    }

    pub fn push_with_hint<S: Into<String>, H: Into<String>>(
        &mut self,
        message: S,
        hint: H,
    ) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: Some(hint.into()),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }
}

pub fn apply_guard_rails(
    config: &Config,
) -> Result<ConfigWarnings, ConfigGuardRailError> {
    let mut warnings = ConfigWarnings::default();
    let pipeline = &config.pipeline;

    validate_redis(&config.redis.url, &config.redis.prefix)?;

    non_zero("dispatcher.pop_batch_size", pipeline.dispatcher.pop_batch_size)?;
    non_zero(
        "dispatcher.address_concurrency",
        pipeline.dispatcher.address_concurrency,
    )?;
    non_zero("dispatcher.seed_page_size", pipeline.dispatcher.seed_page_size)?;
    non_zero("batcher.batch_size", pipeline.batcher.batch_size)?;
    non_zero("batcher.channel_capacity", pipeline.batcher.channel_capacity)?;
    if pipeline.batcher.flush_interval_ms == 0 {
        return Err(ConfigGuardRailError::Zero {
            field: "batcher.flush_interval_ms",
        });
    }
    if pipeline.coordinator.poll_interval_ms == 0 {
        return Err(ConfigGuardRailError::Zero {
            field: "coordinator.poll_interval_ms",
        });
    }
    if pipeline.analyzers.call_timeout_ms == 0 {
        return Err(ConfigGuardRailError::Zero {
            field: "analyzers.call_timeout_ms",
        });
    }

    if pipeline.dispatcher.pop_batch_size > MAX_SANE_POP_BATCH {
        warnings.push_with_hint(
            format!(
                "dispatcher.pop_batch_size = {} holds a large slice of the frontier in one worker",
                pipeline.dispatcher.pop_batch_size
            ),
            format!("Keep it at or below {MAX_SANE_POP_BATCH}"),
        );
    }
    if pipeline.retry.max_attempts <= 1 {
        warnings.push_with_hint(
            "retry.max_attempts <= 1; transient store failures will stop group loops",
            "Set retry.max_attempts to 3 or more",
        );
    }
    if pipeline.batcher.channel_capacity < pipeline.batcher.batch_size {
        warnings.push(
            "batcher.channel_capacity is smaller than batcher.batch_size; size-triggered flushes will rarely fire",
        );
    }
    let heartbeat_ms = pipeline.dispatcher.heartbeat_interval_ms;
    let stale_ms = pipeline.coordinator.stale_started_secs.saturating_mul(1_000);
    if stale_ms >= 0 && (heartbeat_ms as i64).saturating_mul(2) > stale_ms {
        warnings.push_with_hint(
            format!(
                "dispatcher.heartbeat_interval_ms = {heartbeat_ms} leaves little slack before coordinator.stale_started_secs; live runs may be taken over"
            ),
            "Keep the heartbeat at most half the stale window",
        );
    }
    if pipeline.coordinator.stale_started_secs < 0 {
        warnings.push_with_hint(
            "coordinator.stale_started_secs is negative; orphaned Started groups will never be recovered",
            "Use perimeterctl stop to release them manually",
        );
    }

    Ok(warnings)
}

fn non_zero(
    field: &'static str,
    value: usize,
) -> Result<(), ConfigGuardRailError> {
    if value == 0 {
        return Err(ConfigGuardRailError::Zero { field });
    }
    Ok(())
}

fn validate_redis(raw: &str, prefix: &str) -> Result<(), ConfigGuardRailError> {
    let parsed = Url::parse(raw).map_err(|err| {
        ConfigGuardRailError::InvalidRedisUrl {
            url: raw.to_string(),
            reason: err.to_string(),
        }
    })?;
    if !matches!(parsed.scheme(), "redis" | "rediss" | "redis+unix" | "unix") {
        return Err(ConfigGuardRailError::InvalidRedisUrl {
            url: raw.to_string(),
            reason: format!("unsupported scheme `{}`", parsed.scheme()),
        });
    }
    if prefix.trim().is_empty() || prefix.contains(':') {
        return Err(ConfigGuardRailError::InvalidRedisPrefix);
    }
    Ok(())
}
