use std::{collections::HashMap, fmt, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use perimeter_model::{
    Address, AddressHash, GroupKey, GroupStatus, GroupStatusRecord, RunId,
    ScanGroup,
};
use redis::{AsyncCommands, aio::ConnectionManager};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{
    GateKind, GroupInvalidation, GroupStateStore, InvalidationBus,
    InvalidationSubscription, RateGate, WorkQueue, dedup_in_order,
};
use crate::error::{Result, ScanError};

/// Lua scripts for the multi-key steps that must be atomic across
/// dispatcher instances.
mod scripts {
    use redis::Script;

    /// KEYS: queue list, items hash. ARGV: hash, json, hash, json, ...
    pub fn push_idempotent() -> Script {
        Script::new(
            r#"
            local queued = 0
            for i = 1, #ARGV, 2 do
                if redis.call('HSETNX', KEYS[2], ARGV[i], ARGV[i + 1]) == 1 then
                    redis.call('RPUSH', KEYS[1], ARGV[i])
                    queued = queued + 1
                end
            end
            return queued
            "#,
        )
    }

    /// KEYS: queue list, items hash. ARGV: limit.
    pub fn pop_batch() -> Script {
        Script::new(
            r#"
            local limit = tonumber(ARGV[1])
            local out = {}
            while #out < limit do
                local hash = redis.call('LPOP', KEYS[1])
                if not hash then
                    break
                end
                local item = redis.call('HGET', KEYS[2], hash)
                if item then
                    redis.call('HDEL', KEYS[2], hash)
                    table.insert(out, item)
                end
            end
            return out
            "#,
        )
    }

    /// KEYS: seen set. ARGV: candidate hashes.
    pub fn filter_new() -> Script {
        Script::new(
            r#"
            local fresh = {}
            for i = 1, #ARGV do
                if redis.call('SADD', KEYS[1], ARGV[i]) == 1 then
                    table.insert(fresh, ARGV[i])
                end
            end
            return fresh
            "#,
        )
    }

    /// KEYS: status hash. ARGV: now, run id.
    pub fn try_start() -> Script {
        Script::new(
            r#"
            if redis.call('HGET', KEYS[1], 'status') == 'started' then
                return 0
            end
            redis.call('HSET', KEYS[1], 'status', 'started', 'modified_at', ARGV[1],
                'heartbeat_at', ARGV[1], 'run_id', ARGV[2])
            return 1
            "#,
        )
    }

    /// KEYS: status hash. ARGV: now, run id.
    pub fn heartbeat() -> Script {
        Script::new(
            r#"
            if redis.call('HGET', KEYS[1], 'status') ~= 'started'
                or redis.call('HGET', KEYS[1], 'run_id') ~= ARGV[2] then
                return 0
            end
            redis.call('HSET', KEYS[1], 'heartbeat_at', ARGV[1])
            return 1
            "#,
        )
    }

    /// KEYS: status hash. ARGV: now, run id. An empty run id stops
    /// unconditionally.
    pub fn stop() -> Script {
        Script::new(
            r#"
            if ARGV[2] ~= '' and (redis.call('HGET', KEYS[1], 'status') ~= 'started'
                or redis.call('HGET', KEYS[1], 'run_id') ~= ARGV[2]) then
                return 0
            end
            redis.call('HSET', KEYS[1], 'status', 'stopped', 'modified_at', ARGV[1],
                'heartbeat_at', ARGV[1])
            redis.call('HDEL', KEYS[1], 'run_id')
            return 1
            "#,
        )
    }

    /// KEYS: config, config mtime. ARGV: json, modified_time in micros.
    pub fn put_config_if_newer() -> Script {
        Script::new(
            r#"
            local current = redis.call('GET', KEYS[2])
            if current and tonumber(current) >= tonumber(ARGV[2]) then
                return 0
            end
            redis.call('SET', KEYS[1], ARGV[1])
            redis.call('SET', KEYS[2], ARGV[2])
            return 1
            "#,
        )
    }
}

/// Key layout of the shared store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisKeys {
    prefix: String,
}

impl RedisKeys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn group(&self, key: GroupKey, suffix: &str) -> String {
        format!(
            "{}:{}:{}:{suffix}",
            self.prefix, key.org_id, key.group_id
        )
    }

    pub fn queue(&self, key: GroupKey) -> String {
        self.group(key, "queue")
    }

    pub fn items(&self, key: GroupKey) -> String {
        self.group(key, "items")
    }

    pub fn seen(&self, key: GroupKey) -> String {
        self.group(key, "seen")
    }

    pub fn status(&self, key: GroupKey) -> String {
        self.group(key, "status")
    }

    pub fn config(&self, key: GroupKey) -> String {
        self.group(key, "config")
    }

    /// `modified_time` of the stored config, in microseconds.
    pub fn config_mtime(&self, key: GroupKey) -> String {
        self.group(key, "config_mtime")
    }

    pub fn gate(&self, kind: GateKind, key: GroupKey, subject: &str) -> String {
        format!(
            "{}:gate:{kind}:{}:{}:{}",
            self.prefix,
            key.org_id,
            key.group_id,
            subject.trim().to_ascii_lowercase()
        )
    }

    pub fn invalidation_channel(&self) -> String {
        format!("{}:invalidate", self.prefix)
    }
}

#[derive(Clone)]
pub struct RedisStateStore {
    client: redis::Client,
    conn: ConnectionManager,
    keys: RedisKeys,
}

impl fmt::Debug for RedisStateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStateStore")
            .field("connection", &"ConnectionManager")
            .field("keys", &self.keys)
            .finish()
    }
}

impl RedisStateStore {
    pub async fn connect(redis_url: &str, prefix: &str) -> Result<Self> {
        info!(target: "scan::store", "Connecting to shared state store at {}", redis_url);

        let client = redis::Client::open(redis_url).map_err(|e| {
            ScanError::Store(format!("Failed to create Redis client: {e}"))
        })?;
        let conn = ConnectionManager::new(client.clone()).await.map_err(|e| {
            ScanError::Store(format!("Failed to connect to Redis: {e}"))
        })?;

        info!(target: "scan::store", "Connected to shared state store");

        Ok(Self {
            client,
            conn,
            keys: RedisKeys::new(prefix),
        })
    }

    pub fn keys(&self) -> &RedisKeys {
        &self.keys
    }

    async fn publish(&self, message: &GroupInvalidation) -> Result<()> {
        let payload = serde_json::to_string(message)?;
        let mut conn = self.conn.clone();
        let receivers: i64 = conn
            .publish(self.keys.invalidation_channel(), payload)
            .await?;
        debug!(
            target: "scan::store",
            key = %message.key,
            receivers,
            "invalidation published"
        );
        Ok(())
    }

    async fn set_stopped(&self, key: GroupKey, run: Option<RunId>) -> Result<bool> {
        let mut conn = self.conn.clone();
        let stopped: i64 = scripts::stop()
            .key(self.keys.status(key))
            .arg(Utc::now().to_rfc3339())
            .arg(run.map(|run| run.to_string()).unwrap_or_default())
            .invoke_async(&mut conn)
            .await?;
        Ok(stopped == 1)
    }
}

fn decode_address(raw: &str) -> Result<Address> {
    Ok(serde_json::from_str(raw)?)
}

fn decode_status(fields: HashMap<String, String>) -> Result<Option<GroupStatusRecord>> {
    let Some(status) = fields.get("status") else {
        return Ok(None);
    };
    let status: GroupStatus = status.parse()?;
    let timestamp = |field: &str| {
        fields
            .get(field)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|ts| ts.with_timezone(&Utc))
    };
    let modified_at = timestamp("modified_at").unwrap_or_else(Utc::now);
    let heartbeat_at = timestamp("heartbeat_at").unwrap_or(modified_at);
    let run_id = fields
        .get("run_id")
        .filter(|raw| !raw.is_empty())
        .map(|raw| raw.parse::<RunId>())
        .transpose()?;
    Ok(Some(GroupStatusRecord {
        status,
        modified_at,
        heartbeat_at,
        run_id,
    }))
}

#[async_trait]
impl WorkQueue for RedisStateStore {
    async fn push_addresses(
        &self,
        key: GroupKey,
        addresses: &[Address],
    ) -> Result<usize> {
        if addresses.is_empty() {
            return Ok(0);
        }
        let script = scripts::push_idempotent();
        let mut invocation = script.key(self.keys.queue(key));
        invocation.key(self.keys.items(key));
        for address in addresses {
            invocation
                .arg(address.address_hash.as_str())
                .arg(serde_json::to_string(address)?);
        }
        let mut conn = self.conn.clone();
        let queued: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(queued.max(0) as usize)
    }

    async fn pop_addresses(
        &self,
        key: GroupKey,
        limit: usize,
    ) -> Result<Vec<Address>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let raw: Vec<String> = scripts::pop_batch()
            .key(self.keys.queue(key))
            .key(self.keys.items(key))
            .arg(limit)
            .invoke_async(&mut conn)
            .await?;
        raw.iter().map(|item| decode_address(item)).collect()
    }

    async fn queue_len(&self, key: GroupKey) -> Result<usize> {
        let mut conn = self.conn.clone();
        let len: usize = conn.hlen(self.keys.items(key)).await?;
        Ok(len)
    }

    async fn filter_new(
        &self,
        key: GroupKey,
        candidates: &[AddressHash],
    ) -> Result<Vec<AddressHash>> {
        let candidates = dedup_in_order(candidates);
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let script = scripts::filter_new();
        let mut invocation = script.key(self.keys.seen(key));
        for hash in &candidates {
            invocation.arg(hash.as_str());
        }
        let mut conn = self.conn.clone();
        let fresh: Vec<String> = invocation.invoke_async(&mut conn).await?;
        fresh
            .into_iter()
            .map(|hash| AddressHash::from_hex(hash).map_err(ScanError::from))
            .collect()
    }

    async fn clear_frontier(&self, key: GroupKey) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .del(vec![
                self.keys.queue(key),
                self.keys.items(key),
                self.keys.seen(key),
            ])
            .await?;
        debug!(target: "scan::store", %key, "frontier cleared");
        Ok(())
    }
}

#[async_trait]
impl GroupStateStore for RedisStateStore {
    async fn group_status(
        &self,
        key: GroupKey,
    ) -> Result<Option<GroupStatusRecord>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> =
            conn.hgetall(self.keys.status(key)).await?;
        decode_status(fields)
    }

    async fn try_start(&self, key: GroupKey) -> Result<Option<RunId>> {
        let run = RunId::new();
        let mut conn = self.conn.clone();
        let started: i64 = scripts::try_start()
            .key(self.keys.status(key))
            .arg(Utc::now().to_rfc3339())
            .arg(run.to_string())
            .invoke_async(&mut conn)
            .await?;
        Ok((started == 1).then_some(run))
    }

    async fn heartbeat(&self, key: GroupKey, run: RunId) -> Result<bool> {
        let mut conn = self.conn.clone();
        let held: i64 = scripts::heartbeat()
            .key(self.keys.status(key))
            .arg(Utc::now().to_rfc3339())
            .arg(run.to_string())
            .invoke_async(&mut conn)
            .await?;
        Ok(held == 1)
    }

    async fn release(&self, key: GroupKey, run: RunId) -> Result<bool> {
        self.set_stopped(key, Some(run)).await
    }

    async fn stop(&self, key: GroupKey) -> Result<()> {
        self.set_stopped(key, None).await?;
        Ok(())
    }

    async fn put_group(&self, group: &ScanGroup) -> Result<()> {
        let key = group.key();
        let payload = serde_json::to_string(group)?;
        let mut conn = self.conn.clone();
        let _: () = conn
            .mset(&[
                (self.keys.config(key), payload),
                (
                    self.keys.config_mtime(key),
                    group.modified_time.timestamp_micros().to_string(),
                ),
            ])
            .await?;
        self.publish(&GroupInvalidation::for_group(group)).await
    }

    async fn put_group_if_newer(&self, group: &ScanGroup) -> Result<bool> {
        let key = group.key();
        let mut conn = self.conn.clone();
        let written: i64 = scripts::put_config_if_newer()
            .key(self.keys.config(key))
            .key(self.keys.config_mtime(key))
            .arg(serde_json::to_string(group)?)
            .arg(group.modified_time.timestamp_micros())
            .invoke_async(&mut conn)
            .await?;
        if written != 1 {
            debug!(target: "scan::store", %key, "stored configuration is as new; write skipped");
            return Ok(false);
        }
        self.publish(&GroupInvalidation::for_group(group)).await?;
        Ok(true)
    }

    async fn get_group(&self, key: GroupKey) -> Result<Option<ScanGroup>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(self.keys.config(key)).await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn delete_group(&self, key: GroupKey) -> Result<()> {
        let existing = self.get_group(key).await?;
        let mut conn = self.conn.clone();
        let _: () = conn
            .del(vec![self.keys.config(key), self.keys.config_mtime(key)])
            .await?;
        let modified_time = existing
            .map(|group| group.modified_time)
            .unwrap_or_else(Utc::now);
        self.publish(&GroupInvalidation::new(key, modified_time)).await
    }
}

#[async_trait]
impl InvalidationBus for RedisStateStore {
    async fn publish_invalidation(
        &self,
        message: GroupInvalidation,
    ) -> Result<()> {
        self.publish(&message).await
    }

    async fn subscribe_invalidations(
        &self,
        buffer: usize,
    ) -> Result<InvalidationSubscription> {
        let channel = self.keys.invalidation_channel();
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(&channel).await?;
        info!(target: "scan::store", %channel, "invalidation subscription live");

        let (tx, rx) = mpsc::channel(buffer.max(1));
        tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!(target: "scan::store", error = %err, "unreadable invalidation payload");
                        continue;
                    }
                };
                let message: GroupInvalidation =
                    match serde_json::from_str(&payload) {
                        Ok(message) => message,
                        Err(err) => {
                            warn!(target: "scan::store", error = %err, "malformed invalidation message");
                            continue;
                        }
                    };
                if tx.send(message).await.is_err() {
                    break;
                }
            }
            debug!(target: "scan::store", "invalidation subscription closed");
        });

        Ok(InvalidationSubscription::new(rx))
    }
}

#[async_trait]
impl RateGate for RedisStateStore {
    async fn try_acquire_gate(
        &self,
        kind: GateKind,
        key: GroupKey,
        ttl: Duration,
        subject: &str,
    ) -> Result<bool> {
        let mut conn = self.conn.clone();
        let acquired: Option<String> = redis::cmd("SET")
            .arg(self.keys.gate(kind, key, subject))
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(acquired.is_some())
    }
}
