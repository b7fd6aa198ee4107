// Copyright © 2026 Kirky.X
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::cache::l1::ratio;
use crate::cache::{CodecChain, KeyPattern, RemoteStore, StoreUsage};
use crate::config::L2Config;
use crate::types::{CacheValue, CoreError, Result};

/// 重连策略：指数退避，次数封顶
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_config(&L2Config::default())
    }
}

impl ReconnectPolicy {
    pub fn from_config(config: &L2Config) -> Self {
        Self {
            max_attempts: config.reconnect_max_attempts,
            base_delay: Duration::from_millis(config.reconnect_base_delay_ms),
            max_delay: Duration::from_millis(config.reconnect_max_delay_ms),
        }
    }

    /// 第 `attempt` 次重连前的等待时间，从 1 开始计数
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(20);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

#[derive(Debug, Default)]
struct L2Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    errors: AtomicU64,
    connection_errors: AtomicU64,
    serialization_errors: AtomicU64,
    short_circuits: AtomicU64,
    reconnects: AtomicU64,
}

#[derive(Debug)]
struct L2State {
    available: AtomicBool,
    reconnecting: AtomicBool,
    counters: L2Counters,
    last_error: Mutex<Option<String>>,
}

/// 分布式缓存层：编解码 + 可用性标记 + 后台重连
///
/// 连接类错误会把本层标记为不可用并在后台按退避策略重连，
/// 不可用期间所有操作直接返回安全默认值（未命中 / 未写入），不阻塞调用方。
#[derive(Clone)]
pub struct L2Cache {
    store: Arc<dyn RemoteStore>,
    codec: Arc<CodecChain>,
    policy: ReconnectPolicy,
    state: Arc<L2State>,
}

impl std::fmt::Debug for L2Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("L2Cache")
            .field("store", &self.store.name())
            .field("available", &self.is_available())
            .finish_non_exhaustive()
    }
}

impl L2Cache {
    pub fn new(store: Arc<dyn RemoteStore>, policy: ReconnectPolicy) -> Self {
        Self::with_codec(store, CodecChain::default(), policy)
    }

    pub fn with_codec(
        store: Arc<dyn RemoteStore>,
        codec: CodecChain,
        policy: ReconnectPolicy,
    ) -> Self {
        Self {
            store,
            codec: Arc::new(codec),
            policy,
            state: Arc::new(L2State {
                available: AtomicBool::new(true),
                reconnecting: AtomicBool::new(false),
                counters: L2Counters::default(),
                last_error: Mutex::new(None),
            }),
        }
    }

    pub fn is_available(&self) -> bool {
        self.state.available.load(Ordering::SeqCst)
    }

    pub fn is_reconnecting(&self) -> bool {
        self.state.reconnecting.load(Ordering::SeqCst)
    }

    fn short_circuit(&self) -> bool {
        if self.is_available() {
            return false;
        }
        self.state
            .counters
            .short_circuits
            .fetch_add(1, Ordering::Relaxed);
        true
    }

    fn record_failure(&self, op: &str, err: &CoreError) {
        let counters = &self.state.counters;
        counters.errors.fetch_add(1, Ordering::Relaxed);
        *self.state.last_error.lock() = Some(err.to_string());

        if err.is_connection() {
            counters.connection_errors.fetch_add(1, Ordering::Relaxed);
            self.mark_unavailable(op, err);
            return;
        }
        if matches!(err, CoreError::Serialization(_)) {
            counters
                .serialization_errors
                .fetch_add(1, Ordering::Relaxed);
        }
        warn!("L2 {} failed: {}", op, err);
    }

    fn mark_unavailable(&self, op: &str, err: &CoreError) {
        if self.state.available.swap(false, Ordering::SeqCst) {
            warn!("L2 marked unavailable after {} failure: {}", op, err);
        }
        self.schedule_reconnect();
    }

    /// 同一时刻最多一个重连任务
    fn schedule_reconnect(&self) {
        if self
            .state
            .reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let this = self.clone();
                handle.spawn(async move { this.reconnect_loop().await });
            }
            Err(_) => {
                self.state.reconnecting.store(false, Ordering::SeqCst);
                warn!("No async runtime available, L2 reconnect not scheduled");
            }
        }
    }

    async fn reconnect_loop(&self) {
        for attempt in 1..=self.policy.max_attempts {
            let delay = self.policy.delay(attempt);
            debug!(
                "L2 reconnect attempt {}/{} in {:?}",
                attempt, self.policy.max_attempts, delay
            );
            tokio::time::sleep(delay).await;

            match self.store.reconnect().await {
                Ok(()) => {
                    self.state.available.store(true, Ordering::SeqCst);
                    self.state.reconnecting.store(false, Ordering::SeqCst);
                    self.state.counters.reconnects.fetch_add(1, Ordering::Relaxed);
                    info!("L2 ({}) reconnected after {} attempt(s)", self.store.name(), attempt);
                    return;
                }
                Err(e) => {
                    warn!("L2 reconnect attempt {} failed: {}", attempt, e);
                    *self.state.last_error.lock() = Some(e.to_string());
                }
            }
        }

        error!(
            "L2 reconnect gave up after {} attempts, staying unavailable until next health check",
            self.policy.max_attempts
        );
        self.state.reconnecting.store(false, Ordering::SeqCst);
    }

    pub async fn get(&self, key: &str) -> Option<CacheValue> {
        if self.short_circuit() {
            return None;
        }
        let counters = &self.state.counters;

        match self.store.get(key).await {
            Ok(Some(bytes)) => match self.codec.decode(&bytes) {
                Ok(value) => {
                    counters.hits.fetch_add(1, Ordering::Relaxed);
                    debug!("L2 hit: {}", key);
                    Some(value)
                }
                Err(e) => {
                    counters.misses.fetch_add(1, Ordering::Relaxed);
                    self.record_failure("decode", &e);
                    None
                }
            },
            Ok(None) => {
                counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(e) => {
                self.record_failure("get", &e);
                None
            }
        }
    }

    pub async fn set(&self, key: &str, value: &CacheValue, ttl: Duration) -> bool {
        if self.short_circuit() {
            return false;
        }
        let bytes = match self.codec.encode(value) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.record_failure("encode", &e);
                return false;
            }
        };

        match self.store.set(key, bytes, ttl).await {
            Ok(()) => {
                self.state.counters.sets.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                self.record_failure("set", &e);
                false
            }
        }
    }

    pub async fn delete(&self, key: &str) -> bool {
        if self.short_circuit() {
            return false;
        }
        match self.store.delete(key).await {
            Ok(removed) => {
                if removed {
                    self.state.counters.deletes.fetch_add(1, Ordering::Relaxed);
                }
                removed
            }
            Err(e) => {
                self.record_failure("delete", &e);
                false
            }
        }
    }

    pub async fn exists(&self, key: &str) -> bool {
        if self.short_circuit() {
            return false;
        }
        match self.store.exists(key).await {
            Ok(found) => found,
            Err(e) => {
                self.record_failure("exists", &e);
                false
            }
        }
    }

    /// 只有非法模式会返回错误，存储故障按清理 0 条处理
    pub async fn clear(&self, pattern: &str) -> Result<usize> {
        let pattern = KeyPattern::parse(pattern)?;
        Ok(self.clear_matching(&pattern).await)
    }

    pub async fn clear_matching(&self, pattern: &KeyPattern) -> usize {
        if self.short_circuit() {
            return 0;
        }
        match self.store.delete_matching(pattern).await {
            Ok(count) => count,
            Err(e) => {
                self.record_failure("clear", &e);
                0
            }
        }
    }

    /// 批量读取，只返回命中且解码成功的键
    pub async fn mget(&self, keys: &[String]) -> HashMap<String, CacheValue> {
        let mut found = HashMap::new();
        if keys.is_empty() || self.short_circuit() {
            return found;
        }

        let values = match self.store.mget(keys).await {
            Ok(values) => values,
            Err(e) => {
                self.record_failure("mget", &e);
                return found;
            }
        };

        let counters = &self.state.counters;
        for (key, bytes) in keys.iter().zip(values) {
            let Some(bytes) = bytes else {
                counters.misses.fetch_add(1, Ordering::Relaxed);
                continue;
            };
            match self.codec.decode(&bytes) {
                Ok(value) => {
                    counters.hits.fetch_add(1, Ordering::Relaxed);
                    found.insert(key.clone(), value);
                }
                Err(e) => {
                    counters.misses.fetch_add(1, Ordering::Relaxed);
                    self.record_failure("decode", &e);
                }
            }
        }
        found
    }

    /// 批量写入；无法编码的条目跳过并计入错误
    pub async fn mset(&self, items: &HashMap<String, CacheValue>, ttl: Duration) -> bool {
        if items.is_empty() {
            return true;
        }
        if self.short_circuit() {
            return false;
        }

        let mut encoded = Vec::with_capacity(items.len());
        for (key, value) in items {
            match self.codec.encode(value) {
                Ok(bytes) => encoded.push((key.clone(), bytes)),
                Err(e) => self.record_failure("encode", &e),
            }
        }
        if encoded.is_empty() {
            return false;
        }

        let count = encoded.len() as u64;
        match self.store.mset(encoded, ttl).await {
            Ok(()) => {
                self.state.counters.sets.fetch_add(count, Ordering::Relaxed);
                true
            }
            Err(e) => {
                self.record_failure("mset", &e);
                false
            }
        }
    }

    /// 探活。不可用且没有重连任务在跑时（例如上一轮重连已放弃）会重新开始重连
    pub async fn health_check(&self) -> bool {
        match self.store.ping().await {
            Ok(()) => {
                if !self.state.available.swap(true, Ordering::SeqCst) {
                    info!("L2 ({}) healthy again", self.store.name());
                }
                true
            }
            Err(e) => {
                self.record_failure("health_check", &e);
                false
            }
        }
    }

    /// 存储占用；不可用或查询失败时返回 None
    pub async fn usage(&self) -> Option<StoreUsage> {
        if !self.is_available() {
            return None;
        }
        match self.store.usage().await {
            Ok(usage) => Some(usage),
            Err(e) => {
                self.record_failure("usage", &e);
                None
            }
        }
    }

    pub async fn stats(&self) -> L2Stats {
        let usage = self.usage().await;
        let c = &self.state.counters;
        let hits = c.hits.load(Ordering::Relaxed);
        let misses = c.misses.load(Ordering::Relaxed);
        L2Stats {
            backend: self.store.name(),
            available: self.is_available(),
            reconnecting: self.is_reconnecting(),
            hits,
            misses,
            hit_rate: ratio(hits, hits + misses),
            key_count: usage.map(|u| u.key_count),
            memory_estimate: usage.map(|u| u.memory_bytes),
            sets: c.sets.load(Ordering::Relaxed),
            deletes: c.deletes.load(Ordering::Relaxed),
            errors: c.errors.load(Ordering::Relaxed),
            connection_errors: c.connection_errors.load(Ordering::Relaxed),
            serialization_errors: c.serialization_errors.load(Ordering::Relaxed),
            short_circuits: c.short_circuits.load(Ordering::Relaxed),
            reconnects: c.reconnects.load(Ordering::Relaxed),
            last_error: self.state.last_error.lock().clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct L2Stats {
    pub backend: &'static str,
    pub available: bool,
    pub reconnecting: bool,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub key_count: Option<u64>,
    pub memory_estimate: Option<u64>,
    pub sets: u64,
    pub deletes: u64,
    pub errors: u64,
    pub connection_errors: u64,
    pub serialization_errors: u64,
    pub short_circuits: u64,
    pub reconnects: u64,
    pub last_error: Option<String>,
}
