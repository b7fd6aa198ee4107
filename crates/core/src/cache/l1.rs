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

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{CacheEntry, KeyPattern};
use crate::config::L1Config;
use crate::types::{CacheValue, Result};

struct L1Inner {
    entries: LruCache<String, CacheEntry>,
    bytes: usize,
}

impl L1Inner {
    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.pop(key)?;
        self.bytes = self.bytes.saturating_sub(entry.accounted_size());
        Some(entry)
    }
}

#[derive(Debug, Default)]
struct L1Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    rejected: AtomicU64,
    capacity_evictions: AtomicU64,
    ttl_evictions: AtomicU64,
}

/// 进程内缓存：LRU 淘汰 + TTL 过期，同时限制条目数与估算字节数。
///
/// 所有操作串行化在同一把锁上，操作均摊 O(1)。
pub struct L1Cache {
    inner: Mutex<L1Inner>,
    max_items: usize,
    max_bytes: usize,
    counters: L1Counters,
}

impl std::fmt::Debug for L1Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("L1Cache")
            .field("max_items", &self.max_items)
            .field("max_bytes", &self.max_bytes)
            .finish_non_exhaustive()
    }
}

impl L1Cache {
    pub fn new(max_items: usize, max_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(L1Inner {
                entries: LruCache::unbounded(),
                bytes: 0,
            }),
            max_items: max_items.max(1),
            max_bytes: max_bytes.max(1),
            counters: L1Counters::default(),
        }
    }

    pub fn from_config(config: &L1Config) -> Self {
        Self::new(config.max_items, config.max_bytes)
    }

    pub fn get(&self, key: &str) -> Option<CacheValue> {
        let mut inner = self.inner.lock();

        let expired = match inner.entries.peek(key) {
            Some(entry) => entry.is_expired(),
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        if expired {
            inner.remove(key);
            self.counters.ttl_evictions.fetch_add(1, Ordering::Relaxed);
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            debug!("L1 entry expired on read: {}", key);
            return None;
        }

        let entry = inner.entries.get_mut(key)?;
        entry.touch();
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        Some(entry.value.clone())
    }

    /// 写入条目；`ttl` 为零表示永不过期。单个条目超过字节上限时拒绝写入
    pub fn set(&self, key: &str, value: CacheValue, ttl: Duration) -> bool {
        let entry = CacheEntry::new(value, ttl);
        let size = entry.accounted_size();
        if entry.size.is_none() {
            debug!("L1 size estimate unavailable for key {}, accounting as 0", key);
        }

        if size > self.max_bytes {
            // 旧值不能留在 L1，否则会遮住 L2 中刚写入的新值
            self.inner.lock().remove(key);
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(
                "L1 rejected key {}: entry of {} bytes exceeds cap of {} bytes",
                key, size, self.max_bytes
            );
            return false;
        }

        let mut inner = self.inner.lock();
        inner.remove(key);

        while inner.entries.len() >= self.max_items || inner.bytes + size > self.max_bytes {
            match inner.entries.pop_lru() {
                Some((evicted_key, evicted)) => {
                    inner.bytes = inner.bytes.saturating_sub(evicted.accounted_size());
                    self.counters
                        .capacity_evictions
                        .fetch_add(1, Ordering::Relaxed);
                    debug!("L1 evicted least recently used key: {}", evicted_key);
                }
                None => break,
            }
        }

        inner.bytes += size;
        inner.entries.push(key.to_string(), entry);
        self.counters.sets.fetch_add(1, Ordering::Relaxed);
        true
    }

    pub fn delete(&self, key: &str) -> bool {
        let removed = self.inner.lock().remove(key).is_some();
        if removed {
            self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// 不更新 LRU 位置，过期条目视为不存在并顺带移除
    pub fn exists(&self, key: &str) -> bool {
        let mut inner = self.inner.lock();
        let expired = match inner.entries.peek(key) {
            Some(entry) => entry.is_expired(),
            None => return false,
        };
        if expired {
            inner.remove(key);
            self.counters.ttl_evictions.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        true
    }

    pub fn clear(&self, pattern: &str) -> Result<usize> {
        let pattern = KeyPattern::parse(pattern)?;
        Ok(self.clear_matching(&pattern))
    }

    pub fn clear_matching(&self, pattern: &KeyPattern) -> usize {
        let mut inner = self.inner.lock();

        if *pattern == KeyPattern::All {
            let count = inner.entries.len();
            inner.entries.clear();
            inner.bytes = 0;
            return count;
        }

        let keys: Vec<String> = inner
            .entries
            .iter()
            .filter(|(k, _)| pattern.matches(k))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &keys {
            inner.remove(key);
        }
        keys.len()
    }

    /// 主动清理所有已过期条目，返回清理数量
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired_at(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            inner.remove(key);
        }
        let count = expired.len();
        self.counters
            .ttl_evictions
            .fetch_add(count as u64, Ordering::Relaxed);
        count
    }

    /// 移除超过 `max_idle` 未被访问的条目（深度清理使用），返回移除数量
    pub fn purge_idle(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let idle: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, e)| now.saturating_duration_since(e.last_access) >= max_idle)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &idle {
            inner.remove(key);
        }
        idle.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> L1Stats {
        let (key_count, memory_estimate) = {
            let inner = self.inner.lock();
            (inner.entries.len(), inner.bytes)
        };
        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        L1Stats {
            hits,
            misses,
            hit_rate: ratio(hits, hits + misses),
            sets: self.counters.sets.load(Ordering::Relaxed),
            deletes: self.counters.deletes.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            key_count,
            memory_estimate,
            max_items: self.max_items,
            max_bytes: self.max_bytes,
            evictions: EvictionCounts {
                capacity: self.counters.capacity_evictions.load(Ordering::Relaxed),
                ttl: self.counters.ttl_evictions.load(Ordering::Relaxed),
            },
        }
    }

    /// 后台定期清理过期条目，空闲时也能回收内存
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // interval 第一次 tick 立即返回
            ticker.tick().await;
            info!("L1 sweeper started with interval {:?}", interval);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let purged = cache.purge_expired();
                        if purged > 0 {
                            debug!("L1 sweeper purged {} expired entries", purged);
                        }
                    }
                }
            }
            info!("L1 sweeper stopped");
        })
    }
}

pub(crate) fn ratio(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EvictionCounts {
    pub capacity: u64,
    pub ttl: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct L1Stats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub sets: u64,
    pub deletes: u64,
    pub rejected: u64,
    pub key_count: usize,
    pub memory_estimate: usize,
    pub max_items: usize,
    pub max_bytes: usize,
    pub evictions: EvictionCounts,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(s: &str) -> CacheValue {
        CacheValue::from(s)
    }

    #[test]
    fn test_set_get_delete() {
        let cache = L1Cache::new(10, 1024 * 1024);
        assert!(cache.set("sku:1", value("a"), Duration::from_secs(60)));
        assert_eq!(cache.get("sku:1"), Some(value("a")));
        assert!(cache.exists("sku:1"));

        assert!(cache.delete("sku:1"));
        assert!(!cache.delete("sku:1"));
        assert_eq!(cache.get("sku:1"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lazy_expiry_on_get() {
        let cache = L1Cache::new(10, 1024 * 1024);
        cache.set("k", value("v"), Duration::from_secs(5));

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(cache.get("k").is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.get("k").is_none());
        assert_eq!(cache.stats().evictions.ttl, 1);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_lru_evicts_oldest_untouched_key() {
        let cache = L1Cache::new(3, 1024 * 1024);
        for i in 1..=3 {
            cache.set(&format!("k{}", i), value("v"), Duration::ZERO);
        }
        // 访问 k2、k3，k1 保持最久未使用
        cache.get("k2");
        cache.get("k3");

        cache.set("k4", value("v"), Duration::ZERO);
        assert!(!cache.exists("k1"));
        assert!(cache.exists("k2"));
        assert!(cache.exists("k3"));
        assert!(cache.exists("k4"));
        assert_eq!(cache.stats().evictions.capacity, 1);
    }

    #[test]
    fn test_lru_insertion_order_without_access() {
        let cache = L1Cache::new(4, 1024 * 1024);
        for i in 1..=6 {
            cache.set(&format!("k{}", i), value("v"), Duration::ZERO);
        }
        assert!(!cache.exists("k1"));
        assert!(!cache.exists("k2"));
        for i in 3..=6 {
            assert!(cache.exists(&format!("k{}", i)));
        }
    }

    #[test]
    fn test_byte_cap_evicts() {
        // 每个值估算 12 字节（10 个字符加引号）
        let cache = L1Cache::new(100, 30);
        cache.set("a", value("0123456789"), Duration::ZERO);
        cache.set("b", value("0123456789"), Duration::ZERO);
        cache.set("c", value("0123456789"), Duration::ZERO);

        assert!(!cache.exists("a"));
        assert!(cache.exists("b"));
        assert!(cache.exists("c"));
        assert!(cache.stats().memory_estimate <= 30);
    }

    #[test]
    fn test_oversized_entry_rejected() {
        let cache = L1Cache::new(100, 8);
        assert!(!cache.set("big", value("way too large"), Duration::ZERO));
        assert_eq!(cache.stats().rejected, 1);
    }

    #[test]
    fn test_oversized_overwrite_drops_previous_value() {
        let cache = L1Cache::new(100, 64);
        assert!(cache.set("k", value("old"), Duration::ZERO));
        assert!(!cache.set("k", value(&"n".repeat(200)), Duration::ZERO));
        assert_eq!(cache.get("k"), None);
        assert_eq!(cache.stats().memory_estimate, 0);
    }

    #[test]
    fn test_overwrite_keeps_single_entry() {
        let cache = L1Cache::new(10, 1024);
        cache.set("k", value("first"), Duration::ZERO);
        cache.set("k", value("second"), Duration::ZERO);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("k"), Some(value("second")));
        assert_eq!(cache.stats().memory_estimate, 8);
    }

    #[test]
    fn test_clear_patterns() {
        let cache = L1Cache::new(100, 1024 * 1024);
        for key in ["inv:wh7:a", "inv:wh7:b", "inv:wh8:a", "user:1"] {
            cache.set(key, value("v"), Duration::ZERO);
        }

        assert_eq!(cache.clear("inv:wh7:*").unwrap(), 2);
        assert!(cache.exists("inv:wh8:a"));
        assert!(cache.exists("user:1"));

        assert_eq!(cache.clear("*:a").unwrap(), 1);
        assert_eq!(cache.clear("user:1").unwrap(), 1);
        assert!(cache.is_empty());

        cache.set("x", value("v"), Duration::ZERO);
        assert_eq!(cache.clear("*").unwrap(), 1);
        assert_eq!(cache.stats().memory_estimate, 0);
    }

    #[test]
    fn test_clear_invalid_pattern_rejected() {
        let cache = L1Cache::new(10, 1024);
        assert!(cache.clear("inv*wh7").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let cache = L1Cache::new(10, 1024);
        cache.set("short", value("v"), Duration::from_secs(1));
        cache.set("long", value("v"), Duration::from_secs(100));
        cache.set("forever", value("v"), Duration::ZERO);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_idle_keeps_recently_read() {
        let cache = L1Cache::new(10, 1024);
        cache.set("cold", value("v"), Duration::ZERO);
        cache.set("warm", value("v"), Duration::ZERO);

        tokio::time::advance(Duration::from_secs(50)).await;
        cache.get("warm");
        tokio::time::advance(Duration::from_secs(20)).await;

        assert_eq!(cache.purge_idle(Duration::from_secs(60)), 1);
        assert!(cache.exists("warm"));
        assert!(!cache.exists("cold"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_purges_without_reads() {
        let cache = Arc::new(L1Cache::new(10, 1024));
        cache.set("short", value("v"), Duration::from_secs(1));

        let cancel = CancellationToken::new();
        let handle = cache.spawn_sweeper(Duration::from_secs(60), cancel.clone());

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(cache.len(), 0);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn test_hit_rate() {
        let cache = L1Cache::new(10, 1024);
        cache.set("k", value("v"), Duration::ZERO);
        cache.get("k");
        cache.get("missing");
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
    }
}
