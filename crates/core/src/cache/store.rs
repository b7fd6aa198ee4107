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

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::MultiplexedConnection;
use serde::Serialize;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::KeyPattern;
use crate::config::L2Config;
use crate::types::{CoreError, Result};

const SCAN_BATCH: usize = 500;
const MAX_IDLE: Duration = Duration::from_secs(300);

/// 存储占用：本实例前缀下的键数和存储端报告的内存字节数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreUsage {
    pub key_count: u64,
    pub memory_bytes: u64,
}

/// PSETEX 不接受 0，亚毫秒 TTL 向上取整到 1ms
fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

/// 分布式存储的最小接口，键不带前缀，由实现自行加前缀
#[async_trait]
pub trait RemoteStore: Send + Sync {
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// `ttl` 为零表示不设置过期时间
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<bool>;

    async fn exists(&self, key: &str) -> Result<bool>;

    async fn delete_matching(&self, pattern: &KeyPattern) -> Result<usize>;

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>>;

    async fn mset(&self, items: Vec<(String, Vec<u8>)>, ttl: Duration) -> Result<()>;

    async fn ping(&self) -> Result<()>;

    async fn usage(&self) -> Result<StoreUsage>;

    /// 丢弃现有连接并重新建立
    async fn reconnect(&self) -> Result<()>;
}

/// Redis 连接池条目
struct PooledConnection {
    connection: MultiplexedConnection,
    last_used: std::time::Instant,
}

impl PooledConnection {
    fn new(connection: MultiplexedConnection) -> Self {
        Self {
            connection,
            last_used: std::time::Instant::now(),
        }
    }

    fn is_stale(&self, max_idle: Duration) -> bool {
        self.last_used.elapsed() > max_idle
    }
}

/// Redis 连接池：懒连接，空闲连接复用，并发数受 `max_size` 限制
struct ConnectionPool {
    client: redis::Client,
    idle: Mutex<Vec<PooledConnection>>,
    permits: Semaphore,
    max_size: usize,
    connect_timeout: Duration,
}

impl ConnectionPool {
    fn new(client: redis::Client, max_size: usize, connect_timeout: Duration) -> Self {
        Self {
            client,
            idle: Mutex::new(Vec::new()),
            permits: Semaphore::new(max_size),
            max_size,
            connect_timeout,
        }
    }

    async fn get(&self) -> Result<MultiplexedConnection> {
        {
            let mut idle = self.idle.lock().await;
            while let Some(pooled) = idle.pop() {
                if !pooled.is_stale(MAX_IDLE) {
                    return Ok(pooled.connection);
                }
            }
        }
        self.connect().await
    }

    async fn connect(&self) -> Result<MultiplexedConnection> {
        match tokio::time::timeout(
            self.connect_timeout,
            self.client.get_multiplexed_async_connection(),
        )
        .await
        {
            Ok(Ok(connection)) => Ok(connection),
            Ok(Err(e)) => Err(CoreError::Connection(format!(
                "Failed to connect to Redis: {}",
                e
            ))),
            Err(_) => Err(CoreError::Timeout(self.connect_timeout.as_millis() as u64)),
        }
    }

    async fn return_(&self, connection: MultiplexedConnection) {
        let mut idle = self.idle.lock().await;
        if idle.len() < self.max_size {
            idle.push(PooledConnection::new(connection));
        }
    }

    async fn reset(&self) {
        self.idle.lock().await.clear();
    }
}

/// 基于 Redis 的分布式存储
pub struct RedisStore {
    pool: ConnectionPool,
    key_prefix: String,
    op_timeout: Duration,
    // 串行化重连，避免重连风暴时重复建池
    reconnect_lock: Mutex<()>,
}

impl RedisStore {
    /// 只校验 URL，不建立连接
    pub fn new(config: &L2Config) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str()).map_err(|e| {
            CoreError::Configuration(format!("Invalid Redis URL '{}': {}", config.url, e))
        })?;

        debug!(
            "RedisStore configured for {} with prefix '{}', pool_size={}",
            config.url, config.key_prefix, config.pool_size
        );

        Ok(Self {
            pool: ConnectionPool::new(client, config.pool_size.max(1), config.connect_timeout()),
            key_prefix: config.key_prefix.clone(),
            op_timeout: config.op_timeout(),
            reconnect_lock: Mutex::new(()),
        })
    }

    fn prefixed(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    /// 从池中取连接执行命令；失败的连接直接丢弃，成功的放回池中
    async fn with_conn<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce(MultiplexedConnection) -> Fut,
        Fut: Future<Output = redis::RedisResult<T>>,
    {
        let _permit = self
            .pool
            .permits
            .acquire()
            .await
            .map_err(|_| CoreError::Connection("Connection pool closed".to_string()))?;
        let connection = self.pool.get().await?;

        match tokio::time::timeout(self.op_timeout, f(connection.clone())).await {
            Ok(Ok(value)) => {
                self.pool.return_(connection).await;
                Ok(value)
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(CoreError::Timeout(self.op_timeout.as_millis() as u64)),
        }
    }
}

#[async_trait]
impl RemoteStore for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let key = self.prefixed(key);
        self.with_conn(|mut conn| async move {
            redis::cmd("GET").arg(&key).query_async(&mut conn).await
        })
        .await
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        let key = self.prefixed(key);
        self.with_conn(|mut conn| async move {
            let mut cmd = if ttl.is_zero() {
                redis::cmd("SET")
            } else {
                redis::cmd("PSETEX")
            };
            cmd.arg(&key);
            if !ttl.is_zero() {
                cmd.arg(ttl_millis(ttl));
            }
            cmd.arg(value);
            cmd.query_async(&mut conn).await
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let key = self.prefixed(key);
        let removed: usize = self
            .with_conn(|mut conn| async move {
                redis::cmd("DEL").arg(&key).query_async(&mut conn).await
            })
            .await?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let key = self.prefixed(key);
        self.with_conn(|mut conn| async move {
            redis::cmd("EXISTS").arg(&key).query_async(&mut conn).await
        })
        .await
    }

    async fn delete_matching(&self, pattern: &KeyPattern) -> Result<usize> {
        if let KeyPattern::Exact(key) = pattern {
            return Ok(usize::from(self.delete(key).await?));
        }

        let glob = pattern.to_redis_glob(&self.key_prefix);
        let glob = glob.as_str();
        let mut cursor: u64 = 0;
        let mut deleted = 0usize;

        loop {
            let (next, keys): (u64, Vec<String>) = self
                .with_conn(|mut conn| async move {
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(glob)
                        .arg("COUNT")
                        .arg(SCAN_BATCH)
                        .query_async(&mut conn)
                        .await
                })
                .await?;

            if !keys.is_empty() {
                let removed: usize = self
                    .with_conn(|mut conn| async move {
                        redis::cmd("DEL").arg(&keys).query_async(&mut conn).await
                    })
                    .await?;
                deleted += removed;
            }

            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        debug!("Redis deleted {} keys matching {}", deleted, glob);
        Ok(deleted)
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let prefixed: Vec<String> = keys.iter().map(|k| self.prefixed(k)).collect();
        self.with_conn(|mut conn| async move {
            redis::cmd("MGET").arg(&prefixed).query_async(&mut conn).await
        })
        .await
    }

    async fn mset(&self, items: Vec<(String, Vec<u8>)>, ttl: Duration) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        for (key, value) in items {
            let key = self.prefixed(&key);
            if ttl.is_zero() {
                pipe.cmd("SET").arg(key).arg(value).ignore();
            } else {
                pipe.cmd("PSETEX")
                    .arg(key)
                    .arg(ttl_millis(ttl))
                    .arg(value)
                    .ignore();
            }
        }

        self.with_conn(|mut conn| async move { pipe.query_async(&mut conn).await })
            .await
    }

    async fn ping(&self) -> Result<()> {
        let pong: String = self
            .with_conn(|mut conn| async move { redis::cmd("PING").query_async(&mut conn).await })
            .await?;
        if pong != "PONG" {
            return Err(CoreError::Connection(format!(
                "Unexpected PING response: {}",
                pong
            )));
        }
        Ok(())
    }

    /// 键数按前缀 SCAN 统计；内存取 `INFO memory` 的 used_memory，是整个 Redis 实例的占用
    async fn usage(&self) -> Result<StoreUsage> {
        let glob = KeyPattern::All.to_redis_glob(&self.key_prefix);
        let glob = glob.as_str();
        let mut cursor: u64 = 0;
        let mut key_count = 0u64;
        loop {
            let (next, keys): (u64, Vec<String>) = self
                .with_conn(|mut conn| async move {
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(glob)
                        .arg("COUNT")
                        .arg(SCAN_BATCH)
                        .query_async(&mut conn)
                        .await
                })
                .await?;
            key_count += keys.len() as u64;
            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        let info: String = self
            .with_conn(|mut conn| async move {
                redis::cmd("INFO").arg("memory").query_async(&mut conn).await
            })
            .await?;
        let memory_bytes = info
            .lines()
            .find_map(|line| line.strip_prefix("used_memory:"))
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or(0);

        Ok(StoreUsage {
            key_count,
            memory_bytes,
        })
    }

    async fn reconnect(&self) -> Result<()> {
        let _guard = self.reconnect_lock.lock().await;
        self.pool.reset().await;
        self.ping().await?;
        info!("Redis connection pool re-established");
        Ok(())
    }
}

/// 进程内的分布式存储替身：单实例部署或测试时使用，可切换在线状态模拟故障
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, (Vec<u8>, Option<Instant>)>,
    offline: AtomicBool,
    reconnect_calls: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_online(&self, online: bool) {
        self.offline.store(!online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        !self.offline.load(Ordering::SeqCst)
    }

    pub fn reconnect_calls(&self) -> usize {
        self.reconnect_calls.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn check_online(&self) -> Result<()> {
        if self.is_online() {
            Ok(())
        } else {
            Err(CoreError::Connection("memory store is offline".to_string()))
        }
    }

    /// 过期条目在读取时移除
    fn live_value(&self, key: &str) -> Option<Vec<u8>> {
        {
            let entry = self.entries.get(key)?;
            match entry.1 {
                Some(deadline) if Instant::now() >= deadline => {}
                _ => return Some(entry.0.clone()),
            }
        }
        self.entries.remove(key);
        None
    }

    fn deadline(ttl: Duration) -> Option<Instant> {
        if ttl.is_zero() {
            None
        } else {
            Some(Instant::now() + ttl)
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check_online()?;
        Ok(self.live_value(key))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        self.check_online()?;
        self.entries
            .insert(key.to_string(), (value, Self::deadline(ttl)));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.check_online()?;
        let live = self.live_value(key).is_some();
        self.entries.remove(key);
        Ok(live)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.check_online()?;
        Ok(self.live_value(key).is_some())
    }

    async fn delete_matching(&self, pattern: &KeyPattern) -> Result<usize> {
        self.check_online()?;
        let now = Instant::now();
        let mut deleted = 0usize;
        self.entries.retain(|key, (_, deadline)| {
            if !pattern.matches(key) {
                return true;
            }
            if deadline.map_or(true, |d| now < d) {
                deleted += 1;
            }
            false
        });
        Ok(deleted)
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        self.check_online()?;
        Ok(keys.iter().map(|k| self.live_value(k)).collect())
    }

    async fn mset(&self, items: Vec<(String, Vec<u8>)>, ttl: Duration) -> Result<()> {
        self.check_online()?;
        let deadline = Self::deadline(ttl);
        for (key, value) in items {
            self.entries.insert(key, (value, deadline));
        }
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.check_online()
    }

    /// 内存按键和值的字节数累加
    async fn usage(&self) -> Result<StoreUsage> {
        self.check_online()?;
        let now = Instant::now();
        let mut usage = StoreUsage::default();
        for entry in self.entries.iter() {
            if entry.value().1.map_or(false, |deadline| now >= deadline) {
                continue;
            }
            usage.key_count += 1;
            usage.memory_bytes += (entry.key().len() + entry.value().0.len()) as u64;
        }
        Ok(usage)
    }

    async fn reconnect(&self) -> Result<()> {
        self.reconnect_calls.fetch_add(1, Ordering::SeqCst);
        if !self.is_online() {
            warn!("Memory store reconnect attempted while offline");
        }
        self.check_online()
    }
}

/// 根据配置选择存储：启用 L2 时使用 Redis，否则使用进程内存储
pub fn store_from_config(config: &L2Config) -> Result<Arc<dyn RemoteStore>> {
    if config.enabled {
        Ok(Arc::new(RedisStore::new(config)?))
    } else {
        info!("L2 disabled, using in-process memory store");
        Ok(Arc::new(MemoryStore::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_memory_store_ttl() {
        let store = MemoryStore::new();
        store
            .set("k", b"v".to_vec(), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(!store.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_store_offline_errors() {
        let store = MemoryStore::new();
        store.set_online(false);
        let err = store.get("k").await.unwrap_err();
        assert!(err.is_connection());
        assert!(store.reconnect().await.is_err());
        assert_eq!(store.reconnect_calls(), 1);

        store.set_online(true);
        assert!(store.reconnect().await.is_ok());
    }

    #[tokio::test]
    async fn test_memory_store_delete_matching() {
        let store = MemoryStore::new();
        for key in ["inventory_levels:wh7:a", "inventory_levels:wh8:a", "user_session:1"] {
            store.set(key, b"v".to_vec(), Duration::ZERO).await.unwrap();
        }
        let pattern = KeyPattern::parse("inventory_levels:wh7:*").unwrap();
        assert_eq!(store.delete_matching(&pattern).await.unwrap(), 1);
        assert_eq!(store.len(), 2);

        assert_eq!(store.delete_matching(&KeyPattern::All).await.unwrap(), 2);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_memory_store_batch() {
        let store = MemoryStore::new();
        store
            .mset(
                vec![
                    ("a".to_string(), b"1".to_vec()),
                    ("b".to_string(), b"2".to_vec()),
                ],
                Duration::ZERO,
            )
            .await
            .unwrap();
        let values = store
            .mget(&["a".to_string(), "missing".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(values, vec![Some(b"1".to_vec()), None, Some(b"2".to_vec())]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_store_usage_skips_expired() {
        let store = MemoryStore::new();
        store.set("ab", b"123".to_vec(), Duration::ZERO).await.unwrap();
        store
            .set("cd", b"4567".to_vec(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(
            store.usage().await.unwrap(),
            StoreUsage {
                key_count: 2,
                memory_bytes: 11,
            }
        );

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(
            store.usage().await.unwrap(),
            StoreUsage {
                key_count: 1,
                memory_bytes: 5,
            }
        );
    }

    #[test]
    fn test_sub_millisecond_ttl_rounds_up() {
        assert_eq!(ttl_millis(Duration::from_micros(300)), 1);
        assert_eq!(ttl_millis(Duration::from_millis(1500)), 1500);
    }

    #[test]
    fn test_redis_store_rejects_bad_url() {
        let config = L2Config {
            url: "not a url".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            RedisStore::new(&config),
            Err(CoreError::Configuration(_))
        ));
    }

    fn redis_config() -> L2Config {
        L2Config {
            url: std::env::var("STOCKPILE_REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            key_prefix: "stockpile-test:".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    #[ignore = "requires a running Redis server"]
    async fn test_redis_store_basic_ops() {
        let store = RedisStore::new(&redis_config()).unwrap();
        store.ping().await.unwrap();

        store
            .set("it:basic", b"pallet".to_vec(), Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(store.get("it:basic").await.unwrap(), Some(b"pallet".to_vec()));
        assert!(store.exists("it:basic").await.unwrap());
        assert!(store.delete("it:basic").await.unwrap());
        assert!(!store.delete("it:basic").await.unwrap());
    }

    #[tokio::test]
    #[ignore = "requires a running Redis server"]
    async fn test_redis_store_scan_delete() {
        let store = RedisStore::new(&redis_config()).unwrap();
        store
            .mset(
                (0..20)
                    .map(|i| (format!("it:scan:{}", i), b"x".to_vec()))
                    .collect(),
                Duration::from_secs(30),
            )
            .await
            .unwrap();
        let pattern = KeyPattern::parse("it:scan:*").unwrap();
        assert_eq!(store.delete_matching(&pattern).await.unwrap(), 20);
    }
}
