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

use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::cache::l1::ratio;
use crate::cache::{
    CacheCategory, CacheKey, CategoryPolicyRegistry, KeyPattern, L1Cache, L1Stats, L2Cache,
    L2Stats,
};
use crate::config::ManagerConfig;
use crate::types::{CacheValue, CoreError, Result};

/// 清理作用的缓存层
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheLevel {
    L1,
    L2,
    #[default]
    Both,
}

impl FromStr for CacheLevel {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "l1" => Ok(CacheLevel::L1),
            "l2" => Ok(CacheLevel::L2),
            "both" => Ok(CacheLevel::Both),
            other => Err(CoreError::Configuration(format!(
                "Unknown cache level: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClearReport {
    pub l1_cleared: usize,
    pub l2_cleared: usize,
    pub total_cleared: usize,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CleanupReport {
    pub expired: usize,
    pub idle: usize,
}

/// 全局默认 TTL，分类策略未指定时使用
#[derive(Debug, Clone)]
pub struct ManagerDefaults {
    pub l1_ttl: Duration,
    pub l2_ttl: Duration,
    pub max_key_len: usize,
}

impl Default for ManagerDefaults {
    fn default() -> Self {
        Self::from_config(&ManagerConfig::default())
    }
}

impl ManagerDefaults {
    pub fn from_config(config: &ManagerConfig) -> Self {
        Self {
            l1_ttl: Duration::from_secs(config.default_l1_ttl_secs),
            l2_ttl: Duration::from_secs(config.default_l2_ttl_secs),
            max_key_len: config.max_key_len,
        }
    }
}

#[derive(Debug, Default)]
struct CacheMetrics {
    l1_hits: AtomicU64,
    l2_hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    errors: AtomicU64,
    fallback_invocations: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct OverallStats {
    pub total_requests: u64,
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub errors: u64,
    pub fallback_count: u64,
    pub hit_rate: f64,
    pub l1_hit_rate: f64,
    pub l2_hit_rate: f64,
    pub miss_rate: f64,
    pub error_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStatus {
    pub l1: L1Stats,
    pub l2: L2Stats,
    pub overall: OverallStats,
    /// L2 不可用时为 true
    pub degraded: bool,
}

enum Lookup {
    L1(CacheValue),
    L2(CacheValue),
    Miss,
}

/// 两级缓存的统一入口，业务代码只和它交互
///
/// 读：L1 → L2（命中后回填 L1）→ 回源函数（结果写入两层）。
/// 写：先 L1 后 L2，任一层成功即视为成功。
/// 两层之间不加锁，并发未命中可能重复回源，最后一次写入生效。
pub struct CacheManager {
    l1: Arc<L1Cache>,
    l2: L2Cache,
    registry: Arc<CategoryPolicyRegistry>,
    defaults: ManagerDefaults,
    metrics: CacheMetrics,
}

impl CacheManager {
    pub fn new(
        l1: Arc<L1Cache>,
        l2: L2Cache,
        registry: Arc<CategoryPolicyRegistry>,
        defaults: ManagerDefaults,
    ) -> Self {
        Self {
            l1,
            l2,
            registry,
            defaults,
            metrics: CacheMetrics::default(),
        }
    }

    pub fn l1(&self) -> &Arc<L1Cache> {
        &self.l1
    }

    pub fn l2(&self) -> &L2Cache {
        &self.l2
    }

    pub fn registry(&self) -> &Arc<CategoryPolicyRegistry> {
        &self.registry
    }

    /// 按配置的键长上限构造缓存键
    pub fn key_builder(&self, category: CacheCategory) -> CacheKey {
        CacheKey::new(category).max_len(self.defaults.max_key_len)
    }

    fn resolve_ttls(
        &self,
        category: CacheCategory,
        l1_ttl: Option<Duration>,
        l2_ttl: Option<Duration>,
    ) -> (Duration, Duration) {
        let policy = self.registry.get_config(category);
        (
            l1_ttl.or(policy.l1_ttl).unwrap_or(self.defaults.l1_ttl),
            l2_ttl.or(policy.l2_ttl).unwrap_or(self.defaults.l2_ttl),
        )
    }

    async fn lookup(&self, key: &str, category: CacheCategory) -> Lookup {
        if let Some(value) = self.l1.get(key) {
            return Lookup::L1(value);
        }

        if let Some(value) = self.l2.get(key).await {
            let (l1_ttl, _) = self.resolve_ttls(category, None, None);
            self.l1.set(key, value.clone(), l1_ttl);
            return Lookup::L2(value);
        }

        Lookup::Miss
    }

    /// 查找阶段的内部故障按 None 处理并计入错误
    async fn guarded_lookup(&self, key: &str, category: CacheCategory) -> Option<Lookup> {
        match AssertUnwindSafe(self.lookup(key, category))
            .catch_unwind()
            .await
        {
            Ok(lookup) => Some(lookup),
            Err(_) => {
                self.metrics.errors.fetch_add(1, Ordering::Relaxed);
                error!("Cache lookup for {} panicked, bypassing cache", key);
                None
            }
        }
    }

    fn record_lookup(&self, key: &str, lookup: Lookup) -> Option<CacheValue> {
        match lookup {
            Lookup::L1(value) => {
                self.metrics.l1_hits.fetch_add(1, Ordering::Relaxed);
                debug!("L1 hit: {}", key);
                Some(value)
            }
            Lookup::L2(value) => {
                self.metrics.l2_hits.fetch_add(1, Ordering::Relaxed);
                debug!("L2 hit: {}, backfilled L1", key);
                Some(value)
            }
            Lookup::Miss => {
                self.metrics.misses.fetch_add(1, Ordering::Relaxed);
                debug!("Cache miss: {}", key);
                None
            }
        }
    }

    /// 只读缓存，不回源
    pub async fn get(&self, key: &str, category: CacheCategory) -> Option<CacheValue> {
        let lookup = self.guarded_lookup(key, category).await?;
        self.record_lookup(key, lookup)
    }

    /// 读缓存，未命中时调用 `fallback` 回源并写回两层
    ///
    /// 回源失败时返回 `CoreError::Fallback`；查找阶段出现内部故障时直接回源，
    /// 此时回源失败只记录日志并返回 None。
    pub async fn get_or_load<F, Fut, E>(
        &self,
        key: &str,
        category: CacheCategory,
        fallback: F,
    ) -> Result<Option<CacheValue>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<Option<CacheValue>, E>>,
        E: Display,
    {
        let Some(lookup) = self.guarded_lookup(key, category).await else {
            self.metrics
                .fallback_invocations
                .fetch_add(1, Ordering::Relaxed);
            return match fallback().await {
                Ok(value) => Ok(value),
                Err(e) => {
                    warn!("Direct fallback for {} failed: {}", key, e);
                    Ok(None)
                }
            };
        };

        if let Some(value) = self.record_lookup(key, lookup) {
            return Ok(Some(value));
        }

        self.metrics
            .fallback_invocations
            .fetch_add(1, Ordering::Relaxed);
        match fallback().await {
            Ok(Some(value)) => {
                self.set(key, value.clone(), category).await;
                Ok(Some(value))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                warn!("Fallback for {} failed: {}", key, e);
                Err(CoreError::Fallback(e.to_string()))
            }
        }
    }

    pub async fn set(&self, key: &str, value: CacheValue, category: CacheCategory) -> bool {
        self.set_with_ttl(key, value, category, None, None).await
    }

    /// 显式 TTL 优先，其次分类策略，最后是全局默认值
    pub async fn set_with_ttl(
        &self,
        key: &str,
        value: CacheValue,
        category: CacheCategory,
        l1_ttl: Option<Duration>,
        l2_ttl: Option<Duration>,
    ) -> bool {
        if key.is_empty() {
            warn!("Rejected cache write with empty key");
            return false;
        }
        let (l1_ttl, l2_ttl) = self.resolve_ttls(category, l1_ttl, l2_ttl);

        let l1_ok = self.l1.set(key, value.clone(), l1_ttl);
        let l2_ok = self.l2.set(key, &value, l2_ttl).await;

        if l1_ok || l2_ok {
            self.metrics.sets.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            self.metrics.errors.fetch_add(1, Ordering::Relaxed);
            warn!("Cache write for {} failed on both tiers", key);
            false
        }
    }

    pub async fn delete(&self, key: &str) -> bool {
        let l1_removed = self.l1.delete(key);
        let l2_removed = self.l2.delete(key).await;
        let removed = l1_removed || l2_removed;
        if removed {
            self.metrics.deletes.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// 非法模式会被拒绝，这是唯一返回给调用方的缓存错误
    pub async fn clear(&self, level: CacheLevel, pattern: &str) -> Result<ClearReport> {
        let pattern = KeyPattern::parse(pattern)?;
        Ok(self.clear_matching(level, &pattern).await)
    }

    pub async fn clear_matching(&self, level: CacheLevel, pattern: &KeyPattern) -> ClearReport {
        let l1_cleared = match level {
            CacheLevel::L1 | CacheLevel::Both => self.l1.clear_matching(pattern),
            CacheLevel::L2 => 0,
        };
        let l2_cleared = match level {
            CacheLevel::L2 | CacheLevel::Both => self.l2.clear_matching(pattern).await,
            CacheLevel::L1 => 0,
        };

        debug!(
            "Cleared {} (L1) + {} (L2) entries matching {}",
            l1_cleared, l2_cleared, pattern
        );
        ClearReport {
            l1_cleared,
            l2_cleared,
            total_cleared: l1_cleared + l2_cleared,
        }
    }

    pub async fn get_as<T: DeserializeOwned>(
        &self,
        key: &str,
        category: CacheCategory,
    ) -> Option<T> {
        let value = self.get(key, category).await?;
        match value.deserialize() {
            Ok(typed) => Some(typed),
            Err(e) => {
                self.metrics.errors.fetch_add(1, Ordering::Relaxed);
                warn!("Cached value for {} has unexpected shape: {}", key, e);
                None
            }
        }
    }

    pub async fn set_as<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        category: CacheCategory,
    ) -> bool {
        match CacheValue::from_serializable(value) {
            Ok(value) => self.set(key, value, category).await,
            Err(e) => {
                self.metrics.errors.fetch_add(1, Ordering::Relaxed);
                warn!("Failed to serialize value for {}: {}", key, e);
                false
            }
        }
    }

    pub fn purge_expired(&self) -> usize {
        self.l1.purge_expired()
    }

    /// 深度清理：移除过期条目，再移除长时间未访问的条目
    pub fn deep_cleanup(&self, max_idle: Duration) -> CleanupReport {
        let report = CleanupReport {
            expired: self.l1.purge_expired(),
            idle: self.l1.purge_idle(max_idle),
        };
        info!(
            "Deep cleanup removed {} expired and {} idle L1 entries",
            report.expired, report.idle
        );
        report
    }

    pub async fn health_check(&self) -> bool {
        self.l2.health_check().await
    }

    pub async fn status(&self) -> CacheStatus {
        let m = &self.metrics;
        let l1_hits = m.l1_hits.load(Ordering::Relaxed);
        let l2_hits = m.l2_hits.load(Ordering::Relaxed);
        let misses = m.misses.load(Ordering::Relaxed);
        let errors = m.errors.load(Ordering::Relaxed);
        let total_requests = l1_hits + l2_hits + misses;

        let l2 = self.l2.stats().await;
        CacheStatus {
            degraded: !l2.available,
            l1: self.l1.stats(),
            l2,
            overall: OverallStats {
                total_requests,
                l1_hits,
                l2_hits,
                misses,
                sets: m.sets.load(Ordering::Relaxed),
                deletes: m.deletes.load(Ordering::Relaxed),
                errors,
                fallback_count: m.fallback_invocations.load(Ordering::Relaxed),
                hit_rate: ratio(l1_hits + l2_hits, total_requests),
                l1_hit_rate: ratio(l1_hits, total_requests),
                l2_hit_rate: ratio(l2_hits, total_requests),
                miss_rate: ratio(misses, total_requests),
                error_rate: ratio(errors, total_requests),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{MemoryStore, ReconnectPolicy};
    use crate::cache::store::RemoteStore;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn manager() -> (Arc<MemoryStore>, CacheManager) {
        let store = Arc::new(MemoryStore::new());
        let manager = CacheManager::new(
            Arc::new(L1Cache::new(100, 1024 * 1024)),
            L2Cache::new(store.clone(), ReconnectPolicy::default()),
            Arc::new(CategoryPolicyRegistry::default()),
            ManagerDefaults::default(),
        );
        (store, manager)
    }

    #[tokio::test]
    async fn test_set_then_get_hits_l1() {
        let (_, manager) = manager();
        let value = CacheValue::Json(json!({"open_orders": 12}));
        assert!(
            manager
                .set("dashboard_summary:wh1", value.clone(), CacheCategory::DashboardSummary)
                .await
        );
        assert_eq!(
            manager
                .get("dashboard_summary:wh1", CacheCategory::DashboardSummary)
                .await,
            Some(value)
        );
        assert_eq!(manager.status().await.overall.l1_hits, 1);
    }

    #[test]
    fn test_key_builder_uses_configured_limit() {
        let manager = CacheManager::new(
            Arc::new(L1Cache::new(10, 1024)),
            L2Cache::new(Arc::new(MemoryStore::new()), ReconnectPolicy::default()),
            Arc::new(CategoryPolicyRegistry::default()),
            ManagerDefaults {
                max_key_len: 24,
                ..ManagerDefaults::default()
            },
        );
        let key = manager
            .key_builder(CacheCategory::ReportData)
            .warehouse(7)
            .id("monthly-throughput")
            .build();
        assert!(key.starts_with("report_data:wh7:h:"));
    }

    #[tokio::test]
    async fn test_l2_hit_backfills_l1() {
        let (_, manager) = manager();
        manager
            .set("product_catalog:1", CacheValue::from("widget"), CacheCategory::ProductCatalog)
            .await;
        manager.l1().delete("product_catalog:1");

        let value = manager
            .get("product_catalog:1", CacheCategory::ProductCatalog)
            .await;
        assert_eq!(value, Some(CacheValue::from("widget")));
        assert!(manager.l1().exists("product_catalog:1"));

        let overall = manager.status().await.overall;
        assert_eq!(overall.l2_hits, 1);
        assert_eq!(overall.l1_hits, 0);
    }

    #[tokio::test]
    async fn test_fallback_populates_both_tiers() {
        let (store, manager) = manager();
        let calls = AtomicUsize::new(0);

        let loaded = manager
            .get_or_load("warehouse_info:3", CacheCategory::WarehouseInfo, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, CoreError>(Some(CacheValue::from("north depot")))
            })
            .await
            .unwrap();
        assert_eq!(loaded, Some(CacheValue::from("north depot")));
        assert!(manager.l1().exists("warehouse_info:3"));
        assert!(store.exists("warehouse_info:3").await.unwrap());

        // 第二次直接命中，不再回源
        manager
            .get_or_load("warehouse_info:3", CacheCategory::WarehouseInfo, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, CoreError>(None)
            })
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let overall = manager.status().await.overall;
        assert_eq!(overall.misses, 1);
        assert_eq!(overall.fallback_count, 1);
    }

    #[tokio::test]
    async fn test_fallback_error_surfaces_when_nothing_cached() {
        let (_, manager) = manager();
        let result = manager
            .get_or_load("report_data:q3", CacheCategory::ReportData, || async {
                Err::<Option<CacheValue>, _>("report service down")
            })
            .await;
        assert!(matches!(result, Err(CoreError::Fallback(_))));
    }

    #[tokio::test]
    async fn test_fallback_none_is_not_cached() {
        let (_, manager) = manager();
        let result = manager
            .get_or_load("user_session:x", CacheCategory::UserSession, || async {
                Ok::<_, CoreError>(None)
            })
            .await
            .unwrap();
        assert_eq!(result, None);
        assert!(!manager.l1().exists("user_session:x"));
    }

    #[tokio::test]
    async fn test_explicit_ttl_overrides_policy() {
        let (_, manager) = manager();
        let (l1, l2) = manager.resolve_ttls(
            CacheCategory::DashboardSummary,
            Some(Duration::from_secs(1)),
            None,
        );
        assert_eq!(l1, Duration::from_secs(1));
        assert_eq!(l2, Duration::from_secs(300));

        let (l1, l2) = manager.resolve_ttls(CacheCategory::Default, None, None);
        assert_eq!(l1, Duration::from_secs(300));
        assert_eq!(l2, Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let (_, manager) = manager();
        manager
            .set("k", CacheValue::from("v"), CacheCategory::Default)
            .await;
        assert!(manager.delete("k").await);
        assert!(!manager.delete("k").await);
        assert_eq!(manager.get("k", CacheCategory::Default).await, None);
    }

    #[tokio::test]
    async fn test_clear_levels() {
        let (store, manager) = manager();
        for key in ["inbound_records:wh1:a", "inbound_records:wh1:b", "user_session:9"] {
            manager
                .set(key, CacheValue::from("v"), CacheCategory::InboundRecords)
                .await;
        }

        let report = manager
            .clear(CacheLevel::L1, "inbound_records:*")
            .await
            .unwrap();
        assert_eq!(report.l1_cleared, 2);
        assert_eq!(report.l2_cleared, 0);
        assert_eq!(store.len(), 3);

        let report = manager.clear(CacheLevel::Both, "*").await.unwrap();
        assert_eq!(report.l1_cleared, 1);
        assert_eq!(report.l2_cleared, 3);
        assert_eq!(report.total_cleared, 4);

        assert!(matches!(
            manager.clear(CacheLevel::Both, "").await,
            Err(CoreError::InvalidPattern(_))
        ));
    }

    #[tokio::test]
    async fn test_typed_helpers() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Permissions {
            roles: Vec<String>,
        }

        let (_, manager) = manager();
        let perms = Permissions {
            roles: vec!["picker".to_string(), "auditor".to_string()],
        };
        assert!(
            manager
                .set_as("user_permissions:42", &perms, CacheCategory::UserPermissions)
                .await
        );
        let back: Option<Permissions> = manager
            .get_as("user_permissions:42", CacheCategory::UserPermissions)
            .await;
        assert_eq!(back, Some(perms));

        let wrong: Option<u64> = manager
            .get_as("user_permissions:42", CacheCategory::UserPermissions)
            .await;
        assert_eq!(wrong, None);
        assert_eq!(manager.status().await.overall.errors, 1);
    }

    /// 读操作在存储内部 panic，用来触发查找阶段的故障路径
    struct FaultyStore;

    #[async_trait::async_trait]
    impl crate::cache::RemoteStore for FaultyStore {
        fn name(&self) -> &'static str {
            "faulty"
        }

        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
            panic!("store read fault")
        }

        async fn set(&self, _key: &str, _value: Vec<u8>, _ttl: Duration) -> Result<()> {
            Ok(())
        }

        async fn delete(&self, _key: &str) -> Result<bool> {
            Ok(false)
        }

        async fn exists(&self, _key: &str) -> Result<bool> {
            Ok(false)
        }

        async fn delete_matching(&self, _pattern: &KeyPattern) -> Result<usize> {
            Ok(0)
        }

        async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
            Ok(vec![None; keys.len()])
        }

        async fn mset(&self, _items: Vec<(String, Vec<u8>)>, _ttl: Duration) -> Result<()> {
            Ok(())
        }

        async fn ping(&self) -> Result<()> {
            Ok(())
        }

        async fn usage(&self) -> Result<crate::cache::StoreUsage> {
            Ok(Default::default())
        }

        async fn reconnect(&self) -> Result<()> {
            Ok(())
        }
    }

    fn faulty_manager() -> CacheManager {
        CacheManager::new(
            Arc::new(L1Cache::new(100, 1024 * 1024)),
            L2Cache::new(Arc::new(FaultyStore), ReconnectPolicy::default()),
            Arc::new(CategoryPolicyRegistry::default()),
            ManagerDefaults::default(),
        )
    }

    #[tokio::test]
    async fn test_lookup_fault_calls_fallback_directly() {
        let manager = faulty_manager();
        let value = manager
            .get_or_load("report_data:weekly", CacheCategory::ReportData, || async {
                Ok::<_, CoreError>(Some(CacheValue::from("computed")))
            })
            .await
            .unwrap();
        assert_eq!(value, Some(CacheValue::from("computed")));

        let overall = manager.status().await.overall;
        assert_eq!(overall.errors, 1);
        assert_eq!(overall.fallback_count, 1);
        assert_eq!(overall.misses, 0);
        // 绕过缓存的回源结果不写回
        assert!(!manager.l1().exists("report_data:weekly"));
    }

    #[tokio::test]
    async fn test_lookup_fault_with_failing_fallback_is_absent() {
        let manager = faulty_manager();
        let value = manager
            .get_or_load("report_data:weekly", CacheCategory::ReportData, || async {
                Err::<Option<CacheValue>, _>(CoreError::Internal("backend down".to_string()))
            })
            .await;
        assert!(matches!(value, Ok(None)));
        assert_eq!(manager.status().await.overall.errors, 1);

        assert_eq!(
            manager
                .get("report_data:weekly", CacheCategory::ReportData)
                .await,
            None
        );
        assert_eq!(manager.status().await.overall.errors, 2);
    }

    #[tokio::test]
    async fn test_status_includes_l2_usage() {
        let (_, manager) = manager();
        manager
            .set("product_catalog:1", CacheValue::from("widget"), CacheCategory::ProductCatalog)
            .await;
        let status = manager.status().await;
        assert_eq!(status.l2.key_count, Some(1));
        assert!(status.l2.memory_estimate.is_some());
    }

    #[test]
    fn test_cache_level_parse() {
        assert_eq!("l1".parse::<CacheLevel>().unwrap(), CacheLevel::L1);
        assert_eq!("both".parse::<CacheLevel>().unwrap(), CacheLevel::Both);
        assert!("l3".parse::<CacheLevel>().is_err());
    }
}
