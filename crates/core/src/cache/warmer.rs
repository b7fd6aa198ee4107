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
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{CacheCategory, CacheManager, CachePriority};
use crate::types::{CacheValue, CoreError, Result};

/// 预热产出的单个条目
#[derive(Debug, Clone, PartialEq)]
pub struct WarmItem {
    pub key: String,
    pub value: CacheValue,
}

impl WarmItem {
    pub fn new(key: impl Into<String>, value: impl Into<CacheValue>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// 某个分类的数据来源，由业务层注册
#[async_trait]
pub trait WarmProducer: Send + Sync {
    async fn produce(&self, category: CacheCategory) -> Result<Vec<WarmItem>>;
}

/// 把异步闭包包装成 `WarmProducer`
pub struct FnProducer<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> WarmProducer for FnProducer<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<Vec<WarmItem>>> + Send,
{
    async fn produce(&self, _category: CacheCategory) -> Result<Vec<WarmItem>> {
        (self.f)().await
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WarmReport {
    pub category: CacheCategory,
    pub warmed_items: usize,
    pub errors: Vec<String>,
    pub duration: Duration,
    /// 百分比，0-100
    pub success_rate: f64,
    pub cancelled: bool,
}

impl WarmReport {
    fn failed(category: CacheCategory, error: String, started: Instant) -> Self {
        Self {
            category,
            warmed_items: 0,
            errors: vec![error],
            duration: started.elapsed(),
            success_rate: 0.0,
            cancelled: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WarmAllReport {
    pub priority: CachePriority,
    pub reports: Vec<WarmReport>,
    /// 需要预热但没有注册数据来源的分类
    pub skipped: Vec<CacheCategory>,
    pub total_warmed: usize,
    pub total_errors: usize,
    pub duration: Duration,
}

/// 缓存预热器：调用注册的数据来源，把结果逐条写入缓存
pub struct Warmer {
    manager: Arc<CacheManager>,
    producers: DashMap<CacheCategory, Arc<dyn WarmProducer>>,
    cancel: CancellationToken,
}

impl Warmer {
    pub fn new(manager: Arc<CacheManager>) -> Self {
        Self::with_cancellation(manager, CancellationToken::new())
    }

    pub fn with_cancellation(manager: Arc<CacheManager>, cancel: CancellationToken) -> Self {
        Self {
            manager,
            producers: DashMap::new(),
            cancel,
        }
    }

    pub fn register(&self, category: CacheCategory, producer: Arc<dyn WarmProducer>) {
        if self.producers.insert(category, producer).is_some() {
            debug!("Replaced warm producer for {}", category);
        }
    }

    pub fn register_fn<F, Fut>(&self, category: CacheCategory, f: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<WarmItem>>> + Send + 'static,
    {
        self.register(category, Arc::new(FnProducer { f }));
    }

    pub fn has_producer(&self, category: CacheCategory) -> bool {
        self.producers.contains_key(&category)
    }

    /// 取消后，进行中的预热在下一个条目前停止
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn warm(&self, category: CacheCategory) -> WarmReport {
        let started = Instant::now();

        let Some(producer) = self.producers.get(&category).map(|p| Arc::clone(p.value())) else {
            return WarmReport::failed(
                category,
                format!("no producer registered for {}", category),
                started,
            );
        };

        let produced = AssertUnwindSafe(producer.produce(category))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(CoreError::Internal("producer panicked".to_string())));
        let items = match produced {
            Ok(items) => items,
            Err(e) => {
                warn!("Warm producer for {} failed: {}", category, e);
                return WarmReport::failed(category, e.to_string(), started);
            }
        };

        let total = items.len();
        let mut warmed_items = 0;
        let mut errors = Vec::new();
        let mut cancelled = false;

        for item in items {
            if self.cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            if self.manager.set(&item.key, item.value, category).await {
                warmed_items += 1;
            } else {
                errors.push(format!("failed to cache {}", item.key));
            }
        }

        let success_rate = if total == 0 {
            if errors.is_empty() {
                100.0
            } else {
                0.0
            }
        } else {
            warmed_items as f64 * 100.0 / total as f64
        };

        let report = WarmReport {
            category,
            warmed_items,
            errors,
            duration: started.elapsed(),
            success_rate,
            cancelled,
        };
        info!(
            "Warmed {} {}/{} items in {:?}",
            category, report.warmed_items, total, report.duration
        );
        report
    }

    /// 预热所有不低于 `priority` 的预加载分类，单个分类失败不影响其余分类
    pub async fn warm_all(&self, priority: CachePriority) -> WarmAllReport {
        let started = Instant::now();
        let mut reports = Vec::new();
        let mut skipped = Vec::new();

        for category in self.manager.registry().get_preload_items(priority) {
            if self.cancel.is_cancelled() {
                debug!("Warm-all cancelled before {}", category);
                break;
            }
            if !self.has_producer(category) {
                skipped.push(category);
                continue;
            }
            reports.push(self.warm(category).await);
        }

        let total_warmed = reports.iter().map(|r| r.warmed_items).sum();
        let total_errors = reports.iter().map(|r| r.errors.len()).sum();
        if !skipped.is_empty() {
            debug!("No producer registered for {:?}", skipped);
        }

        WarmAllReport {
            priority,
            reports,
            skipped,
            total_warmed,
            total_errors,
            duration: started.elapsed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{
        CategoryPolicyRegistry, L1Cache, L2Cache, ManagerDefaults, MemoryStore, ReconnectPolicy,
    };

    fn warmer() -> Warmer {
        let manager = Arc::new(CacheManager::new(
            Arc::new(L1Cache::new(100, 1024 * 1024)),
            L2Cache::new(Arc::new(MemoryStore::new()), ReconnectPolicy::default()),
            Arc::new(CategoryPolicyRegistry::default()),
            ManagerDefaults::default(),
        ));
        Warmer::new(manager)
    }

    #[tokio::test]
    async fn test_missing_producer_is_reported() {
        let warmer = warmer();
        let report = warmer.warm(CacheCategory::ProductCatalog).await;
        assert_eq!(report.warmed_items, 0);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.success_rate, 0.0);
    }

    #[tokio::test]
    async fn test_producer_error_is_captured() {
        let warmer = warmer();
        warmer.register_fn(CacheCategory::WarehouseInfo, || async {
            Err(CoreError::Internal("warehouse service down".to_string()))
        });
        let report = warmer.warm(CacheCategory::WarehouseInfo).await;
        assert_eq!(report.warmed_items, 0);
        assert!(report.errors[0].contains("warehouse service down"));
    }

    #[tokio::test]
    async fn test_warm_all_continues_past_failures() {
        let warmer = warmer();
        warmer.register_fn(CacheCategory::DashboardSummary, || async {
            Ok(vec![WarmItem::new("dashboard_summary:wh1", "ok")])
        });
        warmer.register_fn(CacheCategory::InventoryLevels, || async {
            Err(CoreError::Internal("boom".to_string()))
        });
        warmer.register_fn(CacheCategory::SystemConfig, || async {
            Ok(vec![
                WarmItem::new("system_config:a", "1"),
                WarmItem::new("system_config:b", "2"),
            ])
        });

        let report = warmer.warm_all(CachePriority::Critical).await;
        assert_eq!(report.reports.len(), 3);
        assert_eq!(report.total_warmed, 3);
        assert_eq!(report.total_errors, 1);
        assert!(report.skipped.is_empty());
    }

    #[tokio::test]
    async fn test_warm_all_skips_unregistered() {
        let warmer = warmer();
        let report = warmer.warm_all(CachePriority::High).await;
        assert!(report.reports.is_empty());
        assert!(report.skipped.contains(&CacheCategory::ProductCatalog));
    }

    #[tokio::test]
    async fn test_cancel_stops_between_items() {
        let warmer = warmer();
        warmer.register_fn(CacheCategory::ProductCatalog, || async {
            Ok(vec![WarmItem::new("product_catalog:1", "x")])
        });
        warmer.cancel();
        let report = warmer.warm(CacheCategory::ProductCatalog).await;
        assert!(report.cancelled);
        assert_eq!(report.warmed_items, 0);
    }
}
