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

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, info, warn};

use crate::cache::{CacheCategory, CacheKey, CacheLevel, CacheManager, CategoryPolicyRegistry};

/// 领域事件附带的上下文，例如 `warehouse = 7`
///
/// 反序列化时接受字符串、数字和布尔值，统一保存为字符串。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct EventContext {
    values: BTreeMap<String, String>,
}

impl<'de> Deserialize<'de> for EventContext {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = BTreeMap::<String, serde_json::Value>::deserialize(deserializer)?;
        let mut values = BTreeMap::new();
        for (name, value) in raw {
            let value = match value {
                serde_json::Value::String(s) => s,
                serde_json::Value::Number(n) => n.to_string(),
                serde_json::Value::Bool(b) => b.to_string(),
                other => {
                    return Err(D::Error::custom(format!(
                        "context value '{}' must be a string, number or boolean, got {}",
                        name, other
                    )))
                }
            };
            values.insert(name, value);
        }
        Ok(Self { values })
    }
}

impl EventContext {
    pub const WAREHOUSE: &'static str = "warehouse";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.values.insert(name.into(), value.to_string());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn warehouse(&self) -> Option<&str> {
        self.get(Self::WAREHOUSE)
    }
}

/// 事件命中后要清理的目标
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationTarget {
    /// 整个分类；`warehouse_scoped` 为 true 时可按上下文中的仓库收窄
    Category {
        category: CacheCategory,
        warehouse_scoped: bool,
    },
    /// 固定的键模式
    Pattern(String),
}

impl InvalidationTarget {
    fn patterns_for(&self, context: &EventContext) -> Vec<String> {
        match self {
            InvalidationTarget::Category {
                category,
                warehouse_scoped,
            } => match (warehouse_scoped, context.warehouse()) {
                (true, Some(warehouse)) => vec![
                    CacheKey::warehouse_key(*category, warehouse),
                    CacheKey::warehouse_pattern(*category, warehouse),
                ],
                _ => vec![CacheKey::category_pattern(*category)],
            },
            InvalidationTarget::Pattern(pattern) => vec![pattern.clone()],
        }
    }
}

/// 键中带仓库段的分类
fn is_warehouse_scoped(category: CacheCategory) -> bool {
    matches!(
        category,
        CacheCategory::DashboardSummary
            | CacheCategory::InventoryLevels
            | CacheCategory::InboundRecords
            | CacheCategory::OutboundRecords
            | CacheCategory::WarehouseInfo
            | CacheCategory::ReportData
    )
}

#[derive(Debug, Clone, Serialize)]
pub struct PatternOutcome {
    pub pattern: String,
    pub cleared: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InvalidationReport {
    pub event: String,
    pub outcomes: Vec<PatternOutcome>,
    pub total_cleared: usize,
}

impl InvalidationReport {
    pub fn failed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.error.is_some()).count()
    }
}

/// 领域事件到缓存清理的路由表
///
/// 路由在构造时从分类策略的 `invalidation_triggers` 生成，之后只读。
pub struct InvalidationRouter {
    manager: Arc<CacheManager>,
    routes: HashMap<String, Vec<InvalidationTarget>>,
}

impl InvalidationRouter {
    pub fn new(manager: Arc<CacheManager>) -> Self {
        let routes = Self::routes_from_registry(manager.registry());
        Self { manager, routes }
    }

    fn routes_from_registry(
        registry: &CategoryPolicyRegistry,
    ) -> HashMap<String, Vec<InvalidationTarget>> {
        let mut routes: HashMap<String, Vec<InvalidationTarget>> = HashMap::new();
        for policy in registry.categories() {
            for event in &policy.invalidation_triggers {
                routes
                    .entry(event.clone())
                    .or_default()
                    .push(InvalidationTarget::Category {
                        category: policy.category,
                        warehouse_scoped: is_warehouse_scoped(policy.category),
                    });
            }
        }
        for targets in routes.values_mut() {
            targets.sort_by_key(|t| match t {
                InvalidationTarget::Category { category, .. } => Some(*category),
                InvalidationTarget::Pattern(_) => None,
            });
        }
        routes
    }

    /// 额外挂一个固定模式到某事件上
    pub fn add_pattern(mut self, event: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.routes
            .entry(event.into())
            .or_default()
            .push(InvalidationTarget::Pattern(pattern.into()));
        self
    }

    pub fn targets(&self, event: &str) -> &[InvalidationTarget] {
        self.routes.get(event).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn events(&self) -> Vec<&str> {
        let mut events: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        events.sort_unstable();
        events
    }

    /// 逐个清理事件对应的模式，单个模式失败只记录日志，不影响其余模式
    pub async fn on_event(&self, event: &str, context: &EventContext) -> InvalidationReport {
        let targets = self.targets(event);
        if targets.is_empty() {
            debug!("No invalidation routes for event {}", event);
        }

        let mut outcomes = Vec::with_capacity(targets.len());
        let mut total_cleared = 0;
        for pattern in targets.iter().flat_map(|t| t.patterns_for(context)) {
            match self.manager.clear(CacheLevel::Both, &pattern).await {
                Ok(report) => {
                    total_cleared += report.total_cleared;
                    outcomes.push(PatternOutcome {
                        pattern,
                        cleared: report.total_cleared,
                        error: None,
                    });
                }
                Err(e) => {
                    warn!(
                        "Invalidation of {} for event {} failed: {}",
                        pattern, event, e
                    );
                    outcomes.push(PatternOutcome {
                        pattern,
                        cleared: 0,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        if !outcomes.is_empty() {
            info!(
                "Event {} invalidated {} entries across {} patterns",
                event,
                total_cleared,
                outcomes.len()
            );
        }
        InvalidationReport {
            event: event.to_string(),
            outcomes,
            total_cleared,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{L1Cache, L2Cache, ManagerDefaults, MemoryStore, ReconnectPolicy};
    use crate::types::CacheValue;

    fn router() -> InvalidationRouter {
        let manager = Arc::new(CacheManager::new(
            Arc::new(L1Cache::new(100, 1024 * 1024)),
            L2Cache::new(Arc::new(MemoryStore::new()), ReconnectPolicy::default()),
            Arc::new(CategoryPolicyRegistry::default()),
            ManagerDefaults::default(),
        ));
        InvalidationRouter::new(manager)
    }

    #[test]
    fn test_routes_follow_policy_triggers() {
        let router = router();
        let categories: Vec<CacheCategory> = router
            .targets("inventory_change")
            .iter()
            .filter_map(|t| match t {
                InvalidationTarget::Category { category, .. } => Some(*category),
                InvalidationTarget::Pattern(_) => None,
            })
            .collect();
        assert_eq!(
            categories,
            vec![
                CacheCategory::DashboardSummary,
                CacheCategory::InventoryLevels,
                CacheCategory::ReportData,
            ]
        );
        assert!(router.targets("unknown_event").is_empty());
    }

    #[test]
    fn test_context_narrows_warehouse_scoped_categories() {
        let ctx = EventContext::new().with(EventContext::WAREHOUSE, 7);
        let scoped = InvalidationTarget::Category {
            category: CacheCategory::InventoryLevels,
            warehouse_scoped: true,
        };
        assert_eq!(
            scoped.patterns_for(&ctx),
            vec!["inventory_levels:wh7", "inventory_levels:wh7:*"]
        );

        let global = InvalidationTarget::Category {
            category: CacheCategory::UserPermissions,
            warehouse_scoped: false,
        };
        assert_eq!(global.patterns_for(&ctx), vec!["user_permissions:*"]);
        assert_eq!(
            scoped.patterns_for(&EventContext::new()),
            vec!["inventory_levels:*"]
        );
    }

    #[tokio::test]
    async fn test_bad_pattern_does_not_stop_fan_out() {
        let router = router().add_pattern("config_change", "a*b*c");
        router
            .manager
            .set(
                "system_config:flags",
                CacheValue::from("on"),
                CacheCategory::SystemConfig,
            )
            .await;

        let report = router.on_event("config_change", &EventContext::new()).await;
        assert_eq!(report.failed(), 1);
        assert_eq!(report.outcomes.len(), 2);
        assert!(!router.manager.l1().exists("system_config:flags"));
    }

    #[test]
    fn test_context_serializes_flat() {
        let ctx = EventContext::new().with("warehouse", 7).with("sku", "A-1");
        let json = serde_json::to_value(&ctx).unwrap();
        assert_eq!(json, serde_json::json!({"warehouse": "7", "sku": "A-1"}));
    }

    #[test]
    fn test_context_accepts_numeric_values() {
        let ctx: EventContext =
            serde_json::from_value(serde_json::json!({"warehouse": 7, "urgent": true})).unwrap();
        assert_eq!(ctx.warehouse(), Some("7"));
        assert_eq!(ctx.get("urgent"), Some("true"));

        let nested = serde_json::from_value::<EventContext>(serde_json::json!({"warehouse": [7]}));
        assert!(nested.is_err());
    }
}
