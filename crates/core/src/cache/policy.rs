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

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::CategoryOverride;
use crate::types::{CoreError, Result};

/// 缓存数据分类。`Default` 是兜底策略，注册表中永远存在
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheCategory {
    Default,
    DashboardSummary,
    InventoryLevels,
    InboundRecords,
    OutboundRecords,
    WarehouseInfo,
    ProductCatalog,
    UserPermissions,
    UserSession,
    ReportData,
    SystemConfig,
}

impl CacheCategory {
    pub const ALL: [CacheCategory; 11] = [
        CacheCategory::Default,
        CacheCategory::DashboardSummary,
        CacheCategory::InventoryLevels,
        CacheCategory::InboundRecords,
        CacheCategory::OutboundRecords,
        CacheCategory::WarehouseInfo,
        CacheCategory::ProductCatalog,
        CacheCategory::UserPermissions,
        CacheCategory::UserSession,
        CacheCategory::ReportData,
        CacheCategory::SystemConfig,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheCategory::Default => "default",
            CacheCategory::DashboardSummary => "dashboard_summary",
            CacheCategory::InventoryLevels => "inventory_levels",
            CacheCategory::InboundRecords => "inbound_records",
            CacheCategory::OutboundRecords => "outbound_records",
            CacheCategory::WarehouseInfo => "warehouse_info",
            CacheCategory::ProductCatalog => "product_catalog",
            CacheCategory::UserPermissions => "user_permissions",
            CacheCategory::UserSession => "user_session",
            CacheCategory::ReportData => "report_data",
            CacheCategory::SystemConfig => "system_config",
        }
    }
}

impl fmt::Display for CacheCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheCategory {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        CacheCategory::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| CoreError::Configuration(format!("Unknown cache category: {}", s)))
    }
}

/// 优先级，按 Low < Medium < High < Critical 排序
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachePriority {
    Low,
    Medium,
    High,
    Critical,
}

impl FromStr for CachePriority {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "critical" => Ok(CachePriority::Critical),
            "high" => Ok(CachePriority::High),
            "medium" => Ok(CachePriority::Medium),
            "low" => Ok(CachePriority::Low),
            other => Err(CoreError::Configuration(format!(
                "Unknown cache priority: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryPolicy {
    pub category: CacheCategory,
    /// None 表示使用管理器的全局默认值
    pub l1_ttl: Option<Duration>,
    pub l2_ttl: Option<Duration>,
    pub priority: CachePriority,
    pub auto_refresh: bool,
    pub preload: bool,
    pub invalidation_triggers: BTreeSet<String>,
}

impl CategoryPolicy {
    fn builtin(
        category: CacheCategory,
        l1_secs: u64,
        l2_secs: u64,
        priority: CachePriority,
        auto_refresh: bool,
        preload: bool,
        triggers: &[&str],
    ) -> Self {
        Self {
            category,
            l1_ttl: Some(Duration::from_secs(l1_secs)),
            l2_ttl: Some(Duration::from_secs(l2_secs)),
            priority,
            auto_refresh,
            preload,
            invalidation_triggers: triggers.iter().map(|t| t.to_string()).collect(),
        }
    }

    fn apply(&mut self, overrides: &CategoryOverride) {
        if let Some(secs) = overrides.l1_ttl_secs {
            self.l1_ttl = Some(Duration::from_secs(secs));
        }
        if let Some(secs) = overrides.l2_ttl_secs {
            self.l2_ttl = Some(Duration::from_secs(secs));
        }
        if let Some(priority) = overrides.priority {
            self.priority = priority;
        }
        if let Some(auto_refresh) = overrides.auto_refresh {
            self.auto_refresh = auto_refresh;
        }
        if let Some(preload) = overrides.preload {
            self.preload = preload;
        }
        if let Some(ref triggers) = overrides.invalidation_triggers {
            self.invalidation_triggers = triggers.iter().cloned().collect();
        }
    }
}

fn builtin_policies() -> Vec<CategoryPolicy> {
    use CacheCategory::*;
    use CachePriority::*;

    const STOCK_EVENTS: &[&str] = &["inventory_change", "inbound_change", "outbound_change"];

    vec![
        CategoryPolicy::builtin(Default, 300, 3600, Low, false, false, &[]),
        CategoryPolicy::builtin(
            DashboardSummary,
            60,
            300,
            Critical,
            true,
            true,
            &[
                "inventory_change",
                "inbound_change",
                "outbound_change",
                "warehouse_change",
            ],
        ),
        CategoryPolicy::builtin(InventoryLevels, 30, 300, Critical, true, true, STOCK_EVENTS),
        CategoryPolicy::builtin(
            InboundRecords,
            120,
            600,
            Medium,
            false,
            false,
            &["inbound_change"],
        ),
        CategoryPolicy::builtin(
            OutboundRecords,
            120,
            600,
            Medium,
            false,
            false,
            &["outbound_change"],
        ),
        CategoryPolicy::builtin(
            WarehouseInfo,
            1800,
            7200,
            High,
            true,
            true,
            &["warehouse_change"],
        ),
        CategoryPolicy::builtin(ProductCatalog, 600, 3600, High, true, true, &["product_change"]),
        CategoryPolicy::builtin(
            UserPermissions,
            300,
            1800,
            High,
            false,
            true,
            &["user_change", "permission_change"],
        ),
        CategoryPolicy::builtin(UserSession, 900, 3600, Medium, false, false, &["user_change"]),
        CategoryPolicy::builtin(ReportData, 600, 3600, Low, false, false, STOCK_EVENTS),
        CategoryPolicy::builtin(
            SystemConfig,
            3600,
            86400,
            Critical,
            true,
            true,
            &["config_change"],
        ),
    ]
}

/// 分类策略注册表，启动时加载，运行期只读
#[derive(Debug, Clone)]
pub struct CategoryPolicyRegistry {
    policies: HashMap<CacheCategory, CategoryPolicy>,
}

impl Default for CategoryPolicyRegistry {
    fn default() -> Self {
        let policies = builtin_policies()
            .into_iter()
            .map(|p| (p.category, p))
            .collect();
        Self { policies }
    }
}

impl CategoryPolicyRegistry {
    /// 在内置策略上叠加配置文件中的覆盖项，未知分类名直接拒绝
    pub fn from_overrides(overrides: &HashMap<String, CategoryOverride>) -> Result<Self> {
        let mut registry = Self::default();
        for (name, category_override) in overrides {
            let category: CacheCategory = name.parse()?;
            if let Some(policy) = registry.policies.get_mut(&category) {
                policy.apply(category_override);
                debug!("Applied policy override for category {}", category);
            }
        }
        registry.validate()?;
        Ok(registry)
    }

    /// 只包含兜底策略之外的指定策略，用于测试或嵌入场景
    pub fn with_policies(policies: impl IntoIterator<Item = CategoryPolicy>) -> Result<Self> {
        let mut registry = Self {
            policies: HashMap::new(),
        };
        for policy in policies {
            registry.policies.insert(policy.category, policy);
        }
        if !registry.policies.contains_key(&CacheCategory::Default) {
            let default = builtin_policies()
                .into_iter()
                .find(|p| p.category == CacheCategory::Default)
                .ok_or_else(|| CoreError::Internal("builtin default policy missing".into()))?;
            registry.policies.insert(CacheCategory::Default, default);
        }
        registry.validate()?;
        Ok(registry)
    }

    fn validate(&self) -> Result<()> {
        if !self.policies.contains_key(&CacheCategory::Default) {
            return Err(CoreError::Configuration(
                "the default category policy is mandatory".to_string(),
            ));
        }
        for policy in self.policies.values() {
            if let (Some(l1), Some(l2)) = (policy.l1_ttl, policy.l2_ttl) {
                if !l1.is_zero() && (l2.is_zero() || l1 > l2) {
                    // 约定 L1 TTL 不大于 L2 TTL，仅提示不拒绝
                    warn!(
                        "Category {} has l1_ttl {:?} longer than l2_ttl {:?}",
                        policy.category, l1, l2
                    );
                }
            }
        }
        Ok(())
    }

    pub fn get_config(&self, category: CacheCategory) -> &CategoryPolicy {
        match self.policies.get(&category) {
            Some(policy) => policy,
            None => self.default_policy(),
        }
    }

    /// 按名称查询，未知名称回退到默认策略
    pub fn get_config_by_name(&self, name: &str) -> &CategoryPolicy {
        match name.parse::<CacheCategory>() {
            Ok(category) => self.get_config(category),
            Err(_) => {
                debug!("Unknown category '{}', using default policy", name);
                self.default_policy()
            }
        }
    }

    fn default_policy(&self) -> &CategoryPolicy {
        // validate() 保证 Default 一定存在
        &self.policies[&CacheCategory::Default]
    }

    /// 返回优先级不低于 `priority` 且需要预热的分类，按 critical > high > medium > low 排序
    pub fn get_preload_items(&self, priority: CachePriority) -> Vec<CacheCategory> {
        let mut items: Vec<&CategoryPolicy> = self
            .policies
            .values()
            .filter(|p| p.preload && p.priority >= priority)
            .collect();
        items.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.category.cmp(&b.category))
        });
        items.into_iter().map(|p| p.category).collect()
    }

    /// 订阅了该领域事件的所有分类
    pub fn categories_for_event(&self, event: &str) -> Vec<CacheCategory> {
        let mut categories: Vec<CacheCategory> = self
            .policies
            .values()
            .filter(|p| p.invalidation_triggers.contains(event))
            .map(|p| p.category)
            .collect();
        categories.sort();
        categories
    }

    pub fn categories(&self) -> impl Iterator<Item = &CategoryPolicy> {
        self.policies.values()
    }
}
