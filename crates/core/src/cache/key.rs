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

use sha2::{Digest, Sha256};

use crate::cache::CacheCategory;

pub const DEFAULT_MAX_KEY_LEN: usize = 200;

/// 缓存键构造器：`{category}:wh{warehouse}:{identity}:{k=v&...}`
///
/// 超过长度上限的键折叠为 `{category}[:wh{warehouse}]:h:{sha256 前 32 位十六进制}`，
/// 分类和仓库前缀保持不变，按分类或仓库清理时仍能命中。
#[derive(Debug, Clone)]
pub struct CacheKey {
    category: CacheCategory,
    warehouse: Option<String>,
    identity: Vec<String>,
    params: Vec<(String, String)>,
    max_len: usize,
}

impl CacheKey {
    pub fn new(category: CacheCategory) -> Self {
        Self {
            category,
            warehouse: None,
            identity: Vec::new(),
            params: Vec::new(),
            max_len: DEFAULT_MAX_KEY_LEN,
        }
    }

    pub fn warehouse(mut self, warehouse: impl ToString) -> Self {
        self.warehouse = Some(warehouse.to_string());
        self
    }

    pub fn id(mut self, identity: impl ToString) -> Self {
        self.identity.push(identity.to_string());
        self
    }

    pub fn param(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.params.push((name.into(), value.to_string()));
        self
    }

    pub fn max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len;
        self
    }

    pub fn build(mut self) -> String {
        let mut key = String::from(self.category.as_str());
        if let Some(ref warehouse) = self.warehouse {
            key.push_str(":wh");
            key.push_str(warehouse);
        }
        for part in &self.identity {
            key.push(':');
            key.push_str(part);
        }
        if !self.params.is_empty() {
            // 参数顺序不影响键
            self.params.sort();
            let joined = self
                .params
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join("&");
            key.push(':');
            key.push_str(&joined);
        }

        if key.len() > self.max_len {
            return Self::collapse(self.category, self.warehouse.as_deref(), &key);
        }
        key
    }

    fn collapse(category: CacheCategory, warehouse: Option<&str>, full_key: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(category.as_str().as_bytes());
        hasher.update(b"\0");
        hasher.update(full_key.as_bytes());
        let digest = hex::encode(hasher.finalize());
        match warehouse {
            Some(warehouse) => format!(
                "{}:wh{}:h:{}",
                category.as_str(),
                warehouse,
                &digest[..32]
            ),
            None => format!("{}:h:{}", category.as_str(), &digest[..32]),
        }
    }

    /// 某分类下所有键的清理模式
    pub fn category_pattern(category: CacheCategory) -> String {
        format!("{}:*", category.as_str())
    }

    /// 某分类下某仓库范围内键的清理模式
    ///
    /// 只带仓库段的键 `{category}:wh{warehouse}` 没有后续分隔符，由
    /// [`CacheKey::warehouse_key`] 单独精确匹配。
    pub fn warehouse_pattern(category: CacheCategory, warehouse: &str) -> String {
        format!("{}:wh{}:*", category.as_str(), warehouse)
    }

    pub fn warehouse_key(category: CacheCategory, warehouse: &str) -> String {
        format!("{}:wh{}", category.as_str(), warehouse)
    }
}
