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
use std::sync::Arc;

use crate::cache::{
    CacheManager, CategoryPolicyRegistry, L1Cache, L2Cache, ManagerDefaults, MemoryStore,
    ReconnectPolicy,
};
use crate::config::CategoryOverride;

/// 基于 MemoryStore 的完整两级缓存，返回存储句柄以便模拟故障
pub(crate) fn test_manager_with(
    max_items: usize,
    overrides: HashMap<String, CategoryOverride>,
) -> (Arc<MemoryStore>, Arc<CacheManager>) {
    let store = Arc::new(MemoryStore::new());
    let manager = Arc::new(CacheManager::new(
        Arc::new(L1Cache::new(max_items, 16 * 1024 * 1024)),
        L2Cache::new(
            store.clone(),
            ReconnectPolicy {
                max_attempts: 3,
                base_delay: std::time::Duration::from_millis(200),
                max_delay: std::time::Duration::from_secs(2),
            },
        ),
        Arc::new(CategoryPolicyRegistry::from_overrides(&overrides).expect("valid overrides")),
        ManagerDefaults::default(),
    ));
    (store, manager)
}

pub(crate) fn test_manager() -> (Arc<MemoryStore>, Arc<CacheManager>) {
    test_manager_with(1000, HashMap::new())
}
