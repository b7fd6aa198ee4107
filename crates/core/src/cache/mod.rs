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

mod codec;
mod entry;
mod invalidation;
mod key;
mod l1;
mod l2;
mod manager;
mod pattern;
mod policy;
mod store;
mod warmer;

// 对外 API：业务代码只依赖 CacheManager、分类与事件路由
pub use invalidation::{
    EventContext, InvalidationReport, InvalidationRouter, InvalidationTarget, PatternOutcome,
};
pub use key::{CacheKey, DEFAULT_MAX_KEY_LEN};
pub use manager::{
    CacheLevel, CacheManager, CacheStatus, CleanupReport, ClearReport, ManagerDefaults,
    OverallStats,
};
pub use policy::{CacheCategory, CachePriority, CategoryPolicy, CategoryPolicyRegistry};
pub use warmer::{FnProducer, WarmAllReport, WarmItem, WarmProducer, WarmReport, Warmer};

// 分层组件，组装或测试时使用
pub use codec::{Codec, CodecChain, JsonCodec, MsgPackCodec, RawCodec};
pub use entry::CacheEntry;
pub use l1::{EvictionCounts, L1Cache, L1Stats};
pub use l2::{L2Cache, L2Stats, ReconnectPolicy};
pub use pattern::KeyPattern;
pub use store::{store_from_config, MemoryStore, RedisStore, RemoteStore, StoreUsage};
