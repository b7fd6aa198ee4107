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

use std::time::Duration;

use tokio::time::Instant;

use crate::types::CacheValue;

/// 单层缓存中的条目，由持有它的那一层独占
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub value: CacheValue,
    pub created_at: Instant,
    /// `Duration::ZERO` 表示永不过期
    pub ttl: Duration,
    pub access_count: u64,
    pub last_access: Instant,
    /// 写入时估算的字节数，None 表示未知
    pub size: Option<usize>,
}

impl CacheEntry {
    pub fn new(value: CacheValue, ttl: Duration) -> Self {
        let now = Instant::now();
        let size = value.estimated_size();
        Self {
            value,
            created_at: now,
            ttl,
            access_count: 0,
            last_access: now,
            size,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    pub fn is_expired_at(&self, now: Instant) -> bool {
        !self.ttl.is_zero() && now.saturating_duration_since(self.created_at) >= self.ttl
    }

    pub fn touch(&mut self) {
        self.access_count += 1;
        self.last_access = Instant::now();
    }

    /// 剩余有效期，永不过期时返回 None
    pub fn remaining_ttl(&self) -> Option<Duration> {
        if self.ttl.is_zero() {
            return None;
        }
        Some(self.ttl.saturating_sub(self.created_at.elapsed()))
    }

    pub fn accounted_size(&self) -> usize {
        self.size.unwrap_or(0)
    }
}
