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

use serde::{Deserialize, Serialize};
use stockpile_core::cache::EventContext;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub l2_available: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: i32,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(code: i32, message: String) -> Self {
        Self { code, message }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClearRequest {
    /// l1 / l2 / both，缺省为 both
    pub level: Option<String>,
    pub pattern: String,
}

/// 指定 `category` 时只预热该分类，否则按 `priority`（缺省 critical）批量预热
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WarmRequest {
    pub category: Option<String>,
    pub priority: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventRequest {
    pub event: String,
    #[serde(default)]
    pub context: EventContext,
}
