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

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::types::{CoreError, Result};

/// 缓存值：结构化数据优先，无法映射为 JSON 的对象退化为二进制
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum CacheValue {
    Json(serde_json::Value),
    Binary(Vec<u8>),
}

impl CacheValue {
    /// 先尝试 JSON，失败时（例如非字符串键的 map）回退到 MessagePack
    pub fn from_serializable<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        match serde_json::to_value(value) {
            Ok(json) => Ok(CacheValue::Json(json)),
            Err(json_err) => match rmp_serde::to_vec(value) {
                Ok(bytes) => Ok(CacheValue::Binary(bytes)),
                Err(bin_err) => Err(CoreError::Serialization(format!(
                    "json: {}, msgpack: {}",
                    json_err, bin_err
                ))),
            },
        }
    }

    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T> {
        match self {
            CacheValue::Json(json) => Ok(serde_json::from_value(json.clone())?),
            CacheValue::Binary(bytes) => Ok(rmp_serde::from_slice(bytes)?),
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            CacheValue::Json(json) => Some(json),
            CacheValue::Binary(_) => None,
        }
    }

    /// 估算内存占用，序列化失败时返回 None（大小未知）
    pub fn estimated_size(&self) -> Option<usize> {
        match self {
            CacheValue::Json(json) => serde_json::to_vec(json).ok().map(|v| v.len()),
            CacheValue::Binary(bytes) => Some(bytes.len()),
        }
    }
}

impl From<serde_json::Value> for CacheValue {
    fn from(value: serde_json::Value) -> Self {
        CacheValue::Json(value)
    }
}

impl From<Vec<u8>> for CacheValue {
    fn from(value: Vec<u8>) -> Self {
        CacheValue::Binary(value)
    }
}

impl From<&str> for CacheValue {
    fn from(value: &str) -> Self {
        CacheValue::Json(serde_json::Value::String(value.to_string()))
    }
}

impl From<String> for CacheValue {
    fn from(value: String) -> Self {
        CacheValue::Json(serde_json::Value::String(value))
    }
}

impl From<i64> for CacheValue {
    fn from(value: i64) -> Self {
        CacheValue::Json(serde_json::Value::from(value))
    }
}
