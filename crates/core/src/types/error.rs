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

use derive_more::Display;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Display, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// 分布式缓存不可达或超时
    #[display("Connection error: {}", _0)]
    Connection(String),

    #[display("Serialization error: {}", _0)]
    Serialization(String),

    /// 存储端拒绝了命令（OOM、WRONGTYPE 等），连接本身正常
    #[display("Store error: {}", _0)]
    Store(String),

    /// 非法的清理模式，唯一会返回给调用方的缓存错误
    #[display("Invalid pattern: {}", _0)]
    InvalidPattern(String),

    /// 调用方提供的回源函数失败
    #[display("Fallback error: {}", _0)]
    Fallback(String),

    #[display("Capacity exceeded: {}", _0)]
    CapacityExceeded(String),

    #[display("Configuration error: {}", _0)]
    Configuration(String),

    #[display("Timeout after {} ms", _0)]
    Timeout(u64),

    #[display("Job not found: {}", _0)]
    JobNotFound(String),

    #[display("Internal error: {}", _0)]
    Internal(String),
}

impl CoreError {
    /// 连接类错误会把 L2 标记为不可用
    pub fn is_connection(&self) -> bool {
        matches!(self, CoreError::Connection(_) | CoreError::Timeout(_))
    }
}

impl From<redis::RedisError> for CoreError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_io_error() || e.is_timeout() || e.is_connection_dropped() || e.is_connection_refusal()
        {
            return CoreError::Connection(e.to_string());
        }
        match e.kind() {
            redis::ErrorKind::TypeError => CoreError::Serialization(e.to_string()),
            _ => CoreError::Store(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for CoreError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        CoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for CoreError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        CoreError::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        CoreError::Connection(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
