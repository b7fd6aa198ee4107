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
use std::net::SocketAddr;
use std::time::Duration;

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::{CacheCategory, CachePriority};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration: {}", _0)]
    MissingRequired(String),

    #[error("Invalid configuration value: {}", _0)]
    InvalidValue(String),

    #[error("Configuration file error: {}", _0)]
    FileError(String),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub name: String,
    pub host: String,
    pub http_port: u16,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: "stockpile".to_string(),
            host: "0.0.0.0".to_string(),
            http_port: 8080,
        }
    }
}

impl AppConfig {
    pub fn http_addr(&self) -> ConfigResult<SocketAddr> {
        format!("{}:{}", self.host, self.http_port)
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{}:{}", self.host, self.http_port)))
    }
}

/// 进程内缓存（L1）配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct L1Config {
    pub max_items: usize,
    pub max_bytes: usize,
    pub sweep_interval_secs: u64,
}

impl Default for L1Config {
    fn default() -> Self {
        Self {
            max_items: 10_000,
            max_bytes: 100 * 1024 * 1024,
            sweep_interval_secs: 60,
        }
    }
}

/// 分布式缓存（L2）配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct L2Config {
    /// 关闭时使用进程内的 MemoryStore 代替 Redis（单实例模式）
    pub enabled: bool,
    pub url: String,
    pub key_prefix: String,
    pub pool_size: usize,
    pub connect_timeout_ms: u64,
    pub op_timeout_ms: u64,
    pub reconnect_max_attempts: u32,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
}

impl Default for L2Config {
    fn default() -> Self {
        Self {
            enabled: true,
            url: "redis://localhost:6379".to_string(),
            key_prefix: "stockpile:".to_string(),
            pool_size: 10,
            connect_timeout_ms: 2000,
            op_timeout_ms: 2000,
            reconnect_max_attempts: 5,
            reconnect_base_delay_ms: 500,
            reconnect_max_delay_ms: 30_000,
        }
    }
}

impl L2Config {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub default_l1_ttl_secs: u64,
    pub default_l2_ttl_secs: u64,
    pub max_key_len: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            default_l1_ttl_secs: 300,
            default_l2_ttl_secs: 3600,
            max_key_len: 200,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub warm_critical_secs: u64,
    pub warm_high_secs: u64,
    pub ttl_sweep_secs: u64,
    /// UTC 时间，格式 HH:MM
    pub deep_cleanup_at: String,
    /// 深度清理时移除超过该时长未访问的 L1 条目
    pub deep_cleanup_idle_secs: u64,
    pub health_check_secs: u64,
    pub shutdown_timeout_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            warm_critical_secs: 30,
            warm_high_secs: 600,
            ttl_sweep_secs: 3600,
            deep_cleanup_at: "03:00".to_string(),
            deep_cleanup_idle_secs: 3600,
            health_check_secs: 900,
            shutdown_timeout_secs: 10,
        }
    }
}

impl SchedulerConfig {
    pub fn deep_cleanup_time(&self) -> ConfigResult<NaiveTime> {
        NaiveTime::parse_from_str(&self.deep_cleanup_at, "%H:%M").map_err(|_| {
            ConfigError::InvalidValue(format!("deep_cleanup_at: {}", self.deep_cleanup_at))
        })
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub include_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
            include_location: true,
        }
    }
}

/// 分类策略的局部覆盖项，未设置的字段保留内置值
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct CategoryOverride {
    pub l1_ttl_secs: Option<u64>,
    pub l2_ttl_secs: Option<u64>,
    pub priority: Option<CachePriority>,
    pub auto_refresh: Option<bool>,
    pub preload: Option<bool>,
    pub invalidation_triggers: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Config {
    pub app: AppConfig,
    pub l1: L1Config,
    pub l2: L2Config,
    pub manager: ManagerConfig,
    pub scheduler: SchedulerConfig,
    pub logging: LoggingConfig,
    pub categories: HashMap<String, CategoryOverride>,
}

impl Config {
    /// 读取 TOML 文件，再用 `STOCKPILE_*` 环境变量覆盖
    pub fn load_from_file(path: &str) -> ConfigResult<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::FileError(e.to_string()))?;

        let mut config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::InvalidValue(e.to_string()))?;
        config.apply_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_env() -> ConfigResult<Self> {
        let mut config = Config::default();
        config.apply_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(name: &str, value: String) -> ConfigResult<T> {
            value
                .parse()
                .map_err(|_| ConfigError::InvalidValue(name.to_string()))
        }

        if let Some(host) = lookup("STOCKPILE_HOST") {
            self.app.host = host;
        }
        if let Some(port) = lookup("STOCKPILE_HTTP_PORT") {
            self.app.http_port = parse("STOCKPILE_HTTP_PORT", port)?;
        }
        if let Some(url) = lookup("STOCKPILE_REDIS_URL") {
            self.l2.url = url;
            self.l2.enabled = true;
        }
        if let Some(max_items) = lookup("STOCKPILE_L1_MAX_ITEMS") {
            self.l1.max_items = parse("STOCKPILE_L1_MAX_ITEMS", max_items)?;
        }
        if let Some(max_bytes) = lookup("STOCKPILE_L1_MAX_BYTES") {
            self.l1.max_bytes = parse("STOCKPILE_L1_MAX_BYTES", max_bytes)?;
        }
        if let Some(level) = lookup("RUST_LOG") {
            self.logging.level = level;
        }
        Ok(())
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.l1.max_items == 0 {
            return Err(ConfigError::InvalidValue(
                "l1.max_items must be greater than 0".to_string(),
            ));
        }
        if self.l1.max_bytes == 0 {
            return Err(ConfigError::InvalidValue(
                "l1.max_bytes must be greater than 0".to_string(),
            ));
        }
        if self.l1.sweep_interval_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "l1.sweep_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.l2.enabled && self.l2.url.is_empty() {
            return Err(ConfigError::MissingRequired("l2.url".to_string()));
        }
        if self.l2.pool_size == 0 {
            return Err(ConfigError::InvalidValue(
                "l2.pool_size must be greater than 0".to_string(),
            ));
        }
        if self.manager.max_key_len < 64 {
            return Err(ConfigError::InvalidValue(
                "manager.max_key_len must be at least 64".to_string(),
            ));
        }
        self.scheduler.deep_cleanup_time()?;

        for name in self.categories.keys() {
            if name.parse::<CacheCategory>().is_err() {
                return Err(ConfigError::InvalidValue(format!(
                    "unknown category '{}'",
                    name
                )));
            }
        }
        Ok(())
    }
}
