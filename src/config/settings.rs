// Copyright 2025 Kirky.X
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

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::collections::HashMap;

/// 应用程序配置设置
///
/// 包含数据库、队列、限流、恢复与提供商端点等所有配置项
#[derive(Debug, Deserialize)]
pub struct Settings {
    /// 数据库配置
    pub database: DatabaseSettings,
    /// 队列与调度配置
    pub queue: QueueSettings,
    /// 限流配置
    pub rate_limiting: RateLimitingSettings,
    /// 恢复配置
    pub recovery: RecoverySettings,
    /// 提供商端点配置，按提供商键名索引
    #[serde(default)]
    pub providers: HashMap<String, ProviderEndpointSettings>,
}

/// 数据库配置设置
#[derive(Debug, Deserialize)]
pub struct DatabaseSettings {
    /// 数据库连接URL
    pub url: String,
    /// 最大连接数
    pub max_connections: Option<u32>,
    /// 最小连接数
    pub min_connections: Option<u32>,
    /// 连接超时时间（秒）
    pub connect_timeout: Option<u64>,
    /// 空闲连接超时时间（秒）
    pub idle_timeout: Option<u64>,
}

/// 队列与调度配置设置
#[derive(Debug, Deserialize)]
pub struct QueueSettings {
    /// 轮询间隔（毫秒）
    pub poll_interval_ms: u64,
    /// 单次提供商调用的超时（秒）
    pub invoke_timeout_secs: u64,
    /// 每次扫描取出的任务数上限
    pub batch_size: u64,
    /// 任务保留天数，决定 expires_at
    pub retention_days: i64,
    /// 最大重试次数
    pub max_retries: i32,
    /// 重试退避延迟表（毫秒），超出表长复用最后一项
    pub backoff_ms: Vec<u64>,
}

/// 限流配置设置
///
/// 默认预算：每分钟 60 个请求、90000 个令牌。租户级覆盖在
/// 运行时通过 `update_limits` 写入，不走配置文件。
#[derive(Debug, Deserialize)]
pub struct RateLimitingSettings {
    /// 默认每分钟请求数
    pub default_requests_per_minute: u32,
    /// 默认每分钟令牌数
    pub default_tokens_per_minute: u32,
}

/// 恢复配置设置
#[derive(Debug, Deserialize)]
pub struct RecoverySettings {
    /// 卡住判定阈值（分钟）
    pub stuck_threshold_minutes: i64,
}

/// 提供商端点配置设置
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderEndpointSettings {
    /// API基础URL
    pub base_url: String,
    /// 模型名称
    pub model: String,
}

impl Settings {
    /// 创建新的配置实例
    ///
    /// 从配置文件与环境变量加载配置，支持默认值
    ///
    /// # Returns
    ///
    /// * `Ok(Settings)` - 成功加载的配置
    /// * `Err(ConfigError)` - 配置加载失败
    pub fn new() -> Result<Self, ConfigError> {
        let env = std::env::var("APP_ENVIRONMENT").unwrap_or_else(|_| "default".to_string());
        let builder = Config::builder()
            // Default DB pool settings
            .set_default("database.max_connections", 100)?
            .set_default("database.min_connections", 10)?
            .set_default("database.connect_timeout", 10)?
            .set_default("database.idle_timeout", 300)?
            // Default Queue settings
            .set_default("queue.poll_interval_ms", 100)?
            .set_default("queue.invoke_timeout_secs", 30)?
            .set_default("queue.batch_size", 50)?
            .set_default("queue.retention_days", 30)?
            .set_default("queue.max_retries", 3)?
            .set_default("queue.backoff_ms", vec![1000i64, 2000, 5000])?
            // Default Rate Limiting settings
            .set_default("rate_limiting.default_requests_per_minute", 60)?
            .set_default("rate_limiting.default_tokens_per_minute", 90_000)?
            // Default Recovery settings
            .set_default("recovery.stuck_threshold_minutes", 10)?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            .add_source(Environment::with_prefix("AIQUEUE").separator("__"));

        builder.build()?.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_applied_when_only_url_is_set() {
        std::env::set_var("AIQUEUE__DATABASE__URL", "sqlite::memory:");
        let settings = Settings::new().expect("settings should load from defaults");

        assert_eq!(settings.queue.poll_interval_ms, 100);
        assert_eq!(settings.queue.invoke_timeout_secs, 30);
        assert_eq!(settings.queue.max_retries, 3);
        assert_eq!(settings.queue.backoff_ms, vec![1000, 2000, 5000]);
        assert_eq!(settings.rate_limiting.default_requests_per_minute, 60);
        assert_eq!(settings.rate_limiting.default_tokens_per_minute, 90_000);
        assert_eq!(settings.recovery.stuck_threshold_minutes, 10);
        assert!(settings.providers.is_empty());
    }
}
