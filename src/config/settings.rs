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

use config::{Config, ConfigBuilder, ConfigError, Environment, File};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// 应用程序配置设置
///
/// 包含服务器、数据库、熔断器、发送、批量、回调、自动化和供应商等所有配置项
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// 服务器配置
    pub server: ServerSettings,
    /// 数据库配置
    pub database: DatabaseSettings,
    /// Redis配置
    pub redis: RedisSettings,
    /// 熔断器配置
    pub circuit_breaker: CircuitBreakerSettings,
    /// 单条发送配置
    pub dispatch: DispatchSettings,
    /// 批量发送配置
    pub bulk: BulkSettings,
    /// 回调配置
    pub webhook: WebhookSettings,
    /// 自动化任务配置
    pub automation: AutomationSettings,
    /// 指标配置
    pub metrics: MetricsSettings,
    /// 日志配置
    pub logging: LoggingSettings,
    /// 供应商配置块，按供应商名称索引
    #[serde(default)]
    pub providers: HashMap<String, HashMap<String, String>>,
}

/// 服务器配置设置
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    /// 服务器监听主机地址
    pub host: String,
    /// 服务器监听端口
    pub port: u16,
    /// 对外可访问的基础URL，用于回调签名校验
    pub public_url: Option<String>,
}

/// 数据库配置设置
#[derive(Debug, Clone, Deserialize)]
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

/// Redis配置设置
#[derive(Debug, Clone, Deserialize)]
pub struct RedisSettings {
    /// Redis连接URL
    pub url: String,
}

/// 熔断器状态存储类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    /// 进程内存储
    Memory,
    /// Redis共享存储
    Redis,
}

/// 熔断器配置设置
#[derive(Debug, Clone, Deserialize)]
pub struct CircuitBreakerSettings {
    /// 打开熔断器的连续失败次数
    pub failure_threshold: u32,
    /// 打开状态持续时间（秒）
    pub open_timeout_secs: u64,
    /// 半开试探窗口（秒）
    pub half_open_window_secs: u64,
    /// 状态存储
    pub store: StoreKind,
}

/// 单条发送配置设置
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchSettings {
    /// 默认供应商
    pub default_provider: String,
    /// WhatsApp 默认供应商
    pub default_whatsapp_provider: Option<String>,
    /// 发送超时时间（秒）
    pub send_timeout_secs: u64,
    /// 是否启用供应商回退
    pub fallback_enabled: bool,
    /// 号码缺少国家码时使用的默认国家码
    pub default_country_code: Option<String>,
    /// 调度工作者数量
    pub workers: usize,
}

/// 批量发送配置设置
#[derive(Debug, Clone, Deserialize)]
pub struct BulkSettings {
    /// 默认分块大小
    pub chunk_size: i32,
    /// 默认分块间隔（秒）
    pub delay_between_batches_secs: i32,
    /// 默认最大重试次数
    pub max_retries: i32,
}

/// 回调配置设置
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookSettings {
    /// 是否要求签名校验通过
    pub require_signature: bool,
    /// 回调记录最大重试次数
    pub max_retries: i32,
    /// 最大退避时间（分钟）
    pub max_backoff_minutes: i64,
}

/// 自动化任务配置设置
#[derive(Debug, Clone, Deserialize)]
pub struct AutomationSettings {
    /// 是否启用
    pub enabled: bool,
    /// 运行间隔（秒）
    pub interval_secs: u64,
    /// 失败消息扫描窗口（小时）
    pub retry_window_hours: i64,
    /// 自动重试次数上限
    pub max_auto_retries: i32,
    /// 队列积压告警阈值
    pub backlog_alert_threshold: u64,
    /// 供应商失败率告警阈值
    pub failure_rate_alert: f64,
    /// 全局成功率告警阈值
    pub success_rate_alert: f64,
    /// 成功率低于该值时自动打开熔断器
    pub auto_open_below: f64,
    /// 成功率高于该值时自动关闭熔断器
    pub auto_close_above: f64,
    /// 计算成功率所需的最小样本数
    pub min_sample_size: u64,
}

/// 指标配置设置
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsSettings {
    /// 是否启用Prometheus导出
    pub enabled: bool,
    /// 监听地址
    pub listen: String,
}

/// 日志配置设置
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSettings {
    /// 是否输出JSON格式
    pub json: bool,
}

impl CircuitBreakerSettings {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_secs(self.open_timeout_secs)
    }

    pub fn half_open_window(&self) -> Duration {
        Duration::from_secs(self.half_open_window_secs)
    }
}

impl DispatchSettings {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }
}

impl Settings {
    /// 创建新的配置实例
    ///
    /// 依次加载代码默认值、`config/default`、`config/{APP_ENVIRONMENT}`
    /// 以及 `MESSENGER__` 前缀的环境变量
    ///
    /// # Returns
    ///
    /// * `Ok(Settings)` - 成功加载的配置
    /// * `Err(ConfigError)` - 配置加载失败
    pub fn new() -> Result<Self, ConfigError> {
        let env = std::env::var("APP_ENVIRONMENT").unwrap_or_else(|_| "default".to_string());
        let builder = Self::defaults()?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            .add_source(Environment::with_prefix("MESSENGER").separator("__"));

        builder.build()?.try_deserialize()
    }

    /// 仅包含代码默认值的配置构建器
    pub fn defaults() -> Result<ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 3000)?
            .set_default("database.url", "sqlite::memory:")?
            .set_default("database.max_connections", 20)?
            .set_default("database.min_connections", 1)?
            .set_default("database.connect_timeout", 10)?
            .set_default("database.idle_timeout", 300)?
            .set_default("redis.url", "redis://127.0.0.1:6379")?
            // Circuit breaker
            .set_default("circuit_breaker.failure_threshold", 5)?
            .set_default("circuit_breaker.open_timeout_secs", 300)?
            .set_default("circuit_breaker.half_open_window_secs", 60)?
            .set_default("circuit_breaker.store", "memory")?
            // Dispatch
            .set_default("dispatch.default_provider", "mocktest")?
            .set_default("dispatch.send_timeout_secs", 30)?
            .set_default("dispatch.fallback_enabled", true)?
            .set_default("dispatch.workers", 4)?
            // Bulk
            .set_default("bulk.chunk_size", 100)?
            .set_default("bulk.delay_between_batches_secs", 1)?
            .set_default("bulk.max_retries", 3)?
            // Webhook
            .set_default("webhook.require_signature", true)?
            .set_default("webhook.max_retries", 5)?
            .set_default("webhook.max_backoff_minutes", 60)?
            // Automation
            .set_default("automation.enabled", true)?
            .set_default("automation.interval_secs", 60)?
            .set_default("automation.retry_window_hours", 24)?
            .set_default("automation.max_auto_retries", 3)?
            .set_default("automation.backlog_alert_threshold", 1000)?
            .set_default("automation.failure_rate_alert", 0.2)?
            .set_default("automation.success_rate_alert", 0.9)?
            .set_default("automation.auto_open_below", 0.5)?
            .set_default("automation.auto_close_above", 0.95)?
            .set_default("automation.min_sample_size", 20)?
            // Observability
            .set_default("metrics.enabled", true)?
            .set_default("metrics.listen", "0.0.0.0:9000")?
            .set_default("logging.json", false)?
            .set_default("providers.mocktest.cost", "0.10")
    }
}
