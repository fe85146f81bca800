// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use super::registry::ProviderRegistry;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use metrics::gauge;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// 供应商健康状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderHealth {
    /// 健康
    Healthy,
    /// 降级
    Degraded,
    /// 不可用
    Unhealthy,
}

/// 供应商健康检查信息
#[derive(Debug, Clone)]
pub struct HealthCheckInfo {
    /// 供应商名称
    pub provider: String,
    /// 健康状态
    pub health: ProviderHealth,
    /// 最后检查时间
    pub last_check: DateTime<Utc>,
    /// 连续失败次数
    pub consecutive_failures: u32,
    /// 探测耗时（毫秒）
    pub response_time_ms: Option<u64>,
    /// 错误信息
    pub error_message: Option<String>,
}

/// 健康检查配置
#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    /// 单次探测超时时间
    pub timeout: Duration,
    /// 最大连续失败次数
    pub max_consecutive_failures: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_consecutive_failures: 3,
        }
    }
}

/// 供应商健康监控器
///
/// 对每个已配置的供应商执行 `is_healthy` 探测并记录连续失败次数
pub struct ProviderHealthMonitor {
    registry: Arc<ProviderRegistry>,
    health_status: RwLock<HashMap<String, HealthCheckInfo>>,
    config: HealthCheckConfig,
}

impl ProviderHealthMonitor {
    /// 创建新的健康监控器
    pub fn new(registry: Arc<ProviderRegistry>, config: HealthCheckConfig) -> Self {
        Self {
            registry,
            health_status: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// 获取所有供应商的健康状态
    pub async fn get_all_health_status(&self) -> HashMap<String, HealthCheckInfo> {
        self.health_status.read().await.clone()
    }

    /// 获取不健康的供应商
    pub async fn unhealthy_providers(&self) -> Vec<HealthCheckInfo> {
        self.health_status
            .read()
            .await
            .values()
            .filter(|info| info.health == ProviderHealth::Unhealthy)
            .cloned()
            .collect()
    }

    /// 执行一轮健康检查
    pub async fn perform_health_check(&self) {
        let names = self.registry.configured();
        let probes = join_all(names.iter().map(|name| self.check_provider(name))).await;

        for (name, info) in names.into_iter().zip(probes) {
            gauge!("provider_healthy", "provider" => name.to_string()).set(
                if info.health == ProviderHealth::Healthy {
                    1.0
                } else {
                    0.0
                },
            );
            self.health_status
                .write()
                .await
                .insert(name.to_string(), info);
        }
    }

    async fn check_provider(&self, name: &str) -> HealthCheckInfo {
        let start = Instant::now();

        let probe = match self.registry.make(name) {
            Ok(adapter) => match tokio::time::timeout(self.config.timeout, adapter.is_healthy()).await
            {
                Ok(true) => Ok(()),
                Ok(false) => Err("health probe failed".to_string()),
                Err(_) => Err("health probe timed out".to_string()),
            },
            Err(e) => Err(e.to_string()),
        };

        match probe {
            Ok(()) => {
                debug!(provider = name, "Provider healthy");
                HealthCheckInfo {
                    provider: name.to_string(),
                    health: ProviderHealth::Healthy,
                    last_check: Utc::now(),
                    consecutive_failures: 0,
                    response_time_ms: Some(start.elapsed().as_millis() as u64),
                    error_message: None,
                }
            }
            Err(error) => {
                let consecutive_failures = self
                    .health_status
                    .read()
                    .await
                    .get(name)
                    .map(|info| info.consecutive_failures + 1)
                    .unwrap_or(1);

                let health = if consecutive_failures >= self.config.max_consecutive_failures {
                    warn!(
                        "ALARM: Provider {} is unhealthy after {} consecutive failures",
                        name, consecutive_failures
                    );
                    ProviderHealth::Unhealthy
                } else {
                    ProviderHealth::Degraded
                };

                HealthCheckInfo {
                    provider: name.to_string(),
                    health,
                    last_check: Utc::now(),
                    consecutive_failures,
                    response_time_ms: None,
                    error_message: Some(error),
                }
            }
        }
    }
}
