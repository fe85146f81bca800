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

use crate::config::settings::AutomationSettings;
use crate::domain::models::message::MessageStatus;
use crate::domain::repositories::batch_repository::BatchRepository;
use crate::domain::repositories::message_repository::{MessageRepository, ProviderStats};
use crate::domain::services::bulk_message_service::BulkMessageService;
use crate::domain::services::delivery_tracker::DeliveryTracker;
use crate::domain::services::messenger_service::MessengerService;
use crate::providers::circuit_breaker::Status;
use crate::providers::health_monitor::ProviderHealthMonitor;
use crate::queue::dispatch_queue::DispatchQueue;
use crate::utils::retry_policy::{is_retryable_failure, RetryPolicy};
use crate::workers::worker::{Worker, WorkerError};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{error, info, warn};

/// 单次扫描处理的最大记录数
const SWEEP_LIMIT: u64 = 500;

/// 负载调整建议的动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RebalanceAction {
    OpenCircuit,
    CloseCircuit,
}

/// 负载调整建议
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommendation {
    pub provider: String,
    pub action: RebalanceAction,
    pub success_rate: f64,
    /// 是否已自动执行
    pub applied: bool,
}

/// 健康告警类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    QueueBacklog,
    ProviderFailureRate,
    GlobalSuccessRate,
    ProviderUnhealthy,
}

/// 健康告警
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthAlert {
    pub kind: AlertKind,
    pub message: String,
}

/// 一次自动化运行的结果
#[derive(Debug, Clone, Default, Serialize)]
pub struct AutomationReport {
    /// 激活的定时消息数
    pub promoted_messages: usize,
    /// 开始处理的定时批次数
    pub promoted_batches: usize,
    /// 自动重新排队的失败消息数
    pub requeued_messages: usize,
    /// 自动重试的批次数
    pub retried_batches: usize,
    /// 处理的半开熔断器
    pub resolved_circuits: Vec<(String, String)>,
    pub recommendations: Vec<Recommendation>,
    pub alerts: Vec<HealthAlert>,
    /// 重新处理成功的回调记录数
    pub reprocessed_webhooks: usize,
    /// 各子任务的错误，互不影响
    pub errors: Vec<String>,
}

/// 自动化循环
///
/// 周期性地执行一组互相独立的维护任务：激活定时消息和批次、
/// 自动重试失败消息、处理过期的半开熔断器、负载调整和健康告警。
/// 任何一个子任务失败都不会阻止其他子任务执行。
pub struct AutomationLoop {
    messages: Arc<dyn MessageRepository>,
    batches: Arc<dyn BatchRepository>,
    messenger: Arc<MessengerService>,
    bulk: Arc<BulkMessageService>,
    tracker: Arc<DeliveryTracker>,
    queue: Arc<dyn DispatchQueue>,
    health_monitor: Option<Arc<ProviderHealthMonitor>>,
    retry_policy: RetryPolicy,
    settings: AutomationSettings,
}

impl AutomationLoop {
    /// 创建新的自动化循环
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        messages: Arc<dyn MessageRepository>,
        batches: Arc<dyn BatchRepository>,
        messenger: Arc<MessengerService>,
        bulk: Arc<BulkMessageService>,
        tracker: Arc<DeliveryTracker>,
        queue: Arc<dyn DispatchQueue>,
        settings: AutomationSettings,
    ) -> Self {
        let retry_policy = RetryPolicy::with_max_retries(settings.max_auto_retries.max(0) as u32);
        Self {
            messages,
            batches,
            messenger,
            bulk,
            tracker,
            queue,
            health_monitor: None,
            retry_policy,
            settings,
        }
    }

    /// 接入供应商健康监控
    pub fn with_health_monitor(mut self, monitor: Arc<ProviderHealthMonitor>) -> Self {
        self.health_monitor = Some(monitor);
        self
    }

    /// 使用自定义的重试退避策略
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// 执行一次全部子任务
    pub async fn run_once(&self) -> AutomationReport {
        let mut report = AutomationReport::default();

        if let Some(count) = isolate(&mut report, "promote_scheduled", self.promote_scheduled()).await
        {
            report.promoted_messages = count;
        }
        if let Some(count) = isolate(&mut report, "promote_batches", self.promote_batches()).await {
            report.promoted_batches = count;
        }
        if let Some(count) = isolate(&mut report, "retry_failed", self.retry_failed_messages()).await
        {
            report.requeued_messages = count;
        }
        if let Some(count) = isolate(&mut report, "retry_batches", self.retry_batches()).await {
            report.retried_batches = count;
        }
        if let Some(count) = isolate(&mut report, "webhook_retry", self.retry_webhooks()).await {
            report.reprocessed_webhooks = count;
        }

        // circuit tasks share one stats snapshot
        match isolate(&mut report, "provider_stats", self.provider_stats()).await {
            Some(stats) => {
                report.resolved_circuits = self.resolve_half_open(&stats).await;
                report.recommendations = self.rebalance(&stats).await;
                if let Some(alerts) =
                    isolate(&mut report, "health_alerts", self.health_alerts(&stats)).await
                {
                    report.alerts = alerts;
                }
            }
            None => {
                if let Some(alerts) =
                    isolate(&mut report, "health_alerts", self.health_alerts(&[])).await
                {
                    report.alerts = alerts;
                }
            }
        }

        info!(
            promoted_messages = report.promoted_messages,
            promoted_batches = report.promoted_batches,
            requeued_messages = report.requeued_messages,
            retried_batches = report.retried_batches,
            alerts = report.alerts.len(),
            errors = report.errors.len(),
            "Automation run finished"
        );
        report
    }

    /// 激活到期的定时消息
    async fn promote_scheduled(&self) -> Result<usize, WorkerError> {
        let due = self
            .messages
            .find_due_scheduled(Utc::now(), SWEEP_LIMIT)
            .await
            .map_err(repository_error)?;

        let mut promoted = 0;
        for message in due {
            let id = message.id;
            match self.messenger.activate_scheduled(message).await {
                Ok(_) => promoted += 1,
                Err(e) => warn!(message_id = %id, "Failed to activate scheduled message: {}", e),
            }
        }
        Ok(promoted)
    }

    /// 开始处理到期的定时批次，每个批次在独立任务中运行
    async fn promote_batches(&self) -> Result<usize, WorkerError> {
        let due = self
            .batches
            .find_due_scheduled(Utc::now())
            .await
            .map_err(repository_error)?;

        let count = due.len();
        for batch in due {
            let bulk = self.bulk.clone();
            tokio::spawn(async move {
                if let Err(e) = bulk.process_batch(batch.id).await {
                    error!(batch_id = %batch.id, "Scheduled batch failed: {}", e);
                }
            });
        }
        Ok(count)
    }

    /// 将可重试的失败消息按退避时间重新排队
    ///
    /// 批次消息由批次重试负责，这里跳过
    async fn retry_failed_messages(&self) -> Result<usize, WorkerError> {
        let since = Utc::now() - ChronoDuration::hours(self.settings.retry_window_hours);
        let failed = self
            .messages
            .find_failed_since(since, self.settings.max_auto_retries, SWEEP_LIMIT)
            .await
            .map_err(repository_error)?;

        let mut requeued = 0;
        for message in failed {
            if message.batch_id.is_some()
                || !is_retryable_failure(
                    message.error_code.as_deref(),
                    message.error_message.as_deref(),
                )
            {
                continue;
            }
            let attempt = message.retry_count.max(0) as u32 + 1;
            if !self.retry_policy.should_retry(attempt - 1) {
                continue;
            }

            let delay = self.retry_policy.calculate_backoff(attempt);
            match self.messenger.requeue_failed(message.id, Some(delay)).await {
                Ok(_) => requeued += 1,
                Err(e) => warn!(message_id = %message.id, "Failed to requeue message: {}", e),
            }
        }
        Ok(requeued)
    }

    /// 重试开启了 retry_failed 的批次中的失败消息
    async fn retry_batches(&self) -> Result<usize, WorkerError> {
        let retryable = self
            .batches
            .find_retryable()
            .await
            .map_err(repository_error)?;

        let mut retried = 0;
        for batch in retryable {
            match self.bulk.retry_failed_messages(batch.id).await {
                Ok(_) => retried += 1,
                Err(e) => warn!(batch_id = %batch.id, "Automatic batch retry failed: {}", e),
            }
        }
        Ok(retried)
    }

    async fn retry_webhooks(&self) -> Result<usize, WorkerError> {
        self.tracker
            .retry_pending_webhooks(SWEEP_LIMIT)
            .await
            .map_err(|e| WorkerError::ServiceError(e.to_string()))
    }

    async fn provider_stats(&self) -> Result<Vec<ProviderStats>, WorkerError> {
        let since = Utc::now() - ChronoDuration::hours(self.settings.retry_window_hours);
        self.messages
            .provider_stats(since)
            .await
            .map_err(repository_error)
    }

    /// 有足够样本时返回成功率
    fn sampled_rate(&self, stats: &ProviderStats) -> Option<f64> {
        if stats.succeeded + stats.failed < self.settings.min_sample_size {
            return None;
        }
        stats.success_rate()
    }

    /// 处理超过试探窗口的半开熔断器
    ///
    /// 样本不足时视为健康
    async fn resolve_half_open(&self, stats: &[ProviderStats]) -> Vec<(String, String)> {
        let by_provider: HashMap<&str, &ProviderStats> =
            stats.iter().map(|s| (s.provider.as_str(), s)).collect();
        let breaker = self.messenger.breaker();

        let mut resolved = Vec::new();
        for provider in self.messenger.registry().configured() {
            let healthy = by_provider
                .get(provider)
                .and_then(|s| self.sampled_rate(s))
                .map(|rate| rate >= self.settings.auto_open_below)
                .unwrap_or(true);
            if let Some(status) = breaker.resolve_stale_half_open(provider, healthy).await {
                resolved.push((provider.to_string(), status.to_string()));
            }
        }
        resolved
    }

    /// 生成负载调整建议，只自动执行明确的情况
    async fn rebalance(&self, stats: &[ProviderStats]) -> Vec<Recommendation> {
        let breaker = self.messenger.breaker();
        let mut recommendations = Vec::new();

        for provider_stats in stats {
            let Some(rate) = self.sampled_rate(provider_stats) else {
                continue;
            };
            let provider = provider_stats.provider.as_str();
            let status = breaker.state(provider).await.status;

            let recommendation = if rate < self.settings.auto_open_below && status != Status::Open
            {
                breaker.force_open(provider).await;
                Some((RebalanceAction::OpenCircuit, true))
            } else if rate > self.settings.auto_close_above && status == Status::Open {
                breaker.reset(provider).await;
                Some((RebalanceAction::CloseCircuit, true))
            } else if rate < self.settings.success_rate_alert && status == Status::Closed {
                Some((RebalanceAction::OpenCircuit, false))
            } else if rate >= self.settings.success_rate_alert && status == Status::Open {
                Some((RebalanceAction::CloseCircuit, false))
            } else {
                None
            };

            if let Some((action, applied)) = recommendation {
                info!(
                    provider = %provider,
                    success_rate = rate,
                    ?action,
                    applied,
                    "Rebalance recommendation"
                );
                recommendations.push(Recommendation {
                    provider: provider.to_string(),
                    action,
                    success_rate: rate,
                    applied,
                });
            }
        }
        recommendations
    }

    /// 检查积压、失败率和成功率阈值
    async fn health_alerts(&self, stats: &[ProviderStats]) -> Result<Vec<HealthAlert>, WorkerError> {
        let mut alerts = Vec::new();

        let queued = self
            .messages
            .count_by_status(MessageStatus::Queued)
            .await
            .map_err(repository_error)?;
        let backlog = (self.queue.depth() as u64).max(queued);
        if backlog > self.settings.backlog_alert_threshold {
            alerts.push(HealthAlert {
                kind: AlertKind::QueueBacklog,
                message: format!(
                    "queue backlog {} exceeds {}",
                    backlog, self.settings.backlog_alert_threshold
                ),
            });
        }

        let (mut succeeded, mut failed) = (0, 0);
        for provider_stats in stats {
            succeeded += provider_stats.succeeded;
            failed += provider_stats.failed;
            if let Some(rate) = self.sampled_rate(provider_stats) {
                let failure_rate = 1.0 - rate;
                if failure_rate > self.settings.failure_rate_alert {
                    alerts.push(HealthAlert {
                        kind: AlertKind::ProviderFailureRate,
                        message: format!(
                            "provider {} failure rate {:.2} exceeds {:.2}",
                            provider_stats.provider, failure_rate, self.settings.failure_rate_alert
                        ),
                    });
                }
            }
        }

        let global = ProviderStats {
            provider: "all".to_string(),
            total: succeeded + failed,
            succeeded,
            failed,
        };
        if let Some(rate) = self.sampled_rate(&global) {
            if rate < self.settings.success_rate_alert {
                alerts.push(HealthAlert {
                    kind: AlertKind::GlobalSuccessRate,
                    message: format!(
                        "global success rate {:.2} below {:.2}",
                        rate, self.settings.success_rate_alert
                    ),
                });
            }
        }

        if let Some(monitor) = &self.health_monitor {
            monitor.perform_health_check().await;
            for info in monitor.unhealthy_providers().await {
                alerts.push(HealthAlert {
                    kind: AlertKind::ProviderUnhealthy,
                    message: format!(
                        "provider {} unhealthy after {} consecutive failures",
                        info.provider, info.consecutive_failures
                    ),
                });
            }
        }

        for alert in &alerts {
            warn!(kind = ?alert.kind, "ALERT: {}", alert.message);
        }
        Ok(alerts)
    }
}

fn repository_error(e: impl std::fmt::Display) -> WorkerError {
    WorkerError::RepositoryError(e.to_string())
}

/// 运行一个子任务，失败时记录到报告而不是中断
async fn isolate<T, F>(report: &mut AutomationReport, task: &str, fut: F) -> Option<T>
where
    F: Future<Output = Result<T, WorkerError>>,
{
    match fut.await {
        Ok(value) => Some(value),
        Err(e) => {
            error!(task = task, "Automation task failed: {}", e);
            report.errors.push(format!("{}: {}", task, e));
            None
        }
    }
}

#[async_trait]
impl Worker for AutomationLoop {
    async fn run(&self) -> Result<(), WorkerError> {
        info!("Automation loop started");

        let mut ticker = interval(Duration::from_secs(self.settings.interval_secs.max(1)));
        loop {
            ticker.tick().await;
            self.run_once().await;
        }
    }

    fn name(&self) -> &str {
        "automation-loop"
    }
}
