// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use crate::config::settings::CircuitBreakerSettings;
use crate::infrastructure::cache::kv_store::KeyValueStore;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// CAS 冲突时的最大重试次数
const MAX_CAS_ATTEMPTS: usize = 16;

/// 熔断器配置
#[derive(Clone, Debug)]
pub struct CircuitConfig {
    /// 失败阈值
    pub failure_threshold: u32,
    /// 打开后允许半开试探前的等待时间
    pub open_timeout: Duration,
    /// 半开试探的最长等待时间，超过后由自动化任务处理
    pub half_open_window: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout: Duration::from_secs(300),
            half_open_window: Duration::from_secs(60),
        }
    }
}

impl From<&CircuitBreakerSettings> for CircuitConfig {
    fn from(settings: &CircuitBreakerSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold,
            open_timeout: settings.open_timeout(),
            half_open_window: settings.half_open_window(),
        }
    }
}

/// 熔断器状态枚举
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// 关闭状态
    #[default]
    Closed,
    /// 打开状态
    Open,
    /// 半开状态
    HalfOpen,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Closed => write!(f, "closed"),
            Status::Open => write!(f, "open"),
            Status::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// 一次放行判断的结果
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Admission {
    /// 正常放行
    Allowed,
    /// 半开试探，携带进入半开的时间。调用方必须记录结果或归还试探
    Trial(DateTime<Utc>),
    /// 拒绝
    Rejected,
}

impl Admission {
    pub fn is_allowed(self) -> bool {
        self != Admission::Rejected
    }
}

/// 单个供应商的熔断器状态
///
/// 以JSON形式保存在共享键值存储中
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Default)]
pub struct CircuitState {
    /// 当前状态
    pub status: Status,
    /// 连续失败次数
    pub failure_count: u32,
    /// 打开时间，仅在打开或半开时存在
    pub opened_at: Option<DateTime<Utc>>,
    /// 进入半开的时间
    pub half_opened_at: Option<DateTime<Utc>>,
    /// 最近一次失败时间
    pub last_failure_at: Option<DateTime<Utc>>,
}

impl CircuitState {
    fn close(&mut self) {
        self.status = Status::Closed;
        self.failure_count = 0;
        self.opened_at = None;
        self.half_opened_at = None;
    }

    fn open(&mut self, now: DateTime<Utc>) {
        self.status = Status::Open;
        self.opened_at = Some(now);
        self.half_opened_at = None;
    }
}

/// 熔断器
///
/// 每个供应商一个关闭/打开/半开状态机。状态保存在注入的键值存储中，
/// 所有读改写都通过比较并交换完成，并发调用者不会重复转换状态。
/// 本组件从不返回错误，存储不可用时按关闭状态放行。
#[derive(Clone)]
pub struct CircuitBreaker {
    /// 状态存储
    store: Arc<dyn KeyValueStore>,
    /// 配置
    config: CircuitConfig,
}

impl CircuitBreaker {
    /// 创建新的熔断器实例
    ///
    /// # 参数
    ///
    /// * `store` - 共享键值存储
    /// * `config` - 配置
    ///
    /// # 返回值
    ///
    /// 返回新的熔断器实例
    pub fn new(store: Arc<dyn KeyValueStore>, config: CircuitConfig) -> Self {
        Self { store, config }
    }

    /// 当前配置
    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    fn key(provider: &str) -> String {
        format!("circuit_breaker:{}", provider)
    }

    /// 以CAS循环对状态执行一次读改写
    ///
    /// 状态未改变时不写入。返回闭包的结果以及写入前后的状态
    async fn mutate<R, F>(&self, provider: &str, apply: F) -> Option<(R, CircuitState, CircuitState)>
    where
        F: Fn(&mut CircuitState) -> R,
    {
        let key = Self::key(provider);

        for _ in 0..MAX_CAS_ATTEMPTS {
            let raw = match self.store.get(&key).await {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(provider = %provider, "Circuit breaker store unavailable: {}", e);
                    return None;
                }
            };
            let before: CircuitState = raw
                .as_deref()
                .and_then(|r| serde_json::from_str(r).ok())
                .unwrap_or_default();

            let mut after = before.clone();
            let result = apply(&mut after);
            if after == before {
                return Some((result, before, after));
            }

            let encoded = match serde_json::to_string(&after) {
                Ok(encoded) => encoded,
                Err(e) => {
                    error!(provider = %provider, "Failed to encode circuit state: {}", e);
                    return None;
                }
            };

            match self
                .store
                .compare_and_swap(&key, raw.as_deref(), &encoded, None)
                .await
            {
                Ok(true) => {
                    if before.status != after.status {
                        update_status_metric(provider, after.status);
                    }
                    return Some((result, before, after));
                }
                Ok(false) => continue,
                Err(e) => {
                    warn!(provider = %provider, "Circuit breaker store unavailable: {}", e);
                    return None;
                }
            }
        }

        warn!(provider = %provider, "Circuit breaker update abandoned after repeated conflicts");
        None
    }

    /// 检查供应商是否可用
    ///
    /// 打开状态超过超时时间后转换为半开，并且只放行这一次调用作为试探
    ///
    /// # 参数
    ///
    /// * `provider` - 供应商名称
    ///
    /// # 返回值
    ///
    /// 如果允许调用则返回true
    pub async fn is_available(&self, provider: &str) -> bool {
        self.admit(provider).await.is_allowed()
    }

    /// 申请一次调用
    ///
    /// 与 [`CircuitBreaker::is_available`] 相同，但会区分半开试探，
    /// 调用方在没有实际调用供应商时可以用 [`CircuitBreaker::release_trial`] 归还试探
    pub async fn admit(&self, provider: &str) -> Admission {
        let now = Utc::now();
        let timeout =
            ChronoDuration::from_std(self.config.open_timeout).unwrap_or(ChronoDuration::days(365));

        let outcome = self
            .mutate(provider, |state| match state.status {
                Status::Closed => Admission::Allowed,
                Status::Open => {
                    let elapsed = state
                        .opened_at
                        .map(|opened| opened + timeout <= now)
                        .unwrap_or(true);
                    if elapsed {
                        state.status = Status::HalfOpen;
                        state.half_opened_at = Some(now);
                        Admission::Trial(now)
                    } else {
                        Admission::Rejected
                    }
                }
                Status::HalfOpen => Admission::Rejected,
            })
            .await;

        match outcome {
            Some((admission, _, _)) => {
                match admission {
                    Admission::Trial(_) => {
                        info!(provider = %provider, "Circuit half-open, allowing trial call")
                    }
                    Admission::Rejected => {
                        counter!("circuit_breaker_rejected_total", "provider" => provider.to_string())
                            .increment(1)
                    }
                    Admission::Allowed => {}
                }
                admission
            }
            None => Admission::Allowed,
        }
    }

    /// 归还未使用的半开试探
    ///
    /// 只有仍处于同一次半开时才回到打开状态，打开时间不变，
    /// 因此下一个调用者可以立即获得试探
    pub async fn release_trial(&self, provider: &str, admission: Admission) {
        let Admission::Trial(half_opened_at) = admission else {
            return;
        };

        if let Some((_, before, after)) = self
            .mutate(provider, |state| {
                if state.status == Status::HalfOpen && state.half_opened_at == Some(half_opened_at)
                {
                    state.status = Status::Open;
                    state.half_opened_at = None;
                }
            })
            .await
        {
            if before.status != after.status {
                debug!(provider = %provider, "Unused half-open trial released");
            }
        }
    }

    /// 记录成功
    ///
    /// 半开时转换为关闭；关闭时清零失败计数
    pub async fn record_success(&self, provider: &str) {
        let outcome = self
            .mutate(provider, |state| match state.status {
                Status::HalfOpen => state.close(),
                Status::Closed => state.failure_count = 0,
                Status::Open => {}
            })
            .await;

        counter!("circuit_breaker_successes_total", "provider" => provider.to_string())
            .increment(1);

        if let Some((_, before, after)) = outcome {
            if before.status == Status::HalfOpen && after.status == Status::Closed {
                info!(provider = %provider, "Circuit closed after successful trial call");
            }
        }
    }

    /// 记录失败
    ///
    /// 半开时立即重新打开；关闭时失败计数达到阈值后打开
    pub async fn record_failure(&self, provider: &str) {
        let now = Utc::now();
        let threshold = self.config.failure_threshold;

        let outcome = self
            .mutate(provider, |state| {
                state.failure_count = state.failure_count.saturating_add(1);
                state.last_failure_at = Some(now);
                match state.status {
                    Status::HalfOpen => state.open(now),
                    Status::Closed if state.failure_count >= threshold => state.open(now),
                    _ => {}
                }
            })
            .await;

        counter!("circuit_breaker_failures_total", "provider" => provider.to_string())
            .increment(1);

        if let Some((_, before, after)) = outcome {
            if before.status != after.status {
                error!(
                    provider = %provider,
                    failures = after.failure_count,
                    from = %before.status,
                    "Circuit opened"
                );
            } else {
                warn!(
                    provider = %provider,
                    failures = after.failure_count,
                    threshold = threshold,
                    "Provider failure recorded"
                );
            }
        }
    }

    /// 获取供应商当前状态
    pub async fn state(&self, provider: &str) -> CircuitState {
        match self.store.get(&Self::key(provider)).await {
            Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_default(),
            Ok(None) => CircuitState::default(),
            Err(e) => {
                warn!(provider = %provider, "Circuit breaker store unavailable: {}", e);
                CircuitState::default()
            }
        }
    }

    /// 强制打开
    pub async fn force_open(&self, provider: &str) {
        let now = Utc::now();
        if let Some((_, before, after)) = self
            .mutate(provider, |state| {
                if state.status != Status::Open {
                    state.open(now);
                }
            })
            .await
        {
            if before.status != after.status {
                warn!(provider = %provider, "Circuit forced open");
            }
        }
    }

    /// 强制关闭并清零失败计数
    pub async fn reset(&self, provider: &str) {
        if let Some((_, before, after)) = self.mutate(provider, CircuitState::close).await {
            if before.status != after.status {
                info!(provider = %provider, "Circuit forced closed");
            }
        }
    }

    /// 处理半开超时
    ///
    /// 半开状态超过试探窗口仍未有结果时，根据近期成功情况关闭或重新打开
    ///
    /// # 参数
    ///
    /// * `provider` - 供应商名称
    /// * `healthy` - 近期成功率是否健康
    ///
    /// # 返回值
    ///
    /// 发生状态转换时返回新状态
    pub async fn resolve_stale_half_open(&self, provider: &str, healthy: bool) -> Option<Status> {
        let now = Utc::now();
        let window =
            ChronoDuration::from_std(self.config.half_open_window).unwrap_or(ChronoDuration::days(365));

        let (_, before, after) = self
            .mutate(provider, |state| {
                if state.status != Status::HalfOpen {
                    return;
                }
                let stale = state
                    .half_opened_at
                    .map(|at| at + window <= now)
                    .unwrap_or(true);
                if !stale {
                    return;
                }
                if healthy {
                    state.close();
                } else {
                    state.open(now);
                }
            })
            .await?;

        (before.status != after.status).then(|| {
            info!(provider = %provider, to = %after.status, "Stale half-open circuit resolved");
            after.status
        })
    }
}

/// 更新状态指标
fn update_status_metric(provider: &str, status: Status) {
    let val = match status {
        Status::Closed => 0.0,
        Status::Open => 1.0,
        Status::HalfOpen => 0.5,
    };
    gauge!("circuit_breaker_status", "provider" => provider.to_string()).set(val);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::cache::kv_store::InMemoryKeyValueStore;

    fn breaker(open_timeout: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            Arc::new(InMemoryKeyValueStore::new()),
            CircuitConfig {
                failure_threshold: 5,
                open_timeout,
                half_open_window: Duration::from_millis(20),
            },
        )
    }

    #[tokio::test]
    async fn test_opens_after_threshold() {
        let breaker = breaker(Duration::from_secs(300));

        for _ in 0..4 {
            breaker.record_failure("p").await;
            assert!(breaker.is_available("p").await);
        }
        breaker.record_failure("p").await;
        assert!(!breaker.is_available("p").await);

        let state = breaker.state("p").await;
        assert_eq!(state.status, Status::Open);
        assert_eq!(state.failure_count, 5);
        assert!(state.opened_at.is_some());
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let breaker = breaker(Duration::from_secs(300));

        for _ in 0..4 {
            breaker.record_failure("p").await;
        }
        breaker.record_success("p").await;
        breaker.record_failure("p").await;

        assert!(breaker.is_available("p").await);
        assert_eq!(breaker.state("p").await.failure_count, 1);
    }

    #[tokio::test]
    async fn test_half_open_allows_single_trial() {
        let breaker = breaker(Duration::from_millis(10));
        for _ in 0..5 {
            breaker.record_failure("p").await;
        }
        assert!(!breaker.is_available("p").await);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(breaker.is_available("p").await);
        assert!(!breaker.is_available("p").await);
        assert_eq!(breaker.state("p").await.status, Status::HalfOpen);

        breaker.record_success("p").await;
        let state = breaker.state("p").await;
        assert_eq!(state.status, Status::Closed);
        assert_eq!(state.failure_count, 0);
        assert!(state.opened_at.is_none());
    }

    #[tokio::test]
    async fn test_released_trial_is_offered_again() {
        let breaker = breaker(Duration::from_millis(10));
        for _ in 0..5 {
            breaker.record_failure("p").await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        let trial = breaker.admit("p").await;
        assert!(matches!(trial, Admission::Trial(_)));
        assert_eq!(breaker.admit("p").await, Admission::Rejected);

        breaker.release_trial("p", trial).await;
        assert_eq!(breaker.state("p").await.status, Status::Open);

        // opened_at is kept, so the timeout has already elapsed
        tokio::time::sleep(Duration::from_millis(1)).await;
        let next = breaker.admit("p").await;
        assert!(matches!(next, Admission::Trial(_)));

        // a stale trial cannot release the current one
        breaker.release_trial("p", trial).await;
        assert_eq!(breaker.state("p").await.status, Status::HalfOpen);

        assert_eq!(breaker.admit("q").await, Admission::Allowed);
        breaker.release_trial("q", Admission::Allowed).await;
        assert_eq!(breaker.state("q").await.status, Status::Closed);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let breaker = breaker(Duration::from_millis(10));
        for _ in 0..5 {
            breaker.record_failure("p").await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(breaker.is_available("p").await);

        breaker.record_failure("p").await;
        assert_eq!(breaker.state("p").await.status, Status::Open);
        assert!(!breaker.is_available("p").await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_get_one_trial() {
        let breaker = breaker(Duration::from_millis(10));
        for _ in 0..5 {
            breaker.record_failure("p").await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let breaker = breaker.clone();
                tokio::spawn(async move { breaker.is_available("p").await })
            })
            .collect();
        let results = futures::future::join_all(handles).await;
        let admitted = results
            .into_iter()
            .filter(|r| *r.as_ref().unwrap())
            .count();

        assert_eq!(admitted, 1);
    }

    #[tokio::test]
    async fn test_stale_half_open_resolution() {
        let breaker = breaker(Duration::from_millis(1));
        for _ in 0..5 {
            breaker.record_failure("p").await;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(breaker.is_available("p").await);

        assert_eq!(breaker.resolve_stale_half_open("p", true).await, None);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(
            breaker.resolve_stale_half_open("p", true).await,
            Some(Status::Closed)
        );
        assert!(breaker.is_available("p").await);
    }

    #[tokio::test]
    async fn test_providers_are_isolated() {
        let breaker = breaker(Duration::from_secs(300));
        for _ in 0..5 {
            breaker.record_failure("a").await;
        }
        assert!(!breaker.is_available("a").await);
        assert!(breaker.is_available("b").await);

        breaker.reset("a").await;
        assert!(breaker.is_available("a").await);
    }
}
