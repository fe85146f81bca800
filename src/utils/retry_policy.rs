// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use std::time::Duration;

/// 自动重试策略配置
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 最大重试次数
    pub max_retries: u32,
    /// 初始退避时间
    pub initial_backoff: Duration,
    /// 最大退避时间
    pub max_backoff: Duration,
    /// 退避乘数
    pub backoff_multiplier: f64,
    /// 抖动因子 (0.0-1.0)
    pub jitter_factor: f64,
    /// 是否启用抖动
    pub enable_jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_secs(60),
            max_backoff: Duration::from_secs(3600),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
            enable_jitter: true,
        }
    }
}

impl RetryPolicy {
    /// 使用指定的最大重试次数创建策略
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// 计算第 `attempt` 次重试前的退避时间
    ///
    /// `attempt` 从1开始，第一次重试使用初始退避时间
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(30) as i32;
        let backoff_secs = self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(exponent);

        let capped_backoff = backoff_secs.min(self.max_backoff.as_secs_f64());

        let final_backoff = if self.enable_jitter && capped_backoff > 0.0 {
            let jitter_range = capped_backoff * self.jitter_factor;
            if jitter_range > 0.0 {
                let jitter = rand::random_range(-jitter_range..jitter_range);
                (capped_backoff + jitter).max(0.0)
            } else {
                capped_backoff
            }
        } else {
            capped_backoff
        };

        Duration::from_secs_f64(final_backoff)
    }

    /// 是否应该重试
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

/// 判断一次失败是否值得自动重试
///
/// 只有超时、网络和限流类的失败被认为是暂时性的，
/// 其余失败（号码无效、余额不足等）重试也不会成功
///
/// # 参数
///
/// * `error_code` - 失败代码
/// * `error_message` - 失败原因
pub fn is_retryable_failure(error_code: Option<&str>, error_message: Option<&str>) -> bool {
    let haystack = format!(
        "{} {}",
        error_code.unwrap_or_default(),
        error_message.unwrap_or_default()
    )
    .to_lowercase();

    let retryable_patterns = [
        "timeout",
        "timed out",
        "network",
        "connection reset",
        "connection refused",
        "dns error",
        "transport",
        "rate limit",
        "rate_limit",
        "too many requests",
        "throttl",
        "503 service unavailable",
        "504 gateway timeout",
        "provider_unavailable",
    ];

    retryable_patterns.iter().any(|&p| haystack.contains(p))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calculate_backoff_exponential() {
        let mut policy = RetryPolicy::default();
        policy.enable_jitter = false;

        assert_eq!(policy.calculate_backoff(1), Duration::from_secs(60));
        assert_eq!(policy.calculate_backoff(2), Duration::from_secs(120));
        assert_eq!(policy.calculate_backoff(3), Duration::from_secs(240));
    }

    #[test]
    fn test_calculate_backoff_max_limit() {
        let mut policy = RetryPolicy::default();
        policy.max_backoff = Duration::from_secs(300);
        policy.enable_jitter = false;

        assert_eq!(policy.calculate_backoff(10), Duration::from_secs(300));
    }

    #[test]
    fn test_calculate_backoff_with_jitter() {
        let policy = RetryPolicy::default();
        let backoff = policy.calculate_backoff(2);

        assert!(backoff >= Duration::from_secs(108));
        assert!(backoff <= Duration::from_secs(132));
    }

    #[test]
    fn test_should_retry() {
        let policy = RetryPolicy::with_max_retries(3);

        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn test_retryable_failures() {
        assert!(is_retryable_failure(
            Some("TRANSPORT_ERROR"),
            Some("error sending request")
        ));
        assert!(is_retryable_failure(None, Some("Rate limit exceeded")));
        assert!(is_retryable_failure(Some("20429"), Some("Too Many Requests")));
        assert!(!is_retryable_failure(
            Some("21211"),
            Some("Invalid 'To' Phone Number")
        ));
        assert!(!is_retryable_failure(None, None));
    }
}
