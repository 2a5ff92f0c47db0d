//! Provider 调用失败的分类与重试决策
//!
//! 只看归一化后的 {状态码, 响应头, 响应体}，不看异常类型：
//! - connection：传输失败或上游 5xx，指数退避重试（基数逐次翻倍，封顶）
//! - rate_limited：429，按 Retry-After 等待，缺省时退回指数退避
//! - quota_exceeded：额度/账单耗尽，同一提供方不再重试，切到下一个备用提供方
//! - fatal：其余一切，运行以 error 结束

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::llm::ProviderError;

const QUOTA_KEYWORDS: &[&str] = &[
    "insufficient_quota",
    "quota",
    "billing",
    "credit balance",
    "out of credits",
    "payment required",
    "usage limit",
    "exceeded your current",
];

const RATE_LIMIT_KEYWORDS: &[&str] = &[
    "rate limit",
    "rate_limit",
    "ratelimit",
    "too many requests",
    "throttl",
];

/// 失败类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Connection,
    RateLimited,
    QuotaExceeded,
    Fatal,
}

impl FailureClass {
    /// 同一提供方上等一等就可能恢复
    pub fn is_transient(self) -> bool {
        matches!(self, FailureClass::Connection | FailureClass::RateLimited)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureClass::Connection => "connection",
            FailureClass::RateLimited => "rate_limited",
            FailureClass::QuotaExceeded => "quota_exceeded",
            FailureClass::Fatal => "fatal",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    Retry,
    SwitchProvider,
    Fail,
}

/// 单次失败的处理决定；每次失败重新计算，不持久化
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryDecision {
    pub action: RetryAction,
    pub class: FailureClass,
    pub delay: Option<Duration>,
    /// 级联中下一个提供方的下标
    pub next_provider: Option<usize>,
}

impl RetryDecision {
    /// 重试预算耗尽的暂时性失败：计入连续失败，而不是直接终止
    pub fn is_exhausted_transient(&self) -> bool {
        self.action == RetryAction::Fail && self.class.is_transient()
    }
}

/// [retry] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// 单轮内同一提供方的最大尝试次数（含首次）
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
        }
    }
}

/// 重试策略
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn classify(&self, err: &ProviderError) -> FailureClass {
        let status = match err.status() {
            None => return FailureClass::Connection,
            Some(s) => s,
        };
        let body = err.body().to_lowercase();
        let mentions = |keywords: &[&str]| keywords.iter().any(|k| body.contains(k));

        match status {
            402 => FailureClass::QuotaExceeded,
            429 if mentions(QUOTA_KEYWORDS) => FailureClass::QuotaExceeded,
            429 => FailureClass::RateLimited,
            408 | 500 | 502 | 503 | 504 | 529 => {
                if mentions(RATE_LIMIT_KEYWORDS) {
                    FailureClass::RateLimited
                } else {
                    FailureClass::Connection
                }
            }
            _ if mentions(QUOTA_KEYWORDS) => FailureClass::QuotaExceeded,
            _ if mentions(RATE_LIMIT_KEYWORDS) => FailureClass::RateLimited,
            _ => FailureClass::Fatal,
        }
    }

    /// 第 attempt 次失败后的退避（attempt 从 1 开始）：base * 2^(attempt-1)，封顶 max_delay
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self
            .config
            .base_delay_ms
            .saturating_mul(2_u64.saturating_pow(exponent));
        Duration::from_millis(delay.min(self.config.max_delay_ms))
    }

    /// 根据失败、已尝试次数与是否还有备用提供方给出决定
    pub fn decide(
        &self,
        err: &ProviderError,
        attempt: u32,
        next_provider: Option<usize>,
    ) -> RetryDecision {
        let class = self.classify(err);
        let budget_left = attempt < self.config.max_attempts;
        let fail = RetryDecision {
            action: RetryAction::Fail,
            class,
            delay: None,
            next_provider: None,
        };

        match class {
            FailureClass::Connection if budget_left => RetryDecision {
                action: RetryAction::Retry,
                delay: Some(self.backoff(attempt)),
                ..fail
            },
            FailureClass::RateLimited if budget_left => RetryDecision {
                action: RetryAction::Retry,
                delay: Some(retry_after(err).unwrap_or_else(|| self.backoff(attempt))),
                ..fail
            },
            FailureClass::QuotaExceeded if next_provider.is_some() => RetryDecision {
                action: RetryAction::SwitchProvider,
                next_provider,
                ..fail
            },
            _ => fail,
        }
    }
}

/// 提供方建议的等待时间：retry-after-ms，或 Retry-After（秒数或 HTTP-date）
pub fn retry_after(err: &ProviderError) -> Option<Duration> {
    if let Some(ms) = err
        .header("retry-after-ms")
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite() && *v >= 0.0)
    {
        return Some(Duration::from_millis(ms.ceil() as u64));
    }
    let value = err.header("retry-after")?.trim();
    if let Ok(secs) = value.parse::<f64>() {
        if secs.is_finite() && secs >= 0.0 {
            return Some(Duration::from_millis((secs * 1000.0).ceil() as u64));
        }
        return None;
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    let secs = at.signed_duration_since(Utc::now()).num_seconds().max(0) as u64;
    Some(Duration::from_secs(secs))
}
