//! Provider 适配器层
//!
//! 错误分类、重试策略与健康探针接口。适配器只在本层定义的
//! 错误集合内失败；健康状态的实际变更由 Pool Manager 执行，
//! 适配器仅通过返回的错误类别发出信号。

pub mod kiro;

use std::time::Duration;

use thiserror::Error;

/// Provider 错误（闭集）
#[derive(Debug, Error)]
pub enum ProviderError {
    /// 首次 401，可通过一次透明刷新恢复
    #[error("token expired: {0}")]
    TokenExpiredRecoverable(String),
    /// 刷新失败后的 401 或任意 403；凭证需立即标记不健康。
    /// 适配器不在此处轮换凭证，轮换交给池层回退链（运维可配）。
    #[error("authentication failed: {0}")]
    AuthFatal(String),
    /// 429 限流
    #[error("throttled: {0}")]
    Throttled(String),
    /// 上游 5xx
    #[error("upstream server error: {0}")]
    UpstreamServerError(String),
    /// 连接重置/超时/DNS 等瞬态网络错误
    #[error("network error: {0}")]
    NetworkTransient(String),
    /// 无法解析的上游事件帧（不作为凭证健康信号）
    #[error("malformed upstream frame: {0}")]
    UpstreamMalformed(String),
    /// 本地配置错误（凭证文件缺失/损坏），仅该适配器初始化失败
    #[error("local config error: {0}")]
    LocalConfigError(String),
    /// 池内无可用凭证
    #[error("no available provider: {0}")]
    PoolExhausted(String),
}

impl ProviderError {
    /// 按退避策略重试的类别（429/5xx/网络瞬态）
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::Throttled(_)
                | ProviderError::UpstreamServerError(_)
                | ProviderError::NetworkTransient(_)
        )
    }

    /// 是否应立即标记凭证不健康
    pub fn is_auth_fatal(&self) -> bool {
        matches!(self, ProviderError::AuthFatal(_))
    }

    /// 写入 last_error_message 的简短原因
    pub fn short_reason(&self) -> String {
        match self {
            ProviderError::TokenExpiredRecoverable(m) => format!("401: {}", truncate(m)),
            ProviderError::AuthFatal(m) => format!("auth: {}", truncate(m)),
            ProviderError::Throttled(m) => format!("429: {}", truncate(m)),
            ProviderError::UpstreamServerError(m) => format!("upstream: {}", truncate(m)),
            ProviderError::NetworkTransient(m) => format!("network: {}", truncate(m)),
            ProviderError::UpstreamMalformed(m) => format!("malformed: {}", truncate(m)),
            ProviderError::LocalConfigError(m) => format!("config: {}", truncate(m)),
            ProviderError::PoolExhausted(m) => format!("exhausted: {}", truncate(m)),
        }
    }

    /// 按 HTTP 状态码分类
    ///
    /// `refreshed` 表示本请求是否已经历过一次 token 刷新：
    /// 刷新前的 401 可恢复，刷新后的 401 视为致命。
    pub fn from_status(status: u16, body: &str, refreshed: bool) -> Self {
        match status {
            401 if !refreshed => ProviderError::TokenExpiredRecoverable(body.to_string()),
            401 | 403 => ProviderError::AuthFatal(format!("HTTP {}: {}", status, body)),
            429 => ProviderError::Throttled(body.to_string()),
            s if s >= 500 => {
                ProviderError::UpstreamServerError(format!("HTTP {}: {}", s, body))
            }
            s => ProviderError::UpstreamServerError(format!("HTTP {}: {}", s, body)),
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        // 瞬态网络错误集合：超时、连接失败（含 reset/refused/DNS）
        if e.is_timeout() || e.is_connect() || e.is_request() {
            ProviderError::NetworkTransient(e.to_string())
        } else if e.is_decode() {
            ProviderError::UpstreamMalformed(e.to_string())
        } else {
            ProviderError::NetworkTransient(e.to_string())
        }
    }
}

fn truncate(s: &str) -> String {
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s.to_string()
    }
}

/// 指数退避重试策略
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// 最大尝试次数
    pub max_retries: u32,
    /// 基础延迟，实际延迟 base * 2^attempt
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay_ms: u64) -> Self {
        Self {
            max_retries,
            base_delay: Duration::from_millis(base_delay_ms),
        }
    }

    /// 第 attempt 次失败后的退避时长（attempt 从 0 开始）
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt)
    }
}

/// 健康探针
///
/// Pool Manager 通过该接口驱动各适配器的最小探活请求；
/// 测试中以桩实现替换真实上游。
#[async_trait::async_trait]
pub trait HealthProbe: Send + Sync {
    /// 以最小请求探测凭证可用性
    async fn probe(
        &self,
        credential: &crate::models::provider_pool_model::ProviderCredential,
        model: &str,
    ) -> Result<(), ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            ProviderError::from_status(401, "expired", false),
            ProviderError::TokenExpiredRecoverable(_)
        ));
        assert!(matches!(
            ProviderError::from_status(401, "expired", true),
            ProviderError::AuthFatal(_)
        ));
        assert!(matches!(
            ProviderError::from_status(403, "forbidden", false),
            ProviderError::AuthFatal(_)
        ));
        assert!(matches!(
            ProviderError::from_status(429, "slow down", false),
            ProviderError::Throttled(_)
        ));
        assert!(matches!(
            ProviderError::from_status(503, "unavailable", false),
            ProviderError::UpstreamServerError(_)
        ));
    }

    #[test]
    fn test_retryable_set() {
        assert!(ProviderError::Throttled("x".into()).is_retryable());
        assert!(ProviderError::UpstreamServerError("x".into()).is_retryable());
        assert!(ProviderError::NetworkTransient("x".into()).is_retryable());
        assert!(!ProviderError::AuthFatal("x".into()).is_retryable());
        assert!(!ProviderError::LocalConfigError("x".into()).is_retryable());
        assert!(!ProviderError::UpstreamMalformed("x".into()).is_retryable());
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy::new(3, 1000);
        assert_eq!(policy.backoff(0), Duration::from_millis(1000));
        assert_eq!(policy.backoff(1), Duration::from_millis(2000));
        assert_eq!(policy.backoff(2), Duration::from_millis(4000));
    }

    #[test]
    fn test_short_reason_truncates() {
        let long = "x".repeat(500);
        let reason = ProviderError::Throttled(long).short_reason();
        assert!(reason.len() < 230);
        assert!(reason.starts_with("429:"));
    }
}
