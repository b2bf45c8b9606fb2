//! 凭证池运行时配置
//!
//! 定义 Pool Manager、粘性会话、回退链、重试策略的配置结构，
//! 以及 Kiro 适配器读取的环境变量开关。
//! 配置的加载/引导（文件、CLI）由外层完成，这里只定义类型和默认值。

use crate::ProviderType;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 模型回退目标（跨协议重定向）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelFallbackTarget {
    /// 目标 Provider 类型
    pub provider_type: ProviderType,
    /// 目标模型名（调用方需要改写请求体）
    pub model: String,
}

/// 粘性会话配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StickySessionConfig {
    /// 是否启用
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// 会话 TTL（自最后访问起，毫秒）
    #[serde(default = "default_session_ttl_ms")]
    pub ttl_ms: u64,
    /// 清理任务间隔（毫秒）
    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,
    /// 会话上限，超出后按 LRU 批量淘汰 10%
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

impl Default for StickySessionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_ms: default_session_ttl_ms(),
            cleanup_interval_ms: default_cleanup_interval_ms(),
            max_sessions: default_max_sessions(),
        }
    }
}

/// 凭证池运行时配置
///
/// 进程内不可变（初始化后不再修改），各服务持有克隆。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// 健康检查调度间隔（毫秒）
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    /// 错误阈值，达到后自动标记不健康
    #[serde(default = "default_max_error_count")]
    pub max_error_count: u32,
    /// 持久化去抖窗口（毫秒）
    #[serde(default = "default_save_debounce_ms")]
    pub save_debounce_ms: u64,
    /// 粘性会话配置
    #[serde(default)]
    pub sticky_session: StickySessionConfig,
    /// 同协议回退链：请求类型 → 依次尝试的同协议类型
    #[serde(default)]
    pub provider_fallback_chain: HashMap<ProviderType, Vec<ProviderType>>,
    /// 模型回退映射：模型名 → (目标类型, 目标模型)
    #[serde(default)]
    pub model_fallback_mapping: HashMap<String, ModelFallbackTarget>,
    /// 上游请求最大重试次数
    #[serde(default = "default_request_max_retries")]
    pub request_max_retries: u32,
    /// 重试基础延迟（毫秒），实际延迟为 base * 2^attempt
    #[serde(default = "default_request_base_delay_ms")]
    pub request_base_delay_ms: u64,
    /// Token 临近过期窗口（分钟），进入窗口即主动刷新
    #[serde(default = "default_cron_near_minutes")]
    pub cron_near_minutes: i64,
    /// 凭证池持久化文件路径
    #[serde(default = "default_pool_file_path")]
    pub pool_file_path: String,
    /// 各协议是否走系统代理（仅携带，代理接线在外层）
    #[serde(default)]
    pub use_system_proxy: HashMap<String, bool>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            health_check_interval_ms: default_health_check_interval_ms(),
            max_error_count: default_max_error_count(),
            save_debounce_ms: default_save_debounce_ms(),
            sticky_session: StickySessionConfig::default(),
            provider_fallback_chain: HashMap::new(),
            model_fallback_mapping: HashMap::new(),
            request_max_retries: default_request_max_retries(),
            request_base_delay_ms: default_request_base_delay_ms(),
            cron_near_minutes: default_cron_near_minutes(),
            pool_file_path: default_pool_file_path(),
            use_system_proxy: HashMap::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_session_ttl_ms() -> u64 {
    30 * 60 * 1000
}

fn default_cleanup_interval_ms() -> u64 {
    5 * 60 * 1000
}

fn default_max_sessions() -> usize {
    1000
}

fn default_health_check_interval_ms() -> u64 {
    5 * 60 * 1000
}

fn default_max_error_count() -> u32 {
    3
}

fn default_save_debounce_ms() -> u64 {
    1000
}

fn default_request_max_retries() -> u32 {
    3
}

fn default_request_base_delay_ms() -> u64 {
    1000
}

fn default_cron_near_minutes() -> i64 {
    10
}

fn default_pool_file_path() -> String {
    "configs/provider_pools.json".to_string()
}

/// 缓存估算是否使用乐观模式
///
/// `KIRO_OPTIMISTIC_CACHE=false` 强制严格模式，其余情况默认乐观。
pub fn kiro_optimistic_cache() -> bool {
    match std::env::var("KIRO_OPTIMISTIC_CACHE") {
        Ok(v) => !matches!(v.to_lowercase().as_str(), "false" | "0" | "off"),
        Err(_) => true,
    }
}

/// 是否输出缓存估算的逐消息诊断日志
pub fn kiro_cache_debug() -> bool {
    std::env::var("KIRO_CACHE_DEBUG")
        .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "on"))
        .unwrap_or(false)
}

/// Kiro 适配器日志级别（debug/info/warn/error），未设置时为 info
pub fn kiro_log_level() -> tracing::Level {
    match std::env::var("KIRO_LOG_LEVEL")
        .unwrap_or_default()
        .to_lowercase()
        .as_str()
    {
        "debug" => tracing::Level::DEBUG,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = PoolConfig::default();
        assert_eq!(cfg.max_error_count, 3);
        assert_eq!(cfg.save_debounce_ms, 1000);
        assert_eq!(cfg.cron_near_minutes, 10);
        assert_eq!(cfg.sticky_session.ttl_ms, 30 * 60 * 1000);
        assert_eq!(cfg.pool_file_path, "configs/provider_pools.json");
    }

    #[test]
    fn test_deserialize_partial() {
        let cfg: PoolConfig = serde_json::from_str(r#"{"max_error_count": 5}"#).unwrap();
        assert_eq!(cfg.max_error_count, 5);
        assert_eq!(cfg.request_max_retries, 3);
        assert!(cfg.sticky_session.enabled);
    }

    #[test]
    fn test_fallback_chain_deserialize() {
        let cfg: PoolConfig = serde_json::from_str(
            r#"{
                "provider_fallback_chain": {
                    "claude-kiro-oauth": ["claude-custom"]
                },
                "model_fallback_mapping": {
                    "claude-opus-4-5": {
                        "provider_type": "gemini-cli-oauth",
                        "model": "gemini-2.5-pro"
                    }
                }
            }"#,
        )
        .unwrap();
        assert_eq!(
            cfg.provider_fallback_chain[&crate::ProviderType::ClaudeKiroOAuth],
            vec![crate::ProviderType::ClaudeCustom]
        );
        assert_eq!(
            cfg.model_fallback_mapping["claude-opus-4-5"].model,
            "gemini-2.5-pro"
        );
    }
}
