//! Provider Pool 数据模型
//!
//! 多凭证池的核心类型：凭证、健康状态、错误窗口计数、池统计。
//! 健康状态的变更入口统一在 `ProviderPoolService`，这里只提供
//! 按时间参数化的状态迁移方法，便于测试窗口边界。

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::ProviderType;

/// 错误计数窗口：距上次错误超过该时长后计数重置为 1
pub const ERROR_WINDOW_SECONDS: i64 = 10;

/// 凭证数据，按 Provider 类型区分
///
/// OAuth 类凭证只携带凭证文件路径，秘密材料由 Credential Store
/// 从文件加载；API Key 类凭证直接内联。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CredentialData {
    /// Kiro OAuth 凭证（文件路径）
    KiroOAuth { creds_file_path: String },
    /// Gemini CLI OAuth 凭证（文件路径）
    GeminiOAuth {
        creds_file_path: String,
        project_id: Option<String>,
    },
    /// Gemini Antigravity OAuth 凭证（文件路径）
    AntigravityOAuth {
        creds_file_path: String,
        project_id: Option<String>,
    },
    /// Qwen OAuth 凭证（文件路径）
    QwenOAuth { creds_file_path: String },
    /// OpenAI 兼容 API Key 凭证
    OpenAIKey {
        api_key: String,
        base_url: Option<String>,
    },
    /// OpenAI Responses API Key 凭证
    OpenAIResponsesKey {
        api_key: String,
        base_url: Option<String>,
    },
    /// Claude API Key 凭证
    ClaudeKey {
        api_key: String,
        base_url: Option<String>,
    },
}

impl CredentialData {
    /// 获取凭证对应的 Provider 类型
    pub fn provider_type(&self) -> ProviderType {
        match self {
            CredentialData::KiroOAuth { .. } => ProviderType::ClaudeKiroOAuth,
            CredentialData::GeminiOAuth { .. } => ProviderType::GeminiCliOAuth,
            CredentialData::AntigravityOAuth { .. } => ProviderType::GeminiAntigravity,
            CredentialData::QwenOAuth { .. } => ProviderType::OpenAIQwenOAuth,
            CredentialData::OpenAIKey { .. } => ProviderType::OpenAICustom,
            CredentialData::OpenAIResponsesKey { .. } => ProviderType::OpenAIResponses,
            CredentialData::ClaudeKey { .. } => ProviderType::ClaudeCustom,
        }
    }

    /// OAuth 凭证文件路径（API Key 类型返回 None）
    pub fn creds_file_path(&self) -> Option<&str> {
        match self {
            CredentialData::KiroOAuth { creds_file_path }
            | CredentialData::GeminiOAuth {
                creds_file_path, ..
            }
            | CredentialData::AntigravityOAuth {
                creds_file_path, ..
            }
            | CredentialData::QwenOAuth { creds_file_path } => Some(creds_file_path),
            _ => None,
        }
    }

    /// 显示名称（隐藏敏感信息）
    pub fn display_name(&self) -> String {
        match self {
            CredentialData::KiroOAuth { creds_file_path } => {
                format!("Kiro OAuth: {}", mask_path(creds_file_path))
            }
            CredentialData::GeminiOAuth {
                creds_file_path, ..
            } => format!("Gemini OAuth: {}", mask_path(creds_file_path)),
            CredentialData::AntigravityOAuth {
                creds_file_path, ..
            } => format!("Antigravity OAuth: {}", mask_path(creds_file_path)),
            CredentialData::QwenOAuth { creds_file_path } => {
                format!("Qwen OAuth: {}", mask_path(creds_file_path))
            }
            CredentialData::OpenAIKey { api_key, .. } => format!("OpenAI: {}", mask_key(api_key)),
            CredentialData::OpenAIResponsesKey { api_key, .. } => {
                format!("OpenAI Responses: {}", mask_key(api_key))
            }
            CredentialData::ClaudeKey { api_key, .. } => format!("Claude: {}", mask_key(api_key)),
        }
    }
}

/// 通配符模式匹配
///
/// 支持精确匹配、`prefix-*`、`*-suffix`、`*infix*`、`prefix-*-suffix`。
pub fn pattern_matches(pattern: &str, model: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == model;
    }

    let parts: Vec<&str> = pattern.split('*').collect();

    match parts.as_slice() {
        [prefix, ""] => model.starts_with(prefix),
        ["", suffix] => model.ends_with(suffix),
        ["", middle, ""] => model.contains(middle),
        [prefix, suffix] => model.starts_with(prefix) && model.ends_with(suffix),
        _ => false,
    }
}

/// 单个凭证（Provider 实例）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderCredential {
    /// 唯一标识符，跨类型全局唯一
    pub uuid: String,
    /// Provider 类型
    pub provider_type: ProviderType,
    /// 凭证数据
    pub credential: CredentialData,
    /// 备注/名称
    pub custom_name: Option<String>,
    /// 是否健康
    #[serde(default = "default_true")]
    pub is_healthy: bool,
    /// 是否禁用（仅运维手动操作）
    #[serde(default)]
    pub is_disabled: bool,
    /// 是否参与自动健康检查
    #[serde(default = "default_true")]
    pub check_health: bool,
    /// 自定义健康检查模型
    pub check_model_name: Option<String>,
    /// 不支持的模型列表（支持通配符）
    #[serde(default)]
    pub not_supported_models: Vec<String>,
    /// 使用次数
    #[serde(default)]
    pub usage_count: u64,
    /// 错误次数（10 秒窗口内累加）
    #[serde(default)]
    pub error_count: u32,
    /// 最后使用时间
    pub last_used: Option<DateTime<Utc>>,
    /// 最后错误时间
    pub last_error_time: Option<DateTime<Utc>>,
    /// 最后错误消息
    pub last_error_message: Option<String>,
    /// 最后健康检查时间
    pub last_health_check_time: Option<DateTime<Utc>>,
    /// 最后健康检查使用的模型
    pub last_health_check_model: Option<String>,
    /// 凭证级代理 URL（仅携带，代理接线在外层）
    pub proxy_url: Option<String>,
}

fn default_true() -> bool {
    true
}

impl ProviderCredential {
    /// 创建新凭证
    pub fn new(provider_type: ProviderType, credential: CredentialData) -> Self {
        Self {
            uuid: Uuid::new_v4().to_string(),
            provider_type,
            credential,
            custom_name: None,
            is_healthy: true,
            is_disabled: false,
            check_health: true,
            check_model_name: None,
            not_supported_models: Vec::new(),
            usage_count: 0,
            error_count: 0,
            last_used: None,
            last_error_time: None,
            last_error_message: None,
            last_health_check_time: None,
            last_health_check_model: None,
            proxy_url: None,
        }
    }

    /// 是否可参与新流量的选择（健康且未禁用）
    pub fn is_available(&self) -> bool {
        self.is_healthy && !self.is_disabled
    }

    /// 是否支持指定模型
    pub fn supports_model(&self, model: &str) -> bool {
        !self
            .not_supported_models
            .iter()
            .any(|p| pattern_matches(p, model))
    }

    /// LRU 排序键：(last_used 毫秒时间戳, usage_count)
    ///
    /// 从未使用的凭证键为 (0, 0)，排在最前，保证新凭证优先被尝试。
    pub fn lru_key(&self) -> (i64, u64) {
        (
            self.last_used.map(|t| t.timestamp_millis()).unwrap_or(0),
            self.usage_count,
        )
    }

    /// 记录一次错误（窗口计数）
    ///
    /// 距上次错误 10 秒内计数递增，否则重置为 1；达到阈值标记不健康。
    /// `last_used` 一并刷新，避免出错凭证立刻被 LRU 再次选中。
    pub fn record_error_at(
        &mut self,
        now: DateTime<Utc>,
        max_error_count: u32,
        message: Option<String>,
    ) {
        let within_window = self
            .last_error_time
            .map(|t| now - t <= Duration::seconds(ERROR_WINDOW_SECONDS))
            .unwrap_or(false);

        if within_window {
            self.error_count = self.error_count.saturating_add(1);
        } else {
            self.error_count = 1;
        }

        if self.error_count >= max_error_count {
            self.is_healthy = false;
        }

        self.last_error_time = Some(now);
        self.last_used = Some(now);
        if message.is_some() {
            self.last_error_message = message;
        }
    }

    /// 立即标记为不健康（401 刷新失败、403）
    pub fn force_unhealthy_at(
        &mut self,
        now: DateTime<Utc>,
        max_error_count: u32,
        message: Option<String>,
    ) {
        self.error_count = max_error_count;
        self.is_healthy = false;
        self.last_error_time = Some(now);
        self.last_used = Some(now);
        if message.is_some() {
            self.last_error_message = message;
        }
    }

    /// 标记为健康
    ///
    /// `reset_usage` 为 true 时清零使用计数（探活恢复路径）；
    /// 否则使用计数 +1 并刷新 `last_used`，防止刚恢复的凭证立即
    /// 垄断 LRU 排序。
    pub fn mark_healthy_at(
        &mut self,
        now: DateTime<Utc>,
        reset_usage: bool,
        check_model: Option<String>,
    ) {
        self.is_healthy = true;
        self.error_count = 0;
        self.last_error_time = None;
        self.last_error_message = None;
        self.last_health_check_time = Some(now);
        if check_model.is_some() {
            self.last_health_check_model = check_model;
        }
        if reset_usage {
            self.usage_count = 0;
        } else {
            self.usage_count += 1;
            self.last_used = Some(now);
        }
    }

    /// 记录一次使用
    pub fn record_usage_at(&mut self, now: DateTime<Utc>) {
        self.usage_count += 1;
        self.last_used = Some(now);
    }

    /// 重置计数器（运维操作）
    pub fn reset_counters(&mut self) {
        self.usage_count = 0;
        self.error_count = 0;
        self.is_healthy = true;
        self.last_error_time = None;
        self.last_error_message = None;
    }
}

/// 凭证池：类型 → 凭证列表（插入顺序无语义，选择完全按 LRU 键）
pub type ProviderPools = HashMap<ProviderType, Vec<ProviderCredential>>;

/// 凭证池统计信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub disabled: usize,
}

impl PoolStats {
    pub fn from_credentials(credentials: &[ProviderCredential]) -> Self {
        Self {
            total: credentials.len(),
            healthy: credentials.iter().filter(|c| c.is_available()).count(),
            unhealthy: credentials
                .iter()
                .filter(|c| !c.is_healthy && !c.is_disabled)
                .count(),
            disabled: credentials.iter().filter(|c| c.is_disabled).count(),
        }
    }
}

/// 健康检查结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub uuid: String,
    pub success: bool,
    pub model: Option<String>,
    pub message: Option<String>,
    pub duration_ms: u64,
}

/// 默认健康检查模型
pub fn get_default_check_model(provider_type: ProviderType) -> &'static str {
    match provider_type {
        ProviderType::ClaudeKiroOAuth => "claude-haiku-4-5",
        ProviderType::ClaudeCustom => "claude-sonnet-4-5-20250929",
        ProviderType::GeminiCliOAuth => "gemini-2.5-flash",
        ProviderType::GeminiAntigravity => "gemini-3-pro-preview",
        ProviderType::OpenAICustom | ProviderType::OpenAIResponses => "gpt-4o-mini",
        ProviderType::OpenAIQwenOAuth => "qwen3-coder-flash",
    }
}

// 辅助函数：隐藏路径中的用户名
fn mask_path(path: &str) -> String {
    if let Some(home) = dirs::home_dir() {
        let home_str = home.to_string_lossy();
        path.replace(&*home_str, "~")
    } else {
        path.to_string()
    }
}

// 辅助函数：隐藏 API Key
fn mask_key(key: &str) -> String {
    if key.len() <= 12 {
        "****".to_string()
    } else {
        format!("{}...{}", &key[..6], &key[key.len() - 4..])
    }
}
