pub mod cache;
pub mod config;
pub mod converter;
pub mod credential;
pub mod models;
pub mod providers;
pub mod services;
pub mod stream;

use serde::{Deserialize, Serialize};

/// Provider 类型
///
/// 闭集标签，同时决定上游线协议和支持的模型集合。
/// 字符串形式与路由层、凭证池持久化文件保持一致。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProviderType {
    /// Gemini CLI OAuth
    #[serde(rename = "gemini-cli-oauth")]
    GeminiCliOAuth,
    /// Gemini Antigravity OAuth
    #[serde(rename = "gemini-antigravity")]
    GeminiAntigravity,
    /// OpenAI 兼容（自定义 base_url + API Key）
    #[serde(rename = "openai-custom")]
    OpenAICustom,
    /// OpenAI Responses API
    #[serde(rename = "openai-responses")]
    OpenAIResponses,
    /// Claude 直连（API Key）
    #[serde(rename = "claude-custom")]
    ClaudeCustom,
    /// Claude via Kiro/CodeWhisperer OAuth
    #[serde(rename = "claude-kiro-oauth")]
    ClaudeKiroOAuth,
    /// Qwen OAuth（OpenAI 协议）
    #[serde(rename = "openai-qwen-oauth")]
    OpenAIQwenOAuth,
}

impl ProviderType {
    /// 所有已知类型（健康检查、持久化遍历用）
    pub const ALL: &'static [ProviderType] = &[
        ProviderType::GeminiCliOAuth,
        ProviderType::GeminiAntigravity,
        ProviderType::OpenAICustom,
        ProviderType::OpenAIResponses,
        ProviderType::ClaudeCustom,
        ProviderType::ClaudeKiroOAuth,
        ProviderType::OpenAIQwenOAuth,
    ];

    /// 协议前缀（类型名第一段）
    ///
    /// 同协议回退链只允许在相同前缀之间切换。
    pub fn protocol_prefix(&self) -> &'static str {
        match self {
            ProviderType::GeminiCliOAuth | ProviderType::GeminiAntigravity => "gemini",
            ProviderType::OpenAICustom
            | ProviderType::OpenAIResponses
            | ProviderType::OpenAIQwenOAuth => "openai",
            ProviderType::ClaudeCustom | ProviderType::ClaudeKiroOAuth => "claude",
        }
    }
}

impl std::fmt::Display for ProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderType::GeminiCliOAuth => write!(f, "gemini-cli-oauth"),
            ProviderType::GeminiAntigravity => write!(f, "gemini-antigravity"),
            ProviderType::OpenAICustom => write!(f, "openai-custom"),
            ProviderType::OpenAIResponses => write!(f, "openai-responses"),
            ProviderType::ClaudeCustom => write!(f, "claude-custom"),
            ProviderType::ClaudeKiroOAuth => write!(f, "claude-kiro-oauth"),
            ProviderType::OpenAIQwenOAuth => write!(f, "openai-qwen-oauth"),
        }
    }
}

impl std::str::FromStr for ProviderType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "gemini-cli-oauth" => Ok(ProviderType::GeminiCliOAuth),
            "gemini-antigravity" => Ok(ProviderType::GeminiAntigravity),
            "openai-custom" => Ok(ProviderType::OpenAICustom),
            "openai-responses" => Ok(ProviderType::OpenAIResponses),
            "claude-custom" => Ok(ProviderType::ClaudeCustom),
            "claude-kiro-oauth" => Ok(ProviderType::ClaudeKiroOAuth),
            "openai-qwen-oauth" => Ok(ProviderType::OpenAIQwenOAuth),
            _ => Err(format!("Invalid provider: {s}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_type_from_str() {
        assert_eq!(
            "claude-kiro-oauth".parse::<ProviderType>().unwrap(),
            ProviderType::ClaudeKiroOAuth
        );
        assert_eq!(
            "gemini-cli-oauth".parse::<ProviderType>().unwrap(),
            ProviderType::GeminiCliOAuth
        );
        assert_eq!(
            "openai-qwen-oauth".parse::<ProviderType>().unwrap(),
            ProviderType::OpenAIQwenOAuth
        );
        assert!("nonexistent".parse::<ProviderType>().is_err());
    }

    #[test]
    fn test_provider_type_roundtrip() {
        for pt in ProviderType::ALL {
            assert_eq!(pt.to_string().parse::<ProviderType>().unwrap(), *pt);
        }
    }

    #[test]
    fn test_protocol_prefix() {
        assert_eq!(ProviderType::ClaudeKiroOAuth.protocol_prefix(), "claude");
        assert_eq!(ProviderType::ClaudeCustom.protocol_prefix(), "claude");
        assert_eq!(ProviderType::OpenAIQwenOAuth.protocol_prefix(), "openai");
        assert_eq!(ProviderType::GeminiAntigravity.protocol_prefix(), "gemini");
    }

    #[test]
    fn test_serde_rename() {
        let json = serde_json::to_string(&ProviderType::ClaudeKiroOAuth).unwrap();
        assert_eq!(json, "\"claude-kiro-oauth\"");
    }
}
