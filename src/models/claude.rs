//! Claude 协议请求类型
//!
//! 适配器与缓存估算共用的最小 Anthropic 请求模型。
//! 响应侧为流式事件，见 `stream` 模块。

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 缓存控制标记
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheControl {
    #[serde(rename = "type")]
    pub cache_type: String,
}

/// system 字段：纯文本或结构化块数组
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SystemPrompt {
    String(String),
    Array(Vec<SystemBlock>),
}

/// 结构化 system 块
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemBlock {
    #[serde(rename = "type")]
    pub block_type: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<CacheControl>,
}

/// 图片来源
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageSource {
    #[serde(rename = "type")]
    pub source_type: String,
    pub media_type: String,
    pub data: String,
}

/// 消息内容块
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },
    Image {
        source: ImageSource,
        #[serde(skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },
    Thinking {
        thinking: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },
}

impl ContentBlock {
    /// 块上是否带有 cache_control
    pub fn has_cache_control(&self) -> bool {
        matches!(
            self,
            ContentBlock::Text {
                cache_control: Some(_),
                ..
            } | ContentBlock::Image {
                cache_control: Some(_),
                ..
            } | ContentBlock::ToolUse {
                cache_control: Some(_),
                ..
            } | ContentBlock::ToolResult {
                cache_control: Some(_),
                ..
            }
        )
    }
}

/// 消息内容：纯文本或块数组
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    String(String),
    Array(Vec<ContentBlock>),
}

/// 单条消息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: MessageContent,
    /// 部分客户端在消息级别标注 cache_control
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<CacheControl>,
}

impl Message {
    /// 消息本身或任一内容块带有 cache_control
    pub fn has_cache_control(&self) -> bool {
        if self.cache_control.is_some() {
            return true;
        }
        match &self.content {
            MessageContent::String(_) => false,
            MessageContent::Array(blocks) => blocks.iter().any(|b| b.has_cache_control()),
        }
    }
}

/// 工具定义
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<CacheControl>,
}

/// thinking 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThinkingConfig {
    #[serde(rename = "type")]
    pub thinking_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub budget_tokens: Option<u64>,
}

impl ThinkingConfig {
    pub fn is_enabled(&self) -> bool {
        self.thinking_type == "enabled"
    }
}

/// Claude messages 请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaudeRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemPrompt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<ThinkingConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_content_untagged() {
        let msg: Message =
            serde_json::from_str(r#"{"role":"user","content":"hello"}"#).unwrap();
        assert!(matches!(msg.content, MessageContent::String(ref s) if s == "hello"));

        let msg: Message = serde_json::from_str(
            r#"{"role":"user","content":[{"type":"text","text":"hi"}]}"#,
        )
        .unwrap();
        assert!(matches!(msg.content, MessageContent::Array(ref b) if b.len() == 1));
    }

    #[test]
    fn test_has_cache_control_block_level() {
        let msg: Message = serde_json::from_str(
            r#"{"role":"user","content":[
                {"type":"text","text":"hi","cache_control":{"type":"ephemeral"}}
            ]}"#,
        )
        .unwrap();
        assert!(msg.has_cache_control());

        let plain: Message =
            serde_json::from_str(r#"{"role":"user","content":"hi"}"#).unwrap();
        assert!(!plain.has_cache_control());
    }

    #[test]
    fn test_has_cache_control_message_level() {
        let msg: Message = serde_json::from_str(
            r#"{"role":"user","content":"hi","cache_control":{"type":"ephemeral"}}"#,
        )
        .unwrap();
        assert!(msg.has_cache_control());
    }

    #[test]
    fn test_tool_result_roundtrip() {
        let block: ContentBlock = serde_json::from_str(
            r#"{"type":"tool_result","tool_use_id":"tu_1","content":"ok"}"#,
        )
        .unwrap();
        assert!(matches!(
            block,
            ContentBlock::ToolResult { ref tool_use_id, .. } if tool_use_id == "tu_1"
        ));
    }

    #[test]
    fn test_thinking_enabled() {
        let cfg: ThinkingConfig =
            serde_json::from_str(r#"{"type":"enabled","budget_tokens":2048}"#).unwrap();
        assert!(cfg.is_enabled());
        assert_eq!(cfg.budget_tokens, Some(2048));
    }
}
