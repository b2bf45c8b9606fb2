//! Claude → CodeWhisperer 请求转换
//!
//! 把 Anthropic messages 请求改写为 Kiro generateAssistantResponse
//! 的 conversationState 负载。上游约束：
//! - 消息严格 user/assistant 交替，终止消息必须为 user
//! - 同一消息内 tool_result 不允许重复 toolUseId
//! - 过长的工具描述会被拒绝

use serde_json::{json, Value};

use crate::models::claude::{
    ClaudeRequest, ContentBlock, Message, MessageContent, SystemPrompt,
};

/// 工具描述长度上限，超出截断并加省略号
const TOOL_DESCRIPTION_MAX_LENGTH: usize = 9216;
/// 仅保留最近 N 条历史消息中的图片，限制长对话负载体积
const IMAGE_HISTORY_WINDOW: usize = 5;

/// 模型名 → CodeWhisperer modelId
pub fn map_model_id(model: &str) -> String {
    match model {
        "claude-opus-4-5" | "claude-opus-4-5-20251101" => "claude-opus-4.5".to_string(),
        "claude-haiku-4-5" => "claude-haiku-4.5".to_string(),
        "claude-sonnet-4-5" | "claude-sonnet-4-5-20250929" => {
            "CLAUDE_SONNET_4_5_20250929_V1_0".to_string()
        }
        "claude-sonnet-4" | "claude-sonnet-4-20250514" => {
            "CLAUDE_SONNET_4_20250514_V1_0".to_string()
        }
        "claude-3-7-sonnet-20250219" => "CLAUDE_3_7_SONNET_20250219_V1_0".to_string(),
        other => other.to_string(),
    }
}

/// 合并后的消息：同角色相邻消息已并为一条
struct MergedMessage {
    role: String,
    blocks: Vec<ContentBlock>,
}

fn flatten_content(content: &MessageContent) -> Vec<ContentBlock> {
    match content {
        MessageContent::String(s) => vec![ContentBlock::Text {
            text: s.clone(),
            cache_control: None,
        }],
        MessageContent::Array(blocks) => blocks.clone(),
    }
}

/// 尾部 assistant 消息内容是否只有字面量 "{"
///
/// 部分客户端发送该 no-op 续写占位，上游会把它当成真实回答。
fn is_brace_continuation(msg: &Message) -> bool {
    if msg.role != "assistant" {
        return false;
    }
    match &msg.content {
        MessageContent::String(s) => s == "{",
        MessageContent::Array(blocks) => {
            blocks.len() == 1
                && matches!(&blocks[0], ContentBlock::Text { text, .. } if text == "{")
        }
    }
}

fn merge_adjacent(messages: &[Message]) -> Vec<MergedMessage> {
    let mut merged: Vec<MergedMessage> = Vec::new();
    for msg in messages {
        let blocks = flatten_content(&msg.content);
        if let Some(last) = merged.last_mut() {
            if last.role == msg.role {
                last.blocks.extend(blocks);
                continue;
            }
        }
        merged.push(MergedMessage {
            role: msg.role.clone(),
            blocks,
        });
    }
    merged
}

/// 同一消息内按 tool_use_id 去重 tool_result
fn dedupe_tool_results(blocks: &mut Vec<ContentBlock>) {
    let mut seen = std::collections::HashSet::new();
    blocks.retain(|b| match b {
        ContentBlock::ToolResult { tool_use_id, .. } => seen.insert(tool_use_id.clone()),
        _ => true,
    });
}

/// 文本抽取：text 块换行拼接，assistant 的 thinking 块折叠为
/// `<thinking>…</thinking>` 包装
fn extract_text(blocks: &[ContentBlock], collapse_thinking: bool) -> String {
    let mut parts = Vec::new();
    for block in blocks {
        match block {
            ContentBlock::Text { text, .. } => {
                if !text.is_empty() {
                    parts.push(text.clone());
                }
            }
            ContentBlock::Thinking { thinking, .. } if collapse_thinking => {
                if !thinking.is_empty() {
                    parts.push(format!("<thinking>\n{}\n</thinking>", thinking));
                }
            }
            _ => {}
        }
    }
    parts.join("\n")
}

fn extract_tool_uses(blocks: &[ContentBlock]) -> Vec<Value> {
    blocks
        .iter()
        .filter_map(|b| match b {
            ContentBlock::ToolUse {
                id, name, input, ..
            } => Some(json!({
                "toolUseId": id,
                "name": name,
                "input": input
            })),
            _ => None,
        })
        .collect()
}

fn extract_tool_results(blocks: &[ContentBlock]) -> Vec<Value> {
    blocks
        .iter()
        .filter_map(|b| match b {
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
                ..
            } => {
                let text = match content {
                    Some(Value::String(s)) => s.clone(),
                    Some(Value::Array(arr)) => arr
                        .iter()
                        .filter_map(|item| item.get("text").and_then(|t| t.as_str()))
                        .collect::<Vec<_>>()
                        .join("\n"),
                    Some(other) => other.to_string(),
                    None => String::new(),
                };
                let status = if is_error.unwrap_or(false) {
                    "error"
                } else {
                    "success"
                };
                Some(json!({
                    "toolUseId": tool_use_id,
                    "content": [{"text": text}],
                    "status": status
                }))
            }
            _ => None,
        })
        .collect()
}

fn extract_images(blocks: &[ContentBlock]) -> Vec<Value> {
    blocks
        .iter()
        .filter_map(|b| match b {
            ContentBlock::Image { source, .. } => {
                let format_str = source
                    .media_type
                    .split('/')
                    .next_back()
                    .unwrap_or(&source.media_type)
                    .to_string();
                Some(json!({
                    "format": format_str,
                    "source": { "bytes": source.data }
                }))
            }
            _ => None,
        })
        .collect()
}

fn image_count(blocks: &[ContentBlock]) -> usize {
    blocks
        .iter()
        .filter(|b| matches!(b, ContentBlock::Image { .. }))
        .count()
}

fn system_text(system: &SystemPrompt) -> String {
    match system {
        SystemPrompt::String(s) => s.clone(),
        SystemPrompt::Array(blocks) => blocks
            .iter()
            .map(|b| b.text.as_str())
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

/// 过滤并裁剪工具定义
///
/// web_search/websearch 属于上游内建能力，透传会被拒绝。
fn build_tool_specifications(request: &ClaudeRequest) -> Vec<Value> {
    let Some(tools) = &request.tools else {
        return Vec::new();
    };

    tools
        .iter()
        .filter(|tool| {
            let lower = tool.name.to_lowercase();
            lower != "web_search" && lower != "websearch"
        })
        .map(|tool| {
            let description = tool.description.as_deref().unwrap_or("");
            let description = if description.chars().count() > TOOL_DESCRIPTION_MAX_LENGTH {
                let truncated: String =
                    description.chars().take(TOOL_DESCRIPTION_MAX_LENGTH).collect();
                format!("{}...", truncated)
            } else {
                description.to_string()
            };
            json!({
                "toolSpecification": {
                    "name": tool.name,
                    "description": description,
                    "inputSchema": {
                        "json": tool.input_schema.clone().unwrap_or(json!({}))
                    }
                }
            })
        })
        .collect()
}

/// 构造 generateAssistantResponse 负载
pub fn build_codewhisperer_payload(request: &ClaudeRequest, profile_arn: Option<String>) -> Value {
    let model_id = map_model_id(&request.model);

    // 丢弃尾部 "{" 续写占位
    let mut messages: Vec<Message> = request.messages.clone();
    if messages.last().map(is_brace_continuation).unwrap_or(false) {
        messages.pop();
    }

    let mut merged = merge_adjacent(&messages);
    for m in &mut merged {
        dedupe_tool_results(&mut m.blocks);
    }

    // system 处理：首条为 user 时前缀合并，否则作为独立首条 user 轮
    let sys = request.system.as_ref().map(system_text);
    if let Some(sys_text) = sys.filter(|s| !s.is_empty()) {
        let sys_block = ContentBlock::Text {
            text: sys_text,
            cache_control: None,
        };
        let first_is_user = merged.first().map(|m| m.role == "user").unwrap_or(false);
        if first_is_user {
            merged[0].blocks.insert(0, sys_block);
        } else {
            merged.insert(
                0,
                MergedMessage {
                    role: "user".to_string(),
                    blocks: vec![sys_block],
                },
            );
        }
    }

    let conversation_id = uuid::Uuid::new_v4().to_string();

    if merged.is_empty() {
        let mut payload = json!({
            "conversationState": {
                "chatTriggerType": "MANUAL",
                "conversationId": conversation_id,
                "currentMessage": {
                    "userInputMessage": {
                        "content": "Continue",
                        "modelId": model_id,
                        "origin": "AI_EDITOR"
                    }
                }
            }
        });
        if let Some(arn) = profile_arn {
            payload["profileArn"] = json!(arn);
        }
        return payload;
    }

    // 终止消息必须为 user：尾部 assistant 留在历史，现取消息合成 "Continue"
    let (history_msgs, current): (&[MergedMessage], Option<&MergedMessage>) =
        if merged.last().map(|m| m.role.as_str()) == Some("assistant") {
            (&merged[..], None)
        } else {
            let (last, rest) = merged.split_last().unwrap();
            (rest, Some(last))
        };

    let history_len = history_msgs.len();
    let mut history: Vec<Value> = Vec::new();

    for (i, m) in history_msgs.iter().enumerate() {
        if m.role == "user" {
            let mut text = extract_text(&m.blocks, false);
            let tool_results = extract_tool_results(&m.blocks);

            // 只保留最近 N 条消息的图片，更早的换成文字占位
            let in_image_window = i + IMAGE_HISTORY_WINDOW >= history_len;
            let images = if in_image_window {
                extract_images(&m.blocks)
            } else {
                let omitted = image_count(&m.blocks);
                if omitted > 0 {
                    let placeholder =
                        format!("[此消息包含 {} 张图片，已在历史记录中省略]", omitted);
                    if text.is_empty() {
                        text = placeholder;
                    } else {
                        text = format!("{}\n{}", text, placeholder);
                    }
                }
                Vec::new()
            };

            let content = if text.is_empty() {
                "(empty)".to_string()
            } else {
                text
            };
            let mut user_input = json!({
                "content": content,
                "modelId": &model_id,
                "origin": "AI_EDITOR"
            });
            if !images.is_empty() {
                user_input["images"] = json!(images);
            }
            if !tool_results.is_empty() {
                user_input["userInputMessageContext"] = json!({ "toolResults": tool_results });
            }
            history.push(json!({ "userInputMessage": user_input }));
        } else {
            let text = extract_text(&m.blocks, true);
            let tool_uses = extract_tool_uses(&m.blocks);
            let content = if text.is_empty() {
                "(empty)".to_string()
            } else {
                text
            };
            let mut assistant_msg = json!({ "content": content });
            if !tool_uses.is_empty() {
                assistant_msg["toolUses"] = json!(tool_uses);
            }
            history.push(json!({ "assistantResponseMessage": assistant_msg }));
        }
    }

    // 历史必须以 assistant 收尾
    if history
        .last()
        .map(|h| h.get("assistantResponseMessage").is_none())
        .unwrap_or(false)
    {
        history.push(json!({ "assistantResponseMessage": { "content": "Continue" } }));
    }

    // currentMessage
    let (current_text, current_tool_results, current_images) = match current {
        Some(m) => (
            extract_text(&m.blocks, false),
            extract_tool_results(&m.blocks),
            extract_images(&m.blocks),
        ),
        None => ("Continue".to_string(), Vec::new(), Vec::new()),
    };
    let current_content = if current_text.is_empty() {
        "Continue".to_string()
    } else {
        current_text
    };

    let mut user_input_message = json!({
        "content": current_content,
        "modelId": &model_id,
        "origin": "AI_EDITOR"
    });
    if !current_images.is_empty() {
        user_input_message["images"] = json!(current_images);
    }

    let mut user_input_context = serde_json::Map::new();
    let specs = build_tool_specifications(request);
    if !specs.is_empty() {
        user_input_context.insert("tools".to_string(), json!(specs));
    }
    if !current_tool_results.is_empty() {
        user_input_context.insert("toolResults".to_string(), json!(current_tool_results));
    }
    if !user_input_context.is_empty() {
        user_input_message["userInputMessageContext"] = Value::Object(user_input_context);
    }

    let mut conversation_state = json!({
        "chatTriggerType": "MANUAL",
        "conversationId": conversation_id,
        "currentMessage": { "userInputMessage": user_input_message }
    });
    if !history.is_empty() {
        conversation_state["history"] = json!(history);
    }

    if let Some(thinking) = &request.thinking {
        if thinking.is_enabled() {
            if let Some(budget) = thinking.budget_tokens {
                conversation_state["thinkingConfig"] = json!({
                    "enabled": true,
                    "budgetTokens": budget
                });
            }
        }
    }

    let mut payload = json!({ "conversationState": conversation_state });
    if let Some(arn) = profile_arn {
        payload["profileArn"] = json!(arn);
    }

    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::claude::{ImageSource, ThinkingConfig, Tool};

    fn user_msg(text: &str) -> Message {
        Message {
            role: "user".to_string(),
            content: MessageContent::String(text.to_string()),
            cache_control: None,
        }
    }

    fn assistant_msg(text: &str) -> Message {
        Message {
            role: "assistant".to_string(),
            content: MessageContent::String(text.to_string()),
            cache_control: None,
        }
    }

    fn request_with(messages: Vec<Message>) -> ClaudeRequest {
        ClaudeRequest {
            model: "claude-sonnet-4-5".to_string(),
            messages,
            system: None,
            tools: None,
            tool_choice: None,
            thinking: None,
            max_tokens: None,
            stream: None,
        }
    }

    fn current_content(payload: &Value) -> &str {
        payload["conversationState"]["currentMessage"]["userInputMessage"]["content"]
            .as_str()
            .unwrap()
    }

    #[test]
    fn test_map_model_id() {
        assert_eq!(
            map_model_id("claude-sonnet-4-5"),
            "CLAUDE_SONNET_4_5_20250929_V1_0"
        );
        assert_eq!(map_model_id("claude-haiku-4-5"), "claude-haiku-4.5");
        assert_eq!(map_model_id("claude-opus-4-5"), "claude-opus-4.5");
        assert_eq!(map_model_id("unknown-model"), "unknown-model");
    }

    #[test]
    fn test_simple_user_message() {
        let payload = build_codewhisperer_payload(&request_with(vec![user_msg("hello")]), None);
        assert_eq!(current_content(&payload), "hello");
        assert!(payload["conversationState"]["history"].is_null());
        assert!(payload["profileArn"].is_null());
    }

    #[test]
    fn test_profile_arn_attached() {
        let payload = build_codewhisperer_payload(
            &request_with(vec![user_msg("hi")]),
            Some("arn:p/1".to_string()),
        );
        assert_eq!(payload["profileArn"], "arn:p/1");
    }

    #[test]
    fn test_trailing_brace_assistant_dropped() {
        let payload = build_codewhisperer_payload(
            &request_with(vec![user_msg("hi"), assistant_msg("{")]),
            None,
        );
        // "{" 占位被丢弃后，"hi" 成为 currentMessage
        assert_eq!(current_content(&payload), "hi");
        assert!(payload["conversationState"]["history"].is_null());
    }

    #[test]
    fn test_adjacent_same_role_merged() {
        let payload = build_codewhisperer_payload(
            &request_with(vec![user_msg("part1"), user_msg("part2")]),
            None,
        );
        assert_eq!(current_content(&payload), "part1\npart2");
    }

    #[test]
    fn test_system_prefixes_first_user() {
        let mut req = request_with(vec![user_msg("question")]);
        req.system = Some(SystemPrompt::String("be terse".to_string()));
        let payload = build_codewhisperer_payload(&req, None);
        assert_eq!(current_content(&payload), "be terse\nquestion");
    }

    #[test]
    fn test_system_standalone_when_first_is_assistant() {
        let mut req = request_with(vec![assistant_msg("earlier answer"), user_msg("next")]);
        req.system = Some(SystemPrompt::String("be terse".to_string()));
        let payload = build_codewhisperer_payload(&req, None);

        let history = payload["conversationState"]["history"].as_array().unwrap();
        assert_eq!(
            history[0]["userInputMessage"]["content"].as_str().unwrap(),
            "be terse"
        );
        assert!(history[1]["assistantResponseMessage"]["content"]
            .as_str()
            .unwrap()
            .contains("earlier answer"));
        assert_eq!(current_content(&payload), "next");
    }

    #[test]
    fn test_trailing_assistant_becomes_history_with_continue() {
        let payload = build_codewhisperer_payload(
            &request_with(vec![user_msg("q"), assistant_msg("partial answer")]),
            None,
        );
        assert_eq!(current_content(&payload), "Continue");
        let history = payload["conversationState"]["history"].as_array().unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(
            history[1]["assistantResponseMessage"]["content"]
                .as_str()
                .unwrap(),
            "partial answer"
        );
    }

    #[test]
    fn test_thinking_collapsed_in_assistant_history() {
        let assistant = Message {
            role: "assistant".to_string(),
            content: MessageContent::Array(vec![
                ContentBlock::Thinking {
                    thinking: "let me think".to_string(),
                    signature: None,
                },
                ContentBlock::Text {
                    text: "answer".to_string(),
                    cache_control: None,
                },
            ]),
            cache_control: None,
        };
        let payload = build_codewhisperer_payload(
            &request_with(vec![user_msg("q"), assistant, user_msg("next")]),
            None,
        );
        let history = payload["conversationState"]["history"].as_array().unwrap();
        let content = history[1]["assistantResponseMessage"]["content"]
            .as_str()
            .unwrap();
        assert!(content.contains("<thinking>\nlet me think\n</thinking>"));
        assert!(content.contains("answer"));
    }

    #[test]
    fn test_tool_use_preserved_in_history() {
        let assistant = Message {
            role: "assistant".to_string(),
            content: MessageContent::Array(vec![ContentBlock::ToolUse {
                id: "tu_1".to_string(),
                name: "read_file".to_string(),
                input: json!({"path": "/x"}),
                cache_control: None,
            }]),
            cache_control: None,
        };
        let payload = build_codewhisperer_payload(
            &request_with(vec![user_msg("q"), assistant, user_msg("next")]),
            None,
        );
        let history = payload["conversationState"]["history"].as_array().unwrap();
        let tool_uses = history[1]["assistantResponseMessage"]["toolUses"]
            .as_array()
            .unwrap();
        assert_eq!(tool_uses[0]["toolUseId"], "tu_1");
        assert_eq!(tool_uses[0]["input"]["path"], "/x");
    }

    #[test]
    fn test_tool_results_deduped_by_id() {
        let user = Message {
            role: "user".to_string(),
            content: MessageContent::Array(vec![
                ContentBlock::ToolResult {
                    tool_use_id: "tu_1".to_string(),
                    content: Some(json!("first")),
                    is_error: None,
                    cache_control: None,
                },
                ContentBlock::ToolResult {
                    tool_use_id: "tu_1".to_string(),
                    content: Some(json!("duplicate")),
                    is_error: None,
                    cache_control: None,
                },
                ContentBlock::ToolResult {
                    tool_use_id: "tu_2".to_string(),
                    content: Some(json!("second")),
                    is_error: Some(true),
                    cache_control: None,
                },
            ]),
            cache_control: None,
        };
        let payload = build_codewhisperer_payload(&request_with(vec![user]), None);
        let results = payload["conversationState"]["currentMessage"]["userInputMessage"]
            ["userInputMessageContext"]["toolResults"]
            .as_array()
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["toolUseId"], "tu_1");
        assert_eq!(results[0]["content"][0]["text"], "first");
        assert_eq!(results[1]["status"], "error");
    }

    #[test]
    fn test_web_search_tools_filtered() {
        let mut req = request_with(vec![user_msg("q")]);
        req.tools = Some(vec![
            Tool {
                name: "WebSearch".to_string(),
                description: None,
                input_schema: None,
                cache_control: None,
            },
            Tool {
                name: "web_search".to_string(),
                description: None,
                input_schema: None,
                cache_control: None,
            },
            Tool {
                name: "read_file".to_string(),
                description: Some("reads a file".to_string()),
                input_schema: Some(json!({"type": "object"})),
                cache_control: None,
            },
        ]);
        let payload = build_codewhisperer_payload(&req, None);
        let tools = payload["conversationState"]["currentMessage"]["userInputMessage"]
            ["userInputMessageContext"]["tools"]
            .as_array()
            .unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0]["toolSpecification"]["name"], "read_file");
    }

    #[test]
    fn test_long_tool_description_truncated() {
        let mut req = request_with(vec![user_msg("q")]);
        req.tools = Some(vec![Tool {
            name: "big".to_string(),
            description: Some("d".repeat(TOOL_DESCRIPTION_MAX_LENGTH + 100)),
            input_schema: None,
            cache_control: None,
        }]);
        let payload = build_codewhisperer_payload(&req, None);
        let desc = payload["conversationState"]["currentMessage"]["userInputMessage"]
            ["userInputMessageContext"]["tools"][0]["toolSpecification"]["description"]
            .as_str()
            .unwrap();
        assert_eq!(desc.len(), TOOL_DESCRIPTION_MAX_LENGTH + 3);
        assert!(desc.ends_with("..."));
    }

    #[test]
    fn test_old_history_images_replaced_with_placeholder() {
        let image_block = ContentBlock::Image {
            source: ImageSource {
                source_type: "base64".to_string(),
                media_type: "image/png".to_string(),
                data: "AAAA".to_string(),
            },
            cache_control: None,
        };
        let image_msg = Message {
            role: "user".to_string(),
            content: MessageContent::Array(vec![
                ContentBlock::Text {
                    text: "look at this".to_string(),
                    cache_control: None,
                },
                image_block.clone(),
            ]),
            cache_control: None,
        };

        // 12 条历史消息，带图消息在最旧一端（窗口外）
        let mut messages = vec![image_msg];
        for i in 0..5 {
            messages.push(assistant_msg(&format!("a{i}")));
            messages.push(user_msg(&format!("u{i}")));
        }
        messages.push(assistant_msg("last"));
        messages.push(user_msg("current"));

        let payload = build_codewhisperer_payload(&request_with(messages), None);
        let history = payload["conversationState"]["history"].as_array().unwrap();
        let first = &history[0]["userInputMessage"];
        assert!(first["images"].is_null());
        assert!(first["content"]
            .as_str()
            .unwrap()
            .contains("[此消息包含 1 张图片，已在历史记录中省略]"));

        // 窗口内的图片保留
        let recent_image = Message {
            role: "user".to_string(),
            content: MessageContent::Array(vec![image_block]),
            cache_control: None,
        };
        let payload = build_codewhisperer_payload(
            &request_with(vec![
                user_msg("q"),
                assistant_msg("a"),
                recent_image,
                assistant_msg("a2"),
                user_msg("current"),
            ]),
            None,
        );
        let history = payload["conversationState"]["history"].as_array().unwrap();
        let img_entry = &history[2]["userInputMessage"];
        assert_eq!(img_entry["images"][0]["format"], "png");
    }

    #[test]
    fn test_thinking_config_forwarded() {
        let mut req = request_with(vec![user_msg("q")]);
        req.thinking = Some(ThinkingConfig {
            thinking_type: "enabled".to_string(),
            budget_tokens: Some(4096),
        });
        let payload = build_codewhisperer_payload(&req, None);
        assert_eq!(
            payload["conversationState"]["thinkingConfig"]["budgetTokens"],
            4096
        );
    }

    #[test]
    fn test_empty_messages_yields_continue() {
        let payload = build_codewhisperer_payload(&request_with(vec![]), None);
        assert_eq!(current_content(&payload), "Continue");
    }
}
