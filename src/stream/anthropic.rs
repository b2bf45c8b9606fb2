//! Kiro 事件 → Anthropic SSE 组装
//!
//! 把解析器输出的低层事件组装为 Anthropic 兼容的帧序列：
//! `message_start` → `content_block_start/_delta/_stop` →
//! `message_delta`（stop_reason + 用量）→ `message_stop`。
//! `message_start` 的 input_tokens 取缓存估算的未命中部分，
//! cache_read/cache_creation 注入估算结果。工具调用在流内累积，
//! 流收尾时整块发出（上游的参数增量不保证与块边界对齐）。

use futures::StreamExt;
use serde_json::{json, Value};

use crate::cache::estimator::UsageSplit;
use crate::providers::ProviderError;
use crate::stream::events::{KiroStreamEvent, StopReason};
use crate::stream::parsers::aws_event_stream::AwsEventStreamParser;
use crate::stream::thinking::{ThinkingEvent, ThinkingParser};
use crate::stream::tool_recovery::parse_bracket_tool_calls;

/// 流内累积的工具调用
struct PendingToolCall {
    tool_use_id: String,
    name: String,
    input_buffer: String,
}

/// Anthropic SSE 组装器
pub struct AnthropicSseBuilder {
    message_id: String,
    model: String,
    usage: UsageSplit,
    content_index: usize,
    in_text_block: bool,
    thinking_block_index: Option<usize>,
    thinking_parser: Option<ThinkingParser>,
    accumulated_text: String,
    output_char_count: usize,
    has_sent_message_start: bool,
    current_tool: Option<PendingToolCall>,
    completed_tools: Vec<PendingToolCall>,
    has_tool_calls: bool,
}

impl AnthropicSseBuilder {
    /// `thinking_enabled` 为 true 时启用思考标签切分
    pub fn new(model: &str, usage: UsageSplit, thinking_enabled: bool) -> Self {
        Self {
            message_id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
            model: model.to_string(),
            usage,
            content_index: 0,
            in_text_block: false,
            thinking_block_index: None,
            thinking_parser: thinking_enabled.then(ThinkingParser::new),
            accumulated_text: String::new(),
            output_char_count: 0,
            has_sent_message_start: false,
            current_tool: None,
            completed_tools: Vec::new(),
            has_tool_calls: false,
        }
    }

    fn format_sse(event: &str, data: &Value) -> String {
        format!(
            "event: {}\ndata: {}\n\n",
            event,
            serde_json::to_string(data).unwrap_or_default()
        )
    }

    fn message_start(&mut self) -> String {
        if self.has_sent_message_start {
            return String::new();
        }
        self.has_sent_message_start = true;
        Self::format_sse(
            "message_start",
            &json!({
                "type": "message_start",
                "message": {
                    "id": self.message_id,
                    "type": "message",
                    "role": "assistant",
                    "content": [],
                    "model": self.model,
                    "stop_reason": null,
                    "stop_sequence": null,
                    "usage": {
                        "input_tokens": self.usage.uncached,
                        "cache_creation_input_tokens": self.usage.cache_creation,
                        "cache_read_input_tokens": self.usage.cache_read,
                        "output_tokens": 0
                    }
                }
            }),
        )
    }

    fn close_text_block(&mut self) -> String {
        if !self.in_text_block {
            return String::new();
        }
        self.in_text_block = false;
        let out = Self::format_sse(
            "content_block_stop",
            &json!({"type": "content_block_stop", "index": self.content_index}),
        );
        self.content_index += 1;
        out
    }

    fn emit_text(&mut self, text: &str) -> String {
        let mut out = String::new();
        self.accumulated_text.push_str(text);
        if !self.in_text_block {
            out.push_str(&Self::format_sse(
                "content_block_start",
                &json!({
                    "type": "content_block_start",
                    "index": self.content_index,
                    "content_block": {"type": "text", "text": ""}
                }),
            ));
            self.in_text_block = true;
        }
        self.output_char_count += text.len();
        out.push_str(&Self::format_sse(
            "content_block_delta",
            &json!({
                "type": "content_block_delta",
                "index": self.content_index,
                "delta": {"type": "text_delta", "text": text}
            }),
        ));
        out
    }

    fn emit_thinking_event(&mut self, event: ThinkingEvent) -> String {
        let mut out = String::new();
        match event {
            ThinkingEvent::ThinkingStart => {
                out.push_str(&self.close_text_block());
                out.push_str(&Self::format_sse(
                    "content_block_start",
                    &json!({
                        "type": "content_block_start",
                        "index": self.content_index,
                        "content_block": {"type": "thinking", "thinking": ""}
                    }),
                ));
                self.thinking_block_index = Some(self.content_index);
                self.content_index += 1;
            }
            ThinkingEvent::ThinkingDelta(text) => {
                if let Some(idx) = self.thinking_block_index {
                    self.output_char_count += text.len();
                    out.push_str(&Self::format_sse(
                        "content_block_delta",
                        &json!({
                            "type": "content_block_delta",
                            "index": idx,
                            "delta": {"type": "thinking_delta", "thinking": text}
                        }),
                    ));
                }
            }
            ThinkingEvent::ThinkingEnd => {
                if let Some(idx) = self.thinking_block_index.take() {
                    out.push_str(&Self::format_sse(
                        "content_block_stop",
                        &json!({"type": "content_block_stop", "index": idx}),
                    ));
                }
            }
            ThinkingEvent::Text(text) => {
                out.push_str(&self.emit_text(&text));
            }
        }
        out
    }

    fn finalize_current_tool(&mut self) {
        if let Some(tool) = self.current_tool.take() {
            self.completed_tools.push(tool);
        }
    }

    /// 处理一个上游事件，返回要下发的 SSE 片段
    pub fn process_event(&mut self, event: KiroStreamEvent) -> String {
        let mut out = self.message_start();

        match event {
            KiroStreamEvent::Content(text) => {
                if let Some(mut parser) = self.thinking_parser.take() {
                    for tp_event in parser.feed(&text) {
                        out.push_str(&self.emit_thinking_event(tp_event));
                    }
                    self.thinking_parser = Some(parser);
                } else {
                    out.push_str(&self.emit_text(&text));
                }
            }
            KiroStreamEvent::ToolUseStart { id, name, input } => {
                out.push_str(&self.close_text_block());
                self.finalize_current_tool();
                self.current_tool = Some(PendingToolCall {
                    tool_use_id: id,
                    name,
                    input_buffer: input.unwrap_or_default(),
                });
            }
            KiroStreamEvent::ToolUseInput { id: _, input } => {
                if let Some(tool) = &mut self.current_tool {
                    tool.input_buffer.push_str(&input);
                }
            }
            KiroStreamEvent::ToolUseStop { .. } => {
                self.finalize_current_tool();
            }
            KiroStreamEvent::ContextUsage(pct) => {
                tracing::debug!("[SSE] context usage {:.2}%", pct);
            }
        }

        out
    }

    fn emit_tool_block(&mut self, id: &str, name: &str, input: &Value) -> String {
        self.has_tool_calls = true;
        let mut out = Self::format_sse(
            "content_block_start",
            &json!({
                "type": "content_block_start",
                "index": self.content_index,
                "content_block": {
                    "type": "tool_use",
                    "id": id,
                    "name": name,
                    "input": {}
                }
            }),
        );
        let input_str = serde_json::to_string(input).unwrap_or_else(|_| "{}".to_string());
        out.push_str(&Self::format_sse(
            "content_block_delta",
            &json!({
                "type": "content_block_delta",
                "index": self.content_index,
                "delta": {"type": "input_json_delta", "partial_json": input_str}
            }),
        ));
        out.push_str(&Self::format_sse(
            "content_block_stop",
            &json!({"type": "content_block_stop", "index": self.content_index}),
        ));
        self.content_index += 1;
        out
    }

    /// 流收尾：补齐思考/文本块、发出累积的工具调用、恢复括号
    /// 文本工具调用，最后 message_delta + message_stop
    pub fn finalize(&mut self) -> String {
        let mut out = self.message_start();

        if let Some(mut parser) = self.thinking_parser.take() {
            for tp_event in parser.flush() {
                out.push_str(&self.emit_thinking_event(tp_event));
            }
        }

        out.push_str(&self.close_text_block());

        self.finalize_current_tool();
        let tools: Vec<PendingToolCall> = self.completed_tools.drain(..).collect();
        for tool in tools {
            let input: Value = if tool.input_buffer.trim().is_empty() {
                json!({})
            } else {
                serde_json::from_str(&tool.input_buffer).unwrap_or(json!({}))
            };
            out.push_str(&self.emit_tool_block(&tool.tool_use_id, &tool.name, &input));
        }

        if !self.accumulated_text.is_empty() {
            let recovered = parse_bracket_tool_calls(&self.accumulated_text);
            for call in recovered {
                out.push_str(&self.emit_tool_block(
                    &call.tool_call_id,
                    &call.name,
                    &call.arguments,
                ));
            }
        }

        let stop_reason = if self.has_tool_calls {
            StopReason::ToolUse
        } else {
            StopReason::EndTurn
        };
        let output_tokens = (self.output_char_count / 4).max(1) as u64;

        out.push_str(&Self::format_sse(
            "message_delta",
            &json!({
                "type": "message_delta",
                "delta": {
                    "stop_reason": stop_reason.as_str(),
                    "stop_sequence": null
                },
                "usage": {
                    "input_tokens": self.usage.uncached,
                    "cache_creation_input_tokens": self.usage.cache_creation,
                    "cache_read_input_tokens": self.usage.cache_read,
                    "output_tokens": output_tokens
                }
            }),
        ));

        out.push_str(&Self::format_sse(
            "message_stop",
            &json!({"type": "message_stop"}),
        ));

        out
    }
}

/// 把上游流式响应灌入解析器并组装为 SSE，逐帧交给 sink
///
/// 网络中断按瞬态错误上抛，已组装的帧不回收；调用方决定是否
/// 走重试阶梯。正常结束时负责 finalize。
pub async fn pump_response(
    response: reqwest::Response,
    builder: &mut AnthropicSseBuilder,
    mut sink: impl FnMut(String),
) -> Result<(), ProviderError> {
    let mut parser = AwsEventStreamParser::new();
    let mut body = response.bytes_stream();

    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(ProviderError::from)?;
        for event in parser.process(&chunk) {
            let sse = builder.process_event(event);
            if !sse.is_empty() {
                sink(sse);
            }
        }
    }

    for event in parser.finish() {
        let sse = builder.process_event(event);
        if !sse.is_empty() {
            sink(sse);
        }
    }
    sink(builder.finalize());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage() -> UsageSplit {
        UsageSplit {
            cache_read: 100,
            cache_creation: 50,
            uncached: 25,
        }
    }

    fn frames(sse: &str) -> Vec<Value> {
        sse.lines()
            .filter_map(|l| l.strip_prefix("data: "))
            .map(|d| serde_json::from_str(d).unwrap())
            .collect()
    }

    #[test]
    fn test_message_start_carries_usage_split() {
        let mut builder = AnthropicSseBuilder::new("claude-sonnet-4-5", usage(), false);
        let out = builder.process_event(KiroStreamEvent::Content("hi".to_string()));
        let frames = frames(&out);

        assert_eq!(frames[0]["type"], "message_start");
        let u = &frames[0]["message"]["usage"];
        assert_eq!(u["input_tokens"], 25);
        assert_eq!(u["cache_read_input_tokens"], 100);
        assert_eq!(u["cache_creation_input_tokens"], 50);
    }

    #[test]
    fn test_text_stream_lifecycle() {
        let mut builder = AnthropicSseBuilder::new("m", usage(), false);
        let mut out = builder.process_event(KiroStreamEvent::Content("Hello ".to_string()));
        out.push_str(&builder.process_event(KiroStreamEvent::Content("world".to_string())));
        out.push_str(&builder.finalize());

        let frames = frames(&out);
        let types: Vec<&str> = frames.iter().map(|f| f["type"].as_str().unwrap()).collect();
        assert_eq!(
            types,
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop"
            ]
        );
        let delta = &frames[5];
        assert_eq!(delta["delta"]["stop_reason"], "end_turn");
        assert!(delta["usage"]["output_tokens"].as_u64().unwrap() >= 1);
    }

    #[test]
    fn test_tool_use_emitted_on_finalize() {
        let mut builder = AnthropicSseBuilder::new("m", usage(), false);
        builder.process_event(KiroStreamEvent::ToolUseStart {
            id: "tool_1".to_string(),
            name: "read_file".to_string(),
            input: Some("{\"pa".to_string()),
        });
        builder.process_event(KiroStreamEvent::ToolUseInput {
            id: "tool_1".to_string(),
            input: "th\":\"/x\"}".to_string(),
        });
        builder.process_event(KiroStreamEvent::ToolUseStop {
            id: Some("tool_1".to_string()),
        });
        let out = builder.finalize();

        let frames = frames(&out);
        let start = frames
            .iter()
            .find(|f| f["type"] == "content_block_start")
            .unwrap();
        assert_eq!(start["content_block"]["type"], "tool_use");
        assert_eq!(start["content_block"]["name"], "read_file");

        let delta = frames
            .iter()
            .find(|f| f["type"] == "content_block_delta")
            .unwrap();
        assert_eq!(
            delta["delta"]["partial_json"].as_str().unwrap(),
            "{\"path\":\"/x\"}"
        );

        let msg_delta = frames.iter().find(|f| f["type"] == "message_delta").unwrap();
        assert_eq!(msg_delta["delta"]["stop_reason"], "tool_use");
    }

    #[test]
    fn test_thinking_split_into_separate_block() {
        let mut builder = AnthropicSseBuilder::new("m", usage(), true);
        let mut out = builder.process_event(KiroStreamEvent::Content(
            "<thinking>pondering</thinking>the answer".to_string(),
        ));
        out.push_str(&builder.finalize());

        let frames = frames(&out);
        let starts: Vec<&Value> = frames
            .iter()
            .filter(|f| f["type"] == "content_block_start")
            .collect();
        assert_eq!(starts[0]["content_block"]["type"], "thinking");
        assert_eq!(starts[1]["content_block"]["type"], "text");

        let thinking_deltas: String = frames
            .iter()
            .filter(|f| f["delta"]["type"] == "thinking_delta")
            .map(|f| f["delta"]["thinking"].as_str().unwrap())
            .collect();
        assert_eq!(thinking_deltas, "pondering");

        let text_deltas: String = frames
            .iter()
            .filter(|f| f["delta"]["type"] == "text_delta")
            .map(|f| f["delta"]["text"].as_str().unwrap())
            .collect();
        assert_eq!(text_deltas, "the answer");
    }

    #[test]
    fn test_bracket_tool_recovery_on_finalize() {
        let mut builder = AnthropicSseBuilder::new("m", usage(), false);
        builder.process_event(KiroStreamEvent::Content(
            "[Called run with args: {\"cmd\": \"ls\"}]".to_string(),
        ));
        let out = builder.finalize();

        let frames = frames(&out);
        let tool_start = frames
            .iter()
            .find(|f| f["content_block"]["type"] == "tool_use")
            .unwrap();
        assert_eq!(tool_start["content_block"]["name"], "run");
        let msg_delta = frames.iter().find(|f| f["type"] == "message_delta").unwrap();
        assert_eq!(msg_delta["delta"]["stop_reason"], "tool_use");
    }
}
