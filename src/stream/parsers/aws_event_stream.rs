//! AWS Event Stream 解析器
//!
//! Kiro/CodeWhisperer 返回的是二进制帧内嵌 JSON 负载的 AWS Event
//! Stream。二进制帧头可能包含随机的 `{`/`}` 字节，不能盲目扫描
//! 大括号，只在已知键前缀处开始提取：
//! - `{"content":` 文本增量
//! - `{"name":` 工具调用开始
//! - `{"input":` 工具参数增量
//! - `{"stop":` 工具调用结束 / 流终止
//! - `{"followupPrompt":` 跟进提示（忽略）
//! - `{"contextUsagePercentage":` 上下文用量终帧
//!
//! 提取使用识别字符串字面量和转义的括号计数器；无法解析的片段
//! 跳过，通过推进到最近一个成功闭合处保证前进。

use std::collections::HashSet;

use crate::stream::events::KiroStreamEvent;

/// 已知 JSON 事件前缀
const PATTERNS: &[&[u8]] = &[
    b"{\"content\":",
    b"{\"name\":",
    b"{\"input\":",
    b"{\"stop\":",
    b"{\"followupPrompt\":",
    b"{\"contextUsagePercentage\":",
];

/// AWS Event Stream 解析器
#[derive(Debug)]
pub struct AwsEventStreamParser {
    /// 跨 chunk 缓冲
    buffer: Vec<u8>,
    /// 缓冲上限（10 MiB），超出即丢弃
    max_buffer_size: usize,
    /// 已开始的工具调用 id（区分 start 帧与 input 增量帧）
    started_tools: HashSet<String>,
    /// 上一条文本增量，抑制连续重复
    last_content: Option<String>,
    /// 解析失败计数
    parse_error_count: u32,
}

impl Default for AwsEventStreamParser {
    fn default() -> Self {
        Self::new()
    }
}

impl AwsEventStreamParser {
    pub const DEFAULT_MAX_BUFFER_SIZE: usize = 10 * 1024 * 1024;

    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            max_buffer_size: Self::DEFAULT_MAX_BUFFER_SIZE,
            started_tools: HashSet::new(),
            last_content: None,
            parse_error_count: 0,
        }
    }

    pub fn parse_error_count(&self) -> u32 {
        self.parse_error_count
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer.len()
    }

    /// 处理一个到达的字节块，返回解析出的事件
    pub fn process(&mut self, bytes: &[u8]) -> Vec<KiroStreamEvent> {
        if bytes.is_empty() {
            return Vec::new();
        }

        if self.buffer.len() + bytes.len() > self.max_buffer_size {
            self.parse_error_count += 1;
            tracing::error!(
                "[AWS_PARSER] buffer overflow: {} + {} > {}, dropping buffer",
                self.buffer.len(),
                bytes.len(),
                self.max_buffer_size
            );
            self.buffer.clear();
            return Vec::new();
        }

        self.buffer.extend_from_slice(bytes);
        self.parse_buffer()
    }

    /// 流结束，清空缓冲并返回残余事件
    pub fn finish(&mut self) -> Vec<KiroStreamEvent> {
        let events = self.parse_buffer();
        self.buffer.clear();
        events
    }

    fn parse_buffer(&mut self) -> Vec<KiroStreamEvent> {
        let mut events = Vec::new();
        let mut consumed = 0;

        loop {
            let start = match find_earliest_pattern(&self.buffer, consumed) {
                Some(pos) => pos,
                None => {
                    // 无完整前缀：丢掉已扫描的二进制垃圾，只留可能是
                    // 前缀开头的尾部
                    consumed = drain_point_without_pattern(&self.buffer, consumed);
                    break;
                }
            };

            match extract_json(&self.buffer, start) {
                Some(end) => {
                    match serde_json::from_slice::<serde_json::Value>(&self.buffer[start..end]) {
                        Ok(value) => {
                            if let Some(event) = self.classify(value) {
                                events.push(event);
                            }
                        }
                        Err(e) => {
                            self.parse_error_count += 1;
                            tracing::warn!("[AWS_PARSER] skipping malformed segment: {}", e);
                        }
                    }
                    consumed = end;
                }
                None => {
                    // JSON 不完整，等待后续数据；已消费部分先行丢弃
                    consumed = start;
                    break;
                }
            }
        }

        if consumed > 0 {
            self.buffer.drain(..consumed);
        }

        events
    }

    fn classify(&mut self, value: serde_json::Value) -> Option<KiroStreamEvent> {
        // followupPrompt 整帧忽略
        if value.get("followupPrompt").is_some() {
            return None;
        }

        if let Some(content) = value.get("content").and_then(|v| v.as_str()) {
            // 抑制连续重复的文本增量
            if self.last_content.as_deref() == Some(content) {
                return None;
            }
            self.last_content = Some(content.to_string());
            return Some(KiroStreamEvent::Content(content.to_string()));
        }

        if let Some(pct) = value.get("contextUsagePercentage").and_then(|v| v.as_f64()) {
            return Some(KiroStreamEvent::ContextUsage(pct));
        }

        let tool_use_id = value
            .get("toolUseId")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        let is_stop = value.get("stop").and_then(|v| v.as_bool()).unwrap_or(false);
        if is_stop {
            if let Some(id) = &tool_use_id {
                self.started_tools.remove(id);
            }
            return Some(KiroStreamEvent::ToolUseStop { id: tool_use_id });
        }

        if let Some(id) = tool_use_id {
            let name = value.get("name").and_then(|v| v.as_str()).unwrap_or("");
            let input = value
                .get("input")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string());

            // 参数增量帧可能同时携带 name，因此用已开始集合区分
            if !name.is_empty() && !self.started_tools.contains(&id) {
                self.started_tools.insert(id.clone());
                return Some(KiroStreamEvent::ToolUseStart {
                    id,
                    name: name.to_string(),
                    input,
                });
            }

            if let Some(input) = input {
                return Some(KiroStreamEvent::ToolUseInput { id, input });
            }
        }

        None
    }
}

/// 查找最早的已知前缀位置
fn find_earliest_pattern(buffer: &[u8], from: usize) -> Option<usize> {
    let mut earliest: Option<usize> = None;
    for pattern in PATTERNS {
        if let Some(pos) = find_subslice(&buffer[from..], pattern) {
            let abs = from + pos;
            earliest = Some(earliest.map_or(abs, |e: usize| e.min(abs)));
        }
    }
    earliest
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// 无前缀命中时可安全丢弃到的位置
///
/// 尾部若是某个前缀的开头则保留，等待下一个 chunk 补全。
fn drain_point_without_pattern(buffer: &[u8], from: usize) -> usize {
    let max_keep = PATTERNS.iter().map(|p| p.len()).max().unwrap_or(0);
    let tail_start = buffer.len().saturating_sub(max_keep);
    for start in tail_start.max(from)..buffer.len() {
        let tail = &buffer[start..];
        if PATTERNS.iter().any(|p| p.starts_with(tail)) {
            return start;
        }
    }
    buffer.len()
}

/// 从 start（必须是 `{`）提取完整 JSON 对象，返回结束位置（独占）
///
/// 括号计数器识别字符串字面量与转义，二进制高位字节不会与
/// ASCII 的 `{`/`}`/`"` 冲突。
fn extract_json(buffer: &[u8], start: usize) -> Option<usize> {
    if start >= buffer.len() || buffer[start] != b'{' {
        return None;
    }

    let mut brace_count = 0i32;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, &b) in buffer[start..].iter().enumerate() {
        if escape_next {
            escape_next = false;
            continue;
        }

        match b {
            b'\\' if in_string => escape_next = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => brace_count += 1,
            b'}' if !in_string => {
                brace_count -= 1;
                if brace_count == 0 {
                    return Some(start + i + 1);
                }
            }
            _ => {}
        }
    }

    None
}
