//! Kiro 提示词缓存估算
//!
//! 上游不上报 prompt cache 的读写量，这里根据请求体和该账号的
//! 近期请求历史确定性地重建 (cache_read, cache_creation, uncached)
//! 三元组，三者之和恒等于给定的总输入 token 数。
//!
//! 估算分层：静态前缀（system + tools + tool_choice + thinking
//! 配置）的 MD5 是缓存身份；最后一个 cache_control 断点之前的
//! 消息逐条做稳定投影哈希，与账号历史比对。乐观模式把每条单独
//! 命中的消息都计为 cache_read（与真实上游语义有偏差，刻意为之，
//! 可用 `KIRO_OPTIMISTIC_CACHE=false` 切回严格模式）。

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use std::collections::HashMap;

use crate::config::{kiro_cache_debug, kiro_optimistic_cache};
use crate::models::claude::{
    ClaudeRequest, ContentBlock, Message, MessageContent, SystemPrompt,
};

/// 条目 TTL，与上游缓存 TTL 对齐
const ENTRY_TTL_MINUTES: i64 = 5;
/// 单账号条目上限
const MAX_ENTRIES: usize = 500;

/// 用量三元组
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UsageSplit {
    pub cache_read: u64,
    pub cache_creation: u64,
    pub uncached: u64,
}

impl UsageSplit {
    pub fn total(&self) -> u64 {
        self.cache_read + self.cache_creation + self.uncached
    }

    fn all_uncached(total: u64) -> Self {
        Self {
            cache_read: 0,
            cache_creation: 0,
            uncached: total,
        }
    }

    /// 收敛到总量：读优先，写次之，剩余为未缓存
    fn clamp_to_total(read: u64, creation: u64, total: u64) -> Self {
        let cache_read = read.min(total);
        let cache_creation = creation.min(total - cache_read);
        Self {
            cache_read,
            cache_creation,
            uncached: total - cache_read - cache_creation,
        }
    }
}

/// tool_result 投影策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ToolResultStrategy {
    /// 完整内容参与哈希
    #[default]
    Strict,
    /// 完全跳过 tool_result 块
    Ignore,
    /// 只哈希块类型
    NameOnly,
}

#[derive(Debug, Clone)]
struct CachedMessage {
    index: usize,
    role: String,
    content_hash: String,
    tokens: u64,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    static_prefix_tokens: u64,
    prefix_messages_tokens: u64,
    cached_messages: Vec<CachedMessage>,
    all_messages_tokens: Vec<u64>,
    hit_count: u64,
    timestamp: DateTime<Utc>,
}

/// 单账号缓存估算器
#[derive(Debug)]
pub struct CacheEstimator {
    entries: HashMap<String, CacheEntry>,
    optimistic: bool,
    tool_result_strategy: ToolResultStrategy,
}

impl Default for CacheEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheEstimator {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            optimistic: kiro_optimistic_cache(),
            tool_result_strategy: ToolResultStrategy::default(),
        }
    }

    pub fn with_mode(mut self, optimistic: bool) -> Self {
        self.optimistic = optimistic;
        self
    }

    pub fn with_tool_result_strategy(mut self, strategy: ToolResultStrategy) -> Self {
        self.tool_result_strategy = strategy;
        self
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// 估算一次请求的用量切分
    ///
    /// `total_input_tokens` 是外部预先算好的总输入量；返回值满足
    /// `cache_read + cache_creation + uncached == total_input_tokens`。
    pub fn estimate(&mut self, request: &ClaudeRequest, total_input_tokens: u64) -> UsageSplit {
        self.purge_expired(Utc::now());

        // 1. 可缓存性
        let system_has_cc = system_has_cache_control(request.system.as_ref());
        let tools_has_cc = request
            .tools
            .as_ref()
            .and_then(|t| t.last())
            .map(|t| t.cache_control.is_some())
            .unwrap_or(false);
        let any_message_cc = request.messages.iter().any(|m| m.has_cache_control());

        if !system_has_cc && !tools_has_cc && !any_message_cc {
            return UsageSplit::all_uncached(total_input_tokens);
        }

        // 2. 最后一个缓存断点
        let breakpoint = request
            .messages
            .iter()
            .rposition(|m| m.has_cache_control());

        // 3. 逐消息 token
        let all_messages_tokens: Vec<u64> = request
            .messages
            .iter()
            .map(|m| estimate_message_tokens(m, self.tool_result_strategy))
            .collect();
        let prefix_len = breakpoint.map(|k| k + 1).unwrap_or(0);
        let prefix_messages_tokens: u64 = all_messages_tokens[..prefix_len].iter().sum();

        // 4. 静态前缀哈希（缓存身份）
        let static_prefix_tokens = estimate_static_prefix_tokens(request);
        let prefix_hash = static_prefix_hash(request);

        // 5. 断点前逐消息内容哈希
        let current_messages: Vec<CachedMessage> = request.messages[..prefix_len]
            .iter()
            .enumerate()
            .map(|(i, m)| CachedMessage {
                index: i,
                role: m.role.clone(),
                content_hash: message_content_hash(m, self.tool_result_strategy),
                tokens: all_messages_tokens[i],
            })
            .collect();

        // 6. 可缓存总量与模型最小阈值
        let static_cacheable = if system_has_cc || tools_has_cc {
            static_prefix_tokens
        } else {
            0
        };
        let total_cacheable = static_cacheable + prefix_messages_tokens;
        if total_cacheable < min_cacheable_tokens(&request.model) {
            if kiro_cache_debug() {
                tracing::debug!(
                    "[CACHE_EST] below minimum: cacheable={} < min for {}",
                    total_cacheable,
                    request.model
                );
            }
            return UsageSplit::all_uncached(total_input_tokens);
        }

        // 7. 与历史比对
        let (read, creation) = match self.entries.get(&prefix_hash) {
            None => (0, total_cacheable),
            Some(entry) => {
                let (msg_read, msg_creation) =
                    self.compare_messages(entry, &current_messages);
                // 条目存在即静态部分命中（静态内容参与了 prefix_hash）
                (static_cacheable + msg_read, msg_creation)
            }
        };

        // 8. 以当前消息刷新条目
        let hit_count = self
            .entries
            .get(&prefix_hash)
            .map(|e| e.hit_count + 1)
            .unwrap_or(0);
        self.insert_entry(
            prefix_hash,
            CacheEntry {
                static_prefix_tokens,
                prefix_messages_tokens,
                cached_messages: current_messages,
                all_messages_tokens,
                hit_count,
                timestamp: Utc::now(),
            },
        );

        // 9. 收敛到总量
        let split = UsageSplit::clamp_to_total(read, creation, total_input_tokens);
        if kiro_cache_debug() {
            tracing::debug!(
                "[CACHE_EST] read={} creation={} uncached={} (optimistic={})",
                split.cache_read,
                split.cache_creation,
                split.uncached,
                self.optimistic
            );
        }
        split
    }

    /// 断点前消息与历史条目的比对
    fn compare_messages(
        &self,
        entry: &CacheEntry,
        current: &[CachedMessage],
    ) -> (u64, u64) {
        let mut read = 0u64;
        let mut creation = 0u64;

        if self.optimistic {
            // 乐观：逐条独立命中，错位空洞不打断后续命中
            for msg in current {
                let matched = entry.cached_messages.get(msg.index).map(|stored| {
                    stored.role == msg.role && stored.content_hash == msg.content_hash
                });
                if matched.unwrap_or(false) {
                    read += msg.tokens;
                } else {
                    creation += msg.tokens;
                }
            }
        } else {
            // 严格：第一处不匹配打断前缀，其后全部算新建
            let mut broken = false;
            for msg in current {
                if !broken {
                    let matched = entry.cached_messages.get(msg.index).map(|stored| {
                        stored.role == msg.role && stored.content_hash == msg.content_hash
                    });
                    if matched.unwrap_or(false) {
                        read += msg.tokens;
                        continue;
                    }
                    broken = true;
                }
                creation += msg.tokens;
            }
        }

        (read, creation)
    }

    fn purge_expired(&mut self, now: DateTime<Utc>) {
        let ttl = Duration::minutes(ENTRY_TTL_MINUTES);
        self.entries.retain(|_, e| now - e.timestamp <= ttl);
    }

    fn insert_entry(&mut self, key: String, entry: CacheEntry) {
        self.entries.insert(key, entry);
        while self.entries.len() > MAX_ENTRIES {
            // 淘汰最旧
            if let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.timestamp)
                .map(|(k, _)| k.clone())
            {
                self.entries.remove(&oldest);
            } else {
                break;
            }
        }
    }
}

/// 模型相关的最小可缓存 token 阈值
fn min_cacheable_tokens(model: &str) -> u64 {
    if model.contains("opus-4-5") || model.contains("haiku-4-5") {
        4096
    } else if model.contains("haiku-3-5") || model.contains("haiku-3") {
        2048
    } else {
        1024
    }
}

fn system_has_cache_control(system: Option<&SystemPrompt>) -> bool {
    match system {
        Some(SystemPrompt::Array(blocks)) => blocks.iter().any(|b| b.cache_control.is_some()),
        _ => false,
    }
}

/// 粗粒度 token 估算（字符数 / 4，非空至少 1）
fn estimate_tokens(text: &str) -> u64 {
    if text.is_empty() {
        return 0;
    }
    (text.chars().count() as u64 / 4).max(1)
}

fn estimate_message_tokens(msg: &Message, strategy: ToolResultStrategy) -> u64 {
    estimate_tokens(&message_projection(msg, strategy))
}

fn estimate_static_prefix_tokens(request: &ClaudeRequest) -> u64 {
    let mut total = 0u64;
    if let Some(system) = &request.system {
        let text = match system {
            SystemPrompt::String(s) => s.clone(),
            SystemPrompt::Array(blocks) => blocks
                .iter()
                .map(|b| b.text.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
        };
        total += estimate_tokens(&text);
    }
    if let Some(tools) = &request.tools {
        for tool in tools {
            total += estimate_tokens(&tool.name);
            total += estimate_tokens(tool.description.as_deref().unwrap_or(""));
            if let Some(schema) = &tool.input_schema {
                total += estimate_tokens(&schema.to_string());
            }
        }
    }
    total
}

/// 静态前缀哈希：缓存身份
///
/// stableSystem 只保留 {type,text,cache_control}，stableTools 只保留
/// {name,description,input_schema}，连同 model、tool_choice、thinking
/// 配置一起序列化后取 MD5。
fn static_prefix_hash(request: &ClaudeRequest) -> String {
    let stable_system = match &request.system {
        Some(SystemPrompt::String(s)) => json!(s),
        Some(SystemPrompt::Array(blocks)) => json!(blocks
            .iter()
            .map(|b| {
                json!({
                    "type": b.block_type,
                    "text": b.text,
                    "cache_control": b.cache_control,
                })
            })
            .collect::<Vec<_>>()),
        None => json!(null),
    };

    let stable_tools = match &request.tools {
        Some(tools) => json!(tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.input_schema,
                })
            })
            .collect::<Vec<_>>()),
        None => json!(null),
    };

    let stable = json!({
        "model": request.model,
        "system": stable_system,
        "tools": stable_tools,
        "tool_choice": request.tool_choice,
        "thinking": request.thinking.as_ref().map(|t| {
            json!({"type": t.thinking_type, "budget_tokens": t.budget_tokens})
        }),
    });

    format!("{:x}", md5::compute(stable.to_string()))
}

/// 把奇异箭头、控制字符、私用区字符归一化为 ASCII
///
/// 同一段文本经不同客户端转写后字形会漂移，归一化让哈希稳定。
fn normalize_text(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '→' | '⇒' | '➔' | '➜' | '⟶' | '↦' => out.push_str("->"),
            '←' | '⇐' | '⟵' => out.push_str("<-"),
            '\n' | '\t' => out.push(c),
            c if (c as u32) < 0x20 => out.push(' '),
            c if ('\u{E000}'..='\u{F8FF}').contains(&c) => out.push(' '),
            c => out.push(c),
        }
    }
    out
}

/// 图片指纹：不吞整段 base64
fn image_fingerprint(data: &str) -> String {
    let head: String = data.chars().take(32).collect();
    let tail: String = data
        .chars()
        .rev()
        .take(32)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("img:{}:{}:{}", data.len(), head, tail)
}

/// 消息的稳定文本投影
///
/// 排除易变字段（cache_control、tool_use_id、id、input），
/// tool_result 按策略处理。
fn message_projection(msg: &Message, strategy: ToolResultStrategy) -> String {
    let mut parts = vec![format!("{}:", msg.role)];

    match &msg.content {
        MessageContent::String(s) => parts.push(format!("text:{}", normalize_text(s))),
        MessageContent::Array(blocks) => {
            for block in blocks {
                match block {
                    ContentBlock::Text { text, .. } => {
                        parts.push(format!("text:{}", normalize_text(text)));
                    }
                    ContentBlock::Thinking { thinking, .. } => {
                        parts.push(format!("thinking:{}", normalize_text(thinking)));
                    }
                    ContentBlock::Image { source, .. } => {
                        parts.push(image_fingerprint(&source.data));
                    }
                    ContentBlock::ToolUse { name, .. } => {
                        parts.push(format!("tool_use:{}", name));
                    }
                    ContentBlock::ToolResult { content, .. } => match strategy {
                        ToolResultStrategy::Ignore => {}
                        ToolResultStrategy::NameOnly => {
                            parts.push("tool_result".to_string());
                        }
                        ToolResultStrategy::Strict => {
                            let text = match content {
                                Some(serde_json::Value::String(s)) => s.clone(),
                                Some(other) => other.to_string(),
                                None => String::new(),
                            };
                            parts.push(format!("tool_result:{}", normalize_text(&text)));
                        }
                    },
                }
            }
        }
    }

    parts.join("\n")
}

fn message_content_hash(msg: &Message, strategy: ToolResultStrategy) -> String {
    format!(
        "{:x}",
        md5::compute(message_projection(msg, strategy))
    )
}
