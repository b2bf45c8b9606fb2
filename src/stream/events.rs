//! 流事件类型
//!
//! AWS Event Stream 解析器输出的低层事件。Anthropic 帧的组装
//! 见 `stream::anthropic`。

/// Kiro 上游流事件
#[derive(Debug, Clone, PartialEq)]
pub enum KiroStreamEvent {
    /// 文本增量
    Content(String),
    /// 工具调用开始（可携带首段参数）
    ToolUseStart {
        id: String,
        name: String,
        input: Option<String>,
    },
    /// 工具参数增量
    ToolUseInput { id: String, input: String },
    /// 工具调用结束；无 id 的 stop 帧表示流终止
    ToolUseStop { id: Option<String> },
    /// 上下文用量百分比（终帧）
    ContextUsage(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::EndTurn => "end_turn",
            StopReason::ToolUse => "tool_use",
        }
    }
}
