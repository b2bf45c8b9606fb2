//! 思考标签流切分
//!
//! 上游把思考内容内联在文本流里，以 `<thinking>`/`</thinking>`
//! 包裹。本解析器把文本流切分为思考事件与普通文本事件：
//! - 每次吐出时扣留标签长度的安全后缀，跨 chunk 被截断的标签
//!   不会被误发成普通文本
//! - 紧邻引号（`"`、`'`、反引号）的标签视为字面量（通常是工具
//!   参数 JSON 里的字符串），不触发切分

const OPEN_TAG: &str = "<thinking>";
const CLOSE_TAG: &str = "</thinking>";

/// 切分事件
#[derive(Debug, Clone, PartialEq)]
pub enum ThinkingEvent {
    ThinkingStart,
    ThinkingDelta(String),
    ThinkingEnd,
    Text(String),
}

/// 思考标签解析器
#[derive(Debug, Default)]
pub struct ThinkingParser {
    buf: String,
    in_thinking: bool,
}

impl ThinkingParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// 喂入一段文本，返回可安全发出的事件
    pub fn feed(&mut self, chunk: &str) -> Vec<ThinkingEvent> {
        self.buf.push_str(chunk);
        let mut events = Vec::new();
        self.drain_tags(&mut events, false);

        // 安全后缀：留下一个标签长度的尾部
        let holdback = CLOSE_TAG.len().min(self.buf.len());
        let mut emit_len = self.buf.len() - holdback;
        while emit_len > 0 && !self.buf.is_char_boundary(emit_len) {
            emit_len -= 1;
        }
        if emit_len > 0 {
            let part: String = self.buf.drain(..emit_len).collect();
            events.push(self.wrap(part));
        }

        events
    }

    /// 流结束：吐出全部剩余文本，补发未闭合的 ThinkingEnd
    pub fn flush(&mut self) -> Vec<ThinkingEvent> {
        let mut events = Vec::new();
        self.drain_tags(&mut events, true);

        if !self.buf.is_empty() {
            let part = std::mem::take(&mut self.buf);
            events.push(self.wrap(part));
        }
        if self.in_thinking {
            events.push(ThinkingEvent::ThinkingEnd);
            self.in_thinking = false;
        }

        events
    }

    fn wrap(&self, text: String) -> ThinkingEvent {
        if self.in_thinking {
            ThinkingEvent::ThinkingDelta(text)
        } else {
            ThinkingEvent::Text(text)
        }
    }

    fn drain_tags(&mut self, events: &mut Vec<ThinkingEvent>, at_flush: bool) {
        loop {
            let tag = if self.in_thinking { CLOSE_TAG } else { OPEN_TAG };
            let Some(pos) = self.find_tag(tag, at_flush) else {
                break;
            };

            let before: String = self.buf.drain(..pos).collect();
            if !before.is_empty() {
                events.push(self.wrap(before));
            }
            self.buf.drain(..tag.len());

            if self.in_thinking {
                events.push(ThinkingEvent::ThinkingEnd);
            } else {
                events.push(ThinkingEvent::ThinkingStart);
            }
            self.in_thinking = !self.in_thinking;
        }
    }

    /// 查找第一个非字面量标签
    ///
    /// 标签后一个字符尚未到达时（非 flush）返回 None，等待下一个
    /// chunk 再判定引号邻接。
    fn find_tag(&self, tag: &str, at_flush: bool) -> Option<usize> {
        let mut search_from = 0;
        while let Some(rel) = self.buf[search_from..].find(tag) {
            let pos = search_from + rel;
            let prev = self.buf[..pos].chars().next_back();
            let next = self.buf[pos + tag.len()..].chars().next();

            let prev_quoted = matches!(prev, Some('"') | Some('\'') | Some('`'));
            let next_quoted = matches!(next, Some('"') | Some('\'') | Some('`'));

            if next.is_none() && !at_flush {
                // 标签贴着缓冲尾部，邻接字符未知
                return None;
            }
            if !prev_quoted && !next_quoted {
                return Some(pos);
            }
            search_from = pos + tag.len();
        }
        None
    }
}
