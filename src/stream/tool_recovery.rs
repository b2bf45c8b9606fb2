//! 括号文本工具调用恢复
//!
//! 部分回答把工具调用编码为 `[Called <name> with args: {…}]`
//! 形式的纯文本。本模块扫描汇总文本，用识别字符串与转义的括号
//! 计数器找到匹配的 `]`，对参数做宽松 JSON 修复后合成
//! tool_use 事件。结果按 (name, 参数串) 去重。

use serde_json::Value;

const CALL_PREFIX: &str = "[Called ";
const ARGS_MARKER: &str = " with args: ";

/// 恢复出的工具调用
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveredToolCall {
    pub tool_call_id: String,
    pub name: String,
    pub arguments: Value,
}

/// 扫描文本中的括号工具调用
pub fn parse_bracket_tool_calls(text: &str) -> Vec<RecoveredToolCall> {
    let mut calls = Vec::new();
    let mut seen = std::collections::HashSet::new();
    let mut search_from = 0;

    while let Some(rel) = text[search_from..].find(CALL_PREFIX) {
        let start = search_from + rel;
        let Some(end) = find_matching_bracket(&text[start..]) else {
            search_from = start + CALL_PREFIX.len();
            continue;
        };
        let end = start + end;
        let segment = &text[start + 1..end];

        search_from = end + 1;

        // segment 形如 `Called <name> with args: {…}`
        let Some(args_pos) = segment.find(ARGS_MARKER) else {
            continue;
        };
        let name = segment["Called ".len()..args_pos].trim().to_string();
        if name.is_empty() {
            continue;
        }
        let raw_args = segment[args_pos + ARGS_MARKER.len()..].trim();

        let Some(arguments) = repair_json(raw_args) else {
            tracing::debug!("[TOOL_RECOVERY] unrepairable args for {}: {}", name, raw_args);
            continue;
        };

        let dedupe_key = format!("{}:{}", name, arguments);
        if !seen.insert(dedupe_key) {
            continue;
        }

        calls.push(RecoveredToolCall {
            tool_call_id: format!("toolu_{}", uuid::Uuid::new_v4().simple()),
            name,
            arguments,
        });
    }

    calls
}

/// 从开头的 `[` 找到匹配的 `]`，返回其偏移
///
/// 计数器同时跟踪 `[`/`]` 与字符串字面量，参数 JSON 里的数组
/// 括号不会提前终结匹配。
fn find_matching_bracket(text: &str) -> Option<usize> {
    let bytes = text.as_bytes();
    if bytes.first() != Some(&b'[') {
        return None;
    }

    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, &b) in bytes.iter().enumerate() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match b {
            b'\\' if in_string => escape_next = true,
            b'"' => in_string = !in_string,
            b'[' if !in_string => depth += 1,
            b']' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }

    None
}

/// 宽松 JSON 修复
///
/// 依次尝试：原样解析 → 去尾逗号 → 给裸键加引号 → 给裸词值加
/// 引号。修不好返回 None。
pub fn repair_json(raw: &str) -> Option<Value> {
    if let Ok(v) = serde_json::from_str::<Value>(raw) {
        return v.is_object().then_some(v);
    }

    let repaired = quote_barewords(&quote_unquoted_keys(&strip_trailing_commas(raw)));
    serde_json::from_str::<Value>(&repaired)
        .ok()
        .filter(|v| v.is_object())
}

fn strip_trailing_commas(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_string = false;
    let mut escape_next = false;
    let chars: Vec<char> = s.chars().collect();

    for (i, &c) in chars.iter().enumerate() {
        if escape_next {
            escape_next = false;
            out.push(c);
            continue;
        }
        match c {
            '\\' if in_string => {
                escape_next = true;
                out.push(c);
            }
            '"' => {
                in_string = !in_string;
                out.push(c);
            }
            ',' if !in_string => {
                // 逗号后只有空白接 } 或 ] 时丢弃
                let next_meaning = chars[i + 1..].iter().find(|ch| !ch.is_whitespace());
                if !matches!(next_meaning, Some('}') | Some(']')) {
                    out.push(c);
                }
            }
            _ => out.push(c),
        }
    }
    out
}

fn quote_unquoted_keys(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let chars: Vec<char> = s.chars().collect();
    let mut in_string = false;
    let mut escape_next = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if escape_next {
            escape_next = false;
            out.push(c);
            i += 1;
            continue;
        }
        match c {
            '\\' if in_string => {
                escape_next = true;
                out.push(c);
                i += 1;
            }
            '"' => {
                in_string = !in_string;
                out.push(c);
                i += 1;
            }
            '{' | ',' if !in_string => {
                out.push(c);
                i += 1;
                // 跳过空白后若是裸标识符且后随冒号，补引号
                let mut j = i;
                while j < chars.len() && chars[j].is_whitespace() {
                    j += 1;
                }
                let ident_start = j;
                while j < chars.len() && (chars[j].is_alphanumeric() || chars[j] == '_') {
                    j += 1;
                }
                let mut k = j;
                while k < chars.len() && chars[k].is_whitespace() {
                    k += 1;
                }
                if j > ident_start && k < chars.len() && chars[k] == ':' {
                    for &w in &chars[i..ident_start] {
                        out.push(w);
                    }
                    out.push('"');
                    for &w in &chars[ident_start..j] {
                        out.push(w);
                    }
                    out.push('"');
                    i = j;
                }
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

fn quote_barewords(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let chars: Vec<char> = s.chars().collect();
    let mut in_string = false;
    let mut escape_next = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if escape_next {
            escape_next = false;
            out.push(c);
            i += 1;
            continue;
        }
        match c {
            '\\' if in_string => {
                escape_next = true;
                out.push(c);
                i += 1;
            }
            '"' => {
                in_string = !in_string;
                out.push(c);
                i += 1;
            }
            ':' if !in_string => {
                out.push(c);
                i += 1;
                let mut j = i;
                while j < chars.len() && chars[j].is_whitespace() {
                    j += 1;
                }
                if j >= chars.len() {
                    continue;
                }
                let v = chars[j];
                if v == '"' || v == '{' || v == '[' || v == '-' || v.is_ascii_digit() {
                    continue;
                }
                // 读到值结束，true/false/null 之外的裸词加引号
                let word_start = j;
                let mut k = j;
                while k < chars.len() && !matches!(chars[k], ',' | '}' | ']') {
                    k += 1;
                }
                let word: String = chars[word_start..k].iter().collect();
                let trimmed = word.trim_end();
                if matches!(trimmed, "true" | "false" | "null") {
                    continue;
                }
                for &w in &chars[i..word_start] {
                    out.push(w);
                }
                out.push('"');
                out.push_str(trimmed);
                out.push('"');
                for &w in &chars[word_start + trimmed.chars().count()..k] {
                    out.push(w);
                }
                i = k;
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_single_call() {
        let calls =
            parse_bracket_tool_calls(r#"ok [Called read_file with args: {"path": "/x"}] done"#);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "read_file");
        assert_eq!(calls[0].arguments, json!({"path": "/x"}));
        assert!(calls[0].tool_call_id.starts_with("toolu_"));
    }

    #[test]
    fn test_args_containing_brackets_and_strings() {
        let calls = parse_bracket_tool_calls(
            r#"[Called search with args: {"terms": ["a]b", "c[d"], "note": "br ] ok"}]"#,
        );
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].arguments["terms"][0], "a]b");
        assert_eq!(calls[0].arguments["note"], "br ] ok");
    }

    #[test]
    fn test_dedupe_by_name_and_args() {
        let text = r#"
            [Called run with args: {"cmd": "ls"}]
            [Called run with args: {"cmd": "ls"}]
            [Called run with args: {"cmd": "pwd"}]
        "#;
        let calls = parse_bracket_tool_calls(text);
        assert_eq!(calls.len(), 2);
    }

    #[test]
    fn test_repair_trailing_comma() {
        assert_eq!(
            repair_json(r#"{"a": 1, "b": 2,}"#).unwrap(),
            json!({"a": 1, "b": 2})
        );
    }

    #[test]
    fn test_repair_unquoted_keys() {
        assert_eq!(
            repair_json(r#"{path: "/x", mode: "r"}"#).unwrap(),
            json!({"path": "/x", "mode": "r"})
        );
    }

    #[test]
    fn test_repair_bareword_values() {
        assert_eq!(
            repair_json(r#"{"cmd": ls -la, "ok": true}"#).unwrap(),
            json!({"cmd": "ls -la", "ok": true})
        );
    }

    #[test]
    fn test_repair_combined() {
        assert_eq!(
            repair_json(r#"{path: /tmp/x, flags: [1, 2,],}"#).unwrap(),
            json!({"path": "/tmp/x", "flags": [1, 2]})
        );
    }

    #[test]
    fn test_unrepairable_skipped() {
        let calls = parse_bracket_tool_calls("[Called broken with args: {{{]");
        assert!(calls.is_empty());
    }

    #[test]
    fn test_no_calls_in_plain_text() {
        assert!(parse_bracket_tool_calls("nothing here [just brackets]").is_empty());
    }
}
