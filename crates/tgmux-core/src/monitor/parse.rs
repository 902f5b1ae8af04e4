//! Log line parsers for the append-log backends.
//!
//! Claude and codex write newline-delimited JSON session logs with loosely
//! versioned shapes: `content` can be a string, an object or an array, and
//! record types vary. Decoding is best-effort — unknown variants are no-ops,
//! never errors.

use std::collections::HashMap;

use serde_json::Value;

use crate::markup::{rune_count, truncate_runes};
use crate::monitor::{ContentKind, ParsedContent};

const MAX_SUMMARY_RUNES: usize = 200;
const MAX_ERROR_CHARS: usize = 100;

/// Stateful parser for claude session logs.
///
/// Tracks pending `tool_use` ids so a later `tool_result` can be summarized
/// with the tool's name.
#[derive(Debug, Default)]
pub struct ClaudeParser {
    /// tool_use_id → tool name, consumed when the result arrives.
    pending_tools: HashMap<String, String>,
}

impl ClaudeParser {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse one log line into output blocks. Unparseable or irrelevant
    /// lines yield an empty vec.
    pub fn parse_line(&mut self, line: &str) -> Vec<ParsedContent> {
        match serde_json::from_str::<Value>(line) {
            Ok(raw) => self.parse_value(&raw),
            Err(_) => Vec::new(),
        }
    }

    /// Parse an already-decoded log record.
    pub fn parse_value(&mut self, raw: &Value) -> Vec<ParsedContent> {
        let msg_type = raw.get("type").and_then(Value::as_str).unwrap_or_default();
        if msg_type != "assistant" && msg_type != "user" {
            return Vec::new();
        }

        let Some(content) = raw.pointer("/message/content").and_then(Value::as_array) else {
            return Vec::new();
        };

        let mut results = Vec::new();
        for block in content {
            match block.get("type").and_then(Value::as_str) {
                Some("thinking") => {
                    if let Some(text) = block.get("thinking").and_then(Value::as_str) {
                        if !text.is_empty() {
                            results.push(ParsedContent::thinking(text));
                        }
                    }
                }
                Some("text") => {
                    if let Some(text) = block.get("text").and_then(Value::as_str) {
                        if !text.is_empty() {
                            results.push(ParsedContent::text(text));
                        }
                    }
                }
                Some("tool_use") => {
                    if let Some(parsed) = self.parse_tool_use(block) {
                        results.push(parsed);
                    }
                }
                Some("tool_result") => {
                    if let Some(parsed) = self.parse_tool_result(block) {
                        results.push(parsed);
                    }
                }
                _ => {}
            }
        }
        results
    }

    fn parse_tool_use(&mut self, block: &Value) -> Option<ParsedContent> {
        let id = block.get("id").and_then(Value::as_str)?.to_string();
        let name = block
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let summary = format_tool_use_summary(&name, block.get("input"));
        self.pending_tools.insert(id.clone(), name.clone());
        Some(ParsedContent {
            kind: ContentKind::ToolUse,
            text: summary,
            tool_use_id: Some(id),
            tool_name: Some(name),
        })
    }

    fn parse_tool_result(&mut self, block: &Value) -> Option<ParsedContent> {
        let id = block
            .get("tool_use_id")
            .and_then(Value::as_str)?
            .to_string();
        let tool_name = self.pending_tools.remove(&id);
        let text = extract_result_text(block.get("content"));

        let is_error = block
            .get("is_error")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let summary = if is_error {
            let first_line = text.lines().next().unwrap_or_default();
            let mut line = truncate_runes(first_line, MAX_ERROR_CHARS).to_string();
            if rune_count(first_line) > MAX_ERROR_CHARS {
                line.push('…');
            }
            format!("  ⎿  Error: {line}")
        } else {
            format_tool_result_stats(&text, tool_name.as_deref().unwrap_or_default())
        };

        if summary.is_empty() {
            return None;
        }
        Some(ParsedContent {
            kind: ContentKind::ToolResult,
            text: summary,
            tool_use_id: Some(id),
            tool_name,
        })
    }
}

/// `content` of a tool_result is either a plain string or an array of
/// `{type:"text", text}` parts.
fn extract_result_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(items)) => {
            let texts: Vec<&str> = items
                .iter()
                .filter(|item| item.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|item| item.get("text").and_then(Value::as_str))
                .collect();
            texts.join("\n")
        }
        _ => String::new(),
    }
}

/// Format a tool_use block into a short `Name(key arg)` summary.
#[must_use]
pub fn format_tool_use_summary(name: &str, input: Option<&Value>) -> String {
    let Some(input) = input.and_then(Value::as_object) else {
        return name.to_string();
    };

    let summary: String = match name {
        "Read" | "Glob" => {
            let s = str_val(input, "file_path");
            if s.is_empty() {
                str_val(input, "pattern")
            } else {
                s
            }
            .to_string()
        }
        "Write" => str_val(input, "file_path").to_string(),
        "Edit" | "NotebookEdit" => {
            let s = str_val(input, "file_path");
            if s.is_empty() {
                str_val(input, "notebook_path")
            } else {
                s
            }
            .to_string()
        }
        "Bash" => str_val(input, "command").to_string(),
        "Grep" => str_val(input, "pattern").to_string(),
        "Task" => str_val(input, "description").to_string(),
        "WebFetch" => str_val(input, "url").to_string(),
        "WebSearch" => str_val(input, "query").to_string(),
        "TodoWrite" => input
            .get("todos")
            .and_then(Value::as_array)
            .map(|todos| format!("{} item(s)", todos.len()))
            .unwrap_or_default(),
        "Skill" => str_val(input, "skill").to_string(),
        _ => input
            .values()
            .find_map(|v| v.as_str().filter(|s| !s.is_empty()))
            .unwrap_or_default()
            .to_string(),
    };

    if summary.is_empty() {
        return name.to_string();
    }
    let mut summary = summary;
    if rune_count(&summary) > MAX_SUMMARY_RUNES {
        summary = format!("{}…", truncate_runes(&summary, MAX_SUMMARY_RUNES));
    }
    format!("{name}({summary})")
}

/// Format a tool result into a one-line stats summary.
#[must_use]
pub fn format_tool_result_stats(text: &str, tool_name: &str) -> String {
    if text.is_empty() {
        return String::new();
    }
    let lines = count_lines(text);

    match tool_name {
        "Read" => format!("  ⎿  Read {lines} lines"),
        "Write" => format!("  ⎿  Wrote {lines} lines"),
        "Bash" => format!("  ⎿  Output {lines} lines"),
        "Grep" => format!("  ⎿  Found {} matches", count_non_empty(text)),
        "Glob" => format!("  ⎿  Found {} files", count_non_empty(text)),
        "Edit" | "NotebookEdit" => "  ⎿  Edited".to_string(),
        _ => format!("  ⎿  {lines} lines"),
    }
}

fn str_val<'a>(input: &'a serde_json::Map<String, Value>, key: &str) -> &'a str {
    input.get(key).and_then(Value::as_str).unwrap_or_default()
}

fn count_lines(s: &str) -> usize {
    if s.is_empty() {
        0
    } else {
        s.matches('\n').count() + 1
    }
}

fn count_non_empty(s: &str) -> usize {
    s.lines().filter(|l| !l.trim().is_empty()).count()
}

/// Parse one codex session log line.
///
/// Accepts records where `role == "assistant"` or `type` is `assistant` /
/// `response`. `content` may be a string, an array of `{type, text}` parts,
/// or absent (falling back to a top-level `message` string).
#[must_use]
pub fn parse_codex_line(line: &str) -> Option<ParsedContent> {
    let raw: Value = serde_json::from_str(line).ok()?;
    parse_codex_value(&raw)
}

/// [`parse_codex_line`] over an already-decoded record.
#[must_use]
pub fn parse_codex_value(raw: &Value) -> Option<ParsedContent> {
    let msg_type = raw.get("type").and_then(Value::as_str).unwrap_or_default();
    let role = raw.get("role").and_then(Value::as_str).unwrap_or_default();
    if role != "assistant" && msg_type != "assistant" && msg_type != "response" {
        return None;
    }

    match raw.get("content") {
        Some(Value::String(s)) if !s.is_empty() => return Some(ParsedContent::text(s)),
        Some(Value::Array(items)) => {
            let texts: Vec<&str> = items
                .iter()
                .filter_map(|item| item.get("text").and_then(Value::as_str))
                .filter(|t| !t.is_empty())
                .collect();
            if !texts.is_empty() {
                return Some(ParsedContent::text(texts.join("\n")));
            }
        }
        _ => {}
    }

    match raw.get("message") {
        Some(Value::String(s)) if !s.is_empty() => Some(ParsedContent::text(s)),
        _ => None,
    }
}
