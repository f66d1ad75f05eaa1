//! Transcript JSONL parsing
//!
//! Transcripts are append-only logs of newline-delimited JSON records, read
//! while they may still be written. Every line parses independently; a
//! malformed line is skipped, never fatal.
//!
//! User text arrives as its own record but logically belongs to the turn
//! that follows, so emission is deferred one step: the buffered user text is
//! flushed when the next assistant record arrives, or as a trailing message
//! at end of input (the session died before the agent replied).

use std::collections::HashMap;

use serde_json::Value;
use skiff_protocol::{
    Message, MessageRole, TodoItem, TodoStatus, TokenUsage, ToolCall, ToolStatus,
    ASK_USER_QUESTION_TOOL, DEFAULT_CONTEXT_WINDOW, TODO_WRITE_TOOL,
};
use tracing::debug;

/// Everything derivable from one full transcript
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedTranscript {
    pub messages: Vec<Message>,
    pub todos: Option<Vec<TodoItem>>,
    pub usage: Option<TokenUsage>,
    pub total_cost_usd: Option<f64>,
    /// Tool-use id of an `AskUserQuestion` that never got a result — the
    /// transcript ended while the agent was waiting for input.
    pub pending_question: Option<String>,
    /// Compaction summaries, in order of appearance
    pub summaries: Vec<String>,
}

/// Delta extracted from one live streaming record
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamUpdate {
    pub message: Option<Message>,
    pub todos: Option<Vec<TodoItem>>,
}

/// Parse a full transcript into an ordered message list plus derived state.
pub fn parse_transcript(raw: &str) -> ParsedTranscript {
    let mut out = ParsedTranscript::default();
    let mut pending_user: Option<Message> = None;
    let mut tool_results: HashMap<String, (String, bool)> = HashMap::new();
    let mut unresolved_questions: Vec<String> = Vec::new();

    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let record: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                debug!(
                    component = "transcript",
                    event = "transcript.line.skipped",
                    error = %e,
                    "Skipping malformed transcript line"
                );
                continue;
            }
        };

        match record.get("type").and_then(|t| t.as_str()) {
            Some("user") => {
                // Tool results ride on user records; harvest them first.
                for (tool_use_id, content, is_error) in tool_results_in(&record) {
                    unresolved_questions.retain(|id| id != &tool_use_id);
                    apply_tool_result(&mut out.messages, &tool_use_id, &content, is_error);
                    tool_results.insert(tool_use_id, (content, is_error));
                }

                if let Some(text) = user_text_in(&record) {
                    // A second user record before any assistant reply replaces
                    // nothing — both are real turns. Flush the earlier one.
                    if let Some(buffered) = pending_user.take() {
                        out.messages.push(buffered);
                    }
                    pending_user = Some(Message::new(
                        record_id(&record),
                        MessageRole::User,
                        text,
                        record_timestamp(&record),
                    ));
                }
            }

            Some("assistant") => {
                if let Some(buffered) = pending_user.take() {
                    out.messages.push(buffered);
                }
                if let Some(message) = assistant_message_in(
                    &record,
                    &tool_results,
                    &mut unresolved_questions,
                    &mut out.todos,
                ) {
                    out.messages.push(message);
                }
            }

            Some("result") => {
                let usage = extract_token_usage(&record);
                if usage.is_some() {
                    out.usage = usage;
                }
                if let Some(cost) = record.get("total_cost_usd").and_then(|v| v.as_f64()) {
                    out.total_cost_usd = Some(cost);
                }
            }

            Some("system") => {
                if record.get("subtype").and_then(|v| v.as_str()) == Some("compact_boundary") {
                    if let Some(summary) = record.get("summary").and_then(|v| v.as_str()) {
                        out.summaries.push(summary.to_string());
                    }
                }
            }

            Some("summary") => {
                if let Some(summary) = record.get("summary").and_then(|v| v.as_str()) {
                    out.summaries.push(summary.to_string());
                }
            }

            _ => {}
        }
    }

    // A trailing user message with no assistant reply is still a turn.
    if let Some(buffered) = pending_user.take() {
        out.messages.push(buffered);
    }

    out.pending_question = unresolved_questions.last().cloned();
    out
}

/// Parse one live record into a message delta plus any embedded todo update.
///
/// Same extraction rules as the full fold, minus retroactive tool-output
/// patching — live output is attached by the bridge via direct id lookup.
pub fn parse_stream_record(record: &Value) -> Option<StreamUpdate> {
    match record.get("type").and_then(|t| t.as_str()) {
        Some("user") => {
            let text = user_text_in(record)?;
            Some(StreamUpdate {
                message: Some(Message::new(
                    record_id(record),
                    MessageRole::User,
                    text,
                    record_timestamp(record),
                )),
                todos: None,
            })
        }
        Some("assistant") => {
            let mut todos = None;
            let empty = HashMap::new();
            let message =
                assistant_message_in(record, &empty, &mut Vec::new(), &mut todos)?;
            Some(StreamUpdate {
                message: Some(message),
                todos,
            })
        }
        _ => None,
    }
}

/// Parse a subagent's side-channel transcript into child tool calls.
///
/// Two passes: collect tool_result outputs by tool-use id, then materialize
/// the tool list from assistant tool_use blocks. Tools without a result are
/// still running.
pub fn parse_subagent_tools(raw: &str, parent_tool_id: &str) -> Vec<ToolCall> {
    let lines: Vec<&str> = raw.lines().filter(|l| !l.trim().is_empty()).collect();

    let mut results: HashMap<String, (String, bool)> = HashMap::new();
    for line in &lines {
        let record: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(_) => continue,
        };
        if record.get("type").and_then(|t| t.as_str()) != Some("user") {
            continue;
        }
        for (tool_use_id, content, is_error) in tool_results_in(&record) {
            results.insert(tool_use_id, (content, is_error));
        }
    }

    let mut tools: Vec<ToolCall> = Vec::new();
    for line in &lines {
        let record: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(_) => continue,
        };
        if record.get("type").and_then(|t| t.as_str()) != Some("assistant") {
            continue;
        }
        let blocks = match record
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_array())
        {
            Some(arr) => arr,
            None => continue,
        };
        for block in blocks {
            if block.get("type").and_then(|t| t.as_str()) != Some("tool_use") {
                continue;
            }
            let (id, name) = match (
                block.get("id").and_then(|v| v.as_str()),
                block.get("name").and_then(|v| v.as_str()),
            ) {
                (Some(id), Some(name)) => (id, name),
                _ => continue,
            };
            let mut tool = ToolCall::new(id, name, block.get("input").cloned().unwrap_or(Value::Null));
            tool.parent_tool_id = Some(parent_tool_id.to_string());
            match results.get(id) {
                Some((content, is_error)) => {
                    if *is_error {
                        tool.status = ToolStatus::Error;
                        tool.error = Some(content.clone());
                    } else {
                        tool.status = ToolStatus::Completed;
                        tool.output = Some(content.clone());
                    }
                }
                None => tool.status = ToolStatus::Running,
            }
            tools.push(tool);
        }
    }

    tools
}

// ---------------------------------------------------------------------------
// Record extraction helpers
// ---------------------------------------------------------------------------

fn record_id(record: &Value) -> String {
    record
        .get("uuid")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(skiff_protocol::new_id)
}

fn record_timestamp(record: &Value) -> u64 {
    record.get("timestamp").and_then(|v| v.as_u64()).unwrap_or(0)
}

/// Extract plain user text from a user record; tool-result-only records
/// yield nothing.
fn user_text_in(record: &Value) -> Option<String> {
    let content = record.get("message")?.get("content")?;
    if let Some(text) = content.as_str() {
        if text.is_empty() {
            return None;
        }
        return Some(text.to_string());
    }
    let blocks = content.as_array()?;
    let texts: Vec<&str> = blocks
        .iter()
        .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
        .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
        .collect();
    if texts.is_empty() {
        None
    } else {
        Some(texts.join("\n"))
    }
}

/// All `(tool_use_id, content, is_error)` triples carried by a user record.
fn tool_results_in(record: &Value) -> Vec<(String, String, bool)> {
    let blocks = match record
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_array())
    {
        Some(arr) => arr,
        None => return Vec::new(),
    };
    blocks
        .iter()
        .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("tool_result"))
        .filter_map(|b| {
            let id = b.get("tool_use_id").and_then(|v| v.as_str())?;
            let content = extract_tool_result_content(b);
            let is_error = b.get("is_error").and_then(|v| v.as_bool()).unwrap_or(false);
            Some((id.to_string(), content, is_error))
        })
        .collect()
}

/// Build an assistant [`Message`] from an assistant record, materializing
/// tool calls and applying already-known results.
fn assistant_message_in(
    record: &Value,
    tool_results: &HashMap<String, (String, bool)>,
    unresolved_questions: &mut Vec<String>,
    todos: &mut Option<Vec<TodoItem>>,
) -> Option<Message> {
    let blocks = record
        .get("message")?
        .get("content")?
        .as_array()?;

    let mut text_parts: Vec<&str> = Vec::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();

    for block in blocks {
        match block.get("type").and_then(|t| t.as_str()) {
            Some("text") => {
                if let Some(text) = block.get("text").and_then(|v| v.as_str()) {
                    text_parts.push(text);
                }
            }
            Some("tool_use") => {
                let (id, name) = match (
                    block.get("id").and_then(|v| v.as_str()),
                    block.get("name").and_then(|v| v.as_str()),
                ) {
                    (Some(id), Some(name)) => (id, name),
                    _ => continue,
                };
                let input = block.get("input").cloned().unwrap_or(Value::Null);

                if name == TODO_WRITE_TOOL {
                    if let Some(parsed) = parse_todo_input(&input) {
                        *todos = Some(parsed);
                    }
                }
                if name == ASK_USER_QUESTION_TOOL && !tool_results.contains_key(id) {
                    unresolved_questions.push(id.to_string());
                }

                let mut tool = ToolCall::new(id, name, input);
                match tool_results.get(id) {
                    Some((content, true)) => {
                        tool.status = ToolStatus::Error;
                        tool.error = Some(content.clone());
                    }
                    Some((content, false)) => {
                        tool.status = ToolStatus::Completed;
                        tool.output = Some(content.clone());
                    }
                    None => {}
                }
                tool_calls.push(tool);
            }
            _ => {}
        }
    }

    if text_parts.is_empty() && tool_calls.is_empty() {
        return None;
    }

    let mut message = Message::new(
        record_id(record),
        MessageRole::Assistant,
        text_parts.join(""),
        record_timestamp(record),
    );
    message.tool_calls = tool_calls;
    Some(message)
}

/// Retroactively attach a late-arriving tool result to the message that
/// declared the call.
fn apply_tool_result(messages: &mut [Message], tool_use_id: &str, content: &str, is_error: bool) {
    for message in messages.iter_mut().rev() {
        if let Some(tool) = message.tool_calls.iter_mut().find(|t| t.id == tool_use_id) {
            if is_error {
                tool.status = ToolStatus::Error;
                tool.error = Some(content.to_string());
            } else {
                tool.status = ToolStatus::Completed;
                tool.output = Some(content.to_string());
            }
            return;
        }
    }
}

/// Extract text content from a tool_result block.
fn extract_tool_result_content(block: &Value) -> String {
    if let Some(content) = block.get("content").and_then(|c| c.as_str()) {
        return content.to_string();
    }
    if let Some(parts) = block.get("content").and_then(|c| c.as_array()) {
        let texts: Vec<&str> = parts
            .iter()
            .filter_map(|part| {
                if part.get("type").and_then(|t| t.as_str()) == Some("text") {
                    part.get("text").and_then(|t| t.as_str())
                } else {
                    None
                }
            })
            .collect();
        return texts.join("\n");
    }
    String::new()
}

fn parse_todo_input(input: &Value) -> Option<Vec<TodoItem>> {
    let items = input.get("todos")?.as_array()?;
    let todos = items
        .iter()
        .filter_map(|item| {
            let content = item.get("content").and_then(|v| v.as_str())?;
            let status = match item.get("status").and_then(|v| v.as_str())? {
                "pending" => TodoStatus::Pending,
                "in_progress" => TodoStatus::InProgress,
                "completed" => TodoStatus::Completed,
                _ => return None,
            };
            Some(TodoItem {
                content: content.to_string(),
                status,
                active_form: item
                    .get("activeForm")
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
            })
        })
        .collect();
    Some(todos)
}

/// Extract token usage from a result record's `modelUsage` (per-model
/// breakdown, summed) or flat `usage` object.
pub fn extract_token_usage(record: &Value) -> Option<TokenUsage> {
    if let Some(Value::Object(models)) = record.get("modelUsage") {
        let mut total = TokenUsage::default();
        for stats in models.values() {
            total.input_tokens += stats
                .get("inputTokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            total.output_tokens += stats
                .get("outputTokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            total.cached_tokens += stats
                .get("cacheReadInputTokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            if let Some(cw) = stats.get("contextWindow").and_then(|v| v.as_u64()) {
                total.context_window = cw;
            }
        }
        if total.input_tokens > 0 || total.output_tokens > 0 {
            return Some(total);
        }
    }

    if let Some(usage) = record.get("usage") {
        let input = usage
            .get("input_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        let output = usage
            .get("output_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        let cached = usage
            .get("cache_read_input_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        if input > 0 || output > 0 {
            return Some(TokenUsage {
                input_tokens: input,
                output_tokens: output,
                cached_tokens: cached,
                context_window: DEFAULT_CONTEXT_WINDOW,
            });
        }
    }

    None
}

// ---------------------------------------------------------------------------
// Display helpers
// ---------------------------------------------------------------------------

/// One-line human summary of a tool call for list rendering.
pub fn tool_summary(tool_name: &str, input: &Value) -> String {
    match tool_name.to_lowercase().as_str() {
        "read" | "write" | "edit" => {
            if let Some(path) = input.get("file_path").and_then(|p| p.as_str()) {
                return shorten_path(path);
            }
        }
        "bash" => {
            if let Some(cmd) = input.get("command").and_then(|c| c.as_str()) {
                let flattened = cmd.replace('\n', " ");
                return truncate(&flattened, 60);
            }
        }
        "glob" => {
            if let Some(pattern) = input.get("pattern").and_then(|p| p.as_str()) {
                return pattern.to_string();
            }
        }
        "grep" => {
            if let Some(pattern) = input.get("pattern").and_then(|p| p.as_str()) {
                return format!("Pattern: {}", pattern);
            }
        }
        "task" => {
            if let Some(desc) = input
                .get("description")
                .or_else(|| input.get("prompt"))
                .and_then(|p| p.as_str())
            {
                return truncate(desc, 50);
            }
        }
        _ => {}
    }
    tool_name.to_string()
}

/// Shorten a file path for display (last two components with a .../ prefix).
pub fn shorten_path(path: &str) -> String {
    let components: Vec<&str> = path.split('/').collect();
    if components.len() > 3 {
        format!(".../{}", components[components.len() - 2..].join("/"))
    } else {
        path.to_string()
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        let cut: String = text.chars().take(max).collect();
        format!("{}...", cut)
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn user_line(text: &str) -> String {
        json!({"type": "user", "uuid": format!("u-{}", text.len()), "message": {"content": text}})
            .to_string()
    }

    fn assistant_line(uuid: &str, text: &str) -> String {
        json!({
            "type": "assistant",
            "uuid": uuid,
            "message": {"content": [{"type": "text", "text": text}]}
        })
        .to_string()
    }

    #[test]
    fn round_trip_with_trailing_question() {
        let transcript = [
            user_line("first prompt"),
            assistant_line("a-1", "first reply"),
            user_line("second prompt"),
            json!({
                "type": "assistant",
                "uuid": "a-2",
                "message": {"content": [
                    {"type": "text", "text": "choose one"},
                    {"type": "tool_use", "id": "q-1", "name": "AskUserQuestion",
                     "input": {"questions": [{"question": "which?"}]}}
                ]}
            })
            .to_string(),
            user_line("third prompt"),
        ]
        .join("\n");

        let parsed = parse_transcript(&transcript);
        // 2 user + 2 assistant + trailing unanswered user
        assert_eq!(parsed.messages.len(), 5);
        assert_eq!(parsed.messages[4].role, MessageRole::User);
        assert_eq!(parsed.messages[4].text, "third prompt");
        assert_eq!(parsed.pending_question.as_deref(), Some("q-1"));
    }

    #[test]
    fn malformed_line_is_skipped_not_fatal() {
        let clean = [user_line("hello"), assistant_line("a-1", "world")].join("\n");
        let dirty = [
            user_line("hello"),
            "{not json at all".to_string(),
            assistant_line("a-1", "world"),
        ]
        .join("\n");

        assert_eq!(parse_transcript(&clean), parse_transcript(&dirty));
    }

    #[test]
    fn tool_result_applies_retroactively() {
        let transcript = [
            user_line("run it"),
            json!({
                "type": "assistant",
                "uuid": "a-1",
                "message": {"content": [
                    {"type": "tool_use", "id": "t-1", "name": "Bash",
                     "input": {"command": "echo hi"}}
                ]}
            })
            .to_string(),
            json!({
                "type": "user",
                "message": {"content": [
                    {"type": "tool_result", "tool_use_id": "t-1", "content": "hi"}
                ]}
            })
            .to_string(),
        ]
        .join("\n");

        let parsed = parse_transcript(&transcript);
        let tool = &parsed.messages[1].tool_calls[0];
        assert_eq!(tool.status, ToolStatus::Completed);
        assert_eq!(tool.output.as_deref(), Some("hi"));
    }

    #[test]
    fn answered_question_is_not_pending() {
        let transcript = [
            json!({
                "type": "assistant",
                "uuid": "a-1",
                "message": {"content": [
                    {"type": "tool_use", "id": "q-1", "name": "AskUserQuestion", "input": {}}
                ]}
            })
            .to_string(),
            json!({
                "type": "user",
                "message": {"content": [
                    {"type": "tool_result", "tool_use_id": "q-1", "content": "picked A"}
                ]}
            })
            .to_string(),
        ]
        .join("\n");

        assert!(parse_transcript(&transcript).pending_question.is_none());
    }

    #[test]
    fn todo_write_replaces_not_merges() {
        let todo_line = |items: Vec<(&str, &str)>| {
            json!({
                "type": "assistant",
                "uuid": "a-t",
                "message": {"content": [{
                    "type": "tool_use", "id": "td-1", "name": "TodoWrite",
                    "input": {"todos": items.iter().map(|(c, s)| json!({"content": c, "status": s})).collect::<Vec<_>>()}
                }]}
            })
            .to_string()
        };

        let transcript = [
            todo_line(vec![("a", "pending"), ("b", "pending")]),
            todo_line(vec![("c", "in_progress")]),
        ]
        .join("\n");

        let parsed = parse_transcript(&transcript);
        let todos = parsed.todos.expect("todos");
        assert_eq!(todos.len(), 1);
        assert_eq!(todos[0].content, "c");
        assert_eq!(todos[0].status, TodoStatus::InProgress);
    }

    #[test]
    fn result_record_supplies_usage_and_cost() {
        let transcript = [
            assistant_line("a-1", "done"),
            json!({
                "type": "result",
                "total_cost_usd": 0.42,
                "usage": {"input_tokens": 1200, "output_tokens": 300, "cache_read_input_tokens": 800}
            })
            .to_string(),
        ]
        .join("\n");

        let parsed = parse_transcript(&transcript);
        let usage = parsed.usage.expect("usage");
        assert_eq!(usage.input_tokens, 1200);
        assert_eq!(usage.cached_tokens, 800);
        assert_eq!(usage.context_window, DEFAULT_CONTEXT_WINDOW);
        assert_eq!(parsed.total_cost_usd, Some(0.42));
    }

    #[test]
    fn model_usage_sums_across_models() {
        let record = json!({
            "type": "result",
            "modelUsage": {
                "model-a": {"inputTokens": 100, "outputTokens": 10, "cacheReadInputTokens": 50, "contextWindow": 500000},
                "model-b": {"inputTokens": 30, "outputTokens": 5}
            }
        });
        let usage = extract_token_usage(&record).expect("usage");
        assert_eq!(usage.input_tokens, 130);
        assert_eq!(usage.output_tokens, 15);
        assert_eq!(usage.cached_tokens, 50);
        assert_eq!(usage.context_window, 500_000);
    }

    #[test]
    fn compact_boundary_collects_summary() {
        let transcript = json!({
            "type": "system",
            "subtype": "compact_boundary",
            "summary": "earlier work summarized"
        })
        .to_string();

        let parsed = parse_transcript(&transcript);
        assert_eq!(parsed.summaries, vec!["earlier work summarized"]);
    }

    #[test]
    fn stream_record_extracts_message_and_todos() {
        let record = json!({
            "type": "assistant",
            "uuid": "a-9",
            "message": {"content": [
                {"type": "text", "text": "on it"},
                {"type": "tool_use", "id": "td-9", "name": "TodoWrite",
                 "input": {"todos": [{"content": "ship", "status": "in_progress", "activeForm": "shipping"}]}}
            ]}
        });

        let update = parse_stream_record(&record).expect("update");
        let message = update.message.expect("message");
        assert_eq!(message.text, "on it");
        assert_eq!(message.tool_calls.len(), 1);
        let todos = update.todos.expect("todos");
        assert_eq!(todos[0].active_form.as_deref(), Some("shipping"));
    }

    #[test]
    fn subagent_tools_two_pass() {
        let raw = [
            json!({
                "type": "assistant",
                "uuid": "sa-1",
                "message": {"content": [
                    {"type": "tool_use", "id": "st-1", "name": "Read", "input": {"file_path": "/a/b/c/d.rs"}},
                    {"type": "tool_use", "id": "st-2", "name": "Bash", "input": {"command": "cargo check"}}
                ]}
            })
            .to_string(),
            json!({
                "type": "user",
                "message": {"content": [
                    {"type": "tool_result", "tool_use_id": "st-1", "content": "file body"}
                ]}
            })
            .to_string(),
        ]
        .join("\n");

        let tools = parse_subagent_tools(&raw, "task-1");
        assert_eq!(tools.len(), 2);
        assert!(tools.iter().all(|t| t.parent_tool_id.as_deref() == Some("task-1")));
        assert_eq!(tools[0].status, ToolStatus::Completed);
        assert_eq!(tools[0].output.as_deref(), Some("file body"));
        assert_eq!(tools[1].status, ToolStatus::Running);
    }

    #[test]
    fn tool_summaries() {
        assert_eq!(
            tool_summary("Read", &json!({"file_path": "/home/me/project/src/main.rs"})),
            ".../src/main.rs"
        );
        assert_eq!(tool_summary("Bash", &json!({"command": "echo hi"})), "echo hi");
        assert_eq!(tool_summary("Grep", &json!({"pattern": "fn main"})), "Pattern: fn main");
        assert_eq!(tool_summary("Mystery", &json!({})), "Mystery");
        assert_eq!(shorten_path("a/b/c"), "a/b/c");
    }
}
