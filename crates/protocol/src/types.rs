//! Core domain types shared across the client

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Session lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Running,
    WaitingPermission,
    WaitingQuestion,
    Error,
}

/// True when a status should pull the user's attention to the session.
pub fn needs_attention(status: SessionStatus) -> bool {
    matches!(
        status,
        SessionStatus::WaitingPermission | SessionStatus::WaitingQuestion | SessionStatus::Error
    )
}

/// Permission mode governing how tool approvals are handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionMode {
    #[default]
    Default,
    Plan,
    AcceptEdits,
    BypassPermissions,
}

/// Message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

/// Tool call lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Pending,
    Running,
    Completed,
    Error,
    AwaitingInput,
}

impl ToolStatus {
    /// A tool still occupying the agent (keeps the "working" UI state alive).
    pub fn is_active(self) -> bool {
        matches!(self, ToolStatus::Pending | ToolStatus::Running)
    }
}

/// Todo item status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
}

/// One entry of the agent's current todo list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoItem {
    pub content: String,
    pub status: TodoStatus,
    /// Alternate phrasing shown only while the item is in progress
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_form: Option<String>,
}

/// Metadata for a Task (subagent) tool call
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SubagentInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub tool_count: u32,
}

/// One invocation of a named capability by the agent.
///
/// The `id` is the agent's tool-use id: globally unique per session and the
/// join key used to attach late-arriving output to the message that declared
/// the call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: Value,
    pub status: ToolStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Set only for children of a Task (subagent) tool call
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_tool_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subagent: Option<SubagentInfo>,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            input,
            status: ToolStatus::Pending,
            output: None,
            error: None,
            parent_tool_id: None,
            started_at: None,
            ended_at: None,
            subagent: None,
        }
    }

    pub fn is_top_level(&self) -> bool {
        self.parent_tool_id.is_none()
    }
}

/// A file attached to an outgoing user message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub path: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// A message in the conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: MessageRole,
    /// Full accumulated text, never a delta
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// True only while the last assistant message of a working session is
    /// still being appended to. Once false it never reverts.
    #[serde(default)]
    pub is_streaming: bool,
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

impl Message {
    pub fn new(id: impl Into<String>, role: MessageRole, text: impl Into<String>, timestamp: u64) -> Self {
        Self {
            id: id.into(),
            role,
            text: text.into(),
            tool_calls: Vec::new(),
            is_streaming: false,
            timestamp,
            attachments: Vec::new(),
        }
    }
}

/// Token usage information
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_tokens: u64,
    pub context_window: u64,
}

/// Context window size assumed when the backend does not report one.
pub const DEFAULT_CONTEXT_WINDOW: u64 = 200_000;

impl Default for TokenUsage {
    fn default() -> Self {
        Self {
            input_tokens: 0,
            output_tokens: 0,
            cached_tokens: 0,
            context_window: DEFAULT_CONTEXT_WINDOW,
        }
    }
}

impl TokenUsage {
    /// Calculate context fill percentage
    pub fn context_fill_percent(&self) -> f64 {
        if self.context_window == 0 {
            return 0.0;
        }
        (self.input_tokens as f64 / self.context_window as f64) * 100.0
    }

    /// Calculate cache hit percentage
    pub fn cache_hit_percent(&self) -> f64 {
        if self.input_tokens == 0 {
            return 0.0;
        }
        (self.cached_tokens as f64 / self.input_tokens as f64) * 100.0
    }
}

/// Outcome of a permission request, recorded in session history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionDecision {
    Allowed,
    Denied,
    TimedOut,
}

/// Outcome of a slash command, recorded in session history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlashOutcome {
    Completed,
    Error,
}

/// A client-observed occurrence the agent itself doesn't track.
///
/// Append-only per session; drives UI history and the decision to inject
/// compaction context into the next outgoing message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionEvent {
    Compacted {
        summary: String,
        timestamp: u64,
    },
    Permission {
        tool_name: String,
        decision: PermissionDecision,
        #[serde(skip_serializing_if = "Option::is_none")]
        path: Option<String>,
        timestamp: u64,
    },
    Slash {
        command: String,
        status: SlashOutcome,
        timestamp: u64,
    },
}

/// One agent conversation bound to a working directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Client-generated, stable for the session's lifetime
    pub id: String,
    pub name: String,
    /// Absolute path of the working directory
    pub cwd: String,
    pub created_at: u64,
    pub last_active_at: u64,
    pub status: SessionStatus,
    pub permission_mode: PermissionMode,
    /// Agent-assigned identifier, set once after the first exchange
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_cost_usd: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub todos: Option<Vec<TodoItem>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<SessionEvent>,
    /// True for sessions recovered from on-disk transcripts rather than
    /// created interactively in this client
    #[serde(default)]
    pub is_discovered: bool,
}

impl Session {
    pub fn new(id: impl Into<String>, name: impl Into<String>, cwd: impl Into<String>, now: u64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            cwd: cwd.into(),
            created_at: now,
            last_active_at: now,
            status: SessionStatus::Idle,
            permission_mode: PermissionMode::Default,
            agent_session_id: None,
            usage: None,
            total_cost_usd: None,
            todos: None,
            events: Vec::new(),
            is_discovered: false,
        }
    }

    /// Assign the agent session id. First assignment wins; once set it is
    /// never cleared or replaced.
    pub fn assign_agent_session_id(&mut self, id: impl Into<String>) {
        if self.agent_session_id.is_none() {
            self.agent_session_id = Some(id.into());
        }
    }

    pub fn needs_attention(&self) -> bool {
        needs_attention(self.status)
    }

    /// Lightweight projection for list views
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            cwd: self.cwd.clone(),
            status: self.status,
            permission_mode: self.permission_mode,
            needs_attention: self.needs_attention(),
            last_active_at: self.last_active_at,
            is_discovered: self.is_discovered,
        }
    }
}

/// Summary of a session for list views
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub name: String,
    pub cwd: String,
    pub status: SessionStatus,
    pub permission_mode: PermissionMode,
    pub needs_attention: bool,
    pub last_active_at: u64,
    pub is_discovered: bool,
}

/// Which session a pending permission/question request belongs to.
///
/// `Orphan` means the backend could not attribute the request at issue time;
/// it is later reconciled by matching the tool-use id against session tool
/// indexes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum RequestScope {
    Session { session_id: String },
    Orphan,
}

impl RequestScope {
    pub fn session_id(&self) -> Option<&str> {
        match self {
            RequestScope::Session { session_id } => Some(session_id),
            RequestScope::Orphan => None,
        }
    }
}

/// A tool approval awaiting a user decision. Ephemeral, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingPermission {
    /// Server-issued request id, the key for the response
    pub request_id: String,
    pub scope: RequestScope,
    pub tool_name: String,
    pub input: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    pub created_at: u64,
}

/// One structured question posed by the agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    #[serde(default)]
    pub multi_select: bool,
}

/// A question set awaiting user answers. Ephemeral, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingQuestion {
    pub request_id: String,
    pub scope: RequestScope,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    pub questions: Vec<Question>,
    pub created_at: u64,
}

// ---------------------------------------------------------------------------
// Well-known tool names
// ---------------------------------------------------------------------------

/// Subagent-delegating tool
pub const TASK_TOOL: &str = "Task";
/// Plan-mode exit request, routed to the plan-approval overlay
pub const EXIT_PLAN_MODE_TOOL: &str = "ExitPlanMode";
/// Plan-mode entry, toggles the session's permission mode
pub const ENTER_PLAN_MODE_TOOL: &str = "EnterPlanMode";
/// Full-replace todo list writes
pub const TODO_WRITE_TOOL: &str = "TodoWrite";
/// Structured question prompts
pub const ASK_USER_QUESTION_TOOL: &str = "AskUserQuestion";

/// Tools auto-approved under `PermissionMode::AcceptEdits`.
pub fn is_edit_tool(name: &str) -> bool {
    matches!(name, "Edit" | "Write" | "MultiEdit" | "NotebookEdit")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn needs_attention_matches_waiting_and_error() {
        assert!(needs_attention(SessionStatus::WaitingPermission));
        assert!(needs_attention(SessionStatus::WaitingQuestion));
        assert!(needs_attention(SessionStatus::Error));
        assert!(!needs_attention(SessionStatus::Idle));
        assert!(!needs_attention(SessionStatus::Running));
    }

    #[test]
    fn agent_session_id_assigned_once() {
        let mut session = Session::new("s1", "demo", "/tmp/demo", 1000);
        session.assign_agent_session_id("agent-a");
        session.assign_agent_session_id("agent-b");
        assert_eq!(session.agent_session_id.as_deref(), Some("agent-a"));
    }

    #[test]
    fn token_usage_percentages() {
        let usage = TokenUsage {
            input_tokens: 100_000,
            output_tokens: 5_000,
            cached_tokens: 25_000,
            context_window: 200_000,
        };
        assert_eq!(usage.context_fill_percent(), 50.0);
        assert_eq!(usage.cache_hit_percent(), 25.0);

        let empty = TokenUsage {
            context_window: 0,
            ..TokenUsage::default()
        };
        assert_eq!(empty.context_fill_percent(), 0.0);
        assert_eq!(empty.cache_hit_percent(), 0.0);
    }

    #[test]
    fn session_event_roundtrip() {
        let event = SessionEvent::Permission {
            tool_name: "Bash".to_string(),
            decision: PermissionDecision::Denied,
            path: None,
            timestamp: 42,
        };
        let json = serde_json::to_string(&event).expect("serialize");
        assert!(json.contains("\"kind\":\"permission\""));
        let back: SessionEvent = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, event);
    }

    #[test]
    fn edit_tool_classification() {
        assert!(is_edit_tool("Write"));
        assert!(is_edit_tool("NotebookEdit"));
        assert!(!is_edit_tool("Bash"));
        assert!(!is_edit_tool("Read"));
    }
}
