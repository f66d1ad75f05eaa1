//! Backend → client events
//!
//! One process-wide channel carries this tagged union for every running
//! agent subprocess. Events for different sessions arrive interleaved; each
//! carries its owning session id except permission/question events, which
//! are keyed by request id with an optional, sometimes-unreliable session id.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{Message, Question, SubagentInfo, TodoItem, TokenUsage, ToolCall, ToolStatus};

/// Partial update to a tool call (delta semantics, `None` = unchanged)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ToolStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subagent: Option<SubagentInfo>,
}

/// Events delivered by the subprocess-management backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendEvent {
    // -- Session lifecycle --
    SessionStarted {
        session_id: String,
        agent_session_id: String,
    },
    SessionEnded {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    // -- Messages --
    UserMessage {
        session_id: String,
        message: Message,
    },
    AssistantMessage {
        session_id: String,
        message: Message,
    },
    /// Streaming update for an assistant message already appended. `text`
    /// is the full accumulated text so far, never a fragment.
    StreamDelta {
        session_id: String,
        message_id: String,
        text: String,
    },

    // -- Tools --
    ToolStarted {
        session_id: String,
        tool: ToolCall,
    },
    ToolUpdated {
        session_id: String,
        tool_id: String,
        patch: ToolPatch,
    },
    ToolCompleted {
        session_id: String,
        tool_id: String,
        output: String,
    },
    ToolError {
        session_id: String,
        tool_id: String,
        error: String,
    },

    // -- Session metadata --
    TodosUpdated {
        session_id: String,
        todos: Vec<TodoItem>,
    },
    UsageUpdated {
        session_id: String,
        usage: TokenUsage,
        #[serde(skip_serializing_if = "Option::is_none")]
        total_cost_usd: Option<f64>,
    },

    // -- Approvals --
    PermissionRequested {
        request_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        tool_name: String,
        input: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_use_id: Option<String>,
    },
    PermissionResolved {
        request_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    QuestionRequested {
        request_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_use_id: Option<String>,
        questions: Vec<Question>,
    },
    QuestionResolved {
        request_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },

    // -- Slash commands --
    SlashStarted {
        session_id: String,
        command_id: String,
        command: String,
    },
    SlashOutput {
        session_id: String,
        command_id: String,
        chunk: String,
    },
    /// Backend recognized a slash command embedded in a user message
    SlashDetected {
        session_id: String,
        command: String,
    },
    SlashCompleted {
        session_id: String,
        command_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
    },
    SlashError {
        session_id: String,
        command_id: String,
        error: String,
    },
}

impl BackendEvent {
    /// The session id the event is authoritatively scoped to, if any.
    /// Permission/question events return their optional, best-effort id.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            BackendEvent::SessionStarted { session_id, .. }
            | BackendEvent::SessionEnded { session_id, .. }
            | BackendEvent::UserMessage { session_id, .. }
            | BackendEvent::AssistantMessage { session_id, .. }
            | BackendEvent::StreamDelta { session_id, .. }
            | BackendEvent::ToolStarted { session_id, .. }
            | BackendEvent::ToolUpdated { session_id, .. }
            | BackendEvent::ToolCompleted { session_id, .. }
            | BackendEvent::ToolError { session_id, .. }
            | BackendEvent::TodosUpdated { session_id, .. }
            | BackendEvent::UsageUpdated { session_id, .. }
            | BackendEvent::SlashStarted { session_id, .. }
            | BackendEvent::SlashOutput { session_id, .. }
            | BackendEvent::SlashDetected { session_id, .. }
            | BackendEvent::SlashCompleted { session_id, .. }
            | BackendEvent::SlashError { session_id, .. } => Some(session_id),
            BackendEvent::PermissionRequested { session_id, .. }
            | BackendEvent::PermissionResolved { session_id, .. }
            | BackendEvent::QuestionRequested { session_id, .. }
            | BackendEvent::QuestionResolved { session_id, .. } => session_id.as_deref(),
        }
    }
}
