//! Client → backend command payloads

use serde::{Deserialize, Serialize};

/// Parameters for spawning a new agent session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpawnSpec {
    /// Absolute working directory for the session
    pub cwd: String,
    pub prompt: String,
    /// Agent session id to resume, if recovering a prior conversation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Reply to a permission request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionResponse {
    pub request_id: String,
    pub allow: bool,
    /// Remember the decision for this tool for the rest of the session
    #[serde(default)]
    pub scope_to_session: bool,
    /// Deny reason shown to the agent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl PermissionResponse {
    pub fn allow(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            allow: true,
            scope_to_session: false,
            message: None,
        }
    }

    pub fn deny(request_id: impl Into<String>, message: Option<String>) -> Self {
        Self {
            request_id: request_id.into(),
            allow: false,
            scope_to_session: false,
            message,
        }
    }
}

/// Reply to a question request, one answer per question in order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionResponse {
    pub request_id: String,
    pub answers: Vec<String>,
}

/// Small persisted backend configuration object
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Override for the agent CLI binary path
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binary_path: Option<String>,
    /// Override for the directory scanned for project transcripts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub projects_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug_log_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_window_override: Option<u64>,
}

/// A discovered on-disk transcript, used for session recovery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptRef {
    pub path: String,
    pub agent_session_id: String,
    pub cwd: String,
    pub modified_at: u64,
}
