//! Skiff Backend Boundary
//!
//! The interface to the subprocess-management backend. The backend owns the
//! agent CLI processes and their transports; this crate only specifies the
//! contract: typed events in (see `skiff_protocol::BackendEvent`), typed
//! commands out (the `AgentBackend` trait).

pub mod mock;

use async_trait::async_trait;
use skiff_protocol::{
    AppConfig, PermissionResponse, QuestionResponse, SpawnSpec, TranscriptRef,
};
use thiserror::Error;

pub use mock::{MockBackend, MockCall};

/// Errors that can occur at the backend boundary
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Failed to spawn process: {0}")]
    SpawnError(String),

    #[error("Process communication error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Backend error: {0}")]
    BackendError(String),
}

pub type Result<T> = std::result::Result<T, BackendError>;

/// Commands accepted by the subprocess-management backend.
///
/// Every call is a request/response over the backend's transport. Events
/// produced as a consequence (message deltas, tool lifecycle, resolutions)
/// arrive on the shared event channel, not as return values.
#[async_trait]
pub trait AgentBackend: Send + Sync + 'static {
    /// Spawn an agent session, returning the agent-assigned session id.
    async fn spawn_session(&self, session_id: &str, spec: SpawnSpec) -> Result<String>;

    /// Send a user message into an existing session.
    async fn send_message(&self, session_id: &str, content: &str) -> Result<()>;

    /// Best-effort stop signal for a running session.
    async fn interrupt(&self, session_id: &str) -> Result<()>;

    /// Respond to a permission request.
    async fn respond_permission(&self, response: PermissionResponse) -> Result<()>;

    /// Answer a question request.
    async fn answer_question(&self, response: QuestionResponse) -> Result<()>;

    /// Start an out-of-band slash command, returning the backend command id.
    async fn run_slash(&self, session_id: &str, command: &str) -> Result<String>;

    /// Cancel a running slash command.
    async fn cancel_slash(&self, session_id: &str, command_id: &str) -> Result<()>;

    /// List on-disk transcripts available for recovery under a directory.
    async fn list_transcripts(&self, cwd: &str) -> Result<Vec<TranscriptRef>>;

    /// Read the raw newline-delimited transcript at `path`.
    async fn load_transcript(&self, path: &str) -> Result<String>;

    async fn get_config(&self) -> Result<AppConfig>;

    async fn set_config(&self, config: AppConfig) -> Result<()>;
}
