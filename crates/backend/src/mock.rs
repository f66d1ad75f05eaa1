//! Channel-backed mock backend for tests.
//!
//! Records every command call and lets tests inject `BackendEvent`s through
//! the sender half of the event channel, standing in for a real subprocess
//! manager.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use skiff_protocol::{
    AppConfig, BackendEvent, PermissionResponse, QuestionResponse, SpawnSpec, TranscriptRef,
};
use tokio::sync::mpsc;

use crate::{AgentBackend, BackendError, Result};

/// A recorded backend command
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    SpawnSession { session_id: String, spec: SpawnSpec },
    SendMessage { session_id: String, content: String },
    Interrupt { session_id: String },
    RespondPermission(PermissionResponse),
    AnswerQuestion(QuestionResponse),
    RunSlash { session_id: String, command: String },
    CancelSlash { session_id: String, command_id: String },
    ListTranscripts { cwd: String },
    LoadTranscript { path: String },
    GetConfig,
    SetConfig(AppConfig),
}

pub struct MockBackend {
    calls: Mutex<Vec<MockCall>>,
    failing: AtomicBool,
    slash_counter: AtomicU64,
    transcripts: Mutex<HashMap<String, String>>,
    config: Mutex<AppConfig>,
    event_tx: mpsc::Sender<BackendEvent>,
}

impl MockBackend {
    /// Create a mock plus the receiver a bridge/runtime would consume.
    /// The sender is reachable via [`MockBackend::event_sender`].
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<BackendEvent>) {
        let (event_tx, event_rx) = mpsc::channel(capacity);
        let backend = Self {
            calls: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
            slash_counter: AtomicU64::new(0),
            transcripts: Mutex::new(HashMap::new()),
            config: Mutex::new(AppConfig::default()),
            event_tx,
        };
        (backend, event_rx)
    }

    /// Sender for injecting events as if the backend emitted them.
    pub fn event_sender(&self) -> mpsc::Sender<BackendEvent> {
        self.event_tx.clone()
    }

    /// Make every subsequent call fail with a backend error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Seed a transcript returned by `load_transcript`.
    pub fn add_transcript(&self, path: impl Into<String>, raw: impl Into<String>) {
        self.transcripts
            .lock()
            .unwrap()
            .insert(path.into(), raw.into());
    }

    /// All commands recorded so far, in call order.
    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Recorded permission responses, in call order.
    pub fn permission_responses(&self) -> Vec<PermissionResponse> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                MockCall::RespondPermission(response) => Some(response),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: MockCall) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(BackendError::BackendError("mock failure".to_string()));
        }
        self.calls.lock().unwrap().push(call);
        Ok(())
    }
}

#[async_trait]
impl AgentBackend for MockBackend {
    async fn spawn_session(&self, session_id: &str, spec: SpawnSpec) -> Result<String> {
        self.record(MockCall::SpawnSession {
            session_id: session_id.to_string(),
            spec,
        })?;
        Ok(format!("agent-{}", session_id))
    }

    async fn send_message(&self, session_id: &str, content: &str) -> Result<()> {
        self.record(MockCall::SendMessage {
            session_id: session_id.to_string(),
            content: content.to_string(),
        })
    }

    async fn interrupt(&self, session_id: &str) -> Result<()> {
        self.record(MockCall::Interrupt {
            session_id: session_id.to_string(),
        })
    }

    async fn respond_permission(&self, response: PermissionResponse) -> Result<()> {
        self.record(MockCall::RespondPermission(response))
    }

    async fn answer_question(&self, response: QuestionResponse) -> Result<()> {
        self.record(MockCall::AnswerQuestion(response))
    }

    async fn run_slash(&self, session_id: &str, command: &str) -> Result<String> {
        self.record(MockCall::RunSlash {
            session_id: session_id.to_string(),
            command: command.to_string(),
        })?;
        let n = self.slash_counter.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(format!("cmd-{}", n))
    }

    async fn cancel_slash(&self, session_id: &str, command_id: &str) -> Result<()> {
        self.record(MockCall::CancelSlash {
            session_id: session_id.to_string(),
            command_id: command_id.to_string(),
        })
    }

    async fn list_transcripts(&self, cwd: &str) -> Result<Vec<TranscriptRef>> {
        self.record(MockCall::ListTranscripts {
            cwd: cwd.to_string(),
        })?;
        Ok(Vec::new())
    }

    async fn load_transcript(&self, path: &str) -> Result<String> {
        self.record(MockCall::LoadTranscript {
            path: path.to_string(),
        })?;
        self.transcripts
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| BackendError::BackendError(format!("no transcript at {}", path)))
    }

    async fn get_config(&self) -> Result<AppConfig> {
        self.record(MockCall::GetConfig)?;
        Ok(self.config.lock().unwrap().clone())
    }

    async fn set_config(&self, config: AppConfig) -> Result<()> {
        self.record(MockCall::SetConfig(config.clone()))?;
        *self.config.lock().unwrap() = config;
        Ok(())
    }
}
