//! Out-of-band slash command orchestration
//!
//! Two command styles: immediate (clear — optimistic local mutation, then a
//! fire-and-forget remote sync) and awaited (compact — marked running until
//! the backend's terminal event arrives). Each session tracks at most one
//! in-flight command, keyed by the backend-issued command id; terminal events
//! referencing a superseded id are dropped, which guards the race where a
//! new command starts before the previous one's completion lands.

use std::collections::HashMap;
use std::sync::Arc;

use skiff_backend::AgentBackend;
use skiff_protocol::{SessionEvent, SlashOutcome};
use tracing::{debug, warn};

use crate::store::SessionStore;

/// Lifecycle of a session's in-flight slash command
#[derive(Debug, Clone, PartialEq, Default)]
pub enum SlashPhase {
    #[default]
    Idle,
    Running {
        command_id: String,
        command: String,
        output: String,
    },
    Completed {
        command: String,
        summary: Option<String>,
    },
    Error {
        command: String,
        error: String,
    },
}

/// Per-session slash state. Ephemeral, never persisted.
#[derive(Debug, Default)]
pub struct SlashOrchestrator {
    phases: HashMap<String, SlashPhase>,
}

impl SlashOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self, session_id: &str) -> &SlashPhase {
        static IDLE: SlashPhase = SlashPhase::Idle;
        self.phases.get(session_id).unwrap_or(&IDLE)
    }

    /// Immediate command: clear local conversation state now, then tell the
    /// backend on a best-effort basis. Local state is already correct even
    /// if the remote sync fails.
    pub fn run_clear<B: AgentBackend>(
        &mut self,
        store: &mut SessionStore,
        backend: &Arc<B>,
        session_id: &str,
    ) {
        if !store.contains(session_id) {
            return;
        }
        store.clear_session(session_id);

        let backend = Arc::clone(backend);
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = backend.run_slash(&session_id, "clear").await {
                warn!(
                    component = "slash",
                    event = "slash.clear.sync_failed",
                    session_id = %session_id,
                    error = %e,
                    "Remote clear failed after local clear"
                );
            }
        });
    }

    /// Awaited command: mark running under the backend command id and wait
    /// for the terminal slash event. A start failure surfaces immediately.
    pub async fn run_compact<B: AgentBackend>(
        &mut self,
        backend: &Arc<B>,
        session_id: &str,
    ) -> Result<(), skiff_backend::BackendError> {
        match backend.run_slash(session_id, "compact").await {
            Ok(command_id) => {
                self.on_started(session_id, &command_id, "compact");
                Ok(())
            }
            Err(e) => {
                self.phases.insert(
                    session_id.to_string(),
                    SlashPhase::Error {
                        command: "compact".to_string(),
                        error: e.to_string(),
                    },
                );
                Err(e)
            }
        }
    }

    /// Cancel the in-flight command, if any. Best-effort; the terminal event
    /// (or its absence) settles the state machine.
    pub async fn cancel<B: AgentBackend>(&mut self, backend: &Arc<B>, session_id: &str) {
        if let SlashPhase::Running { command_id, .. } = self.phase(session_id) {
            let command_id = command_id.clone();
            if let Err(e) = backend.cancel_slash(session_id, &command_id).await {
                warn!(
                    component = "slash",
                    event = "slash.cancel_failed",
                    session_id = %session_id,
                    command_id = %command_id,
                    error = %e,
                    "Failed to cancel slash command"
                );
            }
        }
    }

    // -- Event-driven transitions ------------------------------------------

    /// A command started (locally initiated or backend-detected). Supersedes
    /// any previous in-flight command for the session.
    pub fn on_started(&mut self, session_id: &str, command_id: &str, command: &str) {
        self.phases.insert(
            session_id.to_string(),
            SlashPhase::Running {
                command_id: command_id.to_string(),
                command: command.to_string(),
                output: String::new(),
            },
        );
    }

    pub fn on_output(&mut self, session_id: &str, command_id: &str, chunk: &str) {
        match self.phases.get_mut(session_id) {
            Some(SlashPhase::Running {
                command_id: current,
                output,
                ..
            }) if current == command_id => output.push_str(chunk),
            _ => debug!(
                component = "slash",
                event = "slash.output.stale",
                session_id = %session_id,
                command_id = %command_id,
                "Dropping output chunk for untracked command"
            ),
        }
    }

    /// Terminal success. Ignored unless it references the tracked command id.
    /// A completed compact appends a `Compacted` session event carrying the
    /// summary.
    pub fn on_completed(
        &mut self,
        store: &mut SessionStore,
        session_id: &str,
        command_id: &str,
        summary: Option<String>,
        now: u64,
    ) {
        let command = match self.phases.get(session_id) {
            Some(SlashPhase::Running {
                command_id: current,
                command,
                ..
            }) if current == command_id => command.clone(),
            _ => {
                debug!(
                    component = "slash",
                    event = "slash.completed.stale",
                    session_id = %session_id,
                    command_id = %command_id,
                    "Ignoring stale slash completion"
                );
                return;
            }
        };

        if command == "compact" {
            store.append_session_event(
                session_id,
                SessionEvent::Compacted {
                    summary: summary.clone().unwrap_or_default(),
                    timestamp: now,
                },
            );
        }
        store.append_session_event(
            session_id,
            SessionEvent::Slash {
                command: command.clone(),
                status: SlashOutcome::Completed,
                timestamp: now,
            },
        );
        self.phases.insert(
            session_id.to_string(),
            SlashPhase::Completed { command, summary },
        );
    }

    /// Terminal failure, with the same stale-id guard.
    pub fn on_error(
        &mut self,
        store: &mut SessionStore,
        session_id: &str,
        command_id: &str,
        error: &str,
        now: u64,
    ) {
        let command = match self.phases.get(session_id) {
            Some(SlashPhase::Running {
                command_id: current,
                command,
                ..
            }) if current == command_id => command.clone(),
            _ => return,
        };

        store.append_session_event(
            session_id,
            SessionEvent::Slash {
                command: command.clone(),
                status: SlashOutcome::Error,
                timestamp: now,
            },
        );
        self.phases.insert(
            session_id.to_string(),
            SlashPhase::Error {
                command,
                error: error.to_string(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skiff_backend::{MockBackend, MockCall};
    use skiff_protocol::{Message, MessageRole, Session, TokenUsage};

    use crate::store::SessionPatch;

    fn store_with_session(id: &str) -> SessionStore {
        let mut store = SessionStore::new();
        store.add_session(Session::new(id, "test", "/tmp/project", 0));
        store
    }

    #[test]
    fn stale_completion_is_ignored() {
        let mut store = store_with_session("s1");
        let mut slash = SlashOrchestrator::new();

        slash.on_started("s1", "cmd-1", "compact");
        slash.on_started("s1", "cmd-2", "compact");

        // Command A's late completion must not touch B's running state.
        slash.on_completed(&mut store, "s1", "cmd-1", Some("old".to_string()), 100);
        assert!(matches!(
            slash.phase("s1"),
            SlashPhase::Running { command_id, .. } if command_id == "cmd-2"
        ));
        assert!(store.session("s1").unwrap().events.is_empty());

        slash.on_completed(&mut store, "s1", "cmd-2", Some("new".to_string()), 200);
        assert!(matches!(slash.phase("s1"), SlashPhase::Completed { .. }));
    }

    #[test]
    fn compact_completion_appends_session_events() {
        let mut store = store_with_session("s1");
        let mut slash = SlashOrchestrator::new();

        slash.on_started("s1", "cmd-1", "compact");
        slash.on_output("s1", "cmd-1", "summarizing ");
        slash.on_output("s1", "cmd-1", "context");
        slash.on_completed(&mut store, "s1", "cmd-1", Some("summary text".to_string()), 300);

        let events = &store.session("s1").unwrap().events;
        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[0],
            SessionEvent::Compacted { summary, .. } if summary == "summary text"
        ));
        assert!(matches!(
            &events[1],
            SessionEvent::Slash { status: SlashOutcome::Completed, .. }
        ));
    }

    #[test]
    fn output_chunks_accumulate_only_for_tracked_id() {
        let mut slash = SlashOrchestrator::new();
        slash.on_started("s1", "cmd-1", "compact");
        slash.on_output("s1", "cmd-1", "a");
        slash.on_output("s1", "cmd-stale", "b");
        slash.on_output("s1", "cmd-1", "c");

        match slash.phase("s1") {
            SlashPhase::Running { output, .. } => assert_eq!(output, "ac"),
            other => panic!("unexpected phase: {:?}", other),
        }
    }

    #[test]
    fn error_records_slash_event() {
        let mut store = store_with_session("s1");
        let mut slash = SlashOrchestrator::new();

        slash.on_started("s1", "cmd-1", "compact");
        slash.on_error(&mut store, "s1", "cmd-1", "backend exploded", 400);

        assert!(matches!(
            slash.phase("s1"),
            SlashPhase::Error { error, .. } if error == "backend exploded"
        ));
        let events = &store.session("s1").unwrap().events;
        assert!(matches!(
            &events[0],
            SessionEvent::Slash { status: SlashOutcome::Error, .. }
        ));
    }

    #[tokio::test]
    async fn clear_is_optimistic_and_fires_remote() {
        let mut store = store_with_session("s1");
        store.add_message("s1", Message::new("m1", MessageRole::User, "hi", 0));
        store.update_session(
            "s1",
            SessionPatch {
                usage: Some(TokenUsage::default()),
                total_cost_usd: Some(1.5),
                ..Default::default()
            },
        );

        let (backend, _rx) = MockBackend::channel(8);
        let backend = Arc::new(backend);
        let mut slash = SlashOrchestrator::new();
        slash.run_clear(&mut store, &backend, "s1");

        // Local state cleared synchronously.
        assert!(store.cell("s1").unwrap().messages().is_empty());
        assert!(store.session("s1").unwrap().usage.is_none());
        assert!(store.session("s1").unwrap().total_cost_usd.is_none());

        // Remote sync is fire-and-forget; give the spawned task a chance.
        for _ in 0..20 {
            if !backend.calls().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(backend
            .calls()
            .iter()
            .any(|c| matches!(c, MockCall::RunSlash { command, .. } if command == "clear")));
    }

    #[tokio::test]
    async fn compact_start_failure_surfaces_error() {
        let (backend, _rx) = MockBackend::channel(8);
        backend.set_failing(true);
        let backend = Arc::new(backend);
        let mut slash = SlashOrchestrator::new();

        let result = slash.run_compact(&backend, "s1").await;
        assert!(result.is_err());
        assert!(matches!(slash.phase("s1"), SlashPhase::Error { .. }));
    }
}
