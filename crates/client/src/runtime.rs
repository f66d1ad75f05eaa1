//! Client runtime — the store-owning event loop
//!
//! The runtime task exclusively owns the `SessionStore`; nothing else holds
//! a reference to it. External callers (the rendering layer) interact
//! through a `ClientHandle`: commands over an mpsc channel, queries answered
//! over oneshot replies, and a lock-free `ArcSwap` snapshot of session
//! summaries refreshed after every applied event. Backend events, client
//! commands, and the persistence debounce timer are multiplexed on one
//! `select!` — mutations are never interleaved.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use skiff_backend::{AgentBackend, BackendError};
use skiff_protocol::{
    new_id, BackendEvent, Message, MessageRole, PendingPermission, PendingQuestion,
    PermissionDecision, PermissionMode, PermissionResponse, QuestionResponse, Session,
    SessionEvent, SessionStatus, SessionSummary, SpawnSpec,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::bridge::EventBridge;
use crate::persistence::{self, PersistedState, PersistenceWriter, FLUSH_DEBOUNCE_MS};
use crate::selectors::{self, SessionGroup};
use crate::store::{SessionCell, SessionPatch, SessionStore};

/// Current time in epoch milliseconds. The one clock read in the crate.
pub fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A command sent to the runtime task
pub enum ClientCommand {
    // -- Queries (oneshot replies) --
    GetSessionState {
        session_id: String,
        reply: oneshot::Sender<Option<SessionCell>>,
    },
    GetVisibleMessages {
        session_id: String,
        reply: oneshot::Sender<Vec<Message>>,
    },
    GetPendingPermissions {
        session_id: String,
        reply: oneshot::Sender<Vec<PendingPermission>>,
    },
    GetPendingQuestions {
        session_id: String,
        reply: oneshot::Sender<Vec<PendingQuestion>>,
    },
    GetGroups {
        reply: oneshot::Sender<Vec<SessionGroup>>,
    },

    // -- Session lifecycle --
    CreateSession {
        name: String,
        cwd: String,
        prompt: String,
        model: Option<String>,
        reply: oneshot::Sender<Result<String, BackendError>>,
    },
    RemoveSession {
        session_id: String,
    },
    DiscoverSessions {
        cwd: String,
        reply: oneshot::Sender<Result<Vec<String>, BackendError>>,
    },
    LoadTranscript {
        session_id: String,
        path: String,
    },

    // -- Conversation --
    SendMessage {
        session_id: String,
        text: String,
    },
    Interrupt {
        session_id: String,
    },
    RespondPermission {
        request_id: String,
        decision: PermissionDecision,
        message: Option<String>,
        scope_to_session: bool,
    },
    AnswerQuestion {
        request_id: String,
        answers: Vec<String>,
    },
    ApprovePlan {
        accept: bool,
    },
    RunSlash {
        session_id: String,
        command: String,
    },

    // -- Focus and settings --
    SetActive {
        session_id: Option<String>,
    },
    OpenTab {
        session_id: String,
    },
    CloseTab {
        session_id: String,
    },
    SetPermissionMode {
        session_id: String,
        mode: PermissionMode,
    },
    SetSettings {
        settings: crate::store::GlobalSettings,
    },

    // -- Backend config --
    GetConfig {
        reply: oneshot::Sender<Result<skiff_protocol::AppConfig, BackendError>>,
    },
    SetConfig {
        config: skiff_protocol::AppConfig,
    },

    // -- Lifecycle --
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cheap-to-clone handle to the runtime
#[derive(Clone)]
pub struct ClientHandle {
    command_tx: mpsc::Sender<ClientCommand>,
    summaries: Arc<ArcSwap<Vec<SessionSummary>>>,
}

impl ClientHandle {
    /// Lock-free snapshot of session summaries.
    pub fn summaries(&self) -> Arc<Vec<SessionSummary>> {
        self.summaries.load_full()
    }

    /// Send a command (fire-and-forget).
    pub async fn send(&self, command: ClientCommand) {
        if self.command_tx.send(command).await.is_err() {
            warn!(
                component = "runtime",
                event = "runtime.command.dropped",
                "Runtime channel closed, command dropped"
            );
        }
    }

    pub async fn session_state(&self, session_id: &str) -> Option<SessionCell> {
        let (reply, rx) = oneshot::channel();
        self.send(ClientCommand::GetSessionState {
            session_id: session_id.to_string(),
            reply,
        })
        .await;
        rx.await.ok().flatten()
    }

    pub async fn visible_messages(&self, session_id: &str) -> Vec<Message> {
        let (reply, rx) = oneshot::channel();
        self.send(ClientCommand::GetVisibleMessages {
            session_id: session_id.to_string(),
            reply,
        })
        .await;
        rx.await.unwrap_or_default()
    }

    pub async fn create_session(
        &self,
        name: &str,
        cwd: &str,
        prompt: &str,
        model: Option<String>,
    ) -> Result<String, BackendError> {
        let (reply, rx) = oneshot::channel();
        self.send(ClientCommand::CreateSession {
            name: name.to_string(),
            cwd: cwd.to_string(),
            prompt: prompt.to_string(),
            model,
            reply,
        })
        .await;
        rx.await.map_err(|_| BackendError::ChannelClosed)?
    }

    /// Flush persistence and stop the runtime.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        self.send(ClientCommand::Shutdown { reply }).await;
        let _ = rx.await;
    }
}

/// The runtime task state
pub struct ClientRuntime<B: AgentBackend> {
    store: SessionStore,
    bridge: EventBridge<B>,
    backend: Arc<B>,
    event_rx: mpsc::Receiver<BackendEvent>,
    command_rx: mpsc::Receiver<ClientCommand>,
    persist_tx: mpsc::Sender<PersistedState>,
    summaries: Arc<ArcSwap<Vec<SessionSummary>>>,
    last_persisted: u64,
}

impl<B: AgentBackend> ClientRuntime<B> {
    /// Hydrate from disk, spawn the persistence writer and the event loop,
    /// and return the handle the rendering layer talks to.
    pub fn start(
        backend: Arc<B>,
        event_rx: mpsc::Receiver<BackendEvent>,
        state_path: std::path::PathBuf,
    ) -> ClientHandle {
        let (command_tx, command_rx) = mpsc::channel(256);
        let (persist_tx, persist_rx) = mpsc::channel(64);
        let summaries = Arc::new(ArcSwap::from_pointee(Vec::new()));

        let mut store = SessionStore::new();
        match persistence::load(&state_path) {
            Ok(state) => persistence::hydrate(&mut store, state),
            Err(e) => info!(
                component = "runtime",
                event = "runtime.hydrate.skipped",
                error = %e,
                "Starting with empty state"
            ),
        }

        tokio::spawn(PersistenceWriter::new(persist_rx, state_path).run());

        let runtime = Self {
            store,
            bridge: EventBridge::new(Arc::clone(&backend)),
            backend,
            event_rx,
            command_rx,
            persist_tx,
            summaries: Arc::clone(&summaries),
            last_persisted: 0,
        };
        tokio::spawn(runtime.run());

        ClientHandle {
            command_tx,
            summaries,
        }
    }

    async fn run(mut self) {
        self.publish();
        let mut flush_tick = tokio::time::interval(Duration::from_millis(FLUSH_DEBOUNCE_MS));
        flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                Some(event) = self.event_rx.recv() => {
                    self.bridge.apply(&mut self.store, event, now_ms());
                    self.publish();
                }
                command = self.command_rx.recv() => {
                    match command {
                        Some(command) => {
                            let shutdown = self.handle_command(command).await;
                            self.publish();
                            if shutdown {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = flush_tick.tick() => {
                    self.maybe_flush().await;
                }
            }
        }

        // Shutdown path: one final unconditional flush.
        let _ = self.persist_tx.send(persistence::snapshot(&self.store)).await;
        info!(
            component = "runtime",
            event = "runtime.loop.ended",
            "Client runtime ended"
        );
    }

    fn publish(&self) {
        let mut summaries: Vec<SessionSummary> =
            self.store.cells().map(|c| c.session.summary()).collect();
        summaries.sort_by(|a, b| b.last_active_at.cmp(&a.last_active_at));
        self.summaries.store(Arc::new(summaries));
    }

    async fn maybe_flush(&mut self) {
        if self.store.revision() != self.last_persisted {
            self.last_persisted = self.store.revision();
            let _ = self.persist_tx.send(persistence::snapshot(&self.store)).await;
        }
    }

    /// Returns true when the runtime should stop.
    async fn handle_command(&mut self, command: ClientCommand) -> bool {
        match command {
            ClientCommand::GetSessionState { session_id, reply } => {
                let _ = reply.send(self.store.cell(&session_id).cloned());
            }
            ClientCommand::GetVisibleMessages { session_id, reply } => {
                let messages = self
                    .store
                    .cell(&session_id)
                    .map(|cell| {
                        selectors::visible_messages(cell)
                            .into_iter()
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default();
                let _ = reply.send(messages);
            }
            ClientCommand::GetPendingPermissions { session_id, reply } => {
                let scoped = selectors::permissions_for_session(&self.store, &session_id)
                    .into_iter()
                    .cloned()
                    .collect();
                let _ = reply.send(scoped);
            }
            ClientCommand::GetPendingQuestions { session_id, reply } => {
                let scoped = selectors::questions_for_session(&self.store, &session_id)
                    .into_iter()
                    .cloned()
                    .collect();
                let _ = reply.send(scoped);
            }
            ClientCommand::GetGroups { reply } => {
                let sort = self.store.settings().sort_order;
                let _ = reply.send(selectors::group_sessions(&self.store, sort));
            }

            ClientCommand::CreateSession {
                name,
                cwd,
                prompt,
                model,
                reply,
            } => {
                let result = self.create_session(name, cwd, prompt, model).await;
                let _ = reply.send(result);
            }
            ClientCommand::RemoveSession { session_id } => {
                self.store.remove_session(&session_id);
            }
            ClientCommand::DiscoverSessions { cwd, reply } => {
                let result = self.discover_sessions(&cwd).await;
                let _ = reply.send(result);
            }
            ClientCommand::LoadTranscript { session_id, path } => {
                self.load_transcript(&session_id, &path).await;
            }

            ClientCommand::SendMessage { session_id, text } => {
                self.send_message(&session_id, &text).await;
            }
            ClientCommand::Interrupt { session_id } => {
                // Best-effort; the session stays running until the backend
                // confirms with a session-ended event.
                if let Err(e) = self.backend.interrupt(&session_id).await {
                    warn!(
                        component = "runtime",
                        event = "runtime.interrupt.failed",
                        session_id = %session_id,
                        error = %e,
                        "Interrupt send failed"
                    );
                }
            }
            ClientCommand::RespondPermission {
                request_id,
                decision,
                message,
                scope_to_session,
            } => {
                self.respond_permission(request_id, decision, message, scope_to_session)
                    .await;
            }
            ClientCommand::AnswerQuestion {
                request_id,
                answers,
            } => {
                self.answer_question(request_id, answers).await;
            }
            ClientCommand::ApprovePlan { accept } => {
                self.approve_plan(accept).await;
            }
            ClientCommand::RunSlash {
                session_id,
                command,
            } => match command.as_str() {
                "clear" => {
                    self.bridge
                        .slash_mut()
                        .run_clear(&mut self.store, &Arc::clone(&self.backend), &session_id)
                }
                "compact" => {
                    let backend = Arc::clone(&self.backend);
                    if let Err(e) = self
                        .bridge
                        .slash_mut()
                        .run_compact(&backend, &session_id)
                        .await
                    {
                        warn!(
                            component = "runtime",
                            event = "runtime.slash.start_failed",
                            session_id = %session_id,
                            command = %command,
                            error = %e,
                            "Slash command failed to start"
                        );
                    }
                }
                other => warn!(
                    component = "runtime",
                    event = "runtime.slash.unknown",
                    command = %other,
                    "Unknown slash command"
                ),
            },

            ClientCommand::SetActive { session_id } => {
                self.store.set_active(session_id.as_deref());
            }
            ClientCommand::OpenTab { session_id } => {
                self.store.open_tab(&session_id);
            }
            ClientCommand::CloseTab { session_id } => {
                self.store.close_tab(&session_id);
            }
            ClientCommand::SetPermissionMode { session_id, mode } => {
                self.store.update_session(
                    &session_id,
                    SessionPatch {
                        permission_mode: Some(mode),
                        ..Default::default()
                    },
                );
            }
            ClientCommand::SetSettings { settings } => {
                self.store.set_settings(settings);
            }

            ClientCommand::GetConfig { reply } => {
                let _ = reply.send(self.backend.get_config().await);
            }
            ClientCommand::SetConfig { config } => {
                if let Err(e) = self.backend.set_config(config).await {
                    warn!(
                        component = "runtime",
                        event = "runtime.config.set_failed",
                        error = %e,
                        "Config update failed"
                    );
                }
            }

            ClientCommand::Shutdown { reply } => {
                let _ = reply.send(());
                return true;
            }
        }
        false
    }

    async fn create_session(
        &mut self,
        name: String,
        cwd: String,
        prompt: String,
        model: Option<String>,
    ) -> Result<String, BackendError> {
        let session_id = new_id();
        let now = now_ms();
        self.store
            .add_session(Session::new(session_id.clone(), name, cwd.clone(), now));

        let spec = SpawnSpec {
            cwd,
            prompt: prompt.clone(),
            resume_id: None,
            model,
        };
        match self.backend.spawn_session(&session_id, spec).await {
            Ok(_) => {
                // The agent session id is recorded when the session-started
                // event arrives; the spawn reply is not trusted over it.
                self.store.add_message(
                    &session_id,
                    Message::new(new_id(), MessageRole::User, prompt, now),
                );
                self.store.update_session(
                    &session_id,
                    SessionPatch {
                        status: Some(SessionStatus::Running),
                        ..Default::default()
                    },
                );
                Ok(session_id)
            }
            Err(e) => {
                self.fail_session(&session_id, &format!("spawn failed: {}", e));
                Err(e)
            }
        }
    }

    async fn discover_sessions(&mut self, cwd: &str) -> Result<Vec<String>, BackendError> {
        let refs = self.backend.list_transcripts(cwd).await?;
        let mut added = Vec::new();
        for transcript in refs {
            // Discovered sessions reuse the agent session id as the local id
            // so a deletion keeps suppressing the same session across scans.
            let id = transcript.agent_session_id.clone();
            let known = self
                .store
                .cells()
                .any(|c| c.session.agent_session_id.as_deref() == Some(id.as_str()));
            if known || self.store.contains(&id) {
                continue;
            }
            let name = transcript
                .cwd
                .rsplit('/')
                .next()
                .unwrap_or("recovered")
                .to_string();
            let mut session = Session::new(id.clone(), name, transcript.cwd.clone(), now_ms());
            session.assign_agent_session_id(id.clone());
            if self.store.add_discovered_session(session) {
                added.push(id);
            }
        }
        Ok(added)
    }

    async fn load_transcript(&mut self, session_id: &str, path: &str) {
        if self.store.has_messages(session_id) || !self.store.contains(session_id) {
            return;
        }
        let raw = match self.backend.load_transcript(path).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(
                    component = "runtime",
                    event = "runtime.transcript.load_failed",
                    session_id = %session_id,
                    path = %path,
                    error = %e,
                    "Transcript load failed"
                );
                return;
            }
        };

        let parsed = crate::transcript::parse_transcript(&raw);
        self.store.set_messages(session_id, parsed.messages);
        self.store.update_session(
            session_id,
            SessionPatch {
                usage: parsed.usage,
                total_cost_usd: parsed.total_cost_usd,
                todos: parsed.todos.map(Some),
                status: parsed
                    .pending_question
                    .is_some()
                    .then_some(SessionStatus::WaitingQuestion),
                ..Default::default()
            },
        );
        for summary in parsed.summaries {
            self.store.append_session_event(
                session_id,
                SessionEvent::Compacted {
                    summary,
                    timestamp: now_ms(),
                },
            );
        }
    }

    async fn send_message(&mut self, session_id: &str, text: &str) {
        if !self.store.contains(session_id) {
            return;
        }
        let now = now_ms();
        self.store.add_message(
            session_id,
            Message::new(new_id(), MessageRole::User, text, now),
        );
        self.store.update_session(
            session_id,
            SessionPatch {
                status: Some(SessionStatus::Running),
                ..Default::default()
            },
        );

        if let Err(e) = self.backend.send_message(session_id, text).await {
            self.fail_session(session_id, &format!("send failed: {}", e));
        }
    }

    async fn respond_permission(
        &mut self,
        request_id: String,
        decision: PermissionDecision,
        message: Option<String>,
        scope_to_session: bool,
    ) {
        // Remove-then-send: the response still goes out even when the local
        // entry already expired — duplicate denial is not an error.
        let removed = self.store.remove_permission(&request_id);
        if let Some(permission) = &removed {
            if let Some(session_id) = permission.scope.session_id() {
                let path = permission
                    .input
                    .get("file_path")
                    .and_then(|v| v.as_str())
                    .map(str::to_string);
                self.store.append_session_event(
                    session_id,
                    SessionEvent::Permission {
                        tool_name: permission.tool_name.clone(),
                        decision,
                        path,
                        timestamp: now_ms(),
                    },
                );
            }
        }

        let allow = matches!(decision, PermissionDecision::Allowed);
        let response = PermissionResponse {
            request_id,
            allow,
            scope_to_session,
            message,
        };
        if let Err(e) = self.backend.respond_permission(response).await {
            warn!(
                component = "runtime",
                event = "runtime.permission.respond_failed",
                error = %e,
                "Permission response failed"
            );
            if let Some(session_id) = removed.and_then(|p| p.scope.session_id().map(str::to_string))
            {
                self.fail_session(&session_id, "permission response failed");
            }
        }
    }

    async fn answer_question(&mut self, request_id: String, answers: Vec<String>) {
        let removed = self.store.remove_question(&request_id);
        let response = QuestionResponse {
            request_id,
            answers,
        };
        if let Err(e) = self.backend.answer_question(response).await {
            warn!(
                component = "runtime",
                event = "runtime.question.respond_failed",
                error = %e,
                "Question response failed"
            );
            if let Some(session_id) = removed.and_then(|q| q.scope.session_id().map(str::to_string))
            {
                self.fail_session(&session_id, "question response failed");
            }
        }
    }

    async fn approve_plan(&mut self, accept: bool) {
        let Some(approval) = self.store.take_plan_approval() else {
            return;
        };
        if accept {
            // Leaving plan mode: the session goes back to gated execution.
            if let Some(session_id) = &approval.session_id {
                self.store.update_session(
                    session_id,
                    SessionPatch {
                        permission_mode: Some(PermissionMode::Default),
                        ..Default::default()
                    },
                );
            }
        }
        if let Some(request_id) = approval.request_id {
            let response = if accept {
                PermissionResponse::allow(request_id)
            } else {
                PermissionResponse::deny(request_id, Some("Plan rejected".to_string()))
            };
            if let Err(e) = self.backend.respond_permission(response).await {
                warn!(
                    component = "runtime",
                    event = "runtime.plan.respond_failed",
                    error = %e,
                    "Plan approval response failed"
                );
            }
        }
    }

    fn fail_session(&mut self, session_id: &str, detail: &str) {
        self.store.update_session(
            session_id,
            SessionPatch {
                status: Some(SessionStatus::Error),
                ..Default::default()
            },
        );
        self.store.add_message(
            session_id,
            Message::new(new_id(), MessageRole::System, detail, now_ms()),
        );
    }
}
