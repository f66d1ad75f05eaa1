//! Backend event ingestion
//!
//! One bridge per client process, subscribed to the shared event channel.
//! Events are applied strictly sequentially — within a session, ordering is
//! load-bearing (message append before tool-output attach); across sessions
//! no ordering is assumed. Every handler is a total function over the
//! current store snapshot: events for unknown or removed sessions are
//! no-ops, because local removal legitimately races in-flight backend
//! events.

use std::collections::HashMap;
use std::sync::Arc;

use skiff_backend::AgentBackend;
use skiff_protocol::events::ToolPatch;
use skiff_protocol::{
    is_edit_tool, BackendEvent, Message, PendingPermission, PendingQuestion, PermissionMode,
    PermissionResponse, RequestScope, SessionStatus, ToolStatus, ENTER_PLAN_MODE_TOOL,
    EXIT_PLAN_MODE_TOOL,
};
use tracing::{debug, warn};

use crate::slash::SlashOrchestrator;
use crate::store::{MessagePatch, PlanApproval, SessionPatch, SessionStore};

pub struct EventBridge<B: AgentBackend> {
    backend: Arc<B>,
    slash: SlashOrchestrator,
    /// Last assistant message id per session, for streaming-flag completion
    last_assistant: HashMap<String, String>,
}

impl<B: AgentBackend> EventBridge<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            slash: SlashOrchestrator::new(),
            last_assistant: HashMap::new(),
        }
    }

    pub fn slash(&self) -> &SlashOrchestrator {
        &self.slash
    }

    pub fn slash_mut(&mut self) -> &mut SlashOrchestrator {
        &mut self.slash
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Apply one backend event as one deterministic store mutation.
    pub fn apply(&mut self, store: &mut SessionStore, event: BackendEvent, now: u64) {
        match event {
            BackendEvent::SessionStarted {
                session_id,
                agent_session_id,
            } => {
                store.update_session(
                    &session_id,
                    SessionPatch {
                        agent_session_id: Some(agent_session_id),
                        status: Some(SessionStatus::Running),
                        ..Default::default()
                    },
                );
            }

            BackendEvent::SessionEnded { session_id, error } => {
                self.finish_streaming(store, &session_id);
                let status = if error.is_some() {
                    SessionStatus::Error
                } else {
                    SessionStatus::Idle
                };
                store.update_session(
                    &session_id,
                    SessionPatch {
                        status: Some(status),
                        ..Default::default()
                    },
                );
            }

            BackendEvent::UserMessage {
                session_id,
                mut message,
            } => {
                if self.is_echoed_user_message(store, &session_id, &message) {
                    return;
                }
                message.is_streaming = false;
                store.add_message(&session_id, message);
            }

            BackendEvent::AssistantMessage {
                session_id,
                mut message,
            } => {
                if !store.contains(&session_id) {
                    return;
                }
                let exists = store
                    .cell(&session_id)
                    .map(|c| c.message_index(&message.id).is_some())
                    .unwrap_or(false);
                if exists {
                    // Streaming revision of a message already appended.
                    store.update_message(
                        &session_id,
                        &message.id.clone(),
                        MessagePatch {
                            text: Some(message.text),
                            tool_calls: Some(message.tool_calls),
                            ..Default::default()
                        },
                    );
                } else {
                    self.finish_streaming(store, &session_id);
                    message.is_streaming = true;
                    let message_id = message.id.clone();
                    store.add_message(&session_id, message);
                    self.last_assistant.insert(session_id.clone(), message_id);
                }
                store.update_session(
                    &session_id,
                    SessionPatch {
                        status: Some(SessionStatus::Running),
                        last_active_at: Some(now),
                        ..Default::default()
                    },
                );
            }

            BackendEvent::StreamDelta {
                session_id,
                message_id,
                text,
            } => {
                store.update_message(
                    &session_id,
                    &message_id,
                    MessagePatch {
                        text: Some(text),
                        ..Default::default()
                    },
                );
            }

            BackendEvent::ToolStarted { session_id, tool } => {
                self.handle_tool_started(store, &session_id, tool, now);
            }

            BackendEvent::ToolUpdated {
                session_id,
                tool_id,
                patch,
            } => {
                store.update_tool_fields(&session_id, &tool_id, &patch);
            }

            BackendEvent::ToolCompleted {
                session_id,
                tool_id,
                output,
            } => {
                store.update_tool_output(&session_id, &tool_id, &output, now);
            }

            BackendEvent::ToolError {
                session_id,
                tool_id,
                error,
            } => {
                store.update_tool_error(&session_id, &tool_id, &error, now);
            }

            BackendEvent::TodosUpdated { session_id, todos } => {
                store.update_session(
                    &session_id,
                    SessionPatch {
                        todos: Some(Some(todos)),
                        ..Default::default()
                    },
                );
            }

            BackendEvent::UsageUpdated {
                session_id,
                usage,
                total_cost_usd,
            } => {
                self.finish_streaming(store, &session_id);
                store.update_session(
                    &session_id,
                    SessionPatch {
                        usage: Some(usage),
                        total_cost_usd,
                        status: Some(SessionStatus::Idle),
                        ..Default::default()
                    },
                );
            }

            BackendEvent::PermissionRequested {
                request_id,
                session_id,
                tool_name,
                input,
                tool_use_id,
            } => {
                self.handle_permission_requested(
                    store,
                    request_id,
                    session_id,
                    tool_name,
                    input,
                    tool_use_id,
                    now,
                );
            }

            BackendEvent::PermissionResolved {
                request_id,
                session_id,
            } => {
                if store
                    .plan_approval()
                    .is_some_and(|p| p.request_id.as_deref() == Some(&request_id))
                {
                    store.take_plan_approval();
                }
                if store.remove_permission(&request_id).is_none() {
                    // Already gone locally (timeout path); resolution is
                    // idempotent.
                    if let Some(session_id) = session_id {
                        store.recompute_status(&session_id);
                    }
                }
            }

            BackendEvent::QuestionRequested {
                request_id,
                session_id,
                tool_use_id,
                questions,
            } => {
                let scope = match session_id {
                    Some(session_id) if store.contains(&session_id) => {
                        RequestScope::Session { session_id }
                    }
                    _ => RequestScope::Orphan,
                };
                store.push_question(PendingQuestion {
                    request_id,
                    scope,
                    tool_use_id,
                    questions,
                    created_at: now,
                });
            }

            BackendEvent::QuestionResolved {
                request_id,
                session_id,
            } => {
                if store.remove_question(&request_id).is_none() {
                    if let Some(session_id) = session_id {
                        store.recompute_status(&session_id);
                    }
                }
            }

            BackendEvent::SlashStarted {
                session_id,
                command_id,
                command,
            } => {
                self.slash.on_started(&session_id, &command_id, &command);
            }

            BackendEvent::SlashOutput {
                session_id,
                command_id,
                chunk,
            } => {
                self.slash.on_output(&session_id, &command_id, &chunk);
            }

            BackendEvent::SlashDetected {
                session_id,
                command,
            } => {
                debug!(
                    component = "bridge",
                    event = "bridge.slash.detected",
                    session_id = %session_id,
                    command = %command,
                    "Backend detected slash command in user input"
                );
            }

            BackendEvent::SlashCompleted {
                session_id,
                command_id,
                summary,
            } => {
                self.slash
                    .on_completed(store, &session_id, &command_id, summary, now);
            }

            BackendEvent::SlashError {
                session_id,
                command_id,
                error,
            } => {
                self.slash
                    .on_error(store, &session_id, &command_id, &error, now);
            }
        }
    }

    /// Mark the session's last streaming assistant message as finished.
    /// The flag only ever transitions one way.
    fn finish_streaming(&mut self, store: &mut SessionStore, session_id: &str) {
        if let Some(message_id) = self.last_assistant.get(session_id) {
            store.update_message(
                session_id,
                &message_id.clone(),
                MessagePatch {
                    is_streaming: Some(false),
                    ..Default::default()
                },
            );
        }
    }

    /// Connectors echo user messages back; skip one whose text matches a
    /// recent user turn.
    fn is_echoed_user_message(
        &self,
        store: &SessionStore,
        session_id: &str,
        message: &Message,
    ) -> bool {
        store
            .cell(session_id)
            .map(|cell| {
                cell.messages()
                    .iter()
                    .rev()
                    .take(5)
                    .any(|m| m.role == message.role && m.text == message.text && !message.text.is_empty())
            })
            .unwrap_or(false)
    }

    fn handle_tool_started(
        &mut self,
        store: &mut SessionStore,
        session_id: &str,
        mut tool: skiff_protocol::ToolCall,
        now: u64,
    ) {
        if !store.contains(session_id) {
            return;
        }

        // Two tool names get special handling: plan-mode entry toggles the
        // permission mode, plan-mode exit opens the approval overlay.
        if tool.name == ENTER_PLAN_MODE_TOOL {
            store.update_session(
                session_id,
                SessionPatch {
                    permission_mode: Some(PermissionMode::Plan),
                    ..Default::default()
                },
            );
        }
        if tool.name == EXIT_PLAN_MODE_TOOL {
            let plan = tool
                .input
                .get("plan")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            store.set_plan_approval(PlanApproval {
                request_id: None,
                session_id: Some(session_id.to_string()),
                plan,
            });
        }

        tool.status = ToolStatus::Running;
        if tool.started_at.is_none() {
            tool.started_at = Some(now);
        }

        let already_indexed = store
            .cell(session_id)
            .map(|c| c.tool(&tool.id).is_some())
            .unwrap_or(false);
        if already_indexed {
            store.update_tool_fields(
                session_id,
                &tool.id,
                &ToolPatch {
                    status: Some(ToolStatus::Running),
                    ..Default::default()
                },
            );
            return;
        }

        // Attach to the message that declared it when we have one; tools
        // without an owning message (subagent side-channel) live in the flat
        // index only.
        let owner = self
            .last_assistant
            .get(session_id)
            .filter(|id| {
                store
                    .cell(session_id)
                    .map(|c| c.message_index(id).is_some())
                    .unwrap_or(false)
            })
            .cloned();
        match owner {
            Some(message_id) if tool.is_top_level() => {
                let mut tool_calls = store
                    .cell(session_id)
                    .and_then(|c| c.message_index(&message_id).map(|i| c.messages()[i].tool_calls.clone()))
                    .unwrap_or_default();
                tool_calls.push(tool);
                store.update_message(
                    session_id,
                    &message_id,
                    MessagePatch {
                        tool_calls: Some(tool_calls),
                        ..Default::default()
                    },
                );
            }
            _ => store.merge_subagent_tools(session_id, vec![tool]),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_permission_requested(
        &mut self,
        store: &mut SessionStore,
        request_id: String,
        session_id: Option<String>,
        tool_name: String,
        input: serde_json::Value,
        tool_use_id: Option<String>,
        now: u64,
    ) {
        // Plan-mode exit always routes to the overlay, never the queue.
        if tool_name == EXIT_PLAN_MODE_TOOL {
            let plan = input
                .get("plan")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .or_else(|| store.plan_approval().map(|p| p.plan.clone()))
                .unwrap_or_default();
            store.set_plan_approval(PlanApproval {
                request_id: Some(request_id),
                session_id,
                plan,
            });
            return;
        }

        let mode = session_id
            .as_deref()
            .and_then(|id| store.session(id))
            .map(|s| s.permission_mode)
            .unwrap_or(store.settings().permission_mode);

        let auto_approve = match mode {
            PermissionMode::BypassPermissions => true,
            PermissionMode::AcceptEdits => is_edit_tool(&tool_name),
            PermissionMode::Default | PermissionMode::Plan => false,
        };

        if auto_approve {
            // Best-effort fire-and-forget: a failed auto-approval is logged,
            // never surfaced, and the request is considered sent.
            let backend = Arc::clone(&self.backend);
            let response = PermissionResponse::allow(request_id);
            tokio::spawn(async move {
                if let Err(e) = backend.respond_permission(response).await {
                    warn!(
                        component = "bridge",
                        event = "bridge.auto_approve.failed",
                        error = %e,
                        "Auto-approval send failed"
                    );
                }
            });
            return;
        }

        let scope = match session_id {
            Some(session_id) if store.contains(&session_id) => RequestScope::Session { session_id },
            _ => RequestScope::Orphan,
        };
        store.push_permission(PendingPermission {
            request_id,
            scope,
            tool_name,
            input,
            tool_use_id,
            created_at: now,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use skiff_backend::MockBackend;
    use skiff_protocol::{MessageRole, Session, TokenUsage, ToolCall};

    fn fixture() -> (EventBridge<MockBackend>, SessionStore) {
        let (backend, _rx) = MockBackend::channel(8);
        let mut store = SessionStore::new();
        store.add_session(Session::new("s1", "test", "/tmp/project", 0));
        (EventBridge::new(Arc::new(backend)), store)
    }

    fn permission_event(request_id: &str, tool_name: &str) -> BackendEvent {
        BackendEvent::PermissionRequested {
            request_id: request_id.to_string(),
            session_id: Some("s1".to_string()),
            tool_name: tool_name.to_string(),
            input: json!({}),
            tool_use_id: None,
        }
    }

    fn set_mode(store: &mut SessionStore, mode: PermissionMode) {
        store.update_session(
            "s1",
            SessionPatch {
                permission_mode: Some(mode),
                ..Default::default()
            },
        );
    }

    #[tokio::test]
    async fn default_mode_enqueues_every_request() {
        let (mut bridge, mut store) = fixture();
        bridge.apply(&mut store, permission_event("req-1", "Bash"), 10);
        bridge.apply(&mut store, permission_event("req-2", "Write"), 11);

        assert_eq!(store.pending_permissions().len(), 2);
        assert!(store
            .pending_permissions()
            .iter()
            .all(|p| p.scope.session_id() == Some("s1")));
        assert_eq!(
            store.session("s1").unwrap().status,
            SessionStatus::WaitingPermission
        );
    }

    #[tokio::test]
    async fn bypass_mode_auto_approves_everything() {
        let (mut bridge, mut store) = fixture();
        set_mode(&mut store, PermissionMode::BypassPermissions);

        bridge.apply(&mut store, permission_event("req-1", "Bash"), 10);
        bridge.apply(&mut store, permission_event("req-2", "Write"), 11);
        for _ in 0..20 {
            if bridge.backend().permission_responses().len() == 2 {
                break;
            }
            tokio::task::yield_now().await;
        }

        assert!(store.pending_permissions().is_empty());
        let responses = bridge.backend().permission_responses();
        assert_eq!(responses.len(), 2);
        assert!(responses.iter().all(|r| r.allow));
    }

    #[tokio::test]
    async fn accept_edits_auto_approves_only_edit_tools() {
        let (mut bridge, mut store) = fixture();
        set_mode(&mut store, PermissionMode::AcceptEdits);

        bridge.apply(&mut store, permission_event("req-1", "Write"), 10);
        bridge.apply(&mut store, permission_event("req-2", "Bash"), 11);
        for _ in 0..20 {
            if !bridge.backend().permission_responses().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }

        let pending = store.pending_permissions();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].tool_name, "Bash");

        let responses = bridge.backend().permission_responses();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].request_id, "req-1");
    }

    #[tokio::test]
    async fn auto_approve_failure_is_swallowed() {
        let (mut bridge, mut store) = fixture();
        set_mode(&mut store, PermissionMode::BypassPermissions);
        bridge.backend().set_failing(true);

        bridge.apply(&mut store, permission_event("req-1", "Bash"), 10);
        tokio::task::yield_now().await;

        // Still not enqueued; the request counts as sent.
        assert!(store.pending_permissions().is_empty());
    }

    #[tokio::test]
    async fn exit_plan_mode_routes_to_overlay() {
        let (mut bridge, mut store) = fixture();
        bridge.apply(
            &mut store,
            BackendEvent::PermissionRequested {
                request_id: "req-plan".to_string(),
                session_id: Some("s1".to_string()),
                tool_name: EXIT_PLAN_MODE_TOOL.to_string(),
                input: json!({"plan": "1. do things"}),
                tool_use_id: None,
            },
            10,
        );

        assert!(store.pending_permissions().is_empty());
        let approval = store.plan_approval().expect("overlay");
        assert_eq!(approval.request_id.as_deref(), Some("req-plan"));
        assert_eq!(approval.plan, "1. do things");

        // Resolution clears the overlay.
        bridge.apply(
            &mut store,
            BackendEvent::PermissionResolved {
                request_id: "req-plan".to_string(),
                session_id: Some("s1".to_string()),
            },
            11,
        );
        assert!(store.plan_approval().is_none());
    }

    #[tokio::test]
    async fn orphan_request_lands_in_orphan_scope() {
        let (mut bridge, mut store) = fixture();
        bridge.apply(
            &mut store,
            BackendEvent::PermissionRequested {
                request_id: "req-1".to_string(),
                session_id: None,
                tool_name: "Bash".to_string(),
                input: json!({}),
                tool_use_id: Some("t-1".to_string()),
            },
            10,
        );

        assert_eq!(store.pending_permissions().len(), 1);
        assert_eq!(store.pending_permissions()[0].scope, RequestScope::Orphan);
        // Orphan requests never flip a session into waiting.
        assert_eq!(store.session("s1").unwrap().status, SessionStatus::Idle);
    }

    #[tokio::test]
    async fn events_for_unknown_sessions_are_no_ops() {
        let (mut bridge, mut store) = fixture();
        let before = store.revision();

        bridge.apply(
            &mut store,
            BackendEvent::AssistantMessage {
                session_id: "ghost".to_string(),
                message: Message::new("m1", MessageRole::Assistant, "hi", 0),
            },
            10,
        );
        bridge.apply(
            &mut store,
            BackendEvent::ToolCompleted {
                session_id: "ghost".to_string(),
                tool_id: "t-1".to_string(),
                output: "out".to_string(),
            },
            11,
        );
        bridge.apply(
            &mut store,
            BackendEvent::SessionEnded {
                session_id: "ghost".to_string(),
                error: None,
            },
            12,
        );

        assert_eq!(store.revision(), before);
    }

    #[tokio::test]
    async fn assistant_streaming_lifecycle() {
        let (mut bridge, mut store) = fixture();

        bridge.apply(
            &mut store,
            BackendEvent::AssistantMessage {
                session_id: "s1".to_string(),
                message: Message::new("m1", MessageRole::Assistant, "first", 5),
            },
            5,
        );
        assert!(store.cell("s1").unwrap().messages()[0].is_streaming);
        assert_eq!(store.session("s1").unwrap().status, SessionStatus::Running);

        bridge.apply(
            &mut store,
            BackendEvent::StreamDelta {
                session_id: "s1".to_string(),
                message_id: "m1".to_string(),
                text: "first, extended".to_string(),
            },
            6,
        );
        assert_eq!(store.cell("s1").unwrap().messages()[0].text, "first, extended");

        // A new assistant message finishes the previous one.
        bridge.apply(
            &mut store,
            BackendEvent::AssistantMessage {
                session_id: "s1".to_string(),
                message: Message::new("m2", MessageRole::Assistant, "second", 7),
            },
            7,
        );
        let cell = store.cell("s1").unwrap();
        assert!(!cell.messages()[0].is_streaming);
        assert!(cell.messages()[1].is_streaming);

        // Usage ends the turn: idle, nothing streaming.
        bridge.apply(
            &mut store,
            BackendEvent::UsageUpdated {
                session_id: "s1".to_string(),
                usage: TokenUsage::default(),
                total_cost_usd: Some(0.1),
            },
            8,
        );
        let cell = store.cell("s1").unwrap();
        assert!(!cell.messages()[1].is_streaming);
        assert_eq!(store.session("s1").unwrap().status, SessionStatus::Idle);
        assert_eq!(store.session("s1").unwrap().total_cost_usd, Some(0.1));
    }

    #[tokio::test]
    async fn tool_started_attaches_to_last_assistant_message() {
        let (mut bridge, mut store) = fixture();
        bridge.apply(
            &mut store,
            BackendEvent::AssistantMessage {
                session_id: "s1".to_string(),
                message: Message::new("m1", MessageRole::Assistant, "running a command", 5),
            },
            5,
        );
        bridge.apply(
            &mut store,
            BackendEvent::ToolStarted {
                session_id: "s1".to_string(),
                tool: ToolCall::new("t-1", "Bash", json!({"command": "ls"})),
            },
            6,
        );

        let cell = store.cell("s1").unwrap();
        assert_eq!(cell.messages()[0].tool_calls.len(), 1);
        assert_eq!(cell.tool("t-1").unwrap().status, ToolStatus::Running);
        assert_eq!(cell.tool_message_id("t-1"), Some("m1"));

        bridge.apply(
            &mut store,
            BackendEvent::ToolCompleted {
                session_id: "s1".to_string(),
                tool_id: "t-1".to_string(),
                output: "src tests".to_string(),
            },
            7,
        );
        let cell = store.cell("s1").unwrap();
        assert_eq!(cell.tool("t-1").unwrap().status, ToolStatus::Completed);
        assert_eq!(
            cell.messages()[0].tool_calls[0].output.as_deref(),
            Some("src tests")
        );
    }

    #[tokio::test]
    async fn subagent_child_tool_goes_to_flat_index_only() {
        let (mut bridge, mut store) = fixture();
        let mut child = ToolCall::new("c-1", "Read", json!({}));
        child.parent_tool_id = Some("task-1".to_string());
        bridge.apply(
            &mut store,
            BackendEvent::ToolStarted {
                session_id: "s1".to_string(),
                tool: child,
            },
            5,
        );

        let cell = store.cell("s1").unwrap();
        assert!(cell.tool("c-1").is_some());
        assert!(cell.tool_message_id("c-1").is_none());
    }

    #[tokio::test]
    async fn session_ended_with_error_sets_error_status() {
        let (mut bridge, mut store) = fixture();
        bridge.apply(
            &mut store,
            BackendEvent::SessionEnded {
                session_id: "s1".to_string(),
                error: Some("process crashed".to_string()),
            },
            5,
        );
        assert_eq!(store.session("s1").unwrap().status, SessionStatus::Error);
    }

    #[tokio::test]
    async fn question_request_and_resolution_drive_status() {
        let (mut bridge, mut store) = fixture();
        bridge.apply(
            &mut store,
            BackendEvent::QuestionRequested {
                request_id: "q-1".to_string(),
                session_id: Some("s1".to_string()),
                tool_use_id: None,
                questions: Vec::new(),
            },
            5,
        );
        assert_eq!(
            store.session("s1").unwrap().status,
            SessionStatus::WaitingQuestion
        );

        bridge.apply(
            &mut store,
            BackendEvent::QuestionResolved {
                request_id: "q-1".to_string(),
                session_id: Some("s1".to_string()),
            },
            6,
        );
        assert_eq!(store.session("s1").unwrap().status, SessionStatus::Idle);
    }

    #[tokio::test]
    async fn echoed_user_message_is_deduped() {
        let (mut bridge, mut store) = fixture();
        store.add_message("s1", Message::new("m1", MessageRole::User, "do the thing", 1));

        bridge.apply(
            &mut store,
            BackendEvent::UserMessage {
                session_id: "s1".to_string(),
                message: Message::new("m-echo", MessageRole::User, "do the thing", 2),
            },
            2,
        );
        assert_eq!(store.cell("s1").unwrap().messages().len(), 1);
    }

    #[tokio::test]
    async fn enter_plan_mode_tool_toggles_mode() {
        let (mut bridge, mut store) = fixture();
        bridge.apply(
            &mut store,
            BackendEvent::ToolStarted {
                session_id: "s1".to_string(),
                tool: ToolCall::new("t-plan", ENTER_PLAN_MODE_TOOL, json!({})),
            },
            5,
        );
        assert_eq!(
            store.session("s1").unwrap().permission_mode,
            PermissionMode::Plan
        );
    }
}
