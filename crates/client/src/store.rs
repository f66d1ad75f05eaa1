//! Normalized multi-session state container
//!
//! One `SessionCell` per session: the session metadata, the ordered message
//! list (canonical for display), and three derived indexes kept consistent
//! with it on every write. Tool calls are dual-written: the copy inline in
//! the owning message and the copy in the flat `tools_by_id` index always
//! move together, through the mutation entry points defined here and nowhere
//! else. Subagent-only tools (discovered from side-channel transcripts) live
//! only in the flat index.
//!
//! All operations are total over the current state: an unknown session id,
//! message id, or tool id is a no-op, never an error — stale references are
//! a normal consequence of local removal racing in-flight backend events.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use skiff_protocol::events::ToolPatch;
use skiff_protocol::{
    Message, PendingPermission, PendingQuestion, PermissionMode, RequestScope, Session,
    SessionEvent, SessionStatus, TodoItem, TokenUsage, ToolCall, ToolStatus,
};
use tracing::warn;

/// Partial update to a message (delta semantics, `None` = unchanged)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessagePatch {
    pub text: Option<String>,
    pub is_streaming: Option<bool>,
    pub tool_calls: Option<Vec<ToolCall>>,
}

/// Partial update to session metadata
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionPatch {
    pub name: Option<String>,
    pub status: Option<SessionStatus>,
    pub permission_mode: Option<PermissionMode>,
    /// Assign-once: ignored when an agent session id is already set
    pub agent_session_id: Option<String>,
    pub usage: Option<TokenUsage>,
    pub total_cost_usd: Option<f64>,
    /// `Some(None)` clears the current todo list
    pub todos: Option<Option<Vec<TodoItem>>>,
    pub last_active_at: Option<u64>,
}

/// Session list sort order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    RecentActivity,
    Name,
    StatusPriority,
}

/// Global user settings, persisted alongside sessions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalSettings {
    pub theme: String,
    pub sidebar_collapsed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hidden_folders: Vec<String>,
    #[serde(default)]
    pub sort_order: SortOrder,
    #[serde(default)]
    pub permission_mode: PermissionMode,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            theme: "system".to_string(),
            sidebar_collapsed: false,
            model: None,
            hidden_folders: Vec::new(),
            sort_order: SortOrder::default(),
            permission_mode: PermissionMode::default(),
        }
    }
}

/// Plan-approval overlay state. Ephemeral, never persisted.
///
/// Opened when the plan-exit tool starts (no request id yet) and completed
/// when its permission request arrives with the id needed to respond.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanApproval {
    pub request_id: Option<String>,
    pub session_id: Option<String>,
    pub plan: String,
}

// ---------------------------------------------------------------------------
// SessionCell
// ---------------------------------------------------------------------------

/// One session's aggregate: metadata, messages, and the derived indexes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCell {
    pub session: Session,
    #[serde(default)]
    messages: Vec<Message>,
    #[serde(default)]
    tools_by_id: HashMap<String, ToolCall>,
    #[serde(default)]
    tool_message_ids: HashMap<String, String>,
    #[serde(default)]
    message_index_by_id: HashMap<String, usize>,
}

impl SessionCell {
    pub fn new(session: Session) -> Self {
        Self {
            session,
            messages: Vec::new(),
            tools_by_id: HashMap::new(),
            tool_message_ids: HashMap::new(),
            message_index_by_id: HashMap::new(),
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn tools_by_id(&self) -> &HashMap<String, ToolCall> {
        &self.tools_by_id
    }

    pub fn tool(&self, tool_id: &str) -> Option<&ToolCall> {
        self.tools_by_id.get(tool_id)
    }

    /// Message id owning a tool, if the tool is embedded in a message
    pub fn tool_message_id(&self, tool_id: &str) -> Option<&str> {
        self.tool_message_ids.get(tool_id).map(String::as_str)
    }

    pub fn message_index(&self, message_id: &str) -> Option<usize> {
        self.message_index_by_id.get(message_id).copied()
    }

    fn add_message(&mut self, message: Message) {
        self.message_index_by_id
            .insert(message.id.clone(), self.messages.len());
        for tool in &message.tool_calls {
            self.tools_by_id.insert(tool.id.clone(), tool.clone());
            self.tool_message_ids
                .insert(tool.id.clone(), message.id.clone());
        }
        self.session.last_active_at = self.session.last_active_at.max(message.timestamp);
        self.messages.push(message);
    }

    fn update_message(&mut self, message_id: &str, patch: MessagePatch) {
        let index = match self.message_index_by_id.get(message_id) {
            Some(&i) => i,
            None => return,
        };
        let message = &mut self.messages[index];

        if let Some(text) = patch.text {
            message.text = text;
        }
        if let Some(is_streaming) = patch.is_streaming {
            // One-way transition: once a message stops streaming it never
            // starts again.
            if message.is_streaming || !is_streaming {
                message.is_streaming = is_streaming;
            }
        }
        if let Some(tool_calls) = patch.tool_calls {
            for tool in &tool_calls {
                self.tools_by_id.insert(tool.id.clone(), tool.clone());
                self.tool_message_ids
                    .insert(tool.id.clone(), message_id.to_string());
            }
            message.tool_calls = tool_calls;
        }
    }

    fn set_messages(&mut self, messages: Vec<Message>) {
        self.messages = messages;
        self.rebuild_indexes();
    }

    fn rebuild_indexes(&mut self) {
        self.tools_by_id.clear();
        self.tool_message_ids.clear();
        self.message_index_by_id.clear();
        for (index, message) in self.messages.iter().enumerate() {
            self.message_index_by_id.insert(message.id.clone(), index);
            for tool in &message.tool_calls {
                self.tools_by_id.insert(tool.id.clone(), tool.clone());
                self.tool_message_ids
                    .insert(tool.id.clone(), message.id.clone());
            }
        }
    }

    /// Patch a tool in both homes: the owning message's inline array and the
    /// flat index. Single entry point for the dual-write invariant.
    fn patch_tool(&mut self, tool_id: &str, apply: impl Fn(&mut ToolCall)) {
        let Some(indexed) = self.tools_by_id.get_mut(tool_id) else {
            return;
        };
        apply(indexed);

        // Subagent-only tools have no owning message; nothing else to do.
        let Some(message_id) = self.tool_message_ids.get(tool_id).cloned() else {
            return;
        };

        let index = match self.message_index_by_id.get(&message_id) {
            Some(&i) if i < self.messages.len() && self.messages[i].id == message_id => i,
            // The position index should always resolve; fall back to a scan
            // rather than dropping the write.
            _ => {
                warn!(
                    component = "store",
                    event = "store.message_index.stale",
                    message_id = %message_id,
                    "Position index missed, scanning messages"
                );
                match self.messages.iter().position(|m| m.id == message_id) {
                    Some(i) => i,
                    None => return,
                }
            }
        };

        if let Some(tool) = self.messages[index]
            .tool_calls
            .iter_mut()
            .find(|t| t.id == tool_id)
        {
            apply(tool);
        }
    }

    /// Rebuild indexes after deserialization, trusting messages over the
    /// persisted indexes but preserving subagent-only tools (which have no
    /// message to rebuild from).
    pub(crate) fn rehydrate(&mut self) {
        let orphan_tools: Vec<ToolCall> = self
            .tools_by_id
            .values()
            .filter(|tool| !self.tool_message_ids.contains_key(&tool.id))
            .cloned()
            .collect();
        self.rebuild_indexes();
        for tool in orphan_tools {
            self.tools_by_id.entry(tool.id.clone()).or_insert(tool);
        }
    }

    fn merge_subagent_tools(&mut self, tools: Vec<ToolCall>) {
        for tool in tools {
            // Flat index only — these have no owning message and must not be
            // forced into the position index.
            self.tools_by_id.insert(tool.id.clone(), tool);
        }
    }
}

// ---------------------------------------------------------------------------
// SessionStore
// ---------------------------------------------------------------------------

/// The one shared mutable resource: every session aggregate plus tab/focus
/// sub-state, the ephemeral request queues, and global settings.
#[derive(Debug, Default)]
pub struct SessionStore {
    cells: HashMap<String, SessionCell>,
    open_tabs: Vec<String>,
    active_session: Option<String>,
    hidden_ids: HashSet<String>,
    settings: GlobalSettings,
    pending_permissions: Vec<PendingPermission>,
    pending_questions: Vec<PendingQuestion>,
    plan_approval: Option<PlanApproval>,
    revision: u64,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Monotonic counter bumped on every persistence-worthy mutation.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    fn mark_dirty(&mut self) {
        self.revision += 1;
    }

    // -- Session CRUD -------------------------------------------------------

    pub fn add_session(&mut self, session: Session) {
        // An explicit local create always wins over a prior hide.
        self.hidden_ids.remove(&session.id);
        self.cells
            .insert(session.id.clone(), SessionCell::new(session));
        self.mark_dirty();
    }

    /// Add a session recovered from an on-disk transcript. Returns false if
    /// the user previously deleted it (hidden ids suppress rediscovery).
    pub fn add_discovered_session(&mut self, mut session: Session) -> bool {
        if self.hidden_ids.contains(&session.id) {
            return false;
        }
        session.is_discovered = true;
        self.cells
            .insert(session.id.clone(), SessionCell::new(session));
        self.mark_dirty();
        true
    }

    pub fn remove_session(&mut self, session_id: &str) {
        if self.cells.remove(session_id).is_none() {
            return;
        }
        self.hidden_ids.insert(session_id.to_string());
        self.close_tab(session_id);
        self.pending_permissions
            .retain(|p| p.scope.session_id() != Some(session_id));
        self.pending_questions
            .retain(|q| q.scope.session_id() != Some(session_id));
        self.mark_dirty();
    }

    pub fn update_session(&mut self, session_id: &str, patch: SessionPatch) {
        let Some(cell) = self.cells.get_mut(session_id) else {
            return;
        };
        let session = &mut cell.session;
        if let Some(name) = patch.name {
            session.name = name;
        }
        if let Some(status) = patch.status {
            session.status = status;
        }
        if let Some(mode) = patch.permission_mode {
            session.permission_mode = mode;
        }
        if let Some(id) = patch.agent_session_id {
            session.assign_agent_session_id(id);
        }
        if let Some(usage) = patch.usage {
            session.usage = Some(usage);
        }
        if let Some(cost) = patch.total_cost_usd {
            session.total_cost_usd = Some(cost);
        }
        if let Some(todos) = patch.todos {
            session.todos = todos;
        }
        if let Some(ts) = patch.last_active_at {
            session.last_active_at = session.last_active_at.max(ts);
        }
        self.mark_dirty();
    }

    pub fn append_session_event(&mut self, session_id: &str, event: SessionEvent) {
        if let Some(cell) = self.cells.get_mut(session_id) {
            cell.session.events.push(event);
            self.mark_dirty();
        }
    }

    // -- Reads --------------------------------------------------------------

    pub fn session(&self, session_id: &str) -> Option<&Session> {
        self.cells.get(session_id).map(|c| &c.session)
    }

    pub fn cell(&self, session_id: &str) -> Option<&SessionCell> {
        self.cells.get(session_id)
    }

    pub fn cells(&self) -> impl Iterator<Item = &SessionCell> {
        self.cells.values()
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.cells.contains_key(session_id)
    }

    pub fn is_hidden(&self, session_id: &str) -> bool {
        self.hidden_ids.contains(session_id)
    }

    /// O(1) guard used to skip redundant transcript loads.
    pub fn has_messages(&self, session_id: &str) -> bool {
        self.cells
            .get(session_id)
            .map(|c| !c.messages.is_empty())
            .unwrap_or(false)
    }

    // -- Messages and tools -------------------------------------------------

    pub fn add_message(&mut self, session_id: &str, message: Message) {
        if let Some(cell) = self.cells.get_mut(session_id) {
            cell.add_message(message);
            self.mark_dirty();
        }
    }

    pub fn update_message(&mut self, session_id: &str, message_id: &str, patch: MessagePatch) {
        if let Some(cell) = self.cells.get_mut(session_id) {
            cell.update_message(message_id, patch);
            self.mark_dirty();
        }
    }

    /// Attach output to a tool call: forces status to completed and stamps
    /// the end time, in both the inline copy and the flat index.
    pub fn update_tool_output(&mut self, session_id: &str, tool_id: &str, output: &str, now: u64) {
        if let Some(cell) = self.cells.get_mut(session_id) {
            cell.patch_tool(tool_id, |tool| {
                tool.output = Some(output.to_string());
                tool.status = ToolStatus::Completed;
                tool.ended_at = Some(now);
            });
            self.mark_dirty();
        }
    }

    /// Record a tool failure: error text, error status, end timestamp.
    pub fn update_tool_error(&mut self, session_id: &str, tool_id: &str, error: &str, now: u64) {
        if let Some(cell) = self.cells.get_mut(session_id) {
            cell.patch_tool(tool_id, |tool| {
                tool.error = Some(error.to_string());
                tool.status = ToolStatus::Error;
                tool.ended_at = Some(now);
            });
            self.mark_dirty();
        }
    }

    pub fn update_tool_fields(&mut self, session_id: &str, tool_id: &str, patch: &ToolPatch) {
        if let Some(cell) = self.cells.get_mut(session_id) {
            cell.patch_tool(tool_id, |tool| {
                if let Some(status) = patch.status {
                    tool.status = status;
                }
                if let Some(input) = &patch.input {
                    tool.input = input.clone();
                }
                if let Some(output) = &patch.output {
                    tool.output = Some(output.clone());
                }
                if let Some(error) = &patch.error {
                    tool.error = Some(error.clone());
                }
                if let Some(subagent) = &patch.subagent {
                    tool.subagent = Some(subagent.clone());
                }
            });
            self.mark_dirty();
        }
    }

    /// Bulk replace, used when loading a transcript. Rebuilds all indexes.
    pub fn set_messages(&mut self, session_id: &str, messages: Vec<Message>) {
        if let Some(cell) = self.cells.get_mut(session_id) {
            cell.set_messages(messages);
            self.mark_dirty();
        }
    }

    pub fn merge_subagent_tools(&mut self, session_id: &str, tools: Vec<ToolCall>) {
        if let Some(cell) = self.cells.get_mut(session_id) {
            cell.merge_subagent_tools(tools);
            self.mark_dirty();
        }
    }

    /// Optimistic local reset for the clear command: drops messages, derived
    /// indexes, usage, cost, and todos. Session identity and events survive.
    pub fn clear_session(&mut self, session_id: &str) {
        if let Some(cell) = self.cells.get_mut(session_id) {
            cell.set_messages(Vec::new());
            cell.session.usage = None;
            cell.session.total_cost_usd = None;
            cell.session.todos = None;
            self.mark_dirty();
        }
    }

    // -- Tabs and focus -----------------------------------------------------

    pub fn open_tabs(&self) -> &[String] {
        &self.open_tabs
    }

    pub fn active_session(&self) -> Option<&str> {
        self.active_session.as_deref()
    }

    pub fn open_tab(&mut self, session_id: &str) {
        if !self.cells.contains_key(session_id) {
            return;
        }
        if !self.open_tabs.iter().any(|id| id == session_id) {
            self.open_tabs.push(session_id.to_string());
            self.mark_dirty();
        }
    }

    /// Setting the active session auto-opens its tab.
    pub fn set_active(&mut self, session_id: Option<&str>) {
        match session_id {
            Some(id) if self.cells.contains_key(id) => {
                self.open_tab(id);
                self.active_session = Some(id.to_string());
            }
            Some(_) => return,
            None => self.active_session = None,
        }
        self.mark_dirty();
    }

    /// Closing the active tab hands focus to the right neighbor, else the
    /// left one, else nothing. The active pointer never dangles.
    pub fn close_tab(&mut self, session_id: &str) {
        let Some(position) = self.open_tabs.iter().position(|id| id == session_id) else {
            return;
        };
        self.open_tabs.remove(position);

        if self.active_session.as_deref() == Some(session_id) {
            self.active_session = self
                .open_tabs
                .get(position)
                .or_else(|| self.open_tabs.get(position.wrapping_sub(1)))
                .cloned();
        }
        self.mark_dirty();
    }

    // -- Pending requests (ephemeral) ---------------------------------------

    pub fn pending_permissions(&self) -> &[PendingPermission] {
        &self.pending_permissions
    }

    pub fn pending_questions(&self) -> &[PendingQuestion] {
        &self.pending_questions
    }

    pub fn push_permission(&mut self, permission: PendingPermission) {
        if let RequestScope::Session { session_id } = &permission.scope {
            let id = session_id.clone();
            self.set_session_status(&id, SessionStatus::WaitingPermission);
        }
        self.pending_permissions.push(permission);
    }

    pub fn remove_permission(&mut self, request_id: &str) -> Option<PendingPermission> {
        let position = self
            .pending_permissions
            .iter()
            .position(|p| p.request_id == request_id)?;
        let removed = self.pending_permissions.remove(position);
        if let Some(session_id) = removed.scope.session_id().map(str::to_string) {
            self.recompute_status(&session_id);
        }
        Some(removed)
    }

    pub fn push_question(&mut self, question: PendingQuestion) {
        if let RequestScope::Session { session_id } = &question.scope {
            let id = session_id.clone();
            self.set_session_status(&id, SessionStatus::WaitingQuestion);
        }
        self.pending_questions.push(question);
    }

    pub fn remove_question(&mut self, request_id: &str) -> Option<PendingQuestion> {
        let position = self
            .pending_questions
            .iter()
            .position(|q| q.request_id == request_id)?;
        let removed = self.pending_questions.remove(position);
        if let Some(session_id) = removed.scope.session_id().map(str::to_string) {
            self.recompute_status(&session_id);
        }
        Some(removed)
    }

    fn set_session_status(&mut self, session_id: &str, status: SessionStatus) {
        if let Some(cell) = self.cells.get_mut(session_id) {
            cell.session.status = status;
            self.mark_dirty();
        }
    }

    /// After a resolution, derive the session's status from what remains:
    /// question > permission > running, in that priority.
    pub fn recompute_status(&mut self, session_id: &str) {
        let Some(cell) = self.cells.get(session_id) else {
            return;
        };
        let has_question = self
            .pending_questions
            .iter()
            .any(|q| q.scope.session_id() == Some(session_id));
        let has_permission = self
            .pending_permissions
            .iter()
            .any(|p| p.scope.session_id() == Some(session_id));
        let has_running_tools = cell.tools_by_id.values().any(|t| t.status.is_active());

        let status = if has_question {
            SessionStatus::WaitingQuestion
        } else if has_permission {
            SessionStatus::WaitingPermission
        } else if has_running_tools || cell.session.status == SessionStatus::Running {
            SessionStatus::Running
        } else {
            SessionStatus::Idle
        };
        self.set_session_status(session_id, status);
    }

    pub fn plan_approval(&self) -> Option<&PlanApproval> {
        self.plan_approval.as_ref()
    }

    pub fn set_plan_approval(&mut self, approval: PlanApproval) {
        self.plan_approval = Some(approval);
    }

    pub fn take_plan_approval(&mut self) -> Option<PlanApproval> {
        self.plan_approval.take()
    }

    // -- Settings -----------------------------------------------------------

    pub fn settings(&self) -> &GlobalSettings {
        &self.settings
    }

    pub fn set_settings(&mut self, settings: GlobalSettings) {
        self.settings = settings;
        self.mark_dirty();
    }

    // -- Persistence boundary ----------------------------------------------

    pub(crate) fn hidden_ids(&self) -> &HashSet<String> {
        &self.hidden_ids
    }

    /// Install hydrated state wholesale. Only the persistence loader calls
    /// this; it has already filtered tabs and validated the active pointer.
    pub(crate) fn install(
        &mut self,
        cells: HashMap<String, SessionCell>,
        open_tabs: Vec<String>,
        active_session: Option<String>,
        hidden_ids: HashSet<String>,
        settings: GlobalSettings,
    ) {
        self.cells = cells;
        self.open_tabs = open_tabs;
        self.active_session = active_session;
        self.hidden_ids = hidden_ids;
        self.settings = settings;
    }

    pub(crate) fn cells_map(&self) -> &HashMap<String, SessionCell> {
        &self.cells
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use skiff_protocol::MessageRole;

    fn store_with_session(id: &str) -> SessionStore {
        let mut store = SessionStore::new();
        store.add_session(Session::new(id, "test", "/tmp/project", 1000));
        store
    }

    fn message_with_tool(message_id: &str, tool_id: &str) -> Message {
        let mut message = Message::new(message_id, MessageRole::Assistant, "working", 2000);
        message.tool_calls = vec![ToolCall::new(
            tool_id,
            "Bash",
            json!({"command": "cargo test"}),
        )];
        message
    }

    /// Every tool inline in a message must exist in the flat index with
    /// identical fields, and the position index must resolve to the owner.
    fn assert_indexes_consistent(cell: &SessionCell) {
        for message in cell.messages() {
            for tool in &message.tool_calls {
                let indexed = cell.tool(&tool.id).expect("tool missing from flat index");
                assert_eq!(indexed, tool, "inline and indexed tool diverged");
                let owner = cell.tool_message_id(&tool.id).expect("owner missing");
                let position = cell.message_index(owner).expect("position missing");
                assert_eq!(cell.messages()[position].id, message.id);
            }
        }
    }

    #[test]
    fn add_message_indexes_tools() {
        let mut store = store_with_session("s1");
        store.add_message("s1", message_with_tool("m1", "t1"));

        let cell = store.cell("s1").unwrap();
        assert_eq!(cell.tool("t1").unwrap().status, ToolStatus::Pending);
        assert_eq!(cell.tool_message_id("t1"), Some("m1"));
        assert_indexes_consistent(cell);
    }

    #[test]
    fn tool_output_updates_both_homes() {
        let mut store = store_with_session("s1");
        store.add_message("s1", message_with_tool("m1", "t1"));
        store.update_tool_output("s1", "t1", "ok: 12 passed", 3000);

        let cell = store.cell("s1").unwrap();
        let indexed = cell.tool("t1").unwrap();
        assert_eq!(indexed.status, ToolStatus::Completed);
        assert_eq!(indexed.output.as_deref(), Some("ok: 12 passed"));
        assert_eq!(indexed.ended_at, Some(3000));

        let inline = &cell.messages()[0].tool_calls[0];
        assert_eq!(inline, indexed);
        assert_indexes_consistent(cell);
    }

    #[test]
    fn index_consistency_across_operation_sequence() {
        let mut store = store_with_session("s1");
        store.add_message("s1", message_with_tool("m1", "t1"));
        store.add_message("s1", message_with_tool("m2", "t2"));
        store.update_message(
            "s1",
            "m1",
            MessagePatch {
                tool_calls: Some(vec![
                    ToolCall::new("t1", "Bash", json!({"command": "ls"})),
                    ToolCall::new("t3", "Read", json!({"file_path": "/tmp/x"})),
                ]),
                ..Default::default()
            },
        );
        store.update_tool_fields(
            "s1",
            "t3",
            &ToolPatch {
                status: Some(ToolStatus::Running),
                ..Default::default()
            },
        );
        store.update_tool_output("s1", "t2", "done", 5000);

        assert_indexes_consistent(store.cell("s1").unwrap());
        assert_eq!(
            store.cell("s1").unwrap().tool("t3").unwrap().status,
            ToolStatus::Running
        );
    }

    #[test]
    fn set_messages_rebuilds_indexes() {
        let mut store = store_with_session("s1");
        store.add_message("s1", message_with_tool("m1", "t1"));
        store.set_messages("s1", vec![message_with_tool("m9", "t9")]);

        let cell = store.cell("s1").unwrap();
        assert!(cell.tool("t1").is_none());
        assert!(cell.tool("t9").is_some());
        assert_eq!(cell.message_index("m1"), None);
        assert_indexes_consistent(cell);
    }

    #[test]
    fn subagent_tools_stay_out_of_position_index() {
        let mut store = store_with_session("s1");
        let mut child = ToolCall::new("child-1", "Read", json!({}));
        child.parent_tool_id = Some("task-1".to_string());
        store.merge_subagent_tools("s1", vec![child]);

        let cell = store.cell("s1").unwrap();
        assert!(cell.tool("child-1").is_some());
        assert!(cell.tool_message_id("child-1").is_none());
    }

    #[test]
    fn removal_is_idempotent_and_total() {
        let mut store = store_with_session("s1");
        store.remove_session("s1");
        let revision = store.revision();
        store.remove_session("s1");
        store.remove_session("never-existed");
        store.update_session("s1", SessionPatch::default());
        store.add_message("s1", message_with_tool("m1", "t1"));

        assert_eq!(store.revision(), revision);
        assert!(store.is_hidden("s1"));
    }

    #[test]
    fn hidden_session_does_not_rediscover() {
        let mut store = store_with_session("s1");
        store.remove_session("s1");
        let discovered = store.add_discovered_session(Session::new("s1", "x", "/tmp", 0));
        assert!(!discovered);
        assert!(!store.contains("s1"));

        // But an explicit re-create unhides.
        store.add_session(Session::new("s1", "x", "/tmp", 0));
        assert!(store.contains("s1"));
        assert!(!store.is_hidden("s1"));
    }

    #[test]
    fn close_active_tab_prefers_right_neighbor() {
        let mut store = SessionStore::new();
        for id in ["s1", "s2", "s3"] {
            store.add_session(Session::new(id, id, "/tmp", 0));
            store.open_tab(id);
        }
        store.set_active(Some("s2"));

        store.close_tab("s2");
        assert_eq!(store.active_session(), Some("s3"));

        store.close_tab("s3");
        assert_eq!(store.active_session(), Some("s1"));

        store.close_tab("s1");
        assert_eq!(store.active_session(), None);
        assert!(store.open_tabs().is_empty());
    }

    #[test]
    fn set_active_auto_opens_tab() {
        let mut store = store_with_session("s1");
        assert!(store.open_tabs().is_empty());
        store.set_active(Some("s1"));
        assert_eq!(store.open_tabs(), ["s1".to_string()]);

        // Unknown ids leave focus untouched.
        store.set_active(Some("ghost"));
        assert_eq!(store.active_session(), Some("s1"));
    }

    #[test]
    fn streaming_flag_never_reverts() {
        let mut store = store_with_session("s1");
        let mut message = Message::new("m1", MessageRole::Assistant, "partial", 0);
        message.is_streaming = true;
        store.add_message("s1", message);

        store.update_message(
            "s1",
            "m1",
            MessagePatch {
                is_streaming: Some(false),
                ..Default::default()
            },
        );
        store.update_message(
            "s1",
            "m1",
            MessagePatch {
                is_streaming: Some(true),
                ..Default::default()
            },
        );

        assert!(!store.cell("s1").unwrap().messages()[0].is_streaming);
    }

    #[test]
    fn recompute_status_priority() {
        let mut store = store_with_session("s1");
        store.push_permission(PendingPermission {
            request_id: "p-1".to_string(),
            scope: RequestScope::Session {
                session_id: "s1".to_string(),
            },
            tool_name: "Bash".to_string(),
            input: json!({}),
            tool_use_id: None,
            created_at: 0,
        });
        store.push_question(PendingQuestion {
            request_id: "q-1".to_string(),
            scope: RequestScope::Session {
                session_id: "s1".to_string(),
            },
            tool_use_id: None,
            questions: Vec::new(),
            created_at: 0,
        });

        // Question outranks permission.
        store.recompute_status("s1");
        assert_eq!(
            store.session("s1").unwrap().status,
            SessionStatus::WaitingQuestion
        );

        store.remove_question("q-1");
        assert_eq!(
            store.session("s1").unwrap().status,
            SessionStatus::WaitingPermission
        );

        store.remove_permission("p-1");
        assert_eq!(store.session("s1").unwrap().status, SessionStatus::Idle);
    }

    #[test]
    fn removing_session_drops_scoped_requests() {
        let mut store = store_with_session("s1");
        store.push_permission(PendingPermission {
            request_id: "p-1".to_string(),
            scope: RequestScope::Session {
                session_id: "s1".to_string(),
            },
            tool_name: "Bash".to_string(),
            input: json!({}),
            tool_use_id: None,
            created_at: 0,
        });
        store.push_permission(PendingPermission {
            request_id: "p-2".to_string(),
            scope: RequestScope::Orphan,
            tool_name: "Write".to_string(),
            input: json!({}),
            tool_use_id: None,
            created_at: 0,
        });

        store.remove_session("s1");
        assert_eq!(store.pending_permissions().len(), 1);
        assert_eq!(store.pending_permissions()[0].request_id, "p-2");
    }

    #[test]
    fn last_active_at_only_moves_forward() {
        let mut store = store_with_session("s1");
        store.add_message("s1", Message::new("m1", MessageRole::User, "hi", 9000));
        store.add_message("s1", Message::new("m2", MessageRole::User, "old", 100));
        assert_eq!(store.session("s1").unwrap().last_active_at, 9000);
    }
}
