//! Read-side projections over store state
//!
//! Pure functions of their exact input slice — no store mutation, no IO.
//! The rendering layer recomputes these on state change.

use std::collections::BTreeMap;

use skiff_protocol::{
    Message, PendingPermission, PendingQuestion, RequestScope, SessionStatus, SessionSummary,
    TASK_TOOL,
};

use crate::store::{SessionCell, SessionStore, SortOrder};

/// Messages worth rendering: non-empty text, attachments, or at least one
/// top-level tool call. While a Task (subagent) tool is still active, other
/// top-level tools are suppressed so only the subagent's progress line shows
/// instead of a burst of parallel tool noise.
pub fn visible_messages(cell: &SessionCell) -> Vec<&Message> {
    let subagent_active = cell
        .tools_by_id()
        .values()
        .any(|t| t.name == TASK_TOOL && t.status.is_active());

    cell.messages()
        .iter()
        .filter(|message| {
            if !message.text.is_empty() || !message.attachments.is_empty() {
                return true;
            }
            message
                .tool_calls
                .iter()
                .any(|tool| tool.is_top_level() && (!subagent_active || tool.name == TASK_TOOL))
        })
        .collect()
}

/// True while any tool in the session is pending or running. Keeps the
/// "working" UI state alive across the gap between the assistant message and
/// the final usage event.
pub fn has_running_tools(cell: &SessionCell) -> bool {
    cell.tools_by_id().values().any(|t| t.status.is_active())
}

/// Pending permissions for one session, including orphan-scoped entries
/// reconciled by tool-use id against the session's tool index.
pub fn permissions_for_session<'a>(
    store: &'a SessionStore,
    session_id: &str,
) -> Vec<&'a PendingPermission> {
    let cell = store.cell(session_id);
    store
        .pending_permissions()
        .iter()
        .filter(|permission| match &permission.scope {
            RequestScope::Session { session_id: owner } => owner == session_id,
            RequestScope::Orphan => orphan_belongs_here(cell, permission.tool_use_id.as_deref()),
        })
        .collect()
}

/// Pending questions for one session, orphans reconciled the same way.
pub fn questions_for_session<'a>(
    store: &'a SessionStore,
    session_id: &str,
) -> Vec<&'a PendingQuestion> {
    let cell = store.cell(session_id);
    store
        .pending_questions()
        .iter()
        .filter(|question| match &question.scope {
            RequestScope::Session { session_id: owner } => owner == session_id,
            RequestScope::Orphan => orphan_belongs_here(cell, question.tool_use_id.as_deref()),
        })
        .collect()
}

// Heuristic: an orphan request belongs to the session whose tool index
// contains its tool-use id. Two sessions racing on tool ids could in theory
// both match; first query wins and that ambiguity is accepted.
fn orphan_belongs_here(cell: Option<&SessionCell>, tool_use_id: Option<&str>) -> bool {
    match (cell, tool_use_id) {
        (Some(cell), Some(id)) => cell.tool(id).is_some(),
        _ => false,
    }
}

/// Sessions sharing a working directory, ordered for the sidebar
#[derive(Debug, Clone, PartialEq)]
pub struct SessionGroup {
    pub cwd: String,
    pub sessions: Vec<SessionSummary>,
}

/// Sort weight for status ordering: running < waiting < error < idle.
fn status_priority(status: SessionStatus) -> u8 {
    match status {
        SessionStatus::Running => 0,
        SessionStatus::WaitingPermission | SessionStatus::WaitingQuestion => 1,
        SessionStatus::Error => 2,
        SessionStatus::Idle => 3,
    }
}

fn compare_summaries(a: &SessionSummary, b: &SessionSummary, sort: SortOrder) -> std::cmp::Ordering {
    let recency = |x: &SessionSummary, y: &SessionSummary| y.last_active_at.cmp(&x.last_active_at);
    match sort {
        SortOrder::RecentActivity => recency(a, b),
        SortOrder::Name => a.name.cmp(&b.name).then_with(|| recency(a, b)),
        SortOrder::StatusPriority => status_priority(a.status)
            .cmp(&status_priority(b.status))
            .then_with(|| recency(a, b)),
    }
}

/// Group all sessions (local and rediscovered) by working directory, sorting
/// groups and the sessions within them by the requested order.
pub fn group_sessions(store: &SessionStore, sort: SortOrder) -> Vec<SessionGroup> {
    let mut by_cwd: BTreeMap<String, Vec<SessionSummary>> = BTreeMap::new();
    for cell in store.cells() {
        by_cwd
            .entry(cell.session.cwd.clone())
            .or_default()
            .push(cell.session.summary());
    }

    let mut groups: Vec<SessionGroup> = by_cwd
        .into_iter()
        .map(|(cwd, mut sessions)| {
            sessions.sort_by(|a, b| compare_summaries(a, b, sort));
            SessionGroup { cwd, sessions }
        })
        .collect();

    // Groups order by their lead session under the same criteria.
    groups.sort_by(|a, b| match (a.sessions.first(), b.sessions.first()) {
        (Some(x), Some(y)) => compare_summaries(x, y, sort),
        _ => a.cwd.cmp(&b.cwd),
    });
    groups
}
