//! Debounced JSON persistence
//!
//! On every persistence-worthy mutation the runtime snapshots a serializable
//! subset of the store and hands it to the writer task, which coalesces
//! bursts and writes a single JSON document atomically (tmp file + rename).
//! Ephemeral sub-state — pending permissions/questions, slash status, the
//! plan overlay — is never part of the snapshot.
//!
//! Loading tolerates three legacy shapes of the persisted session
//! collection, normalized through one migration pipeline rather than
//! conditionals scattered through load logic. Hydration filters the open-tab
//! list to surviving ids and nulls a dangling active pointer — downstream
//! selectors assume the active id always resolves.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use skiff_protocol::Session;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::store::{GlobalSettings, SessionCell, SessionStore};

/// Current persisted document version
pub const STATE_VERSION: u32 = 3;

/// Debounce window between a mutation and its disk write
pub const FLUSH_DEBOUNCE_MS: u64 = 500;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unrecognized persisted shape: {0}")]
    Shape(String),
}

/// The serializable subset of store state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedState {
    pub version: u32,
    pub sessions: HashMap<String, SessionCell>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_session: Option<String>,
    #[serde(default)]
    pub open_tabs: Vec<String>,
    #[serde(default)]
    pub hidden_ids: HashSet<String>,
    #[serde(default)]
    pub settings: GlobalSettings,
}

/// Capture the persistable subset of the store.
pub fn snapshot(store: &SessionStore) -> PersistedState {
    PersistedState {
        version: STATE_VERSION,
        sessions: store.cells_map().clone(),
        active_session: store.active_session().map(str::to_string),
        open_tabs: store.open_tabs().to_vec(),
        hidden_ids: store.hidden_ids().clone(),
        settings: store.settings().clone(),
    }
}

/// Install persisted state into a store, enforcing referential integrity:
/// tabs are filtered to hydrated ids and the active pointer is reset to
/// `None` when it no longer resolves.
pub fn hydrate(store: &mut SessionStore, mut state: PersistedState) {
    for cell in state.sessions.values_mut() {
        cell.rehydrate();
    }

    let open_tabs: Vec<String> = state
        .open_tabs
        .into_iter()
        .filter(|id| state.sessions.contains_key(id))
        .collect();
    let active_session = state
        .active_session
        .filter(|id| state.sessions.contains_key(id));

    store.install(
        state.sessions,
        open_tabs,
        active_session,
        state.hidden_ids,
        state.settings,
    );
}

/// Read and migrate the persisted document at `path`.
pub fn load(path: &Path) -> Result<PersistedState, PersistError> {
    let raw = std::fs::read_to_string(path)?;
    parse(&raw)
}

/// Parse a persisted document from any supported shape.
pub fn parse(raw: &str) -> Result<PersistedState, PersistError> {
    let value: Value = serde_json::from_str(raw)?;
    let sessions_value = value
        .get("sessions")
        .cloned()
        .ok_or_else(|| PersistError::Shape("missing sessions field".to_string()))?;

    let sessions = migrate_sessions(sessions_value)?;

    let active_session = value
        .get("active_session")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    let open_tabs = value
        .get("open_tabs")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    let hidden_ids = value
        .get("hidden_ids")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    let settings = value
        .get("settings")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default();

    Ok(PersistedState {
        version: STATE_VERSION,
        sessions,
        active_session,
        open_tabs,
        hidden_ids,
        settings,
    })
}

/// The three observed legacy shapes of the session collection
enum SessionsShape {
    /// Oldest: a bare array of raw sessions
    Array(Vec<Session>),
    /// Middle: id-keyed raw sessions, no messages
    KeyedRaw(HashMap<String, Session>),
    /// Current: id-keyed full aggregates
    KeyedCells(HashMap<String, SessionCell>),
}

fn detect_shape(value: Value) -> Result<SessionsShape, PersistError> {
    if value.is_array() {
        let sessions: Vec<Session> = serde_json::from_value(value)?;
        return Ok(SessionsShape::Array(sessions));
    }
    let Some(map) = value.as_object() else {
        return Err(PersistError::Shape(format!(
            "sessions is neither array nor object: {}",
            value
        )));
    };

    // An aggregate entry nests the session under a "session" key; a raw
    // entry has "id" at the top level.
    let is_aggregate = map
        .values()
        .next()
        .map(|entry| entry.get("session").is_some())
        .unwrap_or(true);
    if is_aggregate {
        let cells: HashMap<String, SessionCell> = serde_json::from_value(value)?;
        Ok(SessionsShape::KeyedCells(cells))
    } else {
        let sessions: HashMap<String, Session> = serde_json::from_value(value)?;
        Ok(SessionsShape::KeyedRaw(sessions))
    }
}

fn migrate_sessions(value: Value) -> Result<HashMap<String, SessionCell>, PersistError> {
    let shape = detect_shape(value)?;
    Ok(match shape {
        SessionsShape::Array(sessions) => sessions
            .into_iter()
            .map(|s| (s.id.clone(), SessionCell::new(s)))
            .collect(),
        SessionsShape::KeyedRaw(sessions) => sessions
            .into_iter()
            .map(|(id, s)| (id, SessionCell::new(s)))
            .collect(),
        SessionsShape::KeyedCells(cells) => cells,
    })
}

// ---------------------------------------------------------------------------
// Writer task
// ---------------------------------------------------------------------------

/// Default location of the persisted state document.
pub fn state_file_path() -> PathBuf {
    if let Ok(path) = std::env::var("SKIFF_STATE_PATH") {
        return PathBuf::from(path);
    }
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("skiff")
        .join("state.json")
}

/// Persistence writer: receives snapshots, coalesces bursts, writes the
/// latest one. Runs until the sender side closes, then performs a final
/// flush — the shutdown path.
pub struct PersistenceWriter {
    rx: mpsc::Receiver<PersistedState>,
    path: PathBuf,
}

impl PersistenceWriter {
    pub fn new(rx: mpsc::Receiver<PersistedState>, path: PathBuf) -> Self {
        Self { rx, path }
    }

    /// Run the writer (call from `tokio::spawn`).
    pub async fn run(mut self) {
        info!(
            component = "persistence",
            event = "persistence.writer.started",
            path = %self.path.display(),
        );

        while let Some(mut state) = self.rx.recv().await {
            // Coalesce: only the newest queued snapshot matters.
            while let Ok(newer) = self.rx.try_recv() {
                state = newer;
            }

            let path = self.path.clone();
            let result =
                tokio::task::spawn_blocking(move || write_state(&path, &state)).await;
            match result {
                Ok(Ok(())) => debug!(
                    component = "persistence",
                    event = "persistence.flush.ok",
                    "State flushed"
                ),
                Ok(Err(e)) => error!(
                    component = "persistence",
                    event = "persistence.flush.failed",
                    error = %e,
                    "State flush failed"
                ),
                Err(e) => error!(
                    component = "persistence",
                    event = "persistence.flush.panicked",
                    error = %e,
                    "State flush panicked"
                ),
            }
        }

        info!(
            component = "persistence",
            event = "persistence.writer.ended",
            "Persistence writer ended"
        );
    }
}

/// Atomic write: serialize to a sibling tmp file, then rename over the
/// target so readers never observe a torn document.
fn write_state(path: &Path, state: &PersistedState) -> Result<(), PersistError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string(state)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
