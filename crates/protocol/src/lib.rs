//! Skiff Protocol
//!
//! Shared types for the Skiff client core: the domain model (sessions,
//! messages, tool calls), the inbound backend event stream, and the
//! outbound command payloads. These types are serialized as JSON.

use uuid::Uuid;

pub mod commands;
pub mod events;
pub mod types;

pub use commands::*;
pub use events::BackendEvent;
pub use types::*;

/// Generate a new unique ID
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
