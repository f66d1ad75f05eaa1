//! Skiff Client Core
//!
//! The session engine behind a desktop chat client for coding agents: a
//! normalized multi-session store fed by the backend's streamed event
//! protocol, with transcript parsing, permission gating, derived-view
//! selectors, slash-command orchestration, and debounced persistence.
//!
//! The rendering layer talks to a [`runtime::ClientHandle`]; everything
//! behind it is owned by a single event-loop task, so store mutations never
//! interleave.

pub mod bridge;
pub mod logging;
pub mod persistence;
pub mod runtime;
pub mod selectors;
pub mod slash;
pub mod store;
pub mod transcript;

pub use bridge::EventBridge;
pub use runtime::{ClientCommand, ClientHandle, ClientRuntime};
pub use store::SessionStore;
