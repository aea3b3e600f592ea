//! The coordination state machine.
//!
//! This module contains:
//! - `types`: Protocol data model and request/response types
//! - `events`: The server-push event union
//! - `session`: Per-participant sessions and event sinks
//! - `dkg`: Two-round DKG state and the acknowledgement cache
//! - `signing`: ROAST signature-coordination state
//! - `sharing`: Recovery-share routing tables
//! - `state`: The owned aggregate of all server state
//! - `coordinator`: The request handler

pub mod coordinator;
pub mod dkg;
pub mod events;
pub mod session;
pub mod sharing;
pub mod signing;
pub mod state;
pub mod types;

// Re-export key types
pub use coordinator::Coordinator;
pub use events::ServerEvent;
pub use state::ServerState;
pub use types::*;
