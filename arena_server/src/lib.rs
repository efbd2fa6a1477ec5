//! `arena_server`
//!
//! Authoritative side of an arena session:
//! - Session registry (one entry per live connection)
//! - Phase coordinator (lobby and scene-load readiness gates)
//! - Spawn authority (avatars, projectiles, fixed-step simulation)
//! - Session core (serialized command processing, remote call dispatch)
//! - Session service (TCP accept/read/write tasks around the core)

pub mod phase;
pub mod registry;
pub mod server;
pub mod session;
pub mod spawn;

pub use server::{SessionServer, ShutdownHandle};
pub use session::{SessionCore, SessionEvent};
