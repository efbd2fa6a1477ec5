//! `arena_client`
//!
//! Participant side of an arena session:
//! - Session client (handshake, mirrored replicated state, outbound requests)
//! - Inbound broadcast gateway (server-authority calls only)
//! - Network-mode launcher (local/relay, host/client)

pub mod client;
pub mod launch;

pub use client::{ClientEvent, SessionClient};
pub use launch::{launch, HostedSession, Launched};
