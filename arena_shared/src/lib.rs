//! `arena_shared`
//!
//! Shared libraries used by both client and server.
//!
//! Design goals:
//! - The server is the only writer of record; everything here is usable from
//!   both sides but authorization always assumes a verified [`scope::Principal`].
//! - Clear separation of concerns (net, rpc, replicated fields, events, relay).
//! - Traits for abstraction and dependency injection.
//! - No `unsafe`.

pub mod config;
pub mod ecs;
pub mod error;
pub mod event;
pub mod math;
pub mod net;
pub mod relay;
pub mod replicated;
pub mod rpc;
pub mod scope;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::config::*;
    pub use crate::ecs::*;
    pub use crate::error::*;
    pub use crate::event::*;
    pub use crate::math::*;
    pub use crate::net::*;
    pub use crate::replicated::*;
    pub use crate::rpc::*;
    pub use crate::scope::*;
}
