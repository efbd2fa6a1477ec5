//! Session error taxonomy.
//!
//! Every variant is handled where it is detected on the server. None of them
//! cross the network as a distinct signal: clients observe a failed request
//! only as a state change that never arrives, or, for transport failures, as
//! a session-wide failure event.

use std::fmt;

/// Errors raised by session operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Unauthorized write or call attempt. Dropped, no canonical change.
    PermissionDenied,
    /// The referenced client or entity is no longer registered. No-op.
    NotFound,
    /// The call name is not in the procedure table.
    UnknownProcedure(String),
    /// The operation is not valid in the current session state.
    InvalidState(String),
    /// Connection-layer failure, not attributable to a single call.
    TransportFailure(String),
}

impl SessionError {
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        SessionError::InvalidState(msg.into())
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::PermissionDenied => write!(f, "permission denied"),
            SessionError::NotFound => write!(f, "not found"),
            SessionError::UnknownProcedure(name) => write!(f, "unknown procedure '{}'", name),
            SessionError::InvalidState(msg) => write!(f, "invalid state: {}", msg),
            SessionError::TransportFailure(msg) => write!(f, "transport failure: {}", msg),
        }
    }
}

impl std::error::Error for SessionError {}

/// Result alias for session operations.
pub type SessionResult<T> = Result<T, SessionError>;
