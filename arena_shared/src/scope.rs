//! Scopes and principals.
//!
//! A [`Scope`] is both an addressing rule (who receives a remote call) and an
//! authorization rule (who may write a field or invoke a call). A
//! [`Principal`] is the verified identity of the channel a request arrived on.

use serde::{Deserialize, Serialize};

use crate::net::ClientId;

/// Addressing/authorization scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scope {
    /// The authoritative server only.
    Server,
    /// The connection owning the addressed entity.
    Owner,
    /// The server and every connected client.
    Everyone,
}

/// Verified identity of a request's origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Principal {
    Server,
    Client(ClientId),
}

impl Principal {
    pub fn client_id(self) -> Option<ClientId> {
        match self {
            Principal::Server => None,
            Principal::Client(id) => Some(id),
        }
    }

    pub fn is_server(self) -> bool {
        matches!(self, Principal::Server)
    }
}

impl Scope {
    /// Checks whether `principal` satisfies this scope.
    ///
    /// `owner` is the owning client of the addressed entity, if any. Owner
    /// scope is strict: the server is not the owner of client-owned state.
    pub fn permits(self, principal: Principal, owner: Option<ClientId>) -> bool {
        match self {
            Scope::Everyone => true,
            Scope::Server => principal.is_server(),
            Scope::Owner => match (principal, owner) {
                (Principal::Client(id), Some(owner)) => id == owner,
                _ => false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_scope_rejects_clients() {
        assert!(Scope::Server.permits(Principal::Server, None));
        assert!(!Scope::Server.permits(Principal::Client(ClientId(0)), None));
    }

    #[test]
    fn owner_scope_requires_matching_owner() {
        let owner = Some(ClientId(3));
        assert!(Scope::Owner.permits(Principal::Client(ClientId(3)), owner));
        assert!(!Scope::Owner.permits(Principal::Client(ClientId(4)), owner));
        assert!(!Scope::Owner.permits(Principal::Server, owner));
        assert!(!Scope::Owner.permits(Principal::Client(ClientId(3)), None));
    }

    #[test]
    fn everyone_scope_accepts_all() {
        assert!(Scope::Everyone.permits(Principal::Server, None));
        assert!(Scope::Everyone.permits(Principal::Client(ClientId(9)), Some(ClientId(1))));
    }
}
