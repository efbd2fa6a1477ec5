//! Relay and connection-provider abstractions.
//!
//! The session core never interprets relay data. A relay hands back an opaque
//! [`JoinCode`] for the host to share and an endpoint for peers to connect to;
//! everything else about the allocation travels as uninterpreted bytes.
//!
//! [`LoopbackRelay`] is an in-process relay: the host registers its listen
//! address under a freshly generated join code and joiners resolve the code
//! back to that address. It stands in for a hosted relay in tests and in
//! single-process host mode.

use std::{
    collections::HashMap,
    fmt,
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use bytes::Bytes;
use rand::{distributions::Uniform, Rng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::net::ClientId;

/// Join codes use an alphabet without easily confused glyphs.
const JOIN_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
pub const JOIN_CODE_LEN: usize = 6;

/// Opaque join code handed out by a relay.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JoinCode(String);

impl JoinCode {
    pub fn new(code: impl Into<String>) -> Self {
        JoinCode(code.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JoinCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of creating or joining a relay allocation.
#[derive(Debug, Clone)]
pub struct RelayAllocation {
    pub join_code: JoinCode,
    /// Where peers connect.
    pub endpoint: SocketAddr,
    /// Provider-specific connection data, passed through untouched.
    pub connection_data: Bytes,
}

/// A relay/matchmaking provider.
#[async_trait]
pub trait RelayService: Send + Sync {
    /// Reserves an allocation for a host listening on `endpoint`.
    async fn create_allocation(
        &self,
        endpoint: SocketAddr,
        max_connections: u32,
    ) -> anyhow::Result<RelayAllocation>;

    /// Resolves a join code shared by a host.
    async fn join_allocation(&self, code: &JoinCode) -> anyhow::Result<RelayAllocation>;
}

/// How a process takes part in a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkMode {
    /// Run the server and a local client in this process.
    LocalHost,
    /// Connect to a server by address.
    LocalClient,
    /// Like `LocalHost`, and publish a join code through the relay.
    RelayHost,
    /// Connect to a host by join code.
    RelayClient,
}

impl NetworkMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "local-host" => Some(NetworkMode::LocalHost),
            "local-client" => Some(NetworkMode::LocalClient),
            "relay-host" => Some(NetworkMode::RelayHost),
            "relay-client" => Some(NetworkMode::RelayClient),
            _ => None,
        }
    }

    pub fn is_host(self) -> bool {
        matches!(self, NetworkMode::LocalHost | NetworkMode::RelayHost)
    }
}

/// Events produced by a connection provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected(ClientId),
    Disconnected(ClientId),
    /// The provider itself failed; affects the whole session.
    TransportFailure(String),
}

struct Allocation {
    endpoint: SocketAddr,
    max_connections: u32,
    connection_data: Bytes,
}

/// In-process relay keyed by generated join codes.
#[derive(Clone, Default)]
pub struct LoopbackRelay {
    allocations: Arc<Mutex<HashMap<JoinCode, Allocation>>>,
}

impl LoopbackRelay {
    pub fn new() -> Self {
        Self::default()
    }

    fn generate_code() -> JoinCode {
        let mut rng = rand::thread_rng();
        let pick = Uniform::from(0..JOIN_CODE_ALPHABET.len());
        let code: String = (0..JOIN_CODE_LEN)
            .map(|_| JOIN_CODE_ALPHABET[rng.sample(pick)] as char)
            .collect();
        JoinCode(code)
    }

    /// Capacity reserved for a code, if it exists.
    pub fn max_connections(&self, code: &JoinCode) -> Option<u32> {
        let allocations = self.allocations.lock().ok()?;
        allocations.get(code).map(|a| a.max_connections)
    }
}

#[async_trait]
impl RelayService for LoopbackRelay {
    async fn create_allocation(
        &self,
        endpoint: SocketAddr,
        max_connections: u32,
    ) -> anyhow::Result<RelayAllocation> {
        if max_connections == 0 {
            bail!("relay allocation needs at least one connection");
        }
        let mut allocations = self
            .allocations
            .lock()
            .map_err(|_| anyhow!("relay lock poisoned"))?;

        let mut code = Self::generate_code();
        while allocations.contains_key(&code) {
            code = Self::generate_code();
        }

        let connection_data = Bytes::from(rand::thread_rng().gen::<[u8; 16]>().to_vec());
        debug!(join_code = %code, %endpoint, max_connections, "Relay allocation reserved");
        allocations.insert(
            code.clone(),
            Allocation {
                endpoint,
                max_connections,
                connection_data: connection_data.clone(),
            },
        );

        Ok(RelayAllocation {
            join_code: code,
            endpoint,
            connection_data,
        })
    }

    async fn join_allocation(&self, code: &JoinCode) -> anyhow::Result<RelayAllocation> {
        let allocations = self
            .allocations
            .lock()
            .map_err(|_| anyhow!("relay lock poisoned"))?;
        let allocation = allocations
            .get(code)
            .ok_or_else(|| anyhow!("unknown join code {}", code))?;
        debug!(join_code = %code, endpoint = %allocation.endpoint, "Relay allocation joined");
        Ok(RelayAllocation {
            join_code: code.clone(),
            endpoint: allocation.endpoint,
            connection_data: allocation.connection_data.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn join_resolves_host_endpoint() -> anyhow::Result<()> {
        let relay = LoopbackRelay::new();
        let endpoint: SocketAddr = "127.0.0.1:40000".parse()?;

        let hosted = relay.create_allocation(endpoint, 3).await?;
        assert_eq!(hosted.join_code.as_str().len(), JOIN_CODE_LEN);
        assert_eq!(relay.max_connections(&hosted.join_code), Some(3));

        let joined = relay.join_allocation(&hosted.join_code).await?;
        assert_eq!(joined.endpoint, endpoint);
        assert_eq!(joined.connection_data, hosted.connection_data);
        Ok(())
    }

    #[tokio::test]
    async fn unknown_code_fails() {
        let relay = LoopbackRelay::new();
        assert!(relay.join_allocation(&JoinCode::new("NOPE42")).await.is_err());
    }

    #[test]
    fn network_mode_parsing() {
        assert_eq!(NetworkMode::parse("relay-host"), Some(NetworkMode::RelayHost));
        assert_eq!(NetworkMode::parse("bogus"), None);
        assert!(NetworkMode::LocalHost.is_host());
        assert!(!NetworkMode::RelayClient.is_host());
    }
}
