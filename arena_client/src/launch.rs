//! Network-mode launcher.
//!
//! Starts a process's part in a session according to its [`NetworkMode`].
//! Host modes run the session service in this process and connect a local
//! client to it, so the host plays like everyone else.

use std::net::SocketAddr;

use anyhow::{bail, Context};
use arena_server::{SessionEvent, SessionServer, ShutdownHandle};
use arena_shared::{
    config::SessionConfig,
    relay::{JoinCode, NetworkMode, RelayService},
};
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::info;

use crate::client::SessionClient;

/// The in-process session service of a host.
pub struct HostedSession {
    pub addr: SocketAddr,
    pub join_code: Option<JoinCode>,
    pub events: broadcast::Receiver<SessionEvent>,
    shutdown: ShutdownHandle,
    task: JoinHandle<anyhow::Result<()>>,
}

impl HostedSession {
    /// Stops the service and waits for it.
    pub async fn stop(self) -> anyhow::Result<()> {
        self.shutdown.shutdown();
        self.task.await.context("join session task")?
    }
}

/// A launched participant.
pub struct Launched {
    pub client: SessionClient,
    /// Present in host modes.
    pub host: Option<HostedSession>,
}

/// Starts a participant in `mode`.
///
/// `join_code` is required for [`NetworkMode::RelayClient`] and ignored
/// otherwise.
pub async fn launch(
    mode: NetworkMode,
    cfg: SessionConfig,
    relay: &dyn RelayService,
    join_code: Option<&JoinCode>,
) -> anyhow::Result<Launched> {
    info!(?mode, "Launching");
    match mode {
        NetworkMode::LocalHost | NetworkMode::RelayHost => {
            let server = if mode == NetworkMode::RelayHost {
                SessionServer::host(cfg, relay).await?
            } else {
                SessionServer::bind(cfg).await?
            };
            let host = start(server);
            let client = SessionClient::connect(host.addr).await.context("connect local client")?;
            Ok(Launched {
                client,
                host: Some(host),
            })
        }
        NetworkMode::LocalClient => {
            let addr: SocketAddr = cfg.server_addr.parse().context("parse server_addr")?;
            let client = SessionClient::connect(addr).await?;
            Ok(Launched { client, host: None })
        }
        NetworkMode::RelayClient => {
            let Some(code) = join_code else {
                bail!("relay-client mode needs a join code");
            };
            let allocation = relay.join_allocation(code).await.context("join relay allocation")?;
            info!(join_code = %code, endpoint = %allocation.endpoint, "Joined relay allocation");
            let client = SessionClient::connect(allocation.endpoint).await?;
            Ok(Launched { client, host: None })
        }
    }
}

fn start(server: SessionServer) -> HostedSession {
    let addr = server.local_addr();
    let join_code = server.join_code().cloned();
    let events = server.subscribe();
    let shutdown = server.shutdown_handle();
    let task = tokio::spawn(server.run());
    HostedSession {
        addr,
        join_code,
        events,
        shutdown,
        task,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arena_shared::relay::LoopbackRelay;

    fn local_cfg() -> SessionConfig {
        SessionConfig {
            server_addr: "127.0.0.1:0".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn relay_client_without_code_fails() {
        let relay = LoopbackRelay::new();
        let result = launch(NetworkMode::RelayClient, local_cfg(), &relay, None).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn local_host_plays_as_first_client() -> anyhow::Result<()> {
        let relay = LoopbackRelay::new();
        let launched = launch(NetworkMode::LocalHost, local_cfg(), &relay, None).await?;
        let host = launched.host.context("host mode has a session")?;
        assert!(host.join_code.is_none());
        assert_eq!(launched.client.client_id().0, 0);
        host.stop().await
    }
}
