//! Shared helpers for the socket-level integration tests.

use std::{net::SocketAddr, time::Duration};

use arena_client::{ClientEvent, SessionClient};
use arena_server::{SessionEvent, SessionServer, ShutdownHandle};
use arena_shared::{config::SessionConfig, net::ClientId};
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::info;

/// Upper bound for any single wait in a test.
pub const WAIT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();
}

/// Config listening on an ephemeral localhost port.
pub fn local_config() -> SessionConfig {
    SessionConfig {
        server_addr: "127.0.0.1:0".to_string(),
        ..Default::default()
    }
}

/// A session service running in the background.
pub struct RunningServer {
    pub addr: SocketAddr,
    pub events: broadcast::Receiver<SessionEvent>,
    shutdown: ShutdownHandle,
    task: JoinHandle<anyhow::Result<()>>,
}

impl RunningServer {
    pub async fn start(cfg: SessionConfig) -> anyhow::Result<Self> {
        let server = SessionServer::bind(cfg).await?;
        let addr = server.local_addr();
        let events = server.subscribe();
        let shutdown = server.shutdown_handle();
        let task = tokio::spawn(server.run());
        info!(%addr, "Test server started");
        Ok(Self {
            addr,
            events,
            shutdown,
            task,
        })
    }

    /// Connects `n` clients in order; ids follow connection order.
    pub async fn connect_all(&self, n: usize) -> anyhow::Result<Vec<SessionClient>> {
        let mut clients = Vec::with_capacity(n);
        for _ in 0..n {
            clients.push(SessionClient::connect(self.addr).await?);
        }
        Ok(clients)
    }

    pub async fn stop(self) -> anyhow::Result<()> {
        self.shutdown.shutdown();
        self.task.await?
    }
}

/// Waits until `client` has seen `other` join.
pub async fn wait_for_player(client: &mut SessionClient, other: ClientId) -> anyhow::Result<()> {
    client
        .wait_for(WAIT, |e| matches!(e, ClientEvent::PlayerJoined(p) if p.client_id == other))
        .await?;
    Ok(())
}

/// Drives every client through both readiness gates into gameplay and waits
/// until each has seen every avatar spawn.
pub async fn reach_gameplay(clients: &mut [SessionClient]) -> anyhow::Result<()> {
    let ids: Vec<ClientId> = clients.iter().map(|c| c.client_id()).collect();
    for client in clients.iter_mut() {
        for id in &ids {
            wait_for_player(client, *id).await?;
        }
    }

    for client in clients.iter_mut() {
        client.ready_up().await?;
    }
    for client in clients.iter_mut() {
        client.wait_for(WAIT, |e| *e == ClientEvent::SceneTransition).await?;
        client.scene_loaded().await?;
    }
    for client in clients.iter_mut() {
        client.wait_for(WAIT, |e| *e == ClientEvent::StartGameplay).await?;
        for id in &ids {
            client
                .wait_for(WAIT, |e| {
                    matches!(e, ClientEvent::EntitySpawned(s) if s.owner == Some(*id))
                })
                .await?;
        }
        client.drain_events();
    }
    Ok(())
}
