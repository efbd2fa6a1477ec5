//! Session service.
//!
//! Async shell around [`SessionCore`]:
//! - an accept task performs the handshake and assigns client ids
//! - per-connection reader tasks decode frames and enqueue commands
//! - per-connection writer tasks drain an outbound channel
//! - one run loop owns the core and processes commands and ticks in order
//!
//! A connection the core does not register (session full) gets its
//! `Disconnect` flushed and is then closed from the run loop.
//!
//! Nothing outside the run loop touches session state. Shutdown is explicit
//! through a [`ShutdownHandle`].

use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Context;
use arena_shared::{
    config::SessionConfig,
    net::{ClientId, FrameReader, FrameWriter, NetMsg, ReliableConn, ReliableListener, PROTOCOL_VERSION},
    relay::{ConnectionEvent, JoinCode, RelayService},
};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use crate::session::{Outbound, ServerCommand, SessionCore, SessionEvent};

const COMMAND_QUEUE: usize = 1024;
const EVENT_QUEUE: usize = 256;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Work for the run loop.
enum Work {
    /// Handshake finished; outbound messages for `client` go to `writer`.
    Attach {
        client: ClientId,
        writer: mpsc::UnboundedSender<NetMsg>,
        close: watch::Sender<bool>,
    },
    Command(ServerCommand),
}

/// Run-loop end of one connection.
struct Link {
    writer: mpsc::UnboundedSender<NetMsg>,
    /// Stops the connection's reader.
    close: watch::Sender<bool>,
}

/// Stops a running [`SessionServer`].
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

/// Authoritative session service.
pub struct SessionServer {
    core: SessionCore,
    listener: ReliableListener,
    local_addr: SocketAddr,
    events: broadcast::Sender<SessionEvent>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
    console_rx: Option<mpsc::Receiver<String>>,
}

impl SessionServer {
    /// Binds the listener at `cfg.server_addr`.
    pub async fn bind(cfg: SessionConfig) -> anyhow::Result<Self> {
        let addr: SocketAddr = cfg.server_addr.parse().context("parse server_addr")?;
        let listener = ReliableListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let core = SessionCore::new(cfg).context("build session core")?;

        let (events, _) = broadcast::channel(EVENT_QUEUE);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            core,
            listener,
            local_addr,
            events,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
            console_rx: None,
        })
    }

    /// Binds and publishes the session through a relay.
    pub async fn host(cfg: SessionConfig, relay: &dyn RelayService) -> anyhow::Result<Self> {
        let max_players = cfg.max_players;
        let mut server = Self::bind(cfg).await?;
        let allocation = relay
            .create_allocation(server.local_addr, max_players)
            .await
            .context("create relay allocation")?;
        info!(join_code = %allocation.join_code, endpoint = %allocation.endpoint, "Relay allocation created");
        server.core.set_join_code(Some(allocation.join_code));
        Ok(server)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn join_code(&self) -> Option<&JoinCode> {
        self.core.info().join_code.as_ref()
    }

    pub fn core(&self) -> &SessionCore {
        &self.core
    }

    /// Presentation-side event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    /// Sets the operator console input.
    pub fn set_console_input(&mut self, rx: mpsc::Receiver<String>) {
        self.console_rx = Some(rx);
    }

    /// Runs until shut down.
    pub async fn run(self) -> anyhow::Result<()> {
        let Self {
            mut core,
            listener,
            local_addr,
            events,
            shutdown_tx,
            mut shutdown_rx,
            mut console_rx,
        } = self;

        let (work_tx, mut work_rx) = mpsc::channel::<Work>(COMMAND_QUEUE);
        tokio::spawn(accept_loop(listener, work_tx, shutdown_rx.clone()));

        let dt = core.config().tick_secs();
        let mut ticker = tokio::time::interval(Duration::from_secs_f32(dt));
        let mut links: HashMap<ClientId, Link> = HashMap::new();

        info!(%local_addr, tick_hz = core.config().tick_hz, "Session running");

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                work = work_rx.recv() => {
                    let Some(work) = work else { break };
                    let (cmd, attached) = match work {
                        Work::Attach { client, writer, close } => {
                            links.insert(client, Link { writer, close });
                            (ServerCommand::Connection(ConnectionEvent::Connected(client)), Some(client))
                        }
                        Work::Command(cmd) => (cmd, None),
                    };
                    let left = match &cmd {
                        ServerCommand::Connection(ConnectionEvent::Disconnected(client)) => Some(*client),
                        _ => None,
                    };
                    let out = core.handle(cmd);
                    deliver(&links, out);
                    if let Some(client) = left {
                        links.remove(&client);
                    }
                    if let Some(client) = attached.filter(|c| !core.registry().contains(*c)) {
                        // The writer still flushes the queued refusal before closing.
                        if let Some(link) = links.remove(&client) {
                            let _ = link.close.send(true);
                        }
                        debug!(client_id = ?client, "Refused connection closed");
                    }
                }
                _ = ticker.tick() => {
                    let out = core.handle(ServerCommand::Tick { dt });
                    deliver(&links, out);
                }
                Some(line) = recv_console(&mut console_rx) => {
                    for reply in exec_console(&core, &line) {
                        println!("{reply}");
                    }
                    if matches!(line.trim(), "quit" | "exit") {
                        let _ = shutdown_tx.send(true);
                    }
                }
            }

            for event in core.drain_events() {
                let _ = events.send(event);
            }
        }

        info!("Session shutting down");
        for link in links.values() {
            let _ = link.writer.send(NetMsg::Disconnect {
                reason: "server shutting down".to_string(),
            });
            let _ = link.close.send(true);
        }
        Ok(())
    }
}

async fn recv_console(rx: &mut Option<mpsc::Receiver<String>>) -> Option<String> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Operator console commands.
fn exec_console(core: &SessionCore, line: &str) -> Vec<String> {
    match line.trim() {
        "status" => {
            let info = core.info();
            let mut out = vec![
                format!("Phase: {:?}", core.phase()),
                format!("Started: {}", info.started_at.to_rfc3339()),
                format!("Players: {}", core.registry().len()),
                format!("Entities: {}", core.spawn().world().len()),
            ];
            if let Some(code) = &info.join_code {
                out.push(format!("Join code: {code}"));
            }
            for player in core.registry().iter() {
                let state = player.state();
                out.push(format!(
                    "  {:?}: ready={} appearance={} health={} avatar={:?} joined={}",
                    state.client_id,
                    state.is_ready,
                    state.appearance,
                    state.health,
                    state.avatar,
                    player.joined_at().format("%H:%M:%S"),
                ));
            }
            out
        }
        "quit" | "exit" => vec!["Shutting down".to_string()],
        "" => Vec::new(),
        other => vec![format!("Unknown command: {other}")],
    }
}

fn deliver(links: &HashMap<ClientId, Link>, out: Vec<Outbound>) {
    for Outbound { to, msg } in out {
        for (client, link) in links {
            if to.includes(*client) && link.writer.send(msg.clone()).is_err() {
                debug!(client_id = ?client, "Writer gone, dropping message");
            }
        }
    }
}

async fn accept_loop(listener: ReliableListener, work: mpsc::Sender<Work>, mut shutdown: watch::Receiver<bool>) {
    let next_id = Arc::new(AtomicU32::new(0));
    loop {
        let accepted = tokio::select! {
            _ = shutdown.changed() => return,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((conn, peer)) => {
                debug!(%peer, "Incoming connection");
                tokio::spawn(serve_connection(conn, peer, next_id.clone(), work.clone()));
            }
            Err(e) => {
                warn!(error = %e, "Listener failed");
                let failure = ConnectionEvent::TransportFailure(e.to_string());
                let _ = work.send(Work::Command(ServerCommand::Connection(failure))).await;
                return;
            }
        }
    }
}

async fn serve_connection(mut conn: ReliableConn, peer: SocketAddr, next_id: Arc<AtomicU32>, work: mpsc::Sender<Work>) {
    let Ok(hello) = tokio::time::timeout(HANDSHAKE_TIMEOUT, conn.recv()).await else {
        debug!(%peer, "Handshake timed out");
        return;
    };
    match hello {
        Ok(NetMsg::Hello { protocol }) if protocol == PROTOCOL_VERSION => {}
        Ok(other) => {
            warn!(%peer, msg = ?other, "Bad handshake");
            let _ = conn
                .send(&NetMsg::Disconnect {
                    reason: "protocol mismatch".to_string(),
                })
                .await;
            return;
        }
        Err(e) => {
            debug!(%peer, error = %e, "Handshake failed");
            return;
        }
    }

    let client = ClientId(next_id.fetch_add(1, Ordering::Relaxed));
    let (reader, writer) = conn.into_split();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (close_tx, close_rx) = watch::channel(false);
    tokio::spawn(write_loop(writer, out_rx, client));

    let attach = Work::Attach {
        client,
        writer: out_tx,
        close: close_tx,
    };
    if work.send(attach).await.is_err() {
        return;
    }
    read_loop(reader, client, work, close_rx).await;
}

async fn read_loop(
    mut reader: FrameReader,
    client: ClientId,
    work: mpsc::Sender<Work>,
    mut close: watch::Receiver<bool>,
) {
    loop {
        let received = tokio::select! {
            // Fires on an explicit close and when the run loop drops the link.
            _ = close.changed() => {
                debug!(client_id = ?client, "Reader closed by server");
                return;
            }
            received = reader.recv() => received,
        };
        match received {
            Ok(Some(msg)) => {
                if work.send(Work::Command(ServerCommand::Inbound { client, msg })).await.is_err() {
                    return;
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(client_id = ?client, error = %e, "Read failed");
                break;
            }
        }
    }
    let gone = ServerCommand::Connection(ConnectionEvent::Disconnected(client));
    let _ = work.send(Work::Command(gone)).await;
}

async fn write_loop(mut writer: FrameWriter, mut rx: mpsc::UnboundedReceiver<NetMsg>, client: ClientId) {
    while let Some(msg) = rx.recv().await {
        let closing = matches!(msg, NetMsg::Disconnect { .. });
        if let Err(e) = writer.send(&msg).await {
            debug!(client_id = ?client, error = %e, "Write failed");
            return;
        }
        if closing {
            break;
        }
    }
    let _ = writer.shutdown().await;
}

/// Helper for tests: a session on an ephemeral localhost port.
pub async fn bind_ephemeral(tick_hz: u32) -> anyhow::Result<(SessionServer, SessionConfig)> {
    let cfg = SessionConfig {
        server_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0).to_string(),
        tick_hz,
        ..Default::default()
    };
    let server = SessionServer::bind(cfg.clone()).await?;
    let cfg = SessionConfig {
        server_addr: server.local_addr().to_string(),
        ..cfg
    };
    Ok((server, cfg))
}
