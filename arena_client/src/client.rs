//! Client session.
//!
//! The client keeps a read-only mirror of what the server replicates:
//! - every player's replicated fields
//! - every live networked entity
//! - the session phase
//!
//! Requests go out as remote calls; the server decides. Calls arriving from
//! the server run through a client-side [`Gateway`] holding only broadcast
//! procedures, so anything not sent with server authority is dropped.
//!
//! Everything a presentation layer needs is queued as [`ClientEvent`]s.

use std::{collections::BTreeMap, net::SocketAddr, time::Duration};

use anyhow::{bail, Context};
use arena_shared::{
    ecs::EntityId,
    error::SessionResult,
    math::Vec3,
    net::{
        ClientId, EntityKind, EntitySpawn, EntityState, FieldUpdate, FrameReader, FrameWriter, NetMsg, Phase,
        PlayerField, PlayerState, ReliableConn, SessionInfo, PROTOCOL_VERSION,
    },
    rpc::{procedures, CallContext, CallDescriptor, Gateway, RpcArgs, RpcCall},
    scope::{Principal, Scope},
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Connection state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientState {
    Connected,
    /// Closed by either side; the reason is kept for display.
    Disconnected(String),
}

/// Notifications for the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    PlayerJoined(PlayerState),
    PlayerLeft(ClientId),
    FieldChanged(FieldUpdate),
    PhaseChanged(Phase),
    /// Load the gameplay scene, then report `SceneLoaded`.
    SceneTransition,
    StartGameplay,
    Impact { position: Vec3 },
    EntitySpawned(EntitySpawn),
    EntityMoved(EntityState),
    EntityDespawned(EntityId),
    /// The session's transport failed; the session is over.
    TransportFailure(String),
    Disconnected(String),
}

/// Mirrored session state.
#[derive(Debug, Default)]
pub struct ClientMirror {
    players: BTreeMap<ClientId, PlayerState>,
    entities: BTreeMap<EntityId, EntitySpawn>,
    phase: Option<Phase>,
    events: Vec<ClientEvent>,
}

impl ClientMirror {
    pub fn players(&self) -> impl Iterator<Item = &PlayerState> {
        self.players.values()
    }

    pub fn player(&self, client_id: ClientId) -> Option<&PlayerState> {
        self.players.get(&client_id)
    }

    pub fn entities(&self) -> impl Iterator<Item = &EntitySpawn> {
        self.entities.values()
    }

    pub fn entity(&self, id: EntityId) -> Option<&EntitySpawn> {
        self.entities.get(&id)
    }

    /// Apply one replication message.
    fn apply(&mut self, msg: NetMsg) {
        match msg {
            NetMsg::PlayerJoined(player) => {
                self.players.insert(player.client_id, player.clone());
                self.events.push(ClientEvent::PlayerJoined(player));
            }
            NetMsg::PlayerLeft { client_id } => {
                self.players.remove(&client_id);
                self.events.push(ClientEvent::PlayerLeft(client_id));
            }
            NetMsg::FieldUpdate(update) => {
                if let Some(player) = self.players.get_mut(&update.client_id) {
                    match update.field {
                        PlayerField::IsReady(v) => player.is_ready = v,
                        PlayerField::Appearance(v) => player.appearance = v,
                        PlayerField::Health(v) => player.health = v,
                    }
                }
                self.events.push(ClientEvent::FieldChanged(update));
            }
            NetMsg::PhaseChanged { phase } => {
                self.phase = Some(phase);
                self.events.push(ClientEvent::PhaseChanged(phase));
            }
            NetMsg::EntitySpawned(spawn) => {
                if spawn.kind == EntityKind::Avatar {
                    if let Some(player) = spawn.owner.and_then(|o| self.players.get_mut(&o)) {
                        player.avatar = Some(spawn.id);
                    }
                }
                self.entities.insert(spawn.id, spawn.clone());
                self.events.push(ClientEvent::EntitySpawned(spawn));
            }
            NetMsg::EntityMoved(state) => {
                if let Some(entity) = self.entities.get_mut(&state.id) {
                    entity.position = state.position;
                }
                self.events.push(ClientEvent::EntityMoved(state));
            }
            NetMsg::EntityDespawned { id } => {
                if let Some(owner) = self.entities.remove(&id).and_then(|e| e.owner) {
                    if let Some(player) = self.players.get_mut(&owner).filter(|p| p.avatar == Some(id)) {
                        player.avatar = None;
                    }
                }
                self.events.push(ClientEvent::EntityDespawned(id));
            }
            other => debug!(msg = ?other, "Ignoring message in mirror"),
        }
    }
}

fn on_broadcast(event: ClientEvent) -> impl Fn(&mut ClientMirror, &CallContext, &RpcArgs) -> SessionResult<()> {
    move |mirror: &mut ClientMirror, _: &CallContext, _: &RpcArgs| {
        mirror.events.push(event.clone());
        Ok(())
    }
}

fn on_impact(mirror: &mut ClientMirror, _: &CallContext, args: &RpcArgs) -> SessionResult<()> {
    if let RpcArgs::Impact { position } = *args {
        mirror.events.push(ClientEvent::Impact { position });
    }
    Ok(())
}

/// Procedures a client accepts from the server.
pub fn build_client_gateway() -> SessionResult<Gateway<ClientMirror>> {
    let broadcast = CallDescriptor::new(Scope::Everyone, Scope::Server);
    Ok(Gateway::builder()
        .register(
            procedures::SCENE_TRANSITION,
            broadcast,
            on_broadcast(ClientEvent::SceneTransition),
        )?
        .register(
            procedures::START_GAMEPLAY,
            broadcast,
            on_broadcast(ClientEvent::StartGameplay),
        )?
        .register(procedures::IMPACT_NOTIFICATION, broadcast, on_impact)?
        .build())
}

/// What the reader task hands over.
enum Incoming {
    Msg(NetMsg),
    Closed(String),
}

/// Reads frames off the socket so receiving stays cancel-safe.
async fn read_loop(mut reader: FrameReader, tx: mpsc::UnboundedSender<Incoming>) {
    loop {
        let incoming = match reader.recv().await {
            Ok(Some(msg)) => Incoming::Msg(msg),
            Ok(None) => Incoming::Closed("connection closed".to_string()),
            Err(e) => {
                warn!(error = %e, "Reliable connection error");
                Incoming::Closed(e.to_string())
            }
        };
        let closed = matches!(incoming, Incoming::Closed(_));
        if tx.send(incoming).is_err() || closed {
            return;
        }
    }
}

/// A participant's connection to an arena session.
pub struct SessionClient {
    client_id: ClientId,
    session: SessionInfo,
    state: ClientState,
    inbox: mpsc::UnboundedReceiver<Incoming>,
    writer: FrameWriter,
    gateway: Gateway<ClientMirror>,
    mirror: ClientMirror,
}

impl SessionClient {
    /// Connects and performs the handshake.
    pub async fn connect(addr: SocketAddr) -> anyhow::Result<Self> {
        info!(server = %addr, "Connecting to server");
        let mut conn = ReliableConn::connect(addr).await?;
        conn.send(&NetMsg::Hello {
            protocol: PROTOCOL_VERSION,
        })
        .await?;

        let (client_id, session) = match conn.recv().await.context("await welcome")? {
            NetMsg::Welcome { client_id, session } => (client_id, session),
            NetMsg::Disconnect { reason } => bail!("refused by server: {reason}"),
            other => bail!("expected Welcome, got {other:?}"),
        };
        info!(client_id = ?client_id, phase = ?session.phase, "Connected to server");

        let gateway = build_client_gateway().context("build client gateway")?;
        let mirror = ClientMirror {
            phase: Some(session.phase),
            ..Default::default()
        };
        let (reader, writer) = conn.into_split();
        let (tx, inbox) = mpsc::unbounded_channel();
        tokio::spawn(read_loop(reader, tx));
        Ok(Self {
            client_id,
            session,
            state: ClientState::Connected,
            inbox,
            writer,
            gateway,
            mirror,
        })
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn session(&self) -> &SessionInfo {
        &self.session
    }

    pub fn state(&self) -> &ClientState {
        &self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ClientState::Connected
    }

    pub fn phase(&self) -> Phase {
        self.mirror.phase.unwrap_or(self.session.phase)
    }

    pub fn mirror(&self) -> &ClientMirror {
        &self.mirror
    }

    /// This client's own replicated state.
    pub fn me(&self) -> Option<&PlayerState> {
        self.mirror.player(self.client_id)
    }

    pub fn my_avatar(&self) -> Option<EntityId> {
        self.me().and_then(|p| p.avatar)
    }

    /// Sends a raw remote call.
    pub async fn call(&mut self, call: RpcCall) -> anyhow::Result<()> {
        debug!(procedure = %call.procedure, "Sending call");
        self.writer.send(&NetMsg::Rpc(call)).await
    }

    pub async fn ready_up(&mut self) -> anyhow::Result<()> {
        self.call(RpcCall::new(procedures::READY_UP, RpcArgs::None)).await
    }

    pub async fn scene_loaded(&mut self) -> anyhow::Result<()> {
        self.call(RpcCall::new(procedures::SCENE_LOADED, RpcArgs::None)).await
    }

    pub async fn set_appearance(&mut self, index: i32) -> anyhow::Result<()> {
        self.call(RpcCall::new(procedures::SET_APPEARANCE, RpcArgs::Appearance { index }))
            .await
    }

    pub async fn request_shoot(&mut self, origin: Vec3, direction: Vec3) -> anyhow::Result<()> {
        self.call(RpcCall::new(
            procedures::REQUEST_SHOOT,
            RpcArgs::Shoot { origin, direction },
        ))
        .await
    }

    /// Fires from this client's avatar, if it has one.
    pub async fn shoot_from_avatar(&mut self, direction: Vec3) -> anyhow::Result<()> {
        let origin = self
            .my_avatar()
            .and_then(|id| self.mirror.entity(id))
            .map(|e| e.position)
            .context("no avatar to shoot from")?;
        self.request_shoot(origin, direction).await
    }

    pub async fn request_despawn(&mut self, projectile: EntityId) -> anyhow::Result<()> {
        self.call(RpcCall::new(procedures::REQUEST_DESPAWN, RpcArgs::None).on(projectile))
            .await
    }

    pub async fn request_spawn_avatar(&mut self, position: Vec3) -> anyhow::Result<()> {
        let client_id = self.client_id;
        self.call(RpcCall::new(
            procedures::REQUEST_SPAWN_AVATAR,
            RpcArgs::SpawnAvatar { client_id, position },
        ))
        .await
    }

    pub async fn respawn(&mut self) -> anyhow::Result<()> {
        let mut call = RpcCall::new(procedures::RESPAWN, RpcArgs::None);
        if let Some(avatar) = self.my_avatar() {
            call = call.on(avatar);
        }
        self.call(call).await
    }

    pub async fn request_move(&mut self, direction: Vec3) -> anyhow::Result<()> {
        let mut call = RpcCall::new(procedures::REQUEST_MOVE, RpcArgs::Move { direction });
        if let Some(avatar) = self.my_avatar() {
            call = call.on(avatar);
        }
        self.call(call).await
    }

    /// Says goodbye and closes the connection.
    pub async fn disconnect(&mut self) -> anyhow::Result<()> {
        self.writer
            .send(&NetMsg::Disconnect {
                reason: "client quit".to_string(),
            })
            .await?;
        self.writer.shutdown().await?;
        self.state = ClientState::Disconnected("client quit".to_string());
        Ok(())
    }

    /// Waits for and applies the next server message.
    ///
    /// Returns `false` once the connection is closed.
    pub async fn recv(&mut self) -> anyhow::Result<bool> {
        if !self.is_connected() {
            return Ok(false);
        }
        match self.inbox.recv().await {
            Some(Incoming::Msg(msg)) => {
                self.handle_message(msg);
                Ok(true)
            }
            Some(Incoming::Closed(reason)) => {
                self.close(&reason);
                Ok(false)
            }
            None => {
                self.close("reader stopped");
                Ok(false)
            }
        }
    }

    /// Applies every message arriving within `timeout`.
    pub async fn poll(&mut self, timeout: Duration) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        while let Ok(received) = tokio::time::timeout_at(deadline, self.recv()).await {
            if !received? {
                break;
            }
        }
        Ok(())
    }

    /// Receives until an event matching `pred` is queued, returning it.
    ///
    /// Events before the match stay queued.
    pub async fn wait_for<F>(&mut self, timeout: Duration, pred: F) -> anyhow::Result<ClientEvent>
    where
        F: Fn(&ClientEvent) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut seen = 0;
        loop {
            if let Some(event) = self.mirror.events[seen..].iter().find(|e| pred(*e)) {
                return Ok(event.clone());
            }
            seen = self.mirror.events.len();
            match tokio::time::timeout_at(deadline, self.recv()).await {
                Ok(received) => {
                    if !received? {
                        bail!("connection closed while waiting: {:?}", self.state);
                    }
                }
                Err(_) => bail!("timed out waiting for event"),
            }
        }
    }

    pub fn drain_events(&mut self) -> Vec<ClientEvent> {
        std::mem::take(&mut self.mirror.events)
    }

    fn close(&mut self, reason: &str) {
        if self.is_connected() {
            info!(%reason, "Disconnected from server");
            self.state = ClientState::Disconnected(reason.to_string());
            self.mirror.events.push(ClientEvent::Disconnected(reason.to_string()));
        }
    }

    fn handle_message(&mut self, msg: NetMsg) {
        match msg {
            NetMsg::Rpc(call) => {
                // Everything on this channel comes from the server.
                if let Err(e) = self.gateway.invoke(&mut self.mirror, &call, Principal::Server, None) {
                    debug!(procedure = %call.procedure, error = %e, "Dropped server call");
                }
            }
            NetMsg::SessionFailure { reason } => {
                warn!(%reason, "Session transport failed");
                self.mirror.events.push(ClientEvent::TransportFailure(reason));
            }
            NetMsg::Disconnect { reason } => self.close(&reason),
            NetMsg::Welcome { .. } | NetMsg::Hello { .. } => {
                warn!("Unexpected handshake message");
            }
            other => self.mirror.apply(other),
        }
    }
}

/// Executes a console command against a client.
pub async fn exec_console(client: &mut SessionClient, line: &str) -> anyhow::Result<Vec<String>> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let Some(&command) = tokens.first() else {
        return Ok(Vec::new());
    };
    let vec_arg = |tokens: &[&str]| -> Option<Vec3> {
        let x: f32 = tokens.get(1)?.parse().ok()?;
        let y: f32 = tokens.get(2)?.parse().ok()?;
        Some(Vec3::new(x, y, 0.0))
    };

    match command {
        "ready" => {
            client.ready_up().await?;
            Ok(vec!["Ready".to_string()])
        }
        "loaded" => {
            client.scene_loaded().await?;
            Ok(vec!["Scene loaded".to_string()])
        }
        "color" => match tokens.get(1).and_then(|t| t.parse::<i32>().ok()) {
            Some(index) => {
                client.set_appearance(index).await?;
                Ok(Vec::new())
            }
            None => Ok(vec!["Usage: color <index>".to_string()]),
        },
        "shoot" => match vec_arg(&tokens) {
            Some(direction) => {
                client.shoot_from_avatar(direction).await?;
                Ok(Vec::new())
            }
            None => Ok(vec!["Usage: shoot <dx> <dy>".to_string()]),
        },
        "move" => match vec_arg(&tokens) {
            Some(direction) => {
                client.request_move(direction).await?;
                Ok(Vec::new())
            }
            None => Ok(vec!["Usage: move <dx> <dy>".to_string()]),
        },
        "respawn" => {
            client.respawn().await?;
            Ok(Vec::new())
        }
        "status" => {
            let mut out = vec![
                format!("State: {:?}", client.state()),
                format!("Client ID: {:?}", client.client_id()),
                format!("Phase: {:?}", client.phase()),
            ];
            if let Some(code) = &client.session().join_code {
                out.push(format!("Join code: {code}"));
            }
            for p in client.mirror().players() {
                out.push(format!(
                    "  {:?}: ready={} appearance={} health={} avatar={:?}",
                    p.client_id, p.is_ready, p.appearance, p.health, p.avatar
                ));
            }
            out.push(format!("Entities: {}", client.mirror().entities().count()));
            Ok(out)
        }
        other => Ok(vec![format!("Unknown command: {other}")]),
    }
}
