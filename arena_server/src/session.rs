//! Session core.
//!
//! All authoritative state lives here: the registry, the phase machine and
//! the entity world. The core is synchronous and processes one
//! [`ServerCommand`] at a time; the async service in [`crate::server`] feeds it
//! from a single queue and writes the resulting [`Outbound`] messages.
//!
//! Remote calls go through a frozen [`Gateway`]. Handlers never talk to the
//! network; they mutate [`SessionState`] and queue server-originated calls,
//! which the core then routes with the server as caller.

use arena_shared::{
    config::{IdentitySource, SessionConfig},
    error::{SessionError, SessionResult},
    math::Vec3,
    net::{ClientId, FieldUpdate, NetMsg, Phase, PlayerState, SessionInfo},
    relay::{ConnectionEvent, JoinCode},
    rpc::{procedures, CallContext, CallDescriptor, DeliverySite, Gateway, RpcArgs, RpcCall},
    scope::{Principal, Scope},
};
use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::{
    phase::{PhaseCoordinator, PhaseOutcome},
    registry::{RegistryEvent, SessionRegistry},
    spawn::{SpawnAuthority, SpawnEvent},
};

/// Work item for the core.
#[derive(Debug, Clone)]
pub enum ServerCommand {
    Connection(ConnectionEvent),
    Inbound { client: ClientId, msg: NetMsg },
    Tick { dt: f32 },
}

/// Who an outbound message goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipients {
    All,
    Only(ClientId),
    AllExcept(ClientId),
}

impl Recipients {
    pub fn includes(self, client: ClientId) -> bool {
        match self {
            Recipients::All => true,
            Recipients::Only(id) => id == client,
            Recipients::AllExcept(id) => id != client,
        }
    }
}

/// A message for the transport to deliver.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub to: Recipients,
    pub msg: NetMsg,
}

/// Notifications for presentation collaborators on the server side.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    PlayerJoined(PlayerState),
    PlayerLeft(PlayerState),
    FieldChanged(FieldUpdate),
    PhaseChanged(Phase),
    /// A server broadcast ran at the server's own delivery site.
    Broadcast { procedure: String, args: RpcArgs },
    TransportFailure(String),
}

/// State reachable from procedure handlers.
pub struct SessionState {
    cfg: SessionConfig,
    registry: SessionRegistry,
    phase: PhaseCoordinator,
    spawn: SpawnAuthority,
    info: SessionInfo,
    outbox: Vec<Outbound>,
    events: Vec<SessionEvent>,
    /// Server-originated calls queued by handlers.
    pending_calls: Vec<RpcCall>,
}

impl SessionState {
    fn new(cfg: SessionConfig) -> Self {
        Self {
            registry: SessionRegistry::new(cfg.starting_health, cfg.appearance_options),
            phase: PhaseCoordinator::new(),
            spawn: SpawnAuthority::new(&cfg),
            info: SessionInfo {
                join_code: None,
                phase: Phase::Lobby,
                started_at: Utc::now(),
            },
            cfg,
            outbox: Vec::new(),
            events: Vec::new(),
            pending_calls: Vec::new(),
        }
    }

    fn send(&mut self, to: Recipients, msg: NetMsg) {
        self.outbox.push(Outbound { to, msg });
    }

    fn queue_call(&mut self, procedure: &str, args: RpcArgs) {
        self.pending_calls.push(RpcCall::new(procedure, args));
    }

    /// Client a handler acts for, taken from the channel.
    fn caller_client(call: &CallContext) -> SessionResult<ClientId> {
        call.caller.client_id().ok_or(SessionError::NotFound)
    }

    /// Client a handler acts for when the payload names one.
    fn subject(&self, call: &CallContext, claimed: ClientId) -> SessionResult<ClientId> {
        match (self.cfg.identity_source, call.caller) {
            (IdentitySource::Channel, Principal::Client(channel)) if channel != claimed => {
                Err(SessionError::PermissionDenied)
            }
            _ => Ok(claimed),
        }
    }

    fn on_phase_outcome(&mut self, outcome: PhaseOutcome) -> SessionResult<()> {
        let PhaseOutcome::Advanced(phase) = outcome else {
            return Ok(());
        };
        self.info.phase = phase;
        self.send(Recipients::All, NetMsg::PhaseChanged { phase });
        self.events.push(SessionEvent::PhaseChanged(phase));

        match phase {
            Phase::AwaitingSceneLoad => self.queue_call(procedures::SCENE_TRANSITION, RpcArgs::None),
            Phase::Gameplay => {
                self.queue_call(procedures::START_GAMEPLAY, RpcArgs::None);
                self.spawn_all_avatars()?;
            }
            Phase::Lobby => {}
        }
        Ok(())
    }

    fn spawn_all_avatars(&mut self) -> SessionResult<()> {
        for (index, client_id) in self.registry.client_ids().into_iter().enumerate() {
            let point = self.cfg.spawn_point(index);
            self.spawn.spawn_avatar(&mut self.registry, client_id, point)?;
        }
        Ok(())
    }
}

/// Rejects vectors that cannot be replicated.
fn finite(v: Vec3) -> SessionResult<Vec3> {
    if v.is_finite() {
        Ok(v)
    } else {
        Err(SessionError::invalid_state(format!("non-finite vector {v:?}")))
    }
}

fn on_ready_up(s: &mut SessionState, call: &CallContext, _: &RpcArgs) -> SessionResult<()> {
    let client = SessionState::caller_client(call)?;
    let outcome = s.phase.ready_up(&mut s.registry, client)?;
    s.on_phase_outcome(outcome)
}

fn on_scene_loaded(s: &mut SessionState, call: &CallContext, _: &RpcArgs) -> SessionResult<()> {
    let client = SessionState::caller_client(call)?;
    let outcome = s.phase.scene_loaded(&mut s.registry, client)?;
    s.on_phase_outcome(outcome)
}

fn on_request_shoot(s: &mut SessionState, call: &CallContext, args: &RpcArgs) -> SessionResult<()> {
    s.phase.require(Phase::Gameplay)?;
    let RpcArgs::Shoot { origin, direction } = *args else {
        return Err(SessionError::invalid_state("RequestShoot expects Shoot args"));
    };
    let (origin, direction) = (finite(origin)?, finite(direction)?);
    let owner = SessionState::caller_client(call)?;
    s.spawn.spawn_projectile(&s.registry, owner, origin, direction)?;
    Ok(())
}

fn on_request_despawn(s: &mut SessionState, call: &CallContext, _: &RpcArgs) -> SessionResult<()> {
    let target = call.target.ok_or(SessionError::NotFound)?;
    s.spawn.despawn_projectile(target)?;
    Ok(())
}

fn on_request_spawn_avatar(s: &mut SessionState, call: &CallContext, args: &RpcArgs) -> SessionResult<()> {
    s.phase.require(Phase::Gameplay)?;
    let RpcArgs::SpawnAvatar { client_id, position } = *args else {
        return Err(SessionError::invalid_state("RequestSpawnAvatar expects SpawnAvatar args"));
    };
    let position = finite(position)?;
    let subject = s.subject(call, client_id)?;
    s.spawn.spawn_avatar(&mut s.registry, subject, position)?;
    Ok(())
}

fn on_respawn(s: &mut SessionState, call: &CallContext, _: &RpcArgs) -> SessionResult<()> {
    s.phase.require(Phase::Gameplay)?;
    let owner = call.owner.ok_or(SessionError::NotFound)?;
    s.spawn.respawn(&s.registry, owner)
}

fn on_set_appearance(s: &mut SessionState, call: &CallContext, args: &RpcArgs) -> SessionResult<()> {
    s.phase.require(Phase::Lobby)?;
    let RpcArgs::Appearance { index } = *args else {
        return Err(SessionError::invalid_state("SetAppearance expects Appearance args"));
    };
    let owner = call.owner.ok_or(SessionError::NotFound)?;
    s.registry.set_appearance(owner, index, call.caller)
}

fn on_request_move(s: &mut SessionState, call: &CallContext, args: &RpcArgs) -> SessionResult<()> {
    s.phase.require(Phase::Gameplay)?;
    let RpcArgs::Move { direction } = *args else {
        return Err(SessionError::invalid_state("RequestMove expects Move args"));
    };
    let direction = finite(direction)?;
    let owner = call.owner.ok_or(SessionError::NotFound)?;
    s.spawn.move_avatar(&s.registry, owner, direction)
}

/// Server-side delivery of a broadcast: hand it to presentation.
fn announce(procedure: &'static str) -> impl Fn(&mut SessionState, &CallContext, &RpcArgs) -> SessionResult<()> {
    move |s: &mut SessionState, _: &CallContext, args: &RpcArgs| {
        s.events.push(SessionEvent::Broadcast {
            procedure: procedure.to_string(),
            args: args.clone(),
        });
        Ok(())
    }
}

/// Builds the procedure table of the arena session.
pub fn build_gateway() -> SessionResult<Gateway<SessionState>> {
    let request = CallDescriptor::new(Scope::Server, Scope::Everyone);
    let owned = CallDescriptor::new(Scope::Server, Scope::Owner);
    let broadcast = CallDescriptor::new(Scope::Everyone, Scope::Server);

    Ok(Gateway::builder()
        .register(procedures::READY_UP, request, on_ready_up)?
        .register(procedures::SCENE_LOADED, request, on_scene_loaded)?
        .register(procedures::REQUEST_SHOOT, request, on_request_shoot)?
        .register(procedures::REQUEST_DESPAWN, request, on_request_despawn)?
        .register(procedures::REQUEST_SPAWN_AVATAR, request, on_request_spawn_avatar)?
        .register(procedures::RESPAWN, owned, on_respawn)?
        .register(procedures::SET_APPEARANCE, owned, on_set_appearance)?
        .register(procedures::REQUEST_MOVE, owned, on_request_move)?
        .register(procedures::SCENE_TRANSITION, broadcast, announce(procedures::SCENE_TRANSITION))?
        .register(procedures::START_GAMEPLAY, broadcast, announce(procedures::START_GAMEPLAY))?
        .register(
            procedures::IMPACT_NOTIFICATION,
            broadcast,
            announce(procedures::IMPACT_NOTIFICATION),
        )?
        .build())
}

/// Authoritative session.
pub struct SessionCore {
    gateway: Gateway<SessionState>,
    state: SessionState,
}

impl SessionCore {
    pub fn new(cfg: SessionConfig) -> SessionResult<Self> {
        Ok(Self {
            gateway: build_gateway()?,
            state: SessionState::new(cfg),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.state.cfg
    }

    pub fn set_join_code(&mut self, code: Option<JoinCode>) {
        self.state.info.join_code = code;
    }

    pub fn info(&self) -> &SessionInfo {
        &self.state.info
    }

    pub fn phase(&self) -> Phase {
        self.state.phase.phase()
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.state.registry
    }

    pub fn spawn(&self) -> &SpawnAuthority {
        &self.state.spawn
    }

    /// Processes one command and returns the messages it produced.
    pub fn handle(&mut self, cmd: ServerCommand) -> Vec<Outbound> {
        match cmd {
            ServerCommand::Connection(ConnectionEvent::Connected(client)) => self.on_connected(client),
            ServerCommand::Connection(ConnectionEvent::Disconnected(client)) => self.on_disconnected(client),
            ServerCommand::Connection(ConnectionEvent::TransportFailure(reason)) => {
                error!(%reason, "Transport failure");
                self.state.send(
                    Recipients::All,
                    NetMsg::SessionFailure {
                        reason: reason.clone(),
                    },
                );
                self.state.events.push(SessionEvent::TransportFailure(reason));
            }
            ServerCommand::Inbound { client, msg } => self.on_message(client, msg),
            ServerCommand::Tick { dt } => self.state.spawn.tick(dt, &mut self.state.registry),
        }
        self.flush();
        std::mem::take(&mut self.state.outbox)
    }

    /// Presentation events produced since the last call.
    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.state.events)
    }

    /// Runs a call with the server as caller, e.g. from an operator console.
    pub fn invoke_as_server(&mut self, call: RpcCall) -> Vec<Outbound> {
        self.route_call(call, Principal::Server);
        self.flush();
        std::mem::take(&mut self.state.outbox)
    }

    fn on_connected(&mut self, client: ClientId) {
        if self.state.registry.len() >= self.state.cfg.max_players as usize {
            warn!(client_id = ?client, max = self.state.cfg.max_players, "Session full, refusing client");
            self.state.send(
                Recipients::Only(client),
                NetMsg::Disconnect {
                    reason: "session full".to_string(),
                },
            );
            return;
        }
        if let Err(e) = self.state.registry.join(client) {
            warn!(client_id = ?client, error = %e, "Join rejected");
            return;
        }
        info!(client_id = ?client, players = self.state.registry.len(), "Client connected");

        let welcome = NetMsg::Welcome {
            client_id: client,
            session: self.state.info.clone(),
        };
        self.state.send(Recipients::Only(client), welcome);

        let players: Vec<PlayerState> = self.state.registry.iter().map(|p| p.state()).collect();
        for player in players {
            self.state.send(Recipients::Only(client), NetMsg::PlayerJoined(player));
        }
        for spawn in self.state.spawn.snapshot() {
            self.state.send(Recipients::Only(client), NetMsg::EntitySpawned(spawn));
        }
    }

    fn on_disconnected(&mut self, client: ClientId) {
        if let Err(e) = self.state.spawn.despawn_avatar(&mut self.state.registry, client) {
            debug!(client_id = ?client, error = %e, "No session to tear down");
            return;
        }
        if let Err(e) = self.state.registry.leave(client) {
            debug!(client_id = ?client, error = %e, "Leave failed");
            return;
        }
        info!(client_id = ?client, players = self.state.registry.len(), "Client disconnected");
    }

    fn on_message(&mut self, client: ClientId, msg: NetMsg) {
        match msg {
            NetMsg::Rpc(call) => self.route_call(call, Principal::Client(client)),
            NetMsg::Disconnect { reason } => {
                debug!(client_id = ?client, %reason, "Client said goodbye");
            }
            other => {
                warn!(client_id = ?client, msg = ?other, "Unexpected message from client");
            }
        }
    }

    /// Owner of the entity a call addresses. Calls without a target address
    /// the caller's own session.
    fn resolve_owner(&self, call: &RpcCall, caller: Principal) -> Option<ClientId> {
        match call.target {
            Some(entity) => self.state.spawn.owner_of(entity),
            None => caller.client_id(),
        }
    }

    fn route_call(&mut self, call: RpcCall, caller: Principal) {
        let owner = self.resolve_owner(&call, caller);

        // Client-bound copies are only forwarded once the server has verified
        // the caller, since clients cannot check channel identities.
        match self.gateway.authorize(&call.procedure, caller, owner) {
            Ok(()) => {}
            Err(SessionError::PermissionDenied) => {
                warn!(caller = ?caller, procedure = %call.procedure, "Unauthorized call dropped");
                return;
            }
            Err(e) => {
                debug!(caller = ?caller, procedure = %call.procedure, error = %e, "Call dropped");
                return;
            }
        }

        let connected = self.state.registry.client_ids();
        let sites = match self.gateway.route(&call.procedure, owner, &connected) {
            Ok(sites) => sites,
            Err(e) => {
                debug!(procedure = %call.procedure, error = %e, "Unroutable call");
                return;
            }
        };

        for site in sites {
            match site {
                DeliverySite::Server => {
                    if let Err(e) = self.gateway.invoke(&mut self.state, &call, caller, owner) {
                        debug!(caller = ?caller, procedure = %call.procedure, error = %e, "Call rejected");
                    }
                }
                DeliverySite::Client(id) => {
                    self.state.send(Recipients::Only(id), NetMsg::Rpc(call.clone()));
                }
            }
        }
    }

    /// Replicates everything queued by the last command, in order.
    fn flush(&mut self) {
        for event in self.state.registry.drain_events() {
            match event {
                RegistryEvent::PlayerJoined(player) => {
                    self.state
                        .send(Recipients::AllExcept(player.client_id), NetMsg::PlayerJoined(player.clone()));
                    self.state.events.push(SessionEvent::PlayerJoined(player));
                }
                RegistryEvent::PlayerLeft(player) => {
                    self.state.send(
                        Recipients::All,
                        NetMsg::PlayerLeft {
                            client_id: player.client_id,
                        },
                    );
                    self.state.events.push(SessionEvent::PlayerLeft(player));
                }
            }
        }

        loop {
            for update in self.state.registry.drain_field_updates() {
                let readers = self.state.registry.readers_of(&update);
                if readers.len() == self.state.registry.len() {
                    self.state.send(Recipients::All, NetMsg::FieldUpdate(update));
                } else {
                    for reader in readers {
                        self.state.send(Recipients::Only(reader), NetMsg::FieldUpdate(update));
                    }
                }
                self.state.events.push(SessionEvent::FieldChanged(update));
            }

            let calls = std::mem::take(&mut self.state.pending_calls);
            let spawn_events = self.state.spawn.drain_events();
            if calls.is_empty() && spawn_events.is_empty() {
                break;
            }

            for call in calls {
                self.route_call(call, Principal::Server);
            }
            for event in spawn_events {
                match event {
                    SpawnEvent::Spawned(spawn) => self.state.send(Recipients::All, NetMsg::EntitySpawned(spawn)),
                    SpawnEvent::Moved(state) => self.state.send(Recipients::All, NetMsg::EntityMoved(state)),
                    SpawnEvent::Despawned(id) => self.state.send(Recipients::All, NetMsg::EntityDespawned { id }),
                    SpawnEvent::Impact { position } => self.route_call(
                        RpcCall::new(procedures::IMPACT_NOTIFICATION, RpcArgs::Impact { position }),
                        Principal::Server,
                    ),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arena_shared::{
        ecs::EntityId,
        net::{decode_from_bytes, encode_to_bytes, EntityKind, PlayerField},
        replicated::{FieldPolicy, Replicated},
    };

    fn core_with(ids: &[u32]) -> SessionCore {
        let mut core = SessionCore::new(SessionConfig::default()).unwrap();
        for id in ids {
            core.handle(ServerCommand::Connection(ConnectionEvent::Connected(ClientId(*id))));
        }
        core.drain_events();
        core
    }

    fn rpc(core: &mut SessionCore, client: u32, call: RpcCall) -> Vec<Outbound> {
        core.handle(ServerCommand::Inbound {
            client: ClientId(client),
            msg: NetMsg::Rpc(call),
        })
    }

    fn count_rpc(out: &[Outbound], procedure: &str) -> usize {
        out.iter()
            .filter(|o| matches!(&o.msg, NetMsg::Rpc(c) if c.procedure == procedure))
            .count()
    }

    fn projectile_in(out: &[Outbound]) -> Option<EntityId> {
        out.iter().find_map(|o| match &o.msg {
            NetMsg::EntitySpawned(s) if s.kind == EntityKind::Projectile => Some(s.id),
            _ => None,
        })
    }

    fn moved(out: &[Outbound], entity: EntityId) -> bool {
        out.iter()
            .any(|o| matches!(&o.msg, NetMsg::EntityMoved(s) if s.id == entity))
    }

    fn to_gameplay(core: &mut SessionCore, ids: &[u32]) -> Vec<Outbound> {
        for id in ids {
            rpc(core, *id, RpcCall::new(procedures::READY_UP, RpcArgs::None));
        }
        let mut out = Vec::new();
        for id in ids {
            out = rpc(core, *id, RpcCall::new(procedures::SCENE_LOADED, RpcArgs::None));
        }
        out
    }

    #[test]
    fn connect_sends_welcome_and_state_dump() {
        let mut core = core_with(&[0]);
        let out = core.handle(ServerCommand::Connection(ConnectionEvent::Connected(ClientId(1))));

        assert!(matches!(
            &out[0],
            Outbound { to: Recipients::Only(ClientId(1)), msg: NetMsg::Welcome { client_id: ClientId(1), .. } }
        ));
        let dumped = out
            .iter()
            .filter(|o| o.to == Recipients::Only(ClientId(1)) && matches!(o.msg, NetMsg::PlayerJoined(_)))
            .count();
        assert_eq!(dumped, 2);
        assert!(out
            .iter()
            .any(|o| o.to == Recipients::AllExcept(ClientId(1)) && matches!(o.msg, NetMsg::PlayerJoined(_))));
        assert_eq!(core.registry().len(), 2);
    }

    #[test]
    fn full_session_refuses_extra_clients() {
        let mut core = core_with(&[0, 1, 2, 3]);
        let out = core.handle(ServerCommand::Connection(ConnectionEvent::Connected(ClientId(4))));
        assert_eq!(core.registry().len(), 4);
        assert!(matches!(out[0].msg, NetMsg::Disconnect { .. }));
    }

    #[test]
    fn everyone_ready_broadcasts_one_scene_transition() {
        let mut core = core_with(&[0, 1]);

        let out = rpc(&mut core, 0, RpcCall::new(procedures::READY_UP, RpcArgs::None));
        assert_eq!(count_rpc(&out, procedures::SCENE_TRANSITION), 0);
        assert!(out.contains(&Outbound {
            to: Recipients::All,
            msg: NetMsg::FieldUpdate(FieldUpdate {
                client_id: ClientId(0),
                field: PlayerField::IsReady(true),
            }),
        }));

        let out = rpc(&mut core, 1, RpcCall::new(procedures::READY_UP, RpcArgs::None));
        assert_eq!(count_rpc(&out, procedures::SCENE_TRANSITION), 2);
        assert_eq!(core.phase(), Phase::AwaitingSceneLoad);
        assert!(core.registry().iter().all(|p| !*p.is_ready.read()));

        let events = core.drain_events();
        assert!(events.contains(&SessionEvent::PhaseChanged(Phase::AwaitingSceneLoad)));
        assert!(events.contains(&SessionEvent::Broadcast {
            procedure: procedures::SCENE_TRANSITION.to_string(),
            args: RpcArgs::None,
        }));
    }

    #[test]
    fn leaver_blocks_nothing_but_triggers_nothing() {
        let mut core = core_with(&[0, 1]);
        rpc(&mut core, 0, RpcCall::new(procedures::READY_UP, RpcArgs::None));
        let out = core.handle(ServerCommand::Connection(ConnectionEvent::Disconnected(ClientId(1))));

        assert_eq!(count_rpc(&out, procedures::SCENE_TRANSITION), 0);
        assert_eq!(core.phase(), Phase::Lobby);
        assert!(out.contains(&Outbound {
            to: Recipients::All,
            msg: NetMsg::PlayerLeft { client_id: ClientId(1) },
        }));
    }

    #[test]
    fn clients_cannot_invoke_broadcasts() {
        let mut core = core_with(&[0]);
        let out = rpc(&mut core, 0, RpcCall::new(procedures::START_GAMEPLAY, RpcArgs::None));
        assert!(out.is_empty());
        assert!(core.drain_events().is_empty());

        let out = rpc(&mut core, 0, RpcCall::new("Explode", RpcArgs::None));
        assert!(out.is_empty());
    }

    #[test]
    fn scene_load_spawns_avatars_at_spawn_points() {
        let mut core = core_with(&[0, 1]);
        let out = to_gameplay(&mut core, &[0, 1]);

        assert_eq!(core.phase(), Phase::Gameplay);
        assert_eq!(count_rpc(&out, procedures::START_GAMEPLAY), 2);

        let spawns: Vec<_> = out
            .iter()
            .filter_map(|o| match &o.msg {
                NetMsg::EntitySpawned(s) => Some(s.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(spawns.len(), 2);
        assert!(spawns.iter().all(|s| s.kind == EntityKind::Avatar));
        assert_eq!(spawns[0].owner, Some(ClientId(0)));
        assert_eq!(spawns[0].position, core.config().spawn_point(0));
        assert_eq!(spawns[1].position, core.config().spawn_point(1));
    }

    #[test]
    fn shooting_requires_gameplay() {
        let mut core = core_with(&[0]);
        let shoot = RpcCall::new(
            procedures::REQUEST_SHOOT,
            RpcArgs::Shoot {
                origin: Vec3::ZERO,
                direction: Vec3::new(1.0, 0.0, 0.0),
            },
        );
        let out = rpc(&mut core, 0, shoot.clone());
        assert!(out.is_empty());
        assert_eq!(core.spawn().world().len(), 0);

        to_gameplay(&mut core, &[0]);
        let out = rpc(&mut core, 0, shoot);
        assert!(out.iter().any(|o| matches!(
            &o.msg,
            NetMsg::EntitySpawned(s) if s.kind == EntityKind::Projectile && s.owner == Some(ClientId(0))
        )));
    }

    #[test]
    fn hit_broadcasts_impact_before_despawn_and_replicates_health() {
        let mut core = core_with(&[0, 1]);
        to_gameplay(&mut core, &[0, 1]);
        let victim_at = core.config().spawn_point(1);
        let shooter_at = core.config().spawn_point(0);

        let direction = victim_at - shooter_at;
        let origin = victim_at - direction.normalized() * 0.5;
        let out = rpc(
            &mut core,
            0,
            RpcCall::new(procedures::REQUEST_SHOOT, RpcArgs::Shoot { origin, direction }),
        );
        let bullet = out
            .iter()
            .find_map(|o| match &o.msg {
                NetMsg::EntitySpawned(s) if s.kind == EntityKind::Projectile => Some(s.id),
                _ => None,
            })
            .unwrap();

        let out = core.handle(ServerCommand::Tick { dt: 0.05 });
        let impact = out
            .iter()
            .position(|o| matches!(&o.msg, NetMsg::Rpc(c) if c.procedure == procedures::IMPACT_NOTIFICATION))
            .unwrap();
        let despawn = out
            .iter()
            .position(|o| o.msg == NetMsg::EntityDespawned { id: bullet })
            .unwrap();
        assert!(impact < despawn);
        assert!(out.iter().any(|o| o.msg
            == NetMsg::FieldUpdate(FieldUpdate {
                client_id: ClientId(1),
                field: PlayerField::Health(90),
            })));
    }

    #[test]
    fn spawn_avatar_payload_must_match_channel() {
        let mut core = core_with(&[0, 1]);
        to_gameplay(&mut core, &[0, 1]);
        // Free both avatars so a fresh spawn is legal.
        core.handle(ServerCommand::Connection(ConnectionEvent::Disconnected(ClientId(1))));
        core.handle(ServerCommand::Connection(ConnectionEvent::Connected(ClientId(1))));

        let spoofed = RpcCall::new(
            procedures::REQUEST_SPAWN_AVATAR,
            RpcArgs::SpawnAvatar {
                client_id: ClientId(1),
                position: Vec3::ZERO,
            },
        );
        rpc(&mut core, 0, spoofed.clone());
        assert_eq!(core.registry().lookup(ClientId(1)).unwrap().avatar(), None);

        rpc(&mut core, 1, spoofed);
        assert!(core.registry().lookup(ClientId(1)).unwrap().avatar().is_some());
    }

    #[test]
    fn payload_identity_source_trusts_claimed_id() {
        let cfg = SessionConfig {
            identity_source: IdentitySource::Payload,
            ..Default::default()
        };
        let mut core = SessionCore::new(cfg).unwrap();
        for id in [0, 1] {
            core.handle(ServerCommand::Connection(ConnectionEvent::Connected(ClientId(id))));
        }
        to_gameplay(&mut core, &[0, 1]);
        core.handle(ServerCommand::Connection(ConnectionEvent::Disconnected(ClientId(1))));
        core.handle(ServerCommand::Connection(ConnectionEvent::Connected(ClientId(1))));

        rpc(
            &mut core,
            0,
            RpcCall::new(
                procedures::REQUEST_SPAWN_AVATAR,
                RpcArgs::SpawnAvatar {
                    client_id: ClientId(1),
                    position: Vec3::ZERO,
                },
            ),
        );
        let avatar = core.registry().lookup(ClientId(1)).unwrap().avatar().unwrap();
        assert_eq!(core.spawn().owner_of(avatar), Some(ClientId(1)));
    }

    #[test]
    fn respawn_is_owner_only() {
        let mut core = core_with(&[0, 1]);
        to_gameplay(&mut core, &[0, 1]);
        let avatar: EntityId = core.registry().lookup(ClientId(1)).unwrap().avatar().unwrap();

        let out = rpc(&mut core, 0, RpcCall::new(procedures::RESPAWN, RpcArgs::None).on(avatar));
        assert!(out.is_empty());

        let out = rpc(&mut core, 1, RpcCall::new(procedures::RESPAWN, RpcArgs::None).on(avatar));
        assert!(out.iter().any(|o| matches!(&o.msg, NetMsg::EntityMoved(s) if s.id == avatar)));
    }

    #[test]
    fn appearance_is_set_by_owner_in_lobby() {
        let mut core = core_with(&[0]);
        let out = rpc(
            &mut core,
            0,
            RpcCall::new(procedures::SET_APPEARANCE, RpcArgs::Appearance { index: 3 }),
        );
        assert_eq!(
            out,
            vec![Outbound {
                to: Recipients::All,
                msg: NetMsg::FieldUpdate(FieldUpdate {
                    client_id: ClientId(0),
                    field: PlayerField::Appearance(3),
                }),
            }]
        );
    }

    #[test]
    fn transport_failure_is_session_wide() {
        let mut core = core_with(&[0, 1]);
        let out = core.handle(ServerCommand::Connection(ConnectionEvent::TransportFailure(
            "relay lost".to_string(),
        )));
        assert_eq!(
            out,
            vec![Outbound {
                to: Recipients::All,
                msg: NetMsg::SessionFailure {
                    reason: "relay lost".to_string(),
                },
            }]
        );
        assert_eq!(
            core.drain_events(),
            vec![SessionEvent::TransportFailure("relay lost".to_string())]
        );
    }

    #[test]
    fn non_finite_vectors_are_rejected_before_replication() {
        let mut core = core_with(&[0, 1]);
        to_gameplay(&mut core, &[0, 1]);
        let entities = core.spawn().world().len();

        // 1e39 overflows f32 and decodes as infinity.
        let frame = format!(
            r#"{{"Rpc":{{"procedure":"{}","target":null,"args":{{"Shoot":{{"origin":{{"x":1e39,"y":0.0,"z":0.0}},"direction":{{"x":1.0,"y":0.0,"z":0.0}}}}}}}}}}"#,
            procedures::REQUEST_SHOOT
        );
        let msg = decode_from_bytes(frame.as_bytes()).unwrap();
        let out = core.handle(ServerCommand::Inbound { client: ClientId(0), msg });
        assert!(out.is_empty());

        let out = rpc(
            &mut core,
            0,
            RpcCall::new(
                procedures::REQUEST_SHOOT,
                RpcArgs::Shoot {
                    origin: Vec3::ZERO,
                    direction: Vec3::new(f32::NAN, 0.0, 0.0),
                },
            ),
        );
        assert!(out.is_empty());
        assert_eq!(core.spawn().world().len(), entities);

        let avatar = core.registry().lookup(ClientId(0)).unwrap().avatar().unwrap();
        let out = rpc(
            &mut core,
            0,
            RpcCall::new(
                procedures::REQUEST_MOVE,
                RpcArgs::Move {
                    direction: Vec3::new(f32::INFINITY, 0.0, 0.0),
                },
            )
            .on(avatar),
        );
        assert!(out.is_empty());

        // Nothing queued above may leak into a later broadcast.
        let out = core.handle(ServerCommand::Tick { dt: 0.05 });
        assert!(!moved(&out, avatar));
        for o in &out {
            assert_eq!(decode_from_bytes(&encode_to_bytes(&o.msg).unwrap()).unwrap(), o.msg);
        }
    }

    #[test]
    fn non_finite_spawn_position_is_rejected() {
        let mut core = core_with(&[0, 1]);
        to_gameplay(&mut core, &[0, 1]);
        core.handle(ServerCommand::Connection(ConnectionEvent::Disconnected(ClientId(1))));
        core.handle(ServerCommand::Connection(ConnectionEvent::Connected(ClientId(1))));

        let out = rpc(
            &mut core,
            1,
            RpcCall::new(
                procedures::REQUEST_SPAWN_AVATAR,
                RpcArgs::SpawnAvatar {
                    client_id: ClientId(1),
                    position: Vec3::new(0.0, f32::NEG_INFINITY, 0.0),
                },
            ),
        );
        assert!(out.is_empty());
        assert_eq!(core.registry().lookup(ClientId(1)).unwrap().avatar(), None);
    }

    #[test]
    fn despawn_request_needs_a_targeted_projectile() {
        let mut core = core_with(&[0, 1]);
        to_gameplay(&mut core, &[0, 1]);
        let at = Vec3::new(0.0, 50.0, 0.0);
        let out = rpc(
            &mut core,
            0,
            RpcCall::new(
                procedures::REQUEST_SHOOT,
                RpcArgs::Shoot {
                    origin: at,
                    direction: Vec3::new(0.0, 1.0, 0.0),
                },
            ),
        );
        let bullet = projectile_in(&out).unwrap();
        let avatar = core.registry().lookup(ClientId(1)).unwrap().avatar().unwrap();

        let out = rpc(&mut core, 1, RpcCall::new(procedures::REQUEST_DESPAWN, RpcArgs::None));
        assert!(out.is_empty());
        let out = rpc(&mut core, 1, RpcCall::new(procedures::REQUEST_DESPAWN, RpcArgs::None).on(avatar));
        assert!(out.is_empty());
        assert!(core.spawn().world().contains(avatar));
        assert!(core.spawn().is_projectile(bullet));

        let out = rpc(&mut core, 1, RpcCall::new(procedures::REQUEST_DESPAWN, RpcArgs::None).on(bullet));
        let impact = RpcArgs::Impact { position: at };
        let impacts: Vec<usize> = out
            .iter()
            .enumerate()
            .filter(|(_, o)| {
                matches!(&o.msg, NetMsg::Rpc(c)
                    if c.procedure == procedures::IMPACT_NOTIFICATION && c.args == impact)
            })
            .map(|(i, _)| i)
            .collect();
        let despawn = out
            .iter()
            .position(|o| o.msg == NetMsg::EntityDespawned { id: bullet })
            .unwrap();
        assert_eq!(impacts.len(), 2);
        assert!(impacts.iter().all(|i| *i < despawn));
        assert!(!core.spawn().is_projectile(bullet));
    }

    #[test]
    fn owner_calls_on_another_players_avatar_are_dropped() {
        let mut core = core_with(&[0, 1]);
        to_gameplay(&mut core, &[0, 1]);
        let theirs = core.registry().lookup(ClientId(1)).unwrap().avatar().unwrap();
        let step = RpcCall::new(
            procedures::REQUEST_MOVE,
            RpcArgs::Move {
                direction: Vec3::new(0.0, 1.0, 0.0),
            },
        )
        .on(theirs);

        assert!(rpc(&mut core, 0, step.clone()).is_empty());
        let out = core.handle(ServerCommand::Tick { dt: 0.05 });
        assert!(!moved(&out, theirs));

        let owner = core.spawn().owner_of(theirs);
        assert_eq!(
            core.gateway
                .authorize(procedures::SET_APPEARANCE, Principal::Client(ClientId(0)), owner),
            Err(SessionError::PermissionDenied)
        );
        let out = rpc(
            &mut core,
            0,
            RpcCall::new(procedures::SET_APPEARANCE, RpcArgs::Appearance { index: 2 }).on(theirs),
        );
        assert!(out.is_empty());
        assert_eq!(*core.registry().lookup(ClientId(1)).unwrap().appearance.read(), 0);

        rpc(&mut core, 1, step);
        let out = core.handle(ServerCommand::Tick { dt: 0.05 });
        assert!(moved(&out, theirs));
    }

    #[test]
    fn out_of_range_appearance_is_not_replicated() {
        let mut core = core_with(&[0]);
        let out = rpc(
            &mut core,
            0,
            RpcCall::new(procedures::SET_APPEARANCE, RpcArgs::Appearance { index: -1 }),
        );
        assert!(out.is_empty());
        let out = rpc(
            &mut core,
            0,
            RpcCall::new(procedures::SET_APPEARANCE, RpcArgs::Appearance { index: 4 }),
        );
        assert!(out.is_empty());
        assert_eq!(*core.registry().lookup(ClientId(0)).unwrap().appearance.read(), 0);
    }

    #[test]
    fn field_updates_reach_only_permitted_readers() {
        let mut core = core_with(&[0, 1, 2]);
        let private = FieldPolicy {
            read: Scope::Owner,
            write: Scope::Server,
        };
        let session = core.state.registry.lookup_mut(ClientId(1)).unwrap();
        session.health = Replicated::new(100, private, Some(ClientId(1)));
        core.state.registry.apply_damage(ClientId(1), 10).unwrap();
        core.state.registry.apply_damage(ClientId(2), 10).unwrap();

        let out = core.handle(ServerCommand::Tick { dt: 0.05 });
        assert_eq!(
            out,
            vec![
                Outbound {
                    to: Recipients::Only(ClientId(1)),
                    msg: NetMsg::FieldUpdate(FieldUpdate {
                        client_id: ClientId(1),
                        field: PlayerField::Health(90),
                    }),
                },
                Outbound {
                    to: Recipients::All,
                    msg: NetMsg::FieldUpdate(FieldUpdate {
                        client_id: ClientId(2),
                        field: PlayerField::Health(90),
                    }),
                },
            ]
        );
    }
}
