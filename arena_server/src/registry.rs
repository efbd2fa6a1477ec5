//! Session registry.
//!
//! Authoritative collection of player sessions, one per live connection, kept
//! in join order. Join order matters: a player's position in the registry
//! picks their gameplay spawn point.
//!
//! Membership changes are queued as [`RegistryEvent`]s and drained by the
//! session core, which forwards them to clients and presentation subscribers.

use arena_shared::{
    ecs::EntityId,
    error::{SessionError, SessionResult},
    event::EventBus,
    math::Vec3,
    net::{ClientId, FieldUpdate, PlayerField, PlayerState},
    replicated::{FieldPolicy, Replicated},
    scope::Principal,
};
use chrono::{DateTime, Utc};

/// Server-side state of one connected participant.
#[derive(Debug)]
pub struct PlayerSession {
    client_id: ClientId,
    /// Readiness gate, reused for the lobby and the scene-load barrier.
    pub is_ready: Replicated<bool>,
    /// Appearance picked in the lobby.
    pub appearance: Replicated<i32>,
    pub health: Replicated<i32>,
    /// Where this player's avatar spawns and respawns. Not replicated.
    pub spawn_point: Vec3,
    avatar: Option<EntityId>,
    joined_at: DateTime<Utc>,
}

impl PlayerSession {
    pub fn new(client_id: ClientId, starting_health: i32) -> Self {
        let owner = Some(client_id);
        Self {
            client_id,
            is_ready: Replicated::new(false, FieldPolicy::SERVER_WRITE, owner),
            appearance: Replicated::new(0, FieldPolicy::OWNER_WRITE, owner),
            health: Replicated::new(starting_health, FieldPolicy::SERVER_WRITE, owner),
            spawn_point: Vec3::ZERO,
            avatar: None,
            joined_at: Utc::now(),
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn avatar(&self) -> Option<EntityId> {
        self.avatar
    }

    pub fn joined_at(&self) -> DateTime<Utc> {
        self.joined_at
    }

    /// Replicated view of this session.
    pub fn state(&self) -> PlayerState {
        PlayerState {
            client_id: self.client_id,
            is_ready: *self.is_ready.read(),
            appearance: *self.appearance.read(),
            health: *self.health.read(),
            avatar: self.avatar,
        }
    }

    /// Whether `observer` may receive `field` of this session.
    pub fn can_read(&self, field: &PlayerField, observer: Principal) -> bool {
        match field {
            PlayerField::IsReady(_) => self.is_ready.can_read(observer),
            PlayerField::Appearance(_) => self.appearance.can_read(observer),
            PlayerField::Health(_) => self.health.can_read(observer),
        }
    }

    fn drain_updates(&mut self, out: &mut Vec<FieldUpdate>) {
        let client_id = self.client_id;
        if let Some(v) = self.is_ready.take_dirty() {
            out.push(FieldUpdate {
                client_id,
                field: PlayerField::IsReady(v),
            });
        }
        if let Some(v) = self.appearance.take_dirty() {
            out.push(FieldUpdate {
                client_id,
                field: PlayerField::Appearance(v),
            });
        }
        if let Some(v) = self.health.take_dirty() {
            out.push(FieldUpdate {
                client_id,
                field: PlayerField::Health(v),
            });
        }
    }
}

/// Membership notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    PlayerJoined(PlayerState),
    PlayerLeft(PlayerState),
}

/// Authoritative player registry.
pub struct SessionRegistry {
    players: Vec<PlayerSession>,
    starting_health: i32,
    appearance_options: i32,
    events: EventBus,
}

impl SessionRegistry {
    pub fn new(starting_health: i32, appearance_options: i32) -> Self {
        Self {
            players: Vec::new(),
            starting_health,
            appearance_options,
            events: EventBus::default(),
        }
    }

    /// Registers a new connection.
    pub fn join(&mut self, client_id: ClientId) -> SessionResult<&PlayerSession> {
        if self.contains(client_id) {
            return Err(SessionError::invalid_state(format!(
                "client {:?} already registered",
                client_id
            )));
        }
        let session = PlayerSession::new(client_id, self.starting_health);
        self.events.push(RegistryEvent::PlayerJoined(session.state()));
        self.players.push(session);
        Ok(&self.players[self.players.len() - 1])
    }

    /// Removes a connection's session.
    pub fn leave(&mut self, client_id: ClientId) -> SessionResult<PlayerSession> {
        let index = self.index_of(client_id).ok_or(SessionError::NotFound)?;
        let session = self.players.remove(index);
        self.events.push(RegistryEvent::PlayerLeft(session.state()));
        Ok(session)
    }

    pub fn lookup(&self, client_id: ClientId) -> SessionResult<&PlayerSession> {
        self.players
            .iter()
            .find(|p| p.client_id == client_id)
            .ok_or(SessionError::NotFound)
    }

    pub fn lookup_mut(&mut self, client_id: ClientId) -> SessionResult<&mut PlayerSession> {
        self.players
            .iter_mut()
            .find(|p| p.client_id == client_id)
            .ok_or(SessionError::NotFound)
    }

    pub fn contains(&self, client_id: ClientId) -> bool {
        self.players.iter().any(|p| p.client_id == client_id)
    }

    /// Position in join order.
    pub fn index_of(&self, client_id: ClientId) -> Option<usize> {
        self.players.iter().position(|p| p.client_id == client_id)
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PlayerSession> {
        self.players.iter()
    }

    pub fn client_ids(&self) -> Vec<ClientId> {
        self.players.iter().map(|p| p.client_id).collect()
    }

    /// Associates a spawned avatar with a session.
    pub fn bind_avatar(&mut self, client_id: ClientId, avatar: EntityId) -> SessionResult<()> {
        let session = self.lookup_mut(client_id)?;
        session.avatar = Some(avatar);
        Ok(())
    }

    /// Clears a session's avatar binding, returning the previous one.
    pub fn unbind_avatar(&mut self, client_id: ClientId) -> SessionResult<Option<EntityId>> {
        let session = self.lookup_mut(client_id)?;
        Ok(session.avatar.take())
    }

    /// Server write of `is_ready := true`.
    pub fn mark_ready(&mut self, client_id: ClientId) -> SessionResult<()> {
        self.lookup_mut(client_id)?
            .is_ready
            .write(true, Principal::Server)
    }

    /// Conjunction of `is_ready` over every live session.
    pub fn all_ready(&self) -> bool {
        self.players.iter().all(|p| *p.is_ready.read())
    }

    /// Server write of `is_ready := false` on every live session.
    pub fn reset_ready(&mut self) -> SessionResult<()> {
        for player in self.players.iter_mut() {
            player.is_ready.write(false, Principal::Server)?;
        }
        Ok(())
    }

    pub fn ready_count(&self) -> usize {
        self.players.iter().filter(|p| *p.is_ready.read()).count()
    }

    /// Owner proposal of a new appearance.
    ///
    /// Indices outside `0..appearance_options` are `InvalidState`.
    pub fn set_appearance(&mut self, client_id: ClientId, index: i32, principal: Principal) -> SessionResult<()> {
        if !(0..self.appearance_options).contains(&index) {
            return Err(SessionError::invalid_state(format!(
                "appearance {index} out of range 0..{}",
                self.appearance_options
            )));
        }
        self.lookup_mut(client_id)?.appearance.write(index, principal)
    }

    /// Server write subtracting `amount` from a player's health.
    pub fn apply_damage(&mut self, client_id: ClientId, amount: i32) -> SessionResult<i32> {
        let session = self.lookup_mut(client_id)?;
        let health = session.health.read().saturating_sub(amount);
        session.health.write(health, Principal::Server)?;
        Ok(health)
    }

    pub fn set_spawn_point(&mut self, client_id: ClientId, point: Vec3) -> SessionResult<()> {
        self.lookup_mut(client_id)?.spawn_point = point;
        Ok(())
    }

    /// Clients allowed to receive `update`, in registry order.
    pub fn readers_of(&self, update: &FieldUpdate) -> Vec<ClientId> {
        let Ok(subject) = self.lookup(update.client_id) else {
            return Vec::new();
        };
        self.players
            .iter()
            .map(|p| p.client_id)
            .filter(|id| subject.can_read(&update.field, Principal::Client(*id)))
            .collect()
    }

    /// Collects every pending field replication, in registry order.
    pub fn drain_field_updates(&mut self) -> Vec<FieldUpdate> {
        let mut out = Vec::new();
        for player in self.players.iter_mut() {
            player.drain_updates(&mut out);
        }
        out
    }

    pub fn drain_events(&mut self) -> Vec<RegistryEvent> {
        self.events.drain::<RegistryEvent>()
    }
}
