//! Spawn authority.
//!
//! Owns the server's entity world: avatars and projectiles. Every networked
//! entity is created and destroyed here, and every such change is queued as a
//! [`SpawnEvent`] so the session core can replicate it in order.
//!
//! Simulation is a fixed-step `tick`:
//! - avatars follow their wish direction unless locked after a respawn
//! - projectiles fly straight, expire after their lifetime, and hit any avatar
//!   other than their owner's
//!
//! An impact is always queued before the despawn of the projectile causing it.

use arena_shared::{
    config::{ProjectileConfig, SessionConfig},
    ecs::{EntityId, Position, World},
    error::{SessionError, SessionResult},
    event::EventBus,
    math::Vec3,
    net::{ClientId, EntityKind, EntitySpawn, EntityState},
};
use tracing::{debug, info};

use crate::registry::SessionRegistry;

/// Owning client of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ownership(pub ClientId);

/// Whether an avatar accepts movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MovementState {
    Normal,
    /// Movement ignored for the given number of ticks.
    Locked { remaining_ticks: u32 },
}

/// Avatar component.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Avatar {
    pub state: MovementState,
    /// Requested movement direction, at most unit length.
    pub wish: Vec3,
}

/// Projectile component.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Projectile {
    pub owner: ClientId,
    /// Unit flight direction.
    pub direction: Vec3,
    /// Seconds left before expiry.
    pub remaining: f32,
}

/// World changes to replicate, in the order they happened.
#[derive(Debug, Clone, PartialEq)]
pub enum SpawnEvent {
    Spawned(EntitySpawn),
    Moved(EntityState),
    Impact { position: Vec3 },
    Despawned(EntityId),
}

/// Server-side authority over networked entities.
pub struct SpawnAuthority {
    world: World,
    projectile: ProjectileConfig,
    avatar_speed: f32,
    respawn_lock_ticks: u32,
    events: EventBus,
}

impl SpawnAuthority {
    pub fn new(cfg: &SessionConfig) -> Self {
        Self {
            world: World::default(),
            projectile: cfg.projectile,
            avatar_speed: cfg.avatar_speed,
            respawn_lock_ticks: cfg.respawn_lock_ticks,
            events: EventBus::default(),
        }
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    /// Owner of a live entity.
    pub fn owner_of(&self, entity: EntityId) -> Option<ClientId> {
        self.world.get::<Ownership>(entity).map(|o| o.0)
    }

    pub fn position_of(&self, entity: EntityId) -> Option<Vec3> {
        self.world.get::<Position>(entity).map(|p| p.0)
    }

    pub fn is_projectile(&self, entity: EntityId) -> bool {
        self.world.get::<Projectile>(entity).is_some()
    }

    /// Creates `client_id`'s avatar at `position`, which also becomes the
    /// session's respawn point.
    pub fn spawn_avatar(
        &mut self,
        registry: &mut SessionRegistry,
        client_id: ClientId,
        position: Vec3,
    ) -> SessionResult<EntityId> {
        let session = registry.lookup(client_id)?;
        if let Some(existing) = session.avatar().filter(|e| self.world.contains(*e)) {
            return Err(SessionError::invalid_state(format!(
                "client {:?} already has avatar {:?}",
                client_id, existing
            )));
        }

        let id = self.world.spawn();
        self.world.insert(id, Position(position));
        self.world.insert(id, Ownership(client_id));
        self.world.insert(
            id,
            Avatar {
                state: MovementState::Normal,
                wish: Vec3::ZERO,
            },
        );
        registry.bind_avatar(client_id, id)?;
        registry.set_spawn_point(client_id, position)?;

        info!(client_id = ?client_id, entity = ?id, ?position, "Avatar spawned");
        self.events.push(SpawnEvent::Spawned(EntitySpawn {
            id,
            kind: EntityKind::Avatar,
            owner: Some(client_id),
            position,
        }));
        Ok(id)
    }

    /// Fires a projectile owned by `owner`.
    pub fn spawn_projectile(
        &mut self,
        registry: &SessionRegistry,
        owner: ClientId,
        origin: Vec3,
        direction: Vec3,
    ) -> SessionResult<EntityId> {
        if !registry.contains(owner) {
            return Err(SessionError::NotFound);
        }

        let id = self.world.spawn();
        self.world.insert(id, Position(origin));
        self.world.insert(id, Ownership(owner));
        self.world.insert(
            id,
            Projectile {
                owner,
                direction: direction.normalized(),
                remaining: self.projectile.lifetime_secs,
            },
        );

        debug!(client_id = ?owner, entity = ?id, "Projectile spawned");
        self.events.push(SpawnEvent::Spawned(EntitySpawn {
            id,
            kind: EntityKind::Projectile,
            owner: Some(owner),
            position: origin,
        }));
        Ok(id)
    }

    /// Despawns a projectile, notifying its impact position first.
    pub fn despawn_projectile(&mut self, entity: EntityId) -> SessionResult<Vec3> {
        if !self.is_projectile(entity) {
            return Err(SessionError::NotFound);
        }
        let position = self.position_of(entity).unwrap_or(Vec3::ZERO);
        self.events.push(SpawnEvent::Impact { position });
        self.world.despawn(entity);
        self.events.push(SpawnEvent::Despawned(entity));
        Ok(position)
    }

    /// Removes a client's avatar, if any, and unbinds it from the session.
    pub fn despawn_avatar(
        &mut self,
        registry: &mut SessionRegistry,
        client_id: ClientId,
    ) -> SessionResult<Option<EntityId>> {
        let avatar = registry.unbind_avatar(client_id)?;
        if let Some(entity) = avatar {
            if self.world.despawn(entity) {
                debug!(client_id = ?client_id, entity = ?entity, "Avatar despawned");
                self.events.push(SpawnEvent::Despawned(entity));
            }
        }
        Ok(avatar)
    }

    /// Moves `client_id`'s avatar back to its spawn point and locks movement.
    pub fn respawn(&mut self, registry: &SessionRegistry, client_id: ClientId) -> SessionResult<()> {
        let session = registry.lookup(client_id)?;
        let entity = session.avatar().ok_or(SessionError::NotFound)?;
        let spawn_point = session.spawn_point;

        let avatar = self.world.get_mut::<Avatar>(entity).ok_or(SessionError::NotFound)?;
        avatar.wish = Vec3::ZERO;
        avatar.state = if self.respawn_lock_ticks == 0 {
            MovementState::Normal
        } else {
            MovementState::Locked {
                remaining_ticks: self.respawn_lock_ticks,
            }
        };
        if let Some(pos) = self.world.get_mut::<Position>(entity) {
            pos.0 = spawn_point;
        }

        info!(client_id = ?client_id, entity = ?entity, "Avatar respawned");
        self.events.push(SpawnEvent::Moved(EntityState {
            id: entity,
            position: spawn_point,
        }));
        Ok(())
    }

    /// Sets the wish direction of `client_id`'s avatar.
    pub fn move_avatar(&mut self, registry: &SessionRegistry, client_id: ClientId, wish: Vec3) -> SessionResult<()> {
        let entity = registry.lookup(client_id)?.avatar().ok_or(SessionError::NotFound)?;
        let avatar = self.world.get_mut::<Avatar>(entity).ok_or(SessionError::NotFound)?;
        if let MovementState::Locked { remaining_ticks } = avatar.state {
            return Err(SessionError::invalid_state(format!(
                "avatar locked for {} more ticks",
                remaining_ticks
            )));
        }
        avatar.wish = if wish.len_sq() > 1.0 { wish.normalized() } else { wish };
        Ok(())
    }

    /// Advances the simulation by `dt` seconds.
    pub fn tick(&mut self, dt: f32, registry: &mut SessionRegistry) {
        self.tick_avatars(dt);
        self.tick_projectiles(dt, registry);
    }

    fn tick_avatars(&mut self, dt: f32) {
        let avatars: Vec<(EntityId, Avatar)> = self.world.iter::<Avatar>().map(|(id, a)| (id, *a)).collect();
        for (id, avatar) in avatars {
            match avatar.state {
                MovementState::Locked { remaining_ticks } => {
                    let next = if remaining_ticks <= 1 {
                        MovementState::Normal
                    } else {
                        MovementState::Locked {
                            remaining_ticks: remaining_ticks - 1,
                        }
                    };
                    if let Some(a) = self.world.get_mut::<Avatar>(id) {
                        a.state = next;
                    }
                }
                MovementState::Normal => {
                    if avatar.wish == Vec3::ZERO {
                        continue;
                    }
                    if let Some(pos) = self.world.get_mut::<Position>(id) {
                        pos.0 += avatar.wish * (self.avatar_speed * dt);
                        let position = pos.0;
                        self.events.push(SpawnEvent::Moved(EntityState { id, position }));
                    }
                }
            }
        }
    }

    fn tick_projectiles(&mut self, dt: f32, registry: &mut SessionRegistry) {
        let targets: Vec<(ClientId, Vec3)> = self
            .world
            .iter::<Avatar>()
            .filter_map(|(id, _)| Some((self.owner_of(id)?, self.position_of(id)?)))
            .collect();
        let projectiles: Vec<(EntityId, Projectile)> =
            self.world.iter::<Projectile>().map(|(id, p)| (id, *p)).collect();
        let hit_radius_sq = self.projectile.hit_radius * self.projectile.hit_radius;

        for (id, projectile) in projectiles {
            let Some(start) = self.position_of(id) else {
                continue;
            };
            let position = start + projectile.direction * (self.projectile.speed * dt);
            let remaining = projectile.remaining - dt;

            let hit = targets
                .iter()
                .find(|(owner, at)| *owner != projectile.owner && at.distance_sq(position) <= hit_radius_sq)
                .map(|(owner, _)| *owner);

            if let Some(victim) = hit {
                match registry.apply_damage(victim, self.projectile.damage) {
                    Ok(health) => info!(
                        shooter = ?projectile.owner,
                        victim = ?victim,
                        health,
                        "Projectile hit"
                    ),
                    Err(e) => debug!(victim = ?victim, error = %e, "Hit player without session"),
                }
                self.finish_projectile(id, position);
            } else if remaining <= 0.0 {
                debug!(entity = ?id, "Projectile expired");
                self.finish_projectile(id, position);
            } else {
                if let Some(p) = self.world.get_mut::<Projectile>(id) {
                    p.remaining = remaining;
                }
                if let Some(pos) = self.world.get_mut::<Position>(id) {
                    pos.0 = position;
                }
                self.events.push(SpawnEvent::Moved(EntityState { id, position }));
            }
        }
    }

    fn finish_projectile(&mut self, id: EntityId, position: Vec3) {
        self.events.push(SpawnEvent::Impact { position });
        self.world.despawn(id);
        self.events.push(SpawnEvent::Despawned(id));
    }

    /// Spawn packets for every live entity, for late joiners.
    pub fn snapshot(&self) -> Vec<EntitySpawn> {
        self.world
            .entities()
            .filter_map(|id| {
                let kind = if self.world.get::<Avatar>(id).is_some() {
                    EntityKind::Avatar
                } else if self.is_projectile(id) {
                    EntityKind::Projectile
                } else {
                    return None;
                };
                Some(EntitySpawn {
                    id,
                    kind,
                    owner: self.owner_of(id),
                    position: self.position_of(id)?,
                })
            })
            .collect()
    }

    pub fn drain_events(&mut self) -> Vec<SpawnEvent> {
        self.events.drain::<SpawnEvent>()
    }
}
