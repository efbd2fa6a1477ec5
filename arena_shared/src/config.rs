//! Configuration system.
//!
//! Loads session configuration from JSON strings (file IO left to the binaries).

use serde::{Deserialize, Serialize};

use crate::math::Vec3;

/// Which identity a handler acts on behalf of.
///
/// Authorization always uses the channel identity. This only decides what
/// happens when a call payload names a client (e.g. `RequestSpawnAvatar`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdentitySource {
    /// Payload ids must match the channel's client id.
    Channel,
    /// Payload ids are trusted as sent. Only for same-machine sessions.
    Payload,
}

/// Projectile tuning.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProjectileConfig {
    /// Units per second.
    pub speed: f32,
    /// Seconds before a projectile despawns on its own.
    pub lifetime_secs: f32,
    /// Health removed from a player on hit.
    pub damage: i32,
    /// Distance at which a projectile hits an avatar.
    pub hit_radius: f32,
}

impl Default for ProjectileConfig {
    fn default() -> Self {
        Self {
            speed: 10.0,
            lifetime_secs: 5.0,
            damage: 10,
            hit_radius: 0.75,
        }
    }
}

/// Root configuration shared by client/server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Server listen address, e.g. `127.0.0.1:40000`.
    pub server_addr: String,
    /// Fixed simulation tick rate.
    pub tick_hz: u32,
    /// Maximum connected clients, host included.
    #[serde(default = "default_max_players")]
    pub max_players: u32,
    #[serde(default = "default_identity_source")]
    pub identity_source: IdentitySource,
    /// Starting health of every player session.
    #[serde(default = "default_health")]
    pub starting_health: i32,
    /// Number of selectable appearances; valid indices are `0..appearance_options`.
    #[serde(default = "default_appearance_options")]
    pub appearance_options: i32,
    /// Gameplay spawn points, assigned by registry position.
    #[serde(default = "default_spawn_points")]
    pub spawn_points: Vec<Vec3>,
    #[serde(default)]
    pub projectile: ProjectileConfig,
    /// Avatar movement speed in units per second.
    #[serde(default = "default_avatar_speed")]
    pub avatar_speed: f32,
    /// Ticks an avatar stays locked after a respawn.
    #[serde(default = "default_respawn_lock_ticks")]
    pub respawn_lock_ticks: u32,
}

fn default_max_players() -> u32 {
    4
}

fn default_identity_source() -> IdentitySource {
    IdentitySource::Channel
}

fn default_health() -> i32 {
    100
}

fn default_appearance_options() -> i32 {
    4
}

fn default_spawn_points() -> Vec<Vec3> {
    vec![
        Vec3::new(-10.0, 0.0, 0.0),
        Vec3::new(10.0, 0.0, 0.0),
        Vec3::new(0.0, 8.0, 0.0),
        Vec3::new(0.0, -8.0, 0.0),
    ]
}

fn default_avatar_speed() -> f32 {
    25.0
}

fn default_respawn_lock_ticks() -> u32 {
    1
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:40000".to_string(),
            tick_hz: 64,
            max_players: default_max_players(),
            identity_source: default_identity_source(),
            starting_health: default_health(),
            appearance_options: default_appearance_options(),
            spawn_points: default_spawn_points(),
            projectile: ProjectileConfig::default(),
            avatar_speed: default_avatar_speed(),
            respawn_lock_ticks: default_respawn_lock_ticks(),
        }
    }
}

impl SessionConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    /// Seconds per simulation tick.
    pub fn tick_secs(&self) -> f32 {
        1.0 / self.tick_hz.max(1) as f32
    }

    /// Spawn point for the player at `index` in the registry.
    ///
    /// Wraps when there are more players than points; origin when none.
    pub fn spawn_point(&self, index: usize) -> Vec3 {
        if self.spawn_points.is_empty() {
            Vec3::ZERO
        } else {
            self.spawn_points[index % self.spawn_points.len()]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_json_fills_defaults() {
        let cfg = SessionConfig::from_json_str(r#"{"server_addr":"0.0.0.0:5000","tick_hz":30}"#).unwrap();
        assert_eq!(cfg.server_addr, "0.0.0.0:5000");
        assert_eq!(cfg.identity_source, IdentitySource::Channel);
        assert_eq!(cfg.starting_health, 100);
        assert_eq!(cfg.appearance_options, 4);
        assert_eq!(cfg.projectile.damage, 10);
        assert_eq!(cfg.respawn_lock_ticks, 1);
    }

    #[test]
    fn spawn_points_wrap() {
        let cfg = SessionConfig {
            spawn_points: vec![Vec3::new(1.0, 0.0, 0.0), Vec3::new(2.0, 0.0, 0.0)],
            ..Default::default()
        };
        assert_eq!(cfg.spawn_point(0).x, 1.0);
        assert_eq!(cfg.spawn_point(3).x, 2.0);

        let empty = SessionConfig {
            spawn_points: Vec::new(),
            ..Default::default()
        };
        assert_eq!(empty.spawn_point(7), Vec3::ZERO);
    }
}
