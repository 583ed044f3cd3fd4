//! Component types attached to simulated entities

use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ecs::EntityId;

use super::combat::DamageType;

/// Seconds after a hit during which further damage is ignored
pub const INVULNERABILITY_DURATION: f64 = 0.5;
/// Seconds without damage before health starts regenerating
pub const REGEN_DELAY: f64 = 5.0;
/// Health regenerated per second once regen kicks in
pub const REGEN_RATE: f32 = 5.0;

/// World-space placement
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Quat,
}

impl Transform {
    pub fn at(position: Vec3) -> Self {
        Self {
            position,
            rotation: Quat::IDENTITY,
        }
    }

    /// Facing direction (-Z forward, right-handed, Y up)
    pub fn forward(&self) -> Vec3 {
        self.rotation * Vec3::NEG_Z
    }
}

impl Default for Transform {
    fn default() -> Self {
        Self::at(Vec3::ZERO)
    }
}

/// Linear velocity in units per second
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Velocity(pub Vec3);

/// Vertical capsule used for hit queries
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Collider {
    pub radius: f32,
    pub height: f32,
}

impl Default for Collider {
    fn default() -> Self {
        // Standing soldier
        Self {
            radius: 0.4,
            height: 1.8,
        }
    }
}

/// Coarse health band derived from the health fraction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CombatState {
    Alive,
    Injured,
    Critical,
    Dead,
}

impl CombatState {
    pub fn from_health(health: f32, max_health: f32) -> Self {
        if health <= 0.0 {
            return Self::Dead;
        }
        let fraction = if max_health > 0.0 { health / max_health } else { 0.0 };
        if fraction < 0.25 {
            Self::Critical
        } else if fraction < 0.5 {
            Self::Injured
        } else {
            Self::Alive
        }
    }
}

/// Health, armor and damage timers of a combat-capable entity.
///
/// Invariant: `0 <= health <= max_health`, `armor >= 0`.
#[derive(Debug, Clone, PartialEq)]
pub struct CombatComponent {
    pub health: f32,
    pub max_health: f32,
    pub armor: f32,
    /// Simulation time of the last applied hit, `None` if never hit
    pub last_damage_time: Option<f64>,
    pub combat_state: CombatState,
    pub last_damage_dealer: Option<EntityId>,
}

impl CombatComponent {
    pub fn new(max_health: f32, armor: f32) -> Self {
        let max_health = max_health.max(0.0);
        Self {
            health: max_health,
            max_health,
            armor: armor.max(0.0),
            last_damage_time: None,
            combat_state: CombatState::from_health(max_health, max_health),
            last_damage_dealer: None,
        }
    }

    /// Vulnerable iff more than the invulnerability window has passed since the last hit
    pub fn is_vulnerable(&self, now: f64) -> bool {
        match self.last_damage_time {
            Some(t) => now - t > INVULNERABILITY_DURATION,
            None => true,
        }
    }

    pub fn is_dead(&self) -> bool {
        self.combat_state == CombatState::Dead
    }

    pub fn refresh_state(&mut self) {
        self.combat_state = CombatState::from_health(self.health, self.max_health);
    }
}

impl Default for CombatComponent {
    fn default() -> Self {
        Self::new(100.0, 0.0)
    }
}

/// Who drives an entity's input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Controller {
    /// Sampled on this node and submitted through the input boundary
    Local,
    /// Driven by inputs arriving from a remote peer
    Remote(Uuid),
}

/// Marks a player avatar
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlayerControlled {
    pub controller: Controller,
    /// Units per second at full stick deflection
    pub move_speed: f32,
    /// Sequence of the last input applied to this avatar
    pub last_applied_seq: Option<u32>,
}

impl PlayerControlled {
    pub fn local() -> Self {
        Self {
            controller: Controller::Local,
            move_speed: 5.0,
            last_applied_seq: None,
        }
    }

    pub fn remote(peer_id: Uuid) -> Self {
        Self {
            controller: Controller::Remote(peer_id),
            move_speed: 5.0,
            last_applied_seq: None,
        }
    }
}

/// Kill/death tally used for attribution
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Score {
    pub kills: u32,
    pub deaths: u32,
}

/// How a weapon delivers damage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeaponKind {
    /// Instant ray against Combat-bearing entities
    Hitscan,
    /// Spawns a projectile entity
    Launcher,
}

/// Firearm state
#[derive(Debug, Clone, PartialEq)]
pub struct Weapon {
    pub kind: WeaponKind,
    pub damage: f32,
    pub range: f32,
    pub magazine_size: u32,
    pub ammo: u32,
    pub reserve_ammo: u32,
    /// Seconds between shots
    pub fire_interval: f32,
    pub cooldown: f32,
    pub reload_time: f32,
    /// Remaining reload time, `Some` while reloading
    pub reload_remaining: Option<f32>,
    pub projectile_speed: f32,
    pub projectile_lifetime: f32,
    pub projectile_radius: f32,
}

impl Weapon {
    pub fn rifle() -> Self {
        Self {
            kind: WeaponKind::Hitscan,
            damage: 25.0,
            range: 150.0,
            magazine_size: 30,
            ammo: 30,
            reserve_ammo: 90,
            fire_interval: 0.1,
            cooldown: 0.0,
            reload_time: 2.0,
            reload_remaining: None,
            projectile_speed: 0.0,
            projectile_lifetime: 0.0,
            projectile_radius: 0.0,
        }
    }

    pub fn launcher() -> Self {
        Self {
            kind: WeaponKind::Launcher,
            damage: 80.0,
            range: 0.0,
            magazine_size: 1,
            ammo: 1,
            reserve_ammo: 4,
            fire_interval: 1.0,
            cooldown: 0.0,
            reload_time: 3.0,
            reload_remaining: None,
            projectile_speed: 40.0,
            projectile_lifetime: 4.0,
            projectile_radius: 0.3,
        }
    }

    pub fn is_reloading(&self) -> bool {
        self.reload_remaining.is_some()
    }

    pub fn can_fire(&self) -> bool {
        !self.is_reloading() && self.cooldown <= 0.0 && self.ammo > 0
    }

    pub fn can_reload(&self) -> bool {
        !self.is_reloading() && self.ammo < self.magazine_size && self.reserve_ammo > 0
    }
}

/// In-flight projectile
#[derive(Debug, Clone, PartialEq)]
pub struct Projectile {
    pub owner: EntityId,
    pub damage: f32,
    pub damage_type: DamageType,
    pub radius: f32,
    pub lifetime_remaining: f32,
}

/// Next-tick plan of a non-player entity
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AiIntent {
    pub target: Option<EntityId>,
    /// Point the entity wants to path toward
    pub move_to: Option<Vec3>,
    /// Point to face, usually the target's chest
    pub look_at: Option<Vec3>,
    pub fire: bool,
}

/// Non-player controller
#[derive(Debug, Clone, PartialEq)]
pub struct AiBrain {
    pub sight_range: f32,
    pub engage_range: f32,
    pub move_speed: f32,
    /// Intent computed on the previous tick, consumed by Movement/Weapon
    pub intent: AiIntent,
    /// Seconds until a new wander point is picked
    pub wander_timer: f32,
}

impl Default for AiBrain {
    fn default() -> Self {
        Self {
            sight_range: 40.0,
            engage_range: 25.0,
            move_speed: 3.5,
            intent: AiIntent::default(),
            wander_timer: 0.0,
        }
    }
}
