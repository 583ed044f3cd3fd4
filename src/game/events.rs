//! Gameplay events produced during a tick

use glam::Vec3;

use crate::ecs::EntityId;

use super::combat::{BodyPart, DamageType};

/// Something noteworthy that happened during a tick.
/// Collected into the tick report for the presentation layer and logs.
#[derive(Debug, Clone, PartialEq)]
pub enum GameEvent {
    /// Weapon discharged
    Shot {
        shooter: EntityId,
        origin: Vec3,
        direction: Vec3,
        /// Spawned projectile, `None` for hitscan
        projectile: Option<EntityId>,
    },

    /// Damage landed on a target
    Hit {
        attacker: Option<EntityId>,
        target: EntityId,
        body_part: BodyPart,
        damage_type: DamageType,
        damage: f32,
    },

    /// Target died
    Kill {
        killer: Option<EntityId>,
        victim: EntityId,
        damage_type: DamageType,
    },

    /// Weapon started reloading
    Reload { entity: EntityId },

    /// Entity removed at the end of the tick
    Despawned { entity: EntityId },
}
