//! Simulation systems run by the tick scheduler.
//!
//! Lower priority runs earlier. Movement reads inputs before Weapon fires from
//! the updated transforms; AI plans after both, so its intent takes effect on
//! the next tick; Projectile runs last.

mod ai;
mod combat;
mod movement;
mod projectile;
mod weapon;

pub use ai::AiSystem;
pub use combat::CombatSystem;
pub use movement::MovementSystem;
pub use projectile::ProjectileSystem;
pub use weapon::WeaponSystem;

use super::combat::CombatError;
use super::scheduler::TickContext;

pub const COMBAT_PRIORITY: i32 = 10;
pub const MOVEMENT_PRIORITY: i32 = 15;
pub const WEAPON_PRIORITY: i32 = 20;
pub const AI_PRIORITY: i32 = 25;
pub const PROJECTILE_PRIORITY: i32 = 30;

#[derive(Debug, thiserror::Error)]
pub enum SystemError {
    #[error("combat resolution failed: {0}")]
    Combat(#[from] CombatError),

    #[error("{0}")]
    Failed(String),
}

/// A unit of per-tick simulation logic
pub trait SimSystem: Send {
    fn name(&self) -> &'static str;

    /// Ascending order of execution within a tick
    fn priority(&self) -> i32;

    fn update(&mut self, ctx: &mut TickContext<'_>) -> Result<(), SystemError>;
}
