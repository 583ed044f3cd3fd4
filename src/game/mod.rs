//! Game simulation modules

pub mod combat;
pub mod components;
pub mod events;
pub mod input;
pub mod physics;
pub mod scheduler;
pub mod systems;

pub use combat::{BodyPart, CombatResolver, DamageRequest, DamageResult, DamageType, RemoteHit};
pub use events::GameEvent;
pub use input::InputQueue;
pub use scheduler::{TickContext, TickReport, TickScheduler};
