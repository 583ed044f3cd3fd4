//! Entity/component storage

pub mod entity;
pub mod store;

pub use entity::EntityId;
pub use store::{Component, ComponentType, ComponentsMut, ComponentsRef, EntityStore};
