//! Typed component store.
//!
//! Components live in one slot arena per component type, indexed by
//! `(EntityId, ComponentType)`. Each arena sits behind its own `RwLock`, so:
//! - concurrent `get`/`view` calls are always safe (shared read lock),
//! - `set`/`remove`/`view_mut` against the same component type are serialized,
//! - systems touching disjoint component types never contend.
//!
//! Mutable access is handed out through [`EntityStore::view_mut`], which lends a
//! [`ComponentsMut`] to a closure. The borrow cannot outlive the closure, so it
//! cannot escape the system turn that requested it.
//!
//! Nesting `view`/`view_mut` calls for *different* component types is fine.
//! Nesting two calls for the *same* type where either one is mutable deadlocks.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use parking_lot::RwLock;
use tracing::error;

use super::entity::EntityId;

/// Anything storable as a component
pub trait Component: Send + Sync + 'static {}

impl<T: Send + Sync + 'static> Component for T {}

/// Type token for a component type
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ComponentType {
    id: TypeId,
    name: &'static str,
}

impl ComponentType {
    pub fn of<T: Component>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Debug for ComponentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

#[derive(Debug)]
struct Slot<T> {
    entity: EntityId,
    value: T,
}

/// Slot arena for one component type.
///
/// Freed slots are reused, so iteration stays dense and in slot order.
#[derive(Debug)]
pub struct Arena<T> {
    slots: Vec<Option<Slot<T>>>,
    free: Vec<usize>,
    index: HashMap<EntityId, usize>,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
        }
    }
}

impl<T> Arena<T> {
    /// Upsert, returning the previous value if any
    fn insert(&mut self, entity: EntityId, value: T) -> Option<T> {
        if let Some(&slot) = self.index.get(&entity) {
            if let Some(existing) = self.slots[slot].as_mut() {
                return Some(std::mem::replace(&mut existing.value, value));
            }
        }

        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(Slot { entity, value });
                slot
            }
            None => {
                self.slots.push(Some(Slot { entity, value }));
                self.slots.len() - 1
            }
        };
        self.index.insert(entity, slot);
        None
    }

    fn remove(&mut self, entity: EntityId) -> Option<T> {
        let slot = self.index.remove(&entity)?;
        let removed = self.slots[slot].take().map(|s| s.value);
        self.free.push(slot);
        removed
    }

    fn get(&self, entity: EntityId) -> Option<&T> {
        let slot = *self.index.get(&entity)?;
        self.slots[slot].as_ref().map(|s| &s.value)
    }

    fn get_mut(&mut self, entity: EntityId) -> Option<&mut T> {
        let slot = *self.index.get(&entity)?;
        self.slots[slot].as_mut().map(|s| &mut s.value)
    }

    fn contains(&self, entity: EntityId) -> bool {
        self.index.contains_key(&entity)
    }

    fn len(&self) -> usize {
        self.index.len()
    }

    fn iter(&self) -> impl Iterator<Item = (EntityId, &T)> {
        self.slots
            .iter()
            .filter_map(|s| s.as_ref().map(|s| (s.entity, &s.value)))
    }

    fn iter_mut(&mut self) -> impl Iterator<Item = (EntityId, &mut T)> {
        self.slots
            .iter_mut()
            .filter_map(|s| s.as_mut().map(|s| (s.entity, &mut s.value)))
    }
}

/// Type-erased handle to one arena, used for whole-entity operations
trait ErasedStorage: Send + Sync {
    fn remove_entity(&self, entity: EntityId) -> bool;
    fn contains(&self, entity: EntityId) -> bool;
    fn entities(&self) -> Vec<EntityId>;
    fn len(&self) -> usize;
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

type Storage<T> = RwLock<Arena<T>>;

impl<T: Component> ErasedStorage for Storage<T> {
    fn remove_entity(&self, entity: EntityId) -> bool {
        self.write().remove(entity).is_some()
    }

    fn contains(&self, entity: EntityId) -> bool {
        self.read().contains(entity)
    }

    fn entities(&self) -> Vec<EntityId> {
        self.read().iter().map(|(id, _)| id).collect()
    }

    fn len(&self) -> usize {
        self.read().len()
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Read-only view over every component of one type
pub struct ComponentsRef<'a, T> {
    arena: &'a Arena<T>,
}

impl<'a, T> ComponentsRef<'a, T> {
    pub fn get(&self, entity: EntityId) -> Option<&T> {
        self.arena.get(entity)
    }

    pub fn contains(&self, entity: EntityId) -> bool {
        self.arena.contains(entity)
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (EntityId, &T)> {
        self.arena.iter()
    }
}

/// Mutable view over every component of one type
pub struct ComponentsMut<'a, T> {
    arena: &'a mut Arena<T>,
}

impl<'a, T> ComponentsMut<'a, T> {
    pub fn get(&self, entity: EntityId) -> Option<&T> {
        self.arena.get(entity)
    }

    pub fn get_mut(&mut self, entity: EntityId) -> Option<&mut T> {
        self.arena.get_mut(entity)
    }

    pub fn contains(&self, entity: EntityId) -> bool {
        self.arena.contains(entity)
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (EntityId, &T)> {
        self.arena.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (EntityId, &mut T)> {
        self.arena.iter_mut()
    }
}

/// Entity/component store shared by every system
#[derive(Default)]
pub struct EntityStore {
    entities: DashSet<EntityId>,
    storages: DashMap<TypeId, Arc<dyn ErasedStorage>>,
}

impl EntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new entity with no components
    pub fn spawn(&self) -> EntityId {
        let id = EntityId::new();
        self.entities.insert(id);
        id
    }

    /// Register an entity whose id was minted elsewhere (e.g. by a remote peer).
    /// Returns false if the id was already live.
    pub fn spawn_with_id(&self, id: EntityId) -> bool {
        self.entities.insert(id)
    }

    /// Destroy an entity and every component it owns
    pub fn despawn(&self, entity: EntityId) -> bool {
        let existed = self.entities.remove(&entity).is_some();
        let storages: Vec<Arc<dyn ErasedStorage>> =
            self.storages.iter().map(|s| s.value().clone()).collect();
        for storage in storages {
            storage.remove_entity(entity);
        }
        existed
    }

    pub fn is_alive(&self, entity: EntityId) -> bool {
        self.entities.contains(&entity)
    }

    /// All live entities
    pub fn entities(&self) -> Vec<EntityId> {
        self.entities.iter().map(|e| *e).collect()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Clone out a component
    pub fn get<T: Component + Clone>(&self, entity: EntityId) -> Option<T> {
        let storage = self.storage::<T>()?;
        let arena = storage.read();
        arena.get(entity).cloned()
    }

    pub fn has<T: Component>(&self, entity: EntityId) -> bool {
        self.storage::<T>()
            .map(|s| s.read().contains(entity))
            .unwrap_or(false)
    }

    /// Upsert a component, overwriting any existing component of the same type.
    /// Setting a component on an unknown id registers that entity.
    pub fn set<T: Component>(&self, entity: EntityId, component: T) -> Option<T> {
        self.entities.insert(entity);
        let storage = self.storage_or_insert::<T>()?;
        let mut arena = storage.write();
        arena.insert(entity, component)
    }

    /// Remove a component, returning it
    pub fn remove<T: Component>(&self, entity: EntityId) -> Option<T> {
        let storage = self.storage::<T>()?;
        let mut arena = storage.write();
        arena.remove(entity)
    }

    /// Lend a read-only view of all `T` components to `f`
    pub fn view<T: Component, R>(&self, f: impl FnOnce(&ComponentsRef<'_, T>) -> R) -> R {
        match self.storage::<T>() {
            Some(storage) => {
                let arena = storage.read();
                f(&ComponentsRef { arena: &*arena })
            }
            None => {
                let empty = Arena::default();
                f(&ComponentsRef { arena: &empty })
            }
        }
    }

    /// Lend a mutable view of all `T` components to `f`.
    /// Writers of the same component type are serialized.
    pub fn view_mut<T: Component, R>(&self, f: impl FnOnce(&mut ComponentsMut<'_, T>) -> R) -> R {
        match self.storage_or_insert::<T>() {
            Some(storage) => {
                let mut arena = storage.write();
                f(&mut ComponentsMut { arena: &mut *arena })
            }
            None => {
                let mut empty = Arena::default();
                f(&mut ComponentsMut { arena: &mut empty })
            }
        }
    }

    /// Mutate a single component in place; returns None if absent
    pub fn with_mut<T: Component, R>(&self, entity: EntityId, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let storage = self.storage::<T>()?;
        let mut arena = storage.write();
        arena.get_mut(entity).map(f)
    }

    /// Entities possessing every requested component type.
    ///
    /// Order follows the slot order of the smallest requested storage, so it is
    /// stable for the duration of one call.
    pub fn query(&self, types: &[ComponentType]) -> Vec<EntityId> {
        if types.is_empty() {
            return Vec::new();
        }

        let mut storages = Vec::with_capacity(types.len());
        for ty in types {
            match self.storages.get(&ty.id) {
                Some(storage) => storages.push(storage.value().clone()),
                None => return Vec::new(),
            }
        }

        storages.sort_by_key(|s| s.len());
        let (driver, rest) = match storages.split_first() {
            Some(split) => split,
            None => return Vec::new(),
        };

        driver
            .entities()
            .into_iter()
            .filter(|id| self.entities.contains(id))
            .filter(|id| rest.iter().all(|s| s.contains(*id)))
            .collect()
    }

    fn storage<T: Component>(&self) -> Option<Arc<Storage<T>>> {
        let erased = self.storages.get(&TypeId::of::<T>())?.value().clone();
        erased.into_any().downcast::<Storage<T>>().ok()
    }

    fn storage_or_insert<T: Component>(&self) -> Option<Arc<Storage<T>>> {
        let erased = self
            .storages
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Arc::new(Storage::<T>::default()) as Arc<dyn ErasedStorage>)
            .value()
            .clone();

        match erased.into_any().downcast::<Storage<T>>() {
            Ok(storage) => Some(storage),
            Err(_) => {
                error!(component = std::any::type_name::<T>(), "Component storage type mismatch");
                None
            }
        }
    }
}
