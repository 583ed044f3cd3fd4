//! Inbound input buffering.
//!
//! Network receive loops and the local input boundary push `PlayerInput`s into
//! the [`InputQueue`] at any time. The scheduler drains it once at the start of
//! a tick into a [`TickInputs`] frame that Movement and Weapon read during their
//! turns. Sequence numbers deduplicate and order inputs so each one is consumed
//! at most once.

use std::collections::{BTreeMap, HashMap};

use dashmap::DashMap;

use crate::ecs::EntityId;
use crate::net::protocol::PlayerInput;

/// Inputs buffered per entity before the oldest are shed
pub const MAX_PENDING_INPUTS: usize = 128;

#[derive(Debug, Default)]
struct InputBuffer {
    last_consumed: Option<u32>,
    pending: BTreeMap<u32, PlayerInput>,
}

/// Why an input was not queued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputRejection {
    /// Same sequence already pending
    Duplicate,
    /// Sequence at or below one already consumed
    Stale,
}

/// Concurrency-safe inbound input queue keyed by avatar entity
#[derive(Debug, Default)]
pub struct InputQueue {
    buffers: DashMap<EntityId, InputBuffer>,
}

impl InputQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an input for `entity`
    pub fn push(&self, entity: EntityId, input: PlayerInput) -> Result<(), InputRejection> {
        let mut buffer = self.buffers.entry(entity).or_default();

        if let Some(last) = buffer.last_consumed {
            if input.sequence <= last {
                return Err(InputRejection::Stale);
            }
        }
        if buffer.pending.contains_key(&input.sequence) {
            return Err(InputRejection::Duplicate);
        }

        buffer.pending.insert(input.sequence, input);
        while buffer.pending.len() > MAX_PENDING_INPUTS {
            buffer.pending.pop_first();
        }
        Ok(())
    }

    /// Take every pending input, in sequence order per entity
    pub fn drain(&self) -> TickInputs {
        let mut by_entity = HashMap::new();
        for mut entry in self.buffers.iter_mut() {
            if entry.pending.is_empty() {
                continue;
            }
            let pending = std::mem::take(&mut entry.pending);
            entry.last_consumed = pending.keys().next_back().copied().or(entry.last_consumed);
            let inputs: Vec<PlayerInput> = pending.into_values().collect();
            by_entity.insert(*entry.key(), inputs);
        }
        TickInputs { by_entity }
    }

    /// Forget an entity (despawn / peer left)
    pub fn remove(&self, entity: EntityId) {
        self.buffers.remove(&entity);
    }

    pub fn pending_count(&self) -> usize {
        self.buffers.iter().map(|b| b.pending.len()).sum()
    }
}

/// Inputs consumed by one tick
#[derive(Debug, Clone, Default)]
pub struct TickInputs {
    by_entity: HashMap<EntityId, Vec<PlayerInput>>,
}

impl TickInputs {
    pub fn for_entity(&self, entity: EntityId) -> &[PlayerInput] {
        self.by_entity.get(&entity).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Most recent input for `entity` this tick
    pub fn latest(&self, entity: EntityId) -> Option<&PlayerInput> {
        self.for_entity(entity).last()
    }

    pub fn is_empty(&self) -> bool {
        self.by_entity.is_empty()
    }

    pub fn len(&self) -> usize {
        self.by_entity.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::protocol::Actions;
    use glam::{Quat, Vec2, Vec3};

    fn input(sequence: u32) -> PlayerInput {
        PlayerInput {
            timestamp: sequence as f64,
            sequence,
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            movement: Vec2::ZERO,
            actions: Actions::NONE,
        }
    }

    #[test]
    fn drains_in_sequence_order() {
        let queue = InputQueue::new();
        let e = EntityId::new();
        queue.push(e, input(3)).expect("queued");
        queue.push(e, input(1)).expect("queued");
        queue.push(e, input(2)).expect("queued");

        let frame = queue.drain();
        let seqs: Vec<u32> = frame.for_entity(e).iter().map(|i| i.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(queue.pending_count(), 0);
    }

    #[test]
    fn duplicates_and_stale_inputs_rejected() {
        let queue = InputQueue::new();
        let e = EntityId::new();
        queue.push(e, input(5)).expect("queued");
        assert_eq!(queue.push(e, input(5)), Err(InputRejection::Duplicate));

        let _ = queue.drain();
        assert_eq!(queue.push(e, input(4)), Err(InputRejection::Stale));
        assert_eq!(queue.push(e, input(5)), Err(InputRejection::Stale));
        assert!(queue.push(e, input(6)).is_ok());
    }

    #[test]
    fn overflow_sheds_oldest() {
        let queue = InputQueue::new();
        let e = EntityId::new();
        for seq in 0..(MAX_PENDING_INPUTS as u32 + 10) {
            queue.push(e, input(seq)).expect("queued");
        }
        let frame = queue.drain();
        assert_eq!(frame.for_entity(e).len(), MAX_PENDING_INPUTS);
        assert_eq!(frame.for_entity(e).first().map(|i| i.sequence), Some(10));
    }
}
