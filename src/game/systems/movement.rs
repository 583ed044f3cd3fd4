//! Input-driven and AI-driven movement

use glam::Vec3;
use tracing::{debug, warn};

use crate::ecs::{ComponentType, EntityId};
use crate::game::components::{
    AiBrain, CombatComponent, Controller, PlayerControlled, Projectile, Transform, Velocity,
};
use crate::game::physics::{PhysicsSystem, CROUCH_SPEED_FACTOR, JUMP_SPEED};
use crate::game::scheduler::TickContext;
use crate::net::protocol::{Actions, PlayerInput};

use super::{SimSystem, SystemError, MOVEMENT_PRIORITY};

/// Applies this tick's inputs to player avatars, follows AI intents, and
/// integrates every moving body except projectiles, which only
/// [`ProjectileSystem`](super::ProjectileSystem) moves.
///
/// Locally controlled avatars integrate their stick input. Remote avatars are
/// owned by their peer, so the position and rotation reported in the peer's
/// input are taken as-is and only dead-reckoned between inputs.
#[derive(Debug, Default)]
pub struct MovementSystem {
    dropped_inputs: u64,
}

impl MovementSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Malformed inputs discarded so far
    pub fn dropped_inputs(&self) -> u64 {
        self.dropped_inputs
    }

    fn is_dead(ctx: &TickContext<'_>, entity: EntityId) -> bool {
        ctx.store
            .get::<CombatComponent>(entity)
            .map(|c| c.is_dead())
            .unwrap_or(false)
    }

    fn apply_inputs(&mut self, ctx: &TickContext<'_>, entity: EntityId, inputs: &[PlayerInput]) {
        let Some(mut player) = ctx.store.get::<PlayerControlled>(entity) else {
            return;
        };
        let mut transform = ctx.store.get::<Transform>(entity).unwrap_or_default();
        let mut velocity = ctx.store.get::<Velocity>(entity).unwrap_or_default().0;

        for input in inputs {
            if !input.is_well_formed() {
                self.dropped_inputs += 1;
                warn!(entity = %entity, sequence = input.sequence, "Dropping malformed input");
                continue;
            }

            transform.rotation = input.rotation.normalize();
            if let Controller::Remote(_) = player.controller {
                transform.position = input.position;
            }

            let mut speed = player.move_speed;
            if input.actions.contains(Actions::CROUCHING) {
                speed *= CROUCH_SPEED_FACTOR;
            }
            let planar = PhysicsSystem::planar_velocity(transform.rotation, input.movement, speed);
            velocity.x = planar.x;
            velocity.z = planar.z;

            if input.actions.contains(Actions::JUMPING) && PhysicsSystem::on_ground(transform.position) {
                velocity.y = JUMP_SPEED;
            }

            player.last_applied_seq = Some(input.sequence);
        }

        ctx.store.set(entity, transform);
        ctx.store.set(entity, Velocity(velocity));
        ctx.store.set(entity, player);
    }

    fn steer_ai(ctx: &TickContext<'_>, entity: EntityId, brain: &AiBrain) {
        let Some(mut transform) = ctx.store.get::<Transform>(entity) else {
            return;
        };
        let mut velocity = ctx.store.get::<Velocity>(entity).unwrap_or_default().0;

        let planar = match brain.intent.move_to {
            Some(goal) => {
                let offset = Vec3::new(goal.x - transform.position.x, 0.0, goal.z - transform.position.z);
                // Stop short instead of orbiting the goal
                if offset.length() < 0.25 {
                    Vec3::ZERO
                } else {
                    offset.normalize() * brain.move_speed
                }
            }
            None => Vec3::ZERO,
        };
        velocity.x = planar.x;
        velocity.z = planar.z;

        let face = brain.intent.look_at.or(brain.intent.move_to);
        if let Some(rotation) = face.and_then(|p| PhysicsSystem::look_rotation(transform.position, p)) {
            transform.rotation = rotation;
        }

        ctx.store.set(entity, transform);
        ctx.store.set(entity, Velocity(velocity));
    }
}

impl SimSystem for MovementSystem {
    fn name(&self) -> &'static str {
        "movement"
    }

    fn priority(&self) -> i32 {
        MOVEMENT_PRIORITY
    }

    fn update(&mut self, ctx: &mut TickContext<'_>) -> Result<(), SystemError> {
        let ctx = &*ctx;

        for entity in ctx.query(&[ComponentType::of::<PlayerControlled>(), ComponentType::of::<Transform>()]) {
            if Self::is_dead(ctx, entity) {
                continue;
            }
            let inputs = ctx.inputs.for_entity(entity);
            if !inputs.is_empty() {
                self.apply_inputs(ctx, entity, inputs);
            }
        }

        for entity in ctx.query(&[ComponentType::of::<AiBrain>(), ComponentType::of::<Transform>()]) {
            if Self::is_dead(ctx, entity) {
                continue;
            }
            if let Some(brain) = ctx.store.get::<AiBrain>(entity) {
                Self::steer_ai(ctx, entity, &brain);
            }
        }

        let movers: Vec<EntityId> = ctx
            .query(&[ComponentType::of::<Transform>(), ComponentType::of::<Velocity>()])
            .into_iter()
            .filter(|id| !ctx.store.has::<Projectile>(*id))
            .collect();
        let dead: Vec<bool> = movers.iter().map(|id| Self::is_dead(ctx, *id)).collect();
        let dt = ctx.delta_time;

        ctx.store.view_mut::<Velocity, _>(|velocities| {
            ctx.store.view_mut::<Transform, _>(|transforms| {
                for (entity, dead) in movers.iter().zip(dead) {
                    let (Some(velocity), Some(transform)) = (velocities.get_mut(*entity), transforms.get_mut(*entity)) else {
                        continue;
                    };
                    if dead {
                        velocity.0 = Vec3::ZERO;
                        continue;
                    }
                    let (position, next) = PhysicsSystem::integrate(transform.position, velocity.0, dt);
                    transform.position = position;
                    velocity.0 = next;
                }
            })
        });

        debug!(tick = ctx.tick, moved = movers.len(), "Movement integrated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ecs::EntityStore;
    use crate::game::input::InputQueue;
    use crate::game::scheduler::TickScheduler;
    use glam::{Quat, Vec2};
    use uuid::Uuid;

    fn input(sequence: u32, movement: Vec2, position: Vec3) -> PlayerInput {
        PlayerInput {
            timestamp: 0.0,
            sequence,
            position,
            rotation: Quat::IDENTITY,
            movement,
            actions: Actions::NONE,
        }
    }

    fn avatar(store: &EntityStore, player: PlayerControlled) -> EntityId {
        let id = store.spawn();
        store.set(id, Transform::default());
        store.set(id, Velocity::default());
        store.set(id, CombatComponent::default());
        store.set(id, player);
        id
    }

    fn scheduler() -> TickScheduler {
        let mut s = TickScheduler::new();
        s.register(MovementSystem::new());
        s
    }

    #[test]
    fn local_input_integrates_movement() {
        let store = EntityStore::new();
        let queue = InputQueue::new();
        let id = avatar(&store, PlayerControlled::local());

        queue.push(id, input(1, Vec2::new(0.0, 1.0), Vec3::ZERO)).expect("queued");
        let mut s = scheduler();
        s.run_tick(&store, &queue, 0.5);

        let t = store.get::<Transform>(id).expect("transform");
        assert!((t.position - Vec3::new(0.0, 0.0, -2.5)).length() < 1e-4, "{:?}", t.position);
        assert_eq!(store.get::<PlayerControlled>(id).and_then(|p| p.last_applied_seq), Some(1));
    }

    #[test]
    fn remote_input_snaps_to_reported_position() {
        let store = EntityStore::new();
        let queue = InputQueue::new();
        let id = avatar(&store, PlayerControlled::remote(Uuid::new_v4()));

        queue.push(id, input(7, Vec2::ZERO, Vec3::new(4.0, 0.0, 2.0))).expect("queued");
        let mut s = scheduler();
        s.run_tick(&store, &queue, 0.016);

        let t = store.get::<Transform>(id).expect("transform");
        assert!((t.position - Vec3::new(4.0, 0.0, 2.0)).length() < 1e-4);
    }

    #[test]
    fn malformed_input_is_dropped() {
        let store = EntityStore::new();
        let queue = InputQueue::new();
        let id = avatar(&store, PlayerControlled::local());

        let mut bad = input(1, Vec2::new(0.0, 1.0), Vec3::ZERO);
        bad.actions = Actions::from_bits(0x80);
        queue.push(id, bad).expect("queued");

        let mut s = scheduler();
        s.run_tick(&store, &queue, 0.5);

        let t = store.get::<Transform>(id).expect("transform");
        assert_eq!(t.position, Vec3::ZERO);
        assert_eq!(store.get::<PlayerControlled>(id).and_then(|p| p.last_applied_seq), None);
    }

    #[test]
    fn dead_avatars_do_not_move() {
        let store = EntityStore::new();
        let queue = InputQueue::new();
        let id = avatar(&store, PlayerControlled::local());
        store.with_mut::<CombatComponent, _>(id, |c| {
            c.health = 0.0;
            c.refresh_state();
        });
        store.set(id, Velocity(Vec3::new(3.0, 0.0, 0.0)));

        queue.push(id, input(1, Vec2::new(0.0, 1.0), Vec3::ZERO)).expect("queued");
        let mut s = scheduler();
        s.run_tick(&store, &queue, 0.5);

        assert_eq!(store.get::<Transform>(id).map(|t| t.position), Some(Vec3::ZERO));
    }

    #[test]
    fn projectiles_are_left_alone() {
        let store = EntityStore::new();
        let shell = store.spawn();
        store.set(shell, Transform::at(Vec3::new(0.0, 5.0, 0.0)));
        store.set(shell, Velocity(Vec3::new(10.0, 0.0, 0.0)));
        store.set(
            shell,
            Projectile {
                owner: EntityId::new(),
                damage: 10.0,
                damage_type: crate::game::combat::DamageType::Explosion,
                radius: 0.3,
                lifetime_remaining: 1.0,
            },
        );

        let mut s = scheduler();
        s.run_tick(&store, &InputQueue::new(), 0.1);

        assert_eq!(store.get::<Transform>(shell).map(|t| t.position), Some(Vec3::new(0.0, 5.0, 0.0)));
        assert_eq!(store.get::<Velocity>(shell).map(|v| v.0), Some(Vec3::new(10.0, 0.0, 0.0)));
    }

    #[test]
    fn ai_walks_toward_intent() {
        let store = EntityStore::new();
        let id = store.spawn();
        store.set(id, Transform::default());
        store.set(id, Velocity::default());
        let mut brain = AiBrain::default();
        brain.intent.move_to = Some(Vec3::new(10.0, 0.0, 0.0));
        store.set(id, brain);

        let mut s = scheduler();
        s.run_tick(&store, &InputQueue::new(), 1.0);

        let t = store.get::<Transform>(id).expect("transform");
        assert!((t.position.x - 3.5).abs() < 1e-4);
        assert!((t.forward() - Vec3::X).length() < 1e-4);
    }
}
