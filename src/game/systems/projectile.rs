//! Projectile flight, impact, and expiry

use std::collections::HashSet;

use glam::Vec3;
use tracing::{debug, warn};

use crate::ecs::{ComponentType, EntityId};
use crate::game::combat::{BodyPart, DamageRequest};
use crate::game::components::{Collider, CombatComponent, Projectile, Transform, Velocity};
use crate::game::physics::PhysicsSystem;
use crate::game::scheduler::TickContext;

use super::{SimSystem, SystemError, PROJECTILE_PRIORITY};

/// Upper bound on collision sub-steps per projectile per tick
const MAX_SUBSTEPS: u32 = 8;

/// Moves projectiles, applies damage on the first collider touched, and
/// expires projectiles whose lifetime ran out. A projectile never hits its
/// owner and never hits more than once.
#[derive(Debug, Default)]
pub struct ProjectileSystem {
    spent: HashSet<EntityId>,
}

impl ProjectileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    fn sweep(
        targets: &[(EntityId, Vec3, Collider)],
        owner: EntityId,
        from: Vec3,
        to: Vec3,
        radius: f32,
    ) -> Option<(EntityId, BodyPart)> {
        let travel = from.distance(to);
        let step = radius.max(0.05);
        let substeps = ((travel / step).ceil() as u32).clamp(1, MAX_SUBSTEPS);

        for i in 1..=substeps {
            let point = from.lerp(to, i as f32 / substeps as f32);
            for (target, feet, collider) in targets {
                if *target == owner {
                    continue;
                }
                if let Some(part) = PhysicsSystem::sphere_capsule(point, radius, *feet, collider) {
                    return Some((*target, part));
                }
            }
        }
        None
    }
}

impl SimSystem for ProjectileSystem {
    fn name(&self) -> &'static str {
        "projectile"
    }

    fn priority(&self) -> i32 {
        PROJECTILE_PRIORITY
    }

    fn update(&mut self, ctx: &mut TickContext<'_>) -> Result<(), SystemError> {
        let dt = ctx.delta_time;
        let projectiles = ctx.query(&[
            ComponentType::of::<Projectile>(),
            ComponentType::of::<Transform>(),
            ComponentType::of::<Velocity>(),
        ]);
        // Spent ids are only needed until their deferred despawn lands
        self.spent.retain(|id| ctx.store.is_alive(*id));

        if projectiles.is_empty() {
            return Ok(());
        }

        let targets: Vec<(EntityId, Vec3, Collider)> = ctx
            .query(&[
                ComponentType::of::<CombatComponent>(),
                ComponentType::of::<Transform>(),
                ComponentType::of::<Collider>(),
            ])
            .into_iter()
            .filter(|id| !ctx.store.get::<CombatComponent>(*id).map(|c| c.is_dead()).unwrap_or(true))
            .filter_map(|id| Some((id, ctx.store.get::<Transform>(id)?.position, ctx.store.get::<Collider>(id)?)))
            .collect();

        for id in projectiles {
            if self.spent.contains(&id) {
                continue;
            }
            let (Some(projectile), Some(transform), Some(velocity)) = (
                ctx.store.get::<Projectile>(id),
                ctx.store.get::<Transform>(id),
                ctx.store.get::<Velocity>(id),
            ) else {
                continue;
            };

            let lifetime = projectile.lifetime_remaining - dt;
            if lifetime <= 0.0 {
                self.spent.insert(id);
                ctx.despawn(id);
                debug!(projectile = %id, "Projectile expired");
                continue;
            }

            let from = transform.position;
            let to = from + velocity.0 * dt;
            ctx.store.with_mut::<Transform, _>(id, |t| t.position = to);
            ctx.store.with_mut::<Projectile, _>(id, |p| p.lifetime_remaining = lifetime);

            let Some((target, body_part)) = Self::sweep(&targets, projectile.owner, from, to, projectile.radius) else {
                continue;
            };

            self.spent.insert(id);
            ctx.despawn(id);

            let request = DamageRequest {
                target,
                amount: projectile.damage,
                damage_type: projectile.damage_type,
                body_part,
                source: Some(projectile.owner),
            };
            match ctx.apply_damage(request) {
                Ok(result) => debug!(projectile = %id, target = %target, ?result, "Projectile impact"),
                Err(e) => warn!(projectile = %id, error = %e, "Dropping invalid projectile hit"),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ecs::EntityStore;
    use crate::game::combat::DamageType;
    use crate::game::events::GameEvent;
    use crate::game::input::InputQueue;
    use crate::game::scheduler::TickScheduler;

    fn target(store: &EntityStore, position: Vec3) -> EntityId {
        let id = store.spawn();
        store.set(id, Transform::at(position));
        store.set(id, Collider::default());
        store.set(id, CombatComponent::new(100.0, 0.0));
        id
    }

    fn launch(store: &EntityStore, owner: EntityId, from: Vec3, velocity: Vec3, lifetime: f32) -> EntityId {
        let id = store.spawn();
        store.set(id, Transform::at(from));
        store.set(id, Velocity(velocity));
        store.set(
            id,
            Projectile {
                owner,
                damage: 20.0,
                damage_type: DamageType::Explosion,
                radius: 0.3,
                lifetime_remaining: lifetime,
            },
        );
        id
    }

    fn scheduler() -> TickScheduler {
        let mut s = TickScheduler::new();
        s.register(ProjectileSystem::new());
        s
    }

    #[test]
    fn impact_damages_once_and_despawns() {
        let store = EntityStore::new();
        let owner = store.spawn();
        let victim = target(&store, Vec3::new(0.0, 0.0, -2.0));
        let shell = launch(&store, owner, Vec3::new(0.0, 1.0, 0.0), Vec3::new(0.0, 0.0, -40.0), 4.0);

        let mut s = scheduler();
        let queue = InputQueue::new();
        let report = s.run_tick(&store, &queue, 0.05);

        let hits = report
            .events
            .iter()
            .filter(|e| matches!(e, GameEvent::Hit { damage_type: DamageType::Explosion, .. }))
            .count();
        assert_eq!(hits, 1);
        assert!(!store.is_alive(shell));
        assert_eq!(store.get::<CombatComponent>(victim).map(|c| c.health), Some(80.0));
    }

    #[test]
    fn flight_alongside_movement_travels_once_per_tick() {
        use crate::game::systems::MovementSystem;

        let store = EntityStore::new();
        let owner = store.spawn();
        let victim = target(&store, Vec3::new(2.0, 0.0, 0.0));
        let shell = launch(&store, owner, Vec3::new(0.0, 1.0, 0.0), Vec3::new(10.0, 0.0, 0.0), 4.0);

        let mut s = scheduler();
        s.register(MovementSystem::new());
        let queue = InputQueue::new();

        let report = s.run_tick(&store, &queue, 0.1);
        assert!(report.events.is_empty());
        let position = store.get::<Transform>(shell).map(|t| t.position).expect("in flight");
        assert!((position - Vec3::new(1.0, 1.0, 0.0)).length() < 1e-5, "{position:?}");

        let report = s.run_tick(&store, &queue, 0.1);
        assert!(report.events.iter().any(|e| matches!(e, GameEvent::Hit { target, .. } if *target == victim)));
        assert!(!store.is_alive(shell));
        assert_eq!(store.get::<CombatComponent>(victim).map(|c| c.health), Some(80.0));
    }

    #[test]
    fn owner_is_never_hit() {
        let store = EntityStore::new();
        let owner = target(&store, Vec3::ZERO);
        let shell = launch(&store, owner, Vec3::new(0.0, 1.0, 0.0), Vec3::new(0.0, 0.0, -1.0), 4.0);

        let mut s = scheduler();
        s.run_tick(&store, &InputQueue::new(), 0.05);

        assert!(store.is_alive(shell));
        assert_eq!(store.get::<CombatComponent>(owner).map(|c| c.health), Some(100.0));
    }

    #[test]
    fn expires_after_lifetime() {
        let store = EntityStore::new();
        let owner = store.spawn();
        let shell = launch(&store, owner, Vec3::new(0.0, 1.0, 0.0), Vec3::new(0.0, 0.0, -1.0), 0.1);

        let mut s = scheduler();
        let queue = InputQueue::new();
        s.run_tick(&store, &queue, 0.05);
        assert!(store.is_alive(shell));
        let report = s.run_tick(&store, &queue, 0.06);
        assert!(report.despawned.contains(&shell));
        assert!(!store.is_alive(shell));
    }
}
