//! Tick ordering across the real simulation systems

use glam::Vec3;
use tactical_mesh::ecs::EntityStore;
use tactical_mesh::ecs::{ComponentType, EntityId};
use tactical_mesh::game::components::{
    AiBrain, Collider, CombatComponent, PlayerControlled, Projectile, Transform, Velocity, Weapon,
};
use tactical_mesh::game::input::InputQueue;
use tactical_mesh::game::scheduler::TickScheduler;
use tactical_mesh::game::systems::{AiSystem, CombatSystem, MovementSystem, ProjectileSystem, WeaponSystem};

fn populated_store() -> EntityStore {
    let store = EntityStore::new();

    let player = store.spawn();
    store.set(player, Transform::at(Vec3::ZERO));
    store.set(player, Velocity::default());
    store.set(player, Collider::default());
    store.set(player, CombatComponent::default());
    store.set(player, PlayerControlled::local());
    store.set(player, Weapon::rifle());

    let bot = store.spawn();
    store.set(bot, Transform::at(Vec3::new(0.0, 0.0, -12.0)));
    store.set(bot, Velocity::default());
    store.set(bot, Collider::default());
    store.set(bot, CombatComponent::default());
    store.set(bot, AiBrain::default());
    store.set(bot, Weapon::launcher());

    store
}

#[test]
fn systems_run_in_ascending_priority_every_tick() {
    let store = populated_store();
    let queue = InputQueue::new();

    // Registration order deliberately scrambled
    let mut scheduler = TickScheduler::new();
    scheduler.register(ProjectileSystem::new());
    scheduler.register(AiSystem::new(42));
    scheduler.register(CombatSystem::new());
    scheduler.register(WeaponSystem::new());
    scheduler.register(MovementSystem::new());

    let dt = 1.0 / 60.0;
    let mut flights_checked = 0;
    for _ in 0..120 {
        let in_flight: Vec<(EntityId, Vec3, Vec3)> = store
            .query(&[ComponentType::of::<Projectile>()])
            .into_iter()
            .filter_map(|id| Some((id, store.get::<Transform>(id)?.position, store.get::<Velocity>(id)?.0)))
            .collect();

        let report = scheduler.run_tick(&store, &queue, dt);
        let priorities: Vec<i32> = report.invocations.iter().map(|(_, p)| *p).collect();
        assert_eq!(priorities, vec![10, 15, 20, 25, 30]);
        assert!(report.failures.is_empty(), "failures: {:?}", report.failures);

        // Projectiles still in flight moved exactly one step along their velocity
        for (id, before, velocity) in in_flight {
            if let Some(after) = store.get::<Transform>(id).map(|t| t.position) {
                let travelled = after - before;
                assert!((travelled - velocity * dt).length() < 1e-4, "projectile moved {travelled:?}");
                flights_checked += 1;
            }
        }
    }
    assert!(flights_checked > 0, "the launcher bot never fired");

    assert_eq!(
        scheduler.system_names(),
        vec!["combat", "movement", "weapon", "ai", "projectile"]
    );
    assert_eq!(scheduler.tick(), 120);
}
