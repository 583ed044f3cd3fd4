//! Health regeneration

use crate::ecs::ComponentType;
use crate::game::components::CombatComponent;
use crate::game::scheduler::TickContext;

use super::{SimSystem, SystemError, COMBAT_PRIORITY};

/// Regenerates health for entities that have rested long enough since their
/// last hit. Damage itself arrives through the resolver from Weapon and
/// Projectile.
#[derive(Debug, Default)]
pub struct CombatSystem;

impl CombatSystem {
    pub fn new() -> Self {
        Self
    }
}

impl SimSystem for CombatSystem {
    fn name(&self) -> &'static str {
        "combat"
    }

    fn priority(&self) -> i32 {
        COMBAT_PRIORITY
    }

    fn update(&mut self, ctx: &mut TickContext<'_>) -> Result<(), SystemError> {
        let entities = ctx.query(&[ComponentType::of::<CombatComponent>()]);
        let resolver = ctx.resolver();
        let (now, dt) = (ctx.now, ctx.delta_time);

        ctx.store.view_mut::<CombatComponent, _>(|combats| {
            for id in entities {
                if let Some(combat) = combats.get_mut(id) {
                    resolver.regenerate(combat, now, dt);
                }
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ecs::EntityStore;
    use crate::game::input::InputQueue;
    use crate::game::scheduler::TickScheduler;

    #[test]
    fn regenerates_rested_entities_only() {
        let store = EntityStore::new();
        let rested = store.spawn();
        let mut combat = CombatComponent::new(100.0, 0.0);
        combat.health = 50.0;
        combat.refresh_state();
        store.set(rested, combat.clone());

        let fresh = store.spawn();
        combat.last_damage_time = Some(0.0);
        store.set(fresh, combat);

        let mut scheduler = TickScheduler::new();
        scheduler.register(CombatSystem::new());
        let queue = InputQueue::new();
        for _ in 0..10 {
            scheduler.run_tick(&store, &queue, 0.1);
        }

        let rested_health = store.get::<CombatComponent>(rested).map(|c| c.health).unwrap_or_default();
        let fresh_health = store.get::<CombatComponent>(fresh).map(|c| c.health).unwrap_or_default();
        assert!((rested_health - 55.0).abs() < 1e-3, "{rested_health}");
        assert_eq!(fresh_health, 50.0);
    }
}
