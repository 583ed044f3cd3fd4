//! Combat resolution - damage application, armor, invulnerability, regen

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use uuid::Uuid;

use crate::ecs::{EntityId, EntityStore};

use super::components::{CombatComponent, PlayerControlled, Score, REGEN_DELAY, REGEN_RATE};
use super::events::GameEvent;

/// Fraction of post-multiplier damage armor can soak up
pub const ARMOR_ABSORPTION: f32 = 0.5;

/// Hit location
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BodyPart {
    Head,
    Chest,
    Stomach,
    Arm,
    Leg,
}

impl BodyPart {
    pub fn multiplier(self) -> f32 {
        match self {
            BodyPart::Head => 4.0,
            BodyPart::Chest | BodyPart::Stomach => 1.0,
            BodyPart::Arm | BodyPart::Leg => 0.75,
        }
    }

    /// Classify an impact by its height above the target's feet, as a fraction
    /// of the target's height, and its horizontal distance from the target's
    /// center line as a fraction of the target's radius.
    pub fn from_impact(height_fraction: f32, lateral_fraction: f32) -> Self {
        if height_fraction >= 0.85 {
            BodyPart::Head
        } else if height_fraction < 0.45 {
            BodyPart::Leg
        } else if lateral_fraction > 0.7 {
            BodyPart::Arm
        } else if height_fraction >= 0.62 {
            BodyPart::Chest
        } else {
            BodyPart::Stomach
        }
    }
}

/// Source of damage. Informational: it does not change the multiplier table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DamageType {
    Bullet,
    Explosion,
    Melee,
    Fall,
    Environmental,
}

/// Outcome of one damage application
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DamageResult {
    /// Target has no combat component, or is already dead
    NoDamage,
    /// Target is inside its post-hit invulnerability window
    Invulnerable,
    /// Damage applied; `amount` is what reached health after armor
    Damaged { amount: f32 },
    /// This hit took health to zero
    Killed,
    /// Target is owned by a remote peer; the hit was handed to that peer to resolve
    Forwarded,
}

#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
pub enum CombatError {
    #[error("Invalid damage amount: {0}")]
    InvalidAmount(f32),
}

/// A single hit registration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DamageRequest {
    pub target: EntityId,
    pub amount: f32,
    pub damage_type: DamageType,
    pub body_part: BodyPart,
    pub source: Option<EntityId>,
}

/// A hit on an avatar another peer owns. Only the owner mutates that avatar's
/// `CombatComponent`, so the request travels to it unresolved.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RemoteHit {
    pub owner: Uuid,
    pub request: DamageRequest,
}

/// Side effects of damage resolution that outlive the call: events for the tick
/// report, entities whose despawn must wait until the tick ends, and hits bound
/// for remote owners.
#[derive(Debug, Default)]
pub struct CombatOutcome {
    pub events: Vec<GameEvent>,
    pub despawns: Vec<EntityId>,
    pub forwarded: Vec<RemoteHit>,
}

/// Applies damage to `CombatComponent`s.
///
/// Stateless and synchronous. Each call takes the combat storage's write lock
/// for the duration of the mutation, so two calls against the same target never
/// interleave.
#[derive(Debug, Clone, Copy, Default)]
pub struct CombatResolver;

impl CombatResolver {
    pub fn new() -> Self {
        Self
    }

    pub fn apply_damage(
        &self,
        store: &EntityStore,
        request: DamageRequest,
        now: f64,
        outcome: &mut CombatOutcome,
    ) -> Result<DamageResult, CombatError> {
        Self::validate(&request)?;

        let applied = store.with_mut::<CombatComponent, _>(request.target, |combat| {
            // The window is checked first, so a corpse hit right after the
            // killing blow reports Invulnerable
            if !combat.is_vulnerable(now) {
                return (DamageResult::Invulnerable, 0.0);
            }
            if combat.is_dead() {
                return (DamageResult::NoDamage, 0.0);
            }

            let mut effective = request.amount * request.body_part.multiplier();

            let absorbed = (effective * ARMOR_ABSORPTION).min(combat.armor);
            combat.armor -= absorbed;
            effective -= absorbed;

            combat.health = (combat.health - effective).max(0.0);
            combat.last_damage_time = Some(now);
            combat.last_damage_dealer = request.source;
            combat.refresh_state();

            if combat.health <= 0.0 {
                (DamageResult::Killed, effective)
            } else {
                (DamageResult::Damaged { amount: effective }, effective)
            }
        });

        let (result, dealt) = match applied {
            Some(applied) => applied,
            None => return Ok(DamageResult::NoDamage),
        };

        match result {
            DamageResult::Damaged { .. } | DamageResult::Killed => {
                outcome.events.push(GameEvent::Hit {
                    attacker: request.source,
                    target: request.target,
                    body_part: request.body_part,
                    damage_type: request.damage_type,
                    damage: dealt,
                });
                if result == DamageResult::Killed {
                    self.handle_death(store, &request, outcome);
                }
            }
            DamageResult::Invulnerable => {
                debug!(target_entity = %request.target, "Hit ignored, target invulnerable");
            }
            DamageResult::NoDamage | DamageResult::Forwarded => {}
        }

        Ok(result)
    }

    /// Reject amounts that are negative or not finite
    pub fn validate(request: &DamageRequest) -> Result<(), CombatError> {
        if !request.amount.is_finite() || request.amount < 0.0 {
            return Err(CombatError::InvalidAmount(request.amount));
        }
        Ok(())
    }

    /// Kill attribution and despawn scheduling
    fn handle_death(&self, store: &EntityStore, request: &DamageRequest, outcome: &mut CombatOutcome) {
        let victim = request.target;

        store.with_mut::<Score, _>(victim, |score| score.deaths += 1);
        if let Some(killer) = request.source.filter(|k| *k != victim) {
            store.with_mut::<Score, _>(killer, |score| score.kills += 1);
        }

        outcome.events.push(GameEvent::Kill {
            killer: request.source,
            victim,
            damage_type: request.damage_type,
        });

        // Avatars stay in the world, dead, until gameplay respawns them
        if !store.has::<PlayerControlled>(victim) {
            outcome.despawns.push(victim);
        }

        info!(
            victim = %victim,
            killer = ?request.source.map(|k| k.to_string()),
            damage_type = ?request.damage_type,
            "Entity killed"
        );
    }

    /// Per-tick regeneration. Returns the health gained.
    pub fn regenerate(&self, combat: &mut CombatComponent, now: f64, delta_time: f32) -> f32 {
        if combat.is_dead() || combat.health >= combat.max_health {
            return 0.0;
        }
        let rested = match combat.last_damage_time {
            Some(t) => now - t > REGEN_DELAY,
            None => true,
        };
        if !rested || !delta_time.is_finite() || delta_time <= 0.0 {
            return 0.0;
        }

        let before = combat.health;
        combat.health = (combat.health + REGEN_RATE * delta_time).min(combat.max_health);
        combat.refresh_state();
        combat.health - before
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(store: &EntityStore, health: f32, armor: f32) -> EntityId {
        let id = store.spawn();
        let mut combat = CombatComponent::new(100.0, armor);
        combat.health = health;
        combat.refresh_state();
        store.set(id, combat);
        id
    }

    fn hit(target: EntityId, amount: f32, body_part: BodyPart) -> DamageRequest {
        DamageRequest {
            target,
            amount,
            damage_type: DamageType::Bullet,
            body_part,
            source: None,
        }
    }

    #[test]
    fn missing_component_is_no_damage() {
        let store = EntityStore::new();
        let id = store.spawn();
        let mut out = CombatOutcome::default();
        let result = CombatResolver.apply_damage(&store, hit(id, 10.0, BodyPart::Chest), 0.0, &mut out);
        assert_eq!(result, Ok(DamageResult::NoDamage));
        assert!(out.events.is_empty());
    }

    #[test]
    fn negative_and_nan_amounts_rejected() {
        let store = EntityStore::new();
        let id = target(&store, 100.0, 0.0);
        let mut out = CombatOutcome::default();
        assert!(CombatResolver.apply_damage(&store, hit(id, -1.0, BodyPart::Chest), 0.0, &mut out).is_err());
        assert!(CombatResolver.apply_damage(&store, hit(id, f32::NAN, BodyPart::Chest), 0.0, &mut out).is_err());
        assert_eq!(store.get::<CombatComponent>(id).map(|c| c.health), Some(100.0));
    }

    #[test]
    fn body_part_multipliers() {
        for (part, expected) in [
            (BodyPart::Head, 40.0),
            (BodyPart::Chest, 85.0),
            (BodyPart::Stomach, 85.0),
            (BodyPart::Arm, 88.75),
            (BodyPart::Leg, 88.75),
        ] {
            let store = EntityStore::new();
            let id = target(&store, 100.0, 0.0);
            let mut out = CombatOutcome::default();
            CombatResolver
                .apply_damage(&store, hit(id, 15.0, part), 0.0, &mut out)
                .expect("valid hit");
            let health = store.get::<CombatComponent>(id).map(|c| c.health).unwrap_or_default();
            assert!((health - expected).abs() < 1e-4, "{part:?}: {health}");
        }
    }

    #[test]
    fn dead_is_terminal() {
        let store = EntityStore::new();
        let id = target(&store, 10.0, 0.0);
        let mut out = CombatOutcome::default();

        let first = CombatResolver.apply_damage(&store, hit(id, 50.0, BodyPart::Chest), 0.0, &mut out);
        assert_eq!(first, Ok(DamageResult::Killed));

        let inside_window = CombatResolver.apply_damage(&store, hit(id, 50.0, BodyPart::Chest), 0.2, &mut out);
        assert_eq!(inside_window, Ok(DamageResult::Invulnerable));

        let second = CombatResolver.apply_damage(&store, hit(id, 50.0, BodyPart::Chest), 10.0, &mut out);
        assert_eq!(second, Ok(DamageResult::NoDamage));
        assert_eq!(store.get::<CombatComponent>(id).map(|c| c.health), Some(0.0));

        let kills = out.events.iter().filter(|e| matches!(e, GameEvent::Kill { .. })).count();
        assert_eq!(kills, 1);
    }

    #[test]
    fn kill_attribution_and_despawn_scheduling() {
        let store = EntityStore::new();
        let shooter = store.spawn();
        store.set(shooter, Score::default());
        let victim = target(&store, 5.0, 0.0);
        store.set(victim, Score::default());

        let mut out = CombatOutcome::default();
        let request = DamageRequest {
            source: Some(shooter),
            ..hit(victim, 20.0, BodyPart::Leg)
        };
        assert_eq!(CombatResolver.apply_damage(&store, request, 1.0, &mut out), Ok(DamageResult::Killed));

        assert_eq!(store.get::<Score>(shooter).map(|s| s.kills), Some(1));
        assert_eq!(store.get::<Score>(victim).map(|s| s.deaths), Some(1));
        assert_eq!(out.despawns, vec![victim]);
    }

    #[test]
    fn dead_players_are_not_despawned() {
        let store = EntityStore::new();
        let victim = target(&store, 5.0, 0.0);
        store.set(victim, PlayerControlled::local());
        let mut out = CombatOutcome::default();
        CombatResolver
            .apply_damage(&store, hit(victim, 20.0, BodyPart::Chest), 1.0, &mut out)
            .expect("valid hit");
        assert!(out.despawns.is_empty());
    }

    #[test]
    fn regen_waits_for_delay_and_clamps() {
        let mut combat = CombatComponent::new(100.0, 0.0);
        combat.health = 98.0;
        combat.last_damage_time = Some(0.0);

        assert_eq!(CombatResolver.regenerate(&mut combat, 4.0, 0.1), 0.0);
        assert_eq!(CombatResolver.regenerate(&mut combat, 5.0, 0.1), 0.0);

        let gained = CombatResolver.regenerate(&mut combat, 5.1, 0.1);
        assert!((gained - 0.5).abs() < 1e-5);

        CombatResolver.regenerate(&mut combat, 6.0, 1.0);
        assert_eq!(combat.health, 100.0);
    }

    #[test]
    fn regen_skips_dead() {
        let mut combat = CombatComponent::new(100.0, 0.0);
        combat.health = 0.0;
        combat.refresh_state();
        assert_eq!(CombatResolver.regenerate(&mut combat, 100.0, 1.0), 0.0);
        assert_eq!(combat.health, 0.0);
    }

    #[test]
    fn impact_classification() {
        assert_eq!(BodyPart::from_impact(0.9, 0.0), BodyPart::Head);
        assert_eq!(BodyPart::from_impact(0.7, 0.1), BodyPart::Chest);
        assert_eq!(BodyPart::from_impact(0.5, 0.1), BodyPart::Stomach);
        assert_eq!(BodyPart::from_impact(0.6, 0.9), BodyPart::Arm);
        assert_eq!(BodyPart::from_impact(0.2, 0.0), BodyPart::Leg);
    }
}
