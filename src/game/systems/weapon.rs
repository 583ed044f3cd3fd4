//! Firing, reloading, and hit registration

use glam::Vec3;
use tracing::{debug, warn};

use crate::ecs::{ComponentType, EntityId};
use crate::game::combat::{DamageRequest, DamageType};
use crate::game::components::{
    AiBrain, Collider, CombatComponent, Projectile, Transform, Velocity, Weapon, WeaponKind,
};
use crate::game::events::GameEvent;
use crate::game::physics::{CapsuleHit, PhysicsSystem, EYE_HEIGHT};
use crate::game::scheduler::TickContext;
use crate::net::protocol::Actions;

use super::{SimSystem, SystemError, WEAPON_PRIORITY};

/// Distance in front of the muzzle where projectiles appear
const MUZZLE_OFFSET: f32 = 0.6;

/// What the owner asked of its weapon this tick
#[derive(Debug, Clone, Copy, Default)]
struct Trigger {
    fire: bool,
    reload: bool,
}

/// A discharge that passed the weapon's checks
#[derive(Debug, Clone, Copy)]
struct Discharge {
    kind: WeaponKind,
    damage: f32,
    range: f32,
    projectile_speed: f32,
    projectile_lifetime: f32,
    projectile_radius: f32,
}

/// Turns fire/reload requests into shots. Hitscan weapons ray-test every
/// combat-capable collider; launchers spawn projectile entities.
#[derive(Debug, Default)]
pub struct WeaponSystem;

impl WeaponSystem {
    pub fn new() -> Self {
        Self
    }

    fn trigger(ctx: &TickContext<'_>, entity: EntityId) -> Trigger {
        let mut trigger = Trigger::default();
        for input in ctx.inputs.for_entity(entity) {
            if !input.is_well_formed() {
                debug!(entity = %entity, sequence = input.sequence, "Ignoring malformed input");
                continue;
            }
            trigger.fire |= input.actions.contains(Actions::FIRING);
            trigger.reload |= input.actions.contains(Actions::RELOADING);
        }
        if let Some(brain) = ctx.store.get::<AiBrain>(entity) {
            trigger.fire |= brain.intent.fire;
        }
        trigger
    }

    /// Advance timers and decide whether the weapon discharges this tick
    fn operate(weapon: &mut Weapon, trigger: Trigger, dt: f32) -> (Option<Discharge>, bool) {
        weapon.cooldown = (weapon.cooldown - dt).max(0.0);

        if let Some(remaining) = weapon.reload_remaining {
            let remaining = remaining - dt;
            if remaining <= 0.0 {
                let loaded = (weapon.magazine_size - weapon.ammo).min(weapon.reserve_ammo);
                weapon.ammo += loaded;
                weapon.reserve_ammo -= loaded;
                weapon.reload_remaining = None;
            } else {
                weapon.reload_remaining = Some(remaining);
            }
        }

        let wants_reload = trigger.reload || (trigger.fire && weapon.ammo == 0);
        if wants_reload && weapon.can_reload() {
            weapon.reload_remaining = Some(weapon.reload_time);
            return (None, true);
        }

        if !trigger.fire || !weapon.can_fire() {
            return (None, false);
        }

        weapon.ammo -= 1;
        weapon.cooldown = weapon.fire_interval;
        let discharge = Discharge {
            kind: weapon.kind,
            damage: weapon.damage,
            range: weapon.range,
            projectile_speed: weapon.projectile_speed,
            projectile_lifetime: weapon.projectile_lifetime,
            projectile_radius: weapon.projectile_radius,
        };
        (Some(discharge), false)
    }

    /// Nearest living collider along the ray, excluding the shooter
    fn trace(ctx: &TickContext<'_>, shooter: EntityId, origin: Vec3, direction: Vec3, range: f32) -> Option<(EntityId, CapsuleHit)> {
        let candidates = ctx.query(&[
            ComponentType::of::<CombatComponent>(),
            ComponentType::of::<Transform>(),
            ComponentType::of::<Collider>(),
        ]);

        let mut best: Option<(EntityId, CapsuleHit)> = None;
        for target in candidates {
            if target == shooter {
                continue;
            }
            if ctx.store.get::<CombatComponent>(target).map(|c| c.is_dead()).unwrap_or(true) {
                continue;
            }
            let (Some(transform), Some(collider)) = (ctx.store.get::<Transform>(target), ctx.store.get::<Collider>(target)) else {
                continue;
            };
            if let Some(hit) = PhysicsSystem::ray_capsule(origin, direction, range, transform.position, &collider) {
                if best.as_ref().map(|(_, b)| hit.distance < b.distance).unwrap_or(true) {
                    best = Some((target, hit));
                }
            }
        }
        best
    }

    fn fire(ctx: &mut TickContext<'_>, shooter: EntityId, transform: &Transform, discharge: Discharge) {
        let origin = transform.position + Vec3::Y * EYE_HEIGHT;
        let direction = transform.forward().normalize_or_zero();

        match discharge.kind {
            WeaponKind::Hitscan => {
                ctx.emit(GameEvent::Shot {
                    shooter,
                    origin,
                    direction,
                    projectile: None,
                });

                let Some((target, hit)) = Self::trace(ctx, shooter, origin, direction, discharge.range) else {
                    return;
                };
                let request = DamageRequest {
                    target,
                    amount: discharge.damage,
                    damage_type: DamageType::Bullet,
                    body_part: hit.body_part,
                    source: Some(shooter),
                };
                match ctx.apply_damage(request) {
                    Ok(result) => debug!(shooter = %shooter, target = %target, ?result, "Hitscan hit"),
                    Err(e) => warn!(shooter = %shooter, error = %e, "Dropping invalid hit"),
                }
            }
            WeaponKind::Launcher => {
                let projectile = ctx.store.spawn();
                let spawn = Transform {
                    position: origin + direction * MUZZLE_OFFSET,
                    rotation: transform.rotation,
                };
                ctx.store.set(projectile, spawn);
                ctx.store.set(projectile, Velocity(direction * discharge.projectile_speed));
                ctx.store.set(
                    projectile,
                    Projectile {
                        owner: shooter,
                        damage: discharge.damage,
                        damage_type: DamageType::Explosion,
                        radius: discharge.projectile_radius,
                        lifetime_remaining: discharge.projectile_lifetime,
                    },
                );

                ctx.emit(GameEvent::Shot {
                    shooter,
                    origin,
                    direction,
                    projectile: Some(projectile),
                });
            }
        }
    }
}

impl SimSystem for WeaponSystem {
    fn name(&self) -> &'static str {
        "weapon"
    }

    fn priority(&self) -> i32 {
        WEAPON_PRIORITY
    }

    fn update(&mut self, ctx: &mut TickContext<'_>) -> Result<(), SystemError> {
        let armed = ctx.query(&[ComponentType::of::<Weapon>(), ComponentType::of::<Transform>()]);
        let dt = ctx.delta_time;

        for shooter in armed {
            if ctx.store.get::<CombatComponent>(shooter).map(|c| c.is_dead()).unwrap_or(false) {
                continue;
            }

            let trigger = Self::trigger(ctx, shooter);
            let Some((discharge, reloading)) = ctx
                .store
                .with_mut::<Weapon, _>(shooter, |weapon| Self::operate(weapon, trigger, dt))
            else {
                continue;
            };

            if reloading {
                ctx.emit(GameEvent::Reload { entity: shooter });
            }
            let (Some(discharge), Some(transform)) = (discharge, ctx.store.get::<Transform>(shooter)) else {
                continue;
            };
            Self::fire(ctx, shooter, &transform, discharge);
        }
        Ok(())
    }
}
