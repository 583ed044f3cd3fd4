//! Non-player decision making

use glam::Vec3;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::trace;

use crate::ecs::{ComponentType, EntityId};
use crate::game::components::{AiBrain, AiIntent, CombatComponent, PlayerControlled, Transform};
use crate::game::scheduler::TickContext;

use super::{SimSystem, SystemError, AI_PRIORITY};

/// Radius around the current position in which wander points are picked
const WANDER_RADIUS: f32 = 10.0;
/// Seconds between wander points
const WANDER_INTERVAL: f32 = 4.0;
/// Aim height on a standing target
const AIM_HEIGHT: f32 = 1.3;
/// Fraction of engage range at which the bot stops closing in
const HOLD_FRACTION: f32 = 0.6;

/// Picks a target for every AI entity and writes an intent that Movement and
/// Weapon act on during the next tick.
pub struct AiSystem {
    rng: ChaCha8Rng,
}

impl AiSystem {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    fn plan(&mut self, brain: &mut AiBrain, position: Vec3, target: Option<(EntityId, Vec3)>, dt: f32) -> AiIntent {
        if let Some((target, at)) = target {
            let distance = position.distance(at);
            let move_to = (distance > brain.engage_range * HOLD_FRACTION).then_some(at);
            brain.wander_timer = 0.0;
            return AiIntent {
                target: Some(target),
                move_to,
                look_at: Some(at + Vec3::Y * AIM_HEIGHT),
                fire: distance <= brain.engage_range,
            };
        }

        brain.wander_timer -= dt;
        let mut move_to = brain.intent.move_to.filter(|_| brain.intent.target.is_none());
        if brain.wander_timer <= 0.0 || move_to.is_none() {
            let offset = Vec3::new(
                self.rng.gen_range(-WANDER_RADIUS..WANDER_RADIUS),
                0.0,
                self.rng.gen_range(-WANDER_RADIUS..WANDER_RADIUS),
            );
            move_to = Some(position + offset);
            brain.wander_timer = WANDER_INTERVAL;
        }

        AiIntent {
            target: None,
            move_to,
            look_at: None,
            fire: false,
        }
    }
}

impl Default for AiSystem {
    fn default() -> Self {
        Self::new(0)
    }
}

impl SimSystem for AiSystem {
    fn name(&self) -> &'static str {
        "ai"
    }

    fn priority(&self) -> i32 {
        AI_PRIORITY
    }

    fn update(&mut self, ctx: &mut TickContext<'_>) -> Result<(), SystemError> {
        let bots = ctx.query(&[ComponentType::of::<AiBrain>(), ComponentType::of::<Transform>()]);
        if bots.is_empty() {
            return Ok(());
        }

        let hostiles: Vec<(EntityId, Vec3)> = ctx
            .query(&[
                ComponentType::of::<PlayerControlled>(),
                ComponentType::of::<CombatComponent>(),
                ComponentType::of::<Transform>(),
            ])
            .into_iter()
            .filter(|id| !ctx.store.get::<CombatComponent>(*id).map(|c| c.is_dead()).unwrap_or(true))
            .filter_map(|id| Some((id, ctx.store.get::<Transform>(id)?.position)))
            .collect();

        for bot in bots {
            let Some(position) = ctx.store.get::<Transform>(bot).map(|t| t.position) else {
                continue;
            };
            let Some(mut brain) = ctx.store.get::<AiBrain>(bot) else {
                continue;
            };

            if ctx.store.get::<CombatComponent>(bot).map(|c| c.is_dead()).unwrap_or(false) {
                brain.intent = AiIntent::default();
                ctx.store.set(bot, brain);
                continue;
            }

            let target = hostiles
                .iter()
                .filter(|(id, _)| *id != bot)
                .map(|(id, at)| (*id, *at, position.distance(*at)))
                .filter(|(_, _, d)| *d <= brain.sight_range)
                .min_by(|a, b| a.2.total_cmp(&b.2))
                .map(|(id, at, _)| (id, at));

            brain.intent = self.plan(&mut brain, position, target, ctx.delta_time);
            trace!(bot = %bot, target = ?brain.intent.target.map(|t| t.to_string()), fire = brain.intent.fire, "AI intent");
            ctx.store.set(bot, brain);
        }
        Ok(())
    }
}
