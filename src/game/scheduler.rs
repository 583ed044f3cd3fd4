//! Priority-ordered tick scheduler

use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};

use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use crate::ecs::{ComponentType, EntityId, EntityStore};
use crate::util::time::{SimClock, Timer};

use super::combat::{CombatError, CombatOutcome, CombatResolver, DamageRequest, DamageResult, RemoteHit};
use super::components::{CombatComponent, Controller, PlayerControlled};
use super::events::GameEvent;
use super::input::{InputQueue, TickInputs};
use super::systems::{SimSystem, SystemError};

/// Scheduler state machine, `Idle -> Running -> Idle` once per frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
}

/// Everything a system may touch during its turn.
///
/// Built once per tick by the scheduler; the entity snapshot inside it is fixed
/// before the first system runs, so entities spawned mid-tick stay invisible
/// and despawns are deferred to the end of the tick.
pub struct TickContext<'a> {
    pub store: &'a EntityStore,
    pub inputs: &'a TickInputs,
    pub delta_time: f32,
    pub now: f64,
    pub tick: u64,
    resolver: CombatResolver,
    entities: &'a [EntityId],
    visible: &'a HashSet<EntityId>,
    outcome: &'a mut CombatOutcome,
}

impl<'a> TickContext<'a> {
    /// Entity snapshot taken at the start of the tick
    pub fn entities(&self) -> &[EntityId] {
        self.entities
    }

    pub fn is_visible(&self, entity: EntityId) -> bool {
        self.visible.contains(&entity)
    }

    /// Store query restricted to this tick's entity snapshot
    pub fn query(&self, types: &[ComponentType]) -> Vec<EntityId> {
        self.store
            .query(types)
            .into_iter()
            .filter(|id| self.visible.contains(id))
            .collect()
    }

    /// Feed a hit registration into the combat resolver. Hits on avatars owned
    /// by a remote peer are not resolved here; they are collected for that
    /// peer and reported as [`DamageResult::Forwarded`].
    pub fn apply_damage(&mut self, request: DamageRequest) -> Result<DamageResult, CombatError> {
        let Some(owner) = self.remote_owner(request.target) else {
            return self
                .resolver
                .apply_damage(self.store, request, self.now, self.outcome);
        };

        CombatResolver::validate(&request)?;
        let dead = self
            .store
            .get::<CombatComponent>(request.target)
            .map(|c| c.is_dead())
            .unwrap_or(true);
        if dead {
            return Ok(DamageResult::NoDamage);
        }
        self.outcome.forwarded.push(RemoteHit { owner, request });
        Ok(DamageResult::Forwarded)
    }

    fn remote_owner(&self, entity: EntityId) -> Option<Uuid> {
        match self.store.get::<PlayerControlled>(entity)?.controller {
            Controller::Remote(peer_id) => Some(peer_id),
            Controller::Local => None,
        }
    }

    pub fn resolver(&self) -> CombatResolver {
        self.resolver
    }

    pub fn emit(&mut self, event: GameEvent) {
        self.outcome.events.push(event);
    }

    /// Remove an entity once the tick completes
    pub fn despawn(&mut self, entity: EntityId) {
        self.outcome.despawns.push(entity);
    }
}

/// A system failure captured during a tick
#[derive(Debug, Clone)]
pub struct SystemFailure {
    pub system: &'static str,
    pub message: String,
}

/// What happened during one tick
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub tick: u64,
    pub now: f64,
    /// Systems in the order they ran, with their priority
    pub invocations: Vec<(&'static str, i32)>,
    pub failures: Vec<SystemFailure>,
    pub events: Vec<GameEvent>,
    pub despawned: Vec<EntityId>,
    /// Hits on remote-owned avatars, to be sent to their owners
    pub remote_hits: Vec<RemoteHit>,
    pub inputs_consumed: usize,
    pub elapsed_micros: u64,
}

/// Drives one simulation frame across the registered systems
pub struct TickScheduler {
    systems: Vec<Box<dyn SimSystem>>,
    state: SchedulerState,
    tick: u64,
    clock: SimClock,
    resolver: CombatResolver,
    /// Hits reported by remote peers against local avatars
    pending_hits: Vec<DamageRequest>,
}

impl TickScheduler {
    pub fn new() -> Self {
        Self::with_clock(SimClock::new())
    }

    pub fn with_clock(clock: SimClock) -> Self {
        Self {
            systems: Vec::new(),
            state: SchedulerState::Idle,
            tick: 0,
            clock,
            resolver: CombatResolver::new(),
            pending_hits: Vec::new(),
        }
    }

    /// Queue a hit that a remote peer registered against an avatar this node
    /// owns. It is resolved at the start of the next tick, before any system runs.
    pub fn queue_damage(&mut self, request: DamageRequest) {
        self.pending_hits.push(request);
    }

    /// Register a system; systems stay sorted by ascending priority, with
    /// registration order breaking ties.
    pub fn register<S: SimSystem + 'static>(&mut self, system: S) {
        self.systems.push(Box::new(system));
        self.systems.sort_by_key(|s| s.priority());
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn now(&self) -> f64 {
        self.clock.now()
    }

    pub fn system_names(&self) -> Vec<&'static str> {
        self.systems.iter().map(|s| s.name()).collect()
    }

    /// Run one frame. Each system runs to completion before the next starts;
    /// a failing or panicking system is logged and skipped, and the frame
    /// always completes.
    pub fn run_tick(&mut self, store: &EntityStore, input_queue: &InputQueue, delta_time: f32) -> TickReport {
        let timer = Timer::new();
        self.state = SchedulerState::Running;
        self.tick += 1;
        let now = self.clock.advance(delta_time);

        let entities = store.entities();
        let visible: HashSet<EntityId> = entities.iter().copied().collect();
        let inputs = input_queue.drain();
        let mut outcome = CombatOutcome::default();

        for request in self.pending_hits.drain(..) {
            match self.resolver.apply_damage(store, request, now, &mut outcome) {
                Ok(result) => debug!(target_entity = %request.target, ?result, "Remote hit resolved"),
                Err(e) => warn!(target_entity = %request.target, error = %e, "Dropping invalid remote hit"),
            }
        }

        let mut report = TickReport {
            tick: self.tick,
            now,
            inputs_consumed: inputs.len(),
            ..TickReport::default()
        };

        for system in self.systems.iter_mut() {
            let name = system.name();
            let priority = system.priority();
            report.invocations.push((name, priority));
            trace!(tick = self.tick, system = name, priority, "Running system");

            let mut ctx = TickContext {
                store,
                inputs: &inputs,
                delta_time,
                now,
                tick: self.tick,
                resolver: self.resolver,
                entities: &entities,
                visible: &visible,
                outcome: &mut outcome,
            };

            let result = catch_unwind(AssertUnwindSafe(|| system.update(&mut ctx)));
            let failure = match result {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(panic) => Some(panic_message(panic.as_ref())),
            };

            if let Some(message) = failure {
                error!(tick = self.tick, system = name, error = %message, "System failed, continuing tick");
                report.failures.push(SystemFailure { system: name, message });
            }
        }

        let CombatOutcome {
            events,
            despawns,
            forwarded,
        } = outcome;
        report.events = events;
        report.remote_hits = forwarded;

        let mut seen = HashSet::new();
        for entity in despawns {
            if !seen.insert(entity) {
                continue;
            }
            if store.despawn(entity) {
                input_queue.remove(entity);
                report.events.push(GameEvent::Despawned { entity });
                report.despawned.push(entity);
            }
        }

        report.elapsed_micros = timer.elapsed_micros();
        self.state = SchedulerState::Idle;

        debug!(
            tick = self.tick,
            events = report.events.len(),
            despawned = report.despawned.len(),
            failures = report.failures.len(),
            "Tick complete"
        );

        report
    }
}

impl Default for TickScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&'static str> for SystemError {
    fn from(message: &'static str) -> Self {
        SystemError::Failed(message.to_string())
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}
