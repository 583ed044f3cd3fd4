//! Time utilities for the simulation and the wire

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Get current Unix timestamp in seconds with sub-millisecond precision.
/// This is the `timestamp` carried by wire messages.
pub fn unix_secs_f64() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs_f64()
}

/// Node start time for uptime tracking
static NODE_START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();

/// Initialize node start time (call once at startup)
pub fn init_node_time() {
    NODE_START.get_or_init(Instant::now);
}

/// Get node uptime in seconds
pub fn uptime_secs() -> u64 {
    NODE_START
        .get()
        .map(|start| start.elapsed().as_secs())
        .unwrap_or(0)
}

/// Default tick rate configuration
pub const DEFAULT_SIMULATION_TPS: u32 = 60;
pub const DEFAULT_SNAPSHOT_TPS: u32 = 20;

/// Delta time for a fixed tick rate (in seconds)
pub fn tick_delta(tps: u32) -> f32 {
    1.0 / tps.max(1) as f32
}

/// Simulation clock.
///
/// Gameplay timers (invulnerability window, regen delay) are measured against
/// simulation time, not wall-clock time, so a paused or slowed simulation keeps
/// its timers consistent.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimClock {
    now: f64,
}

impl SimClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current simulation time in seconds
    pub fn now(&self) -> f64 {
        self.now
    }

    /// Advance by one tick's delta time, returns the new time
    pub fn advance(&mut self, delta_time: f32) -> f64 {
        if delta_time.is_finite() && delta_time > 0.0 {
            self.now += f64::from(delta_time);
        }
        self.now
    }
}

/// A simple timer for measuring durations
#[derive(Debug, Clone)]
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_micros(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
