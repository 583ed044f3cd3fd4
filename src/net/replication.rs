//! Snapshot building, stale discard, and interpolation

use crate::ecs::{ComponentType, EntityStore};
use crate::game::components::{AiBrain, CombatComponent, Controller, PlayerControlled, Transform};

use super::protocol::{GameStateSnapshot, PlayerState};

/// How far behind the newest snapshot remote state is rendered, in seconds
pub const INTERPOLATION_DELAY: f64 = 0.1;

/// Builds snapshots of the state this node is authoritative for
pub struct SnapshotBuilder {
    /// Tick counter since last snapshot
    ticks_since_snapshot: u32,
    /// Snapshot interval in ticks
    snapshot_interval: u32,
    /// Sequence of the last built snapshot
    sequence: u32,
}

impl SnapshotBuilder {
    pub fn new(snapshot_interval: u32) -> Self {
        Self {
            ticks_since_snapshot: 0,
            snapshot_interval: snapshot_interval.max(1),
            sequence: 0,
        }
    }

    /// Interval for the given tick and snapshot rates
    pub fn for_rates(tick_rate: u32, snapshot_rate: u32) -> Self {
        Self::new(tick_rate / snapshot_rate.max(1))
    }

    /// Check if it's time to send a snapshot
    pub fn should_send(&mut self) -> bool {
        self.ticks_since_snapshot += 1;
        if self.ticks_since_snapshot >= self.snapshot_interval {
            self.ticks_since_snapshot = 0;
            true
        } else {
            false
        }
    }

    /// Force snapshot on next check (used for important events)
    pub fn force_next(&mut self) {
        self.ticks_since_snapshot = self.snapshot_interval;
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Snapshot the locally owned avatars and bots. Remote avatars belong to
    /// their own peers and are left out.
    pub fn build(&mut self, store: &EntityStore, timestamp: f64) -> GameStateSnapshot {
        let mut owned = store.query(&[ComponentType::of::<Transform>(), ComponentType::of::<CombatComponent>()]);
        owned.retain(|id| match store.get::<PlayerControlled>(*id) {
            Some(player) => player.controller == Controller::Local,
            None => store.has::<AiBrain>(*id),
        });
        owned.sort();

        let players = owned
            .into_iter()
            .filter_map(|id| {
                let transform = store.get::<Transform>(id)?;
                let combat = store.get::<CombatComponent>(id)?;
                Some(PlayerState {
                    id,
                    position: transform.position,
                    rotation: transform.rotation,
                    health: combat.health,
                    is_alive: !combat.is_dead(),
                })
            })
            .collect();

        self.sequence = self.sequence.wrapping_add(1);
        GameStateSnapshot {
            timestamp,
            sequence: self.sequence,
            players,
        }
    }
}

/// Serial-number comparison: `a` is newer than `b` when it is ahead by less
/// than half the sequence space, so ordering survives the wrap at `u32::MAX`.
pub fn sequence_newer(a: u32, b: u32) -> bool {
    a != b && a.wrapping_sub(b) < u32::MAX / 2
}

#[derive(Debug, Clone)]
struct Received {
    snapshot: GameStateSnapshot,
    /// Local wall-clock seconds at arrival
    received_at: f64,
}

/// The two most recent snapshots from one remote peer
#[derive(Debug, Clone, Default)]
pub struct RemoteStateBuffer {
    previous: Option<Received>,
    latest: Option<Received>,
    discarded: u64,
}

impl RemoteStateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept a snapshot unless it is older than (or the same as) the newest
    /// one held. Returns false for discarded stale snapshots.
    pub fn accept(&mut self, snapshot: GameStateSnapshot, received_at: f64) -> bool {
        if let Some(latest) = &self.latest {
            if !sequence_newer(snapshot.sequence, latest.snapshot.sequence) {
                self.discarded += 1;
                return false;
            }
        }
        self.previous = self.latest.take();
        self.latest = Some(Received { snapshot, received_at });
        true
    }

    pub fn last_sequence(&self) -> Option<u32> {
        self.latest.as_ref().map(|r| r.snapshot.sequence)
    }

    pub fn latest(&self) -> Option<&GameStateSnapshot> {
        self.latest.as_ref().map(|r| &r.snapshot)
    }

    /// Stale snapshots dropped so far
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Interpolated remote state for local wall-clock time `now`.
    ///
    /// Rendering runs [`INTERPOLATION_DELAY`] behind the newest snapshot, on
    /// the sender's clock as estimated from the newest arrival. Players missing
    /// from the older snapshot are taken from the newest as-is.
    pub fn sample(&self, now: f64) -> Vec<PlayerState> {
        let Some(latest) = &self.latest else {
            return Vec::new();
        };
        let Some(previous) = &self.previous else {
            return latest.snapshot.players.clone();
        };

        let offset = latest.received_at - latest.snapshot.timestamp;
        let render_time = now - offset - INTERPOLATION_DELAY;
        let span = latest.snapshot.timestamp - previous.snapshot.timestamp;
        let alpha = if span > f64::EPSILON {
            ((render_time - previous.snapshot.timestamp) / span).clamp(0.0, 1.0) as f32
        } else {
            1.0
        };

        latest
            .snapshot
            .players
            .iter()
            .map(|to| match previous.snapshot.players.iter().find(|p| p.id == to.id) {
                Some(from) => PlayerState {
                    id: to.id,
                    position: from.position.lerp(to.position, alpha),
                    rotation: from.rotation.slerp(to.rotation, alpha),
                    health: to.health,
                    is_alive: to.is_alive,
                },
                None => to.clone(),
            })
            .collect()
    }
}

/// Snapshot compression stats for debugging
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct SnapshotStats {
    pub total_snapshots: u64,
    pub total_bytes: u64,
    pub avg_players_per_snapshot: f32,
    pub max_bytes: usize,
}

impl SnapshotStats {
    pub fn record(&mut self, player_count: usize, bytes: usize) {
        self.total_snapshots += 1;
        self.total_bytes += bytes as u64;
        self.max_bytes = self.max_bytes.max(bytes);

        // Running average
        let n = self.total_snapshots as f32;
        self.avg_players_per_snapshot =
            self.avg_players_per_snapshot * ((n - 1.0) / n) + (player_count as f32 / n);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ecs::EntityId;
    use glam::{Quat, Vec3};
    use uuid::Uuid;

    fn state(id: EntityId, x: f32) -> PlayerState {
        PlayerState {
            id,
            position: Vec3::new(x, 0.0, 0.0),
            rotation: Quat::IDENTITY,
            health: 100.0,
            is_alive: true,
        }
    }

    fn snapshot(sequence: u32, timestamp: f64, players: Vec<PlayerState>) -> GameStateSnapshot {
        GameStateSnapshot {
            timestamp,
            sequence,
            players,
        }
    }

    #[test]
    fn snapshot_interval() {
        let mut builder = SnapshotBuilder::for_rates(60, 20);
        let sent: Vec<bool> = (0..6).map(|_| builder.should_send()).collect();
        assert_eq!(sent, vec![false, false, true, false, false, true]);
    }

    #[test]
    fn builds_owned_entities_only() {
        let store = EntityStore::new();
        let local = store.spawn();
        store.set(local, Transform::default());
        store.set(local, CombatComponent::default());
        store.set(local, PlayerControlled::local());

        let remote = store.spawn();
        store.set(remote, Transform::default());
        store.set(remote, CombatComponent::default());
        store.set(remote, PlayerControlled::remote(Uuid::new_v4()));

        let bot = store.spawn();
        store.set(bot, Transform::default());
        store.set(bot, CombatComponent::default());
        store.set(bot, AiBrain::default());

        let mut builder = SnapshotBuilder::new(1);
        let first = builder.build(&store, 10.0);
        let second = builder.build(&store, 10.05);

        let mut ids: Vec<EntityId> = first.players.iter().map(|p| p.id).collect();
        ids.sort();
        let mut expected = vec![local, bot];
        expected.sort();
        assert_eq!(ids, expected);
        assert!(second.sequence > first.sequence);
    }

    #[test]
    fn stale_snapshots_discarded() {
        let id = EntityId::new();
        let mut buffer = RemoteStateBuffer::new();
        assert!(buffer.accept(snapshot(5, 1.0, vec![state(id, 0.0)]), 1.0));
        assert!(!buffer.accept(snapshot(4, 0.9, vec![state(id, 9.0)]), 1.01));
        assert!(!buffer.accept(snapshot(5, 1.0, vec![state(id, 9.0)]), 1.02));
        assert_eq!(buffer.last_sequence(), Some(5));
        assert_eq!(buffer.discarded(), 2);
    }

    #[test]
    fn sequence_wrap_keeps_ordering() {
        assert!(sequence_newer(1, u32::MAX));
        assert!(!sequence_newer(u32::MAX, 1));

        let id = EntityId::new();
        let mut buffer = RemoteStateBuffer::new();
        assert!(buffer.accept(snapshot(u32::MAX, 1.0, vec![state(id, 0.0)]), 1.0));
        assert!(buffer.accept(snapshot(0, 1.05, vec![state(id, 1.0)]), 1.05));
        assert!(buffer.accept(snapshot(1, 1.1, vec![state(id, 2.0)]), 1.1));
        assert!(!buffer.accept(snapshot(u32::MAX, 1.0, vec![state(id, 0.0)]), 1.11));
        assert_eq!(buffer.last_sequence(), Some(1));
    }

    #[test]
    fn interpolates_between_last_two() {
        let id = EntityId::new();
        let mut buffer = RemoteStateBuffer::new();
        buffer.accept(snapshot(1, 100.0, vec![state(id, 0.0)]), 500.0);
        buffer.accept(snapshot(2, 100.1, vec![state(id, 10.0)]), 500.1);

        // Newest arrived at 500.1; rendering 0.1s behind lands on the older one
        let at_start = buffer.sample(500.1);
        assert!(at_start[0].position.x.abs() < 1e-3);

        let halfway = buffer.sample(500.15);
        assert!((halfway[0].position.x - 5.0).abs() < 1e-2);

        let past_end = buffer.sample(501.0);
        assert!((past_end[0].position.x - 10.0).abs() < 1e-3);
    }

    #[test]
    fn stats_running_average() {
        let mut stats = SnapshotStats::default();
        stats.record(2, 200);
        stats.record(4, 400);
        assert_eq!(stats.total_snapshots, 2);
        assert_eq!(stats.total_bytes, 600);
        assert_eq!(stats.max_bytes, 400);
        assert!((stats.avg_players_per_snapshot - 3.0).abs() < 1e-5);
    }
}
