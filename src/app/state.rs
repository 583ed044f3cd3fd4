//! Node state shared by the tick loop and the status routes

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use glam::{Quat, Vec3};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{Config, SessionRole};
use crate::ecs::{ComponentType, EntityId, EntityStore};
use crate::game::components::{
    AiBrain, Collider, CombatComponent, CombatState, Controller, PlayerControlled, Score, Transform, Velocity,
    Weapon,
};
use crate::game::events::GameEvent;
use crate::game::input::{InputQueue, InputRejection};
use crate::game::scheduler::{TickReport, TickScheduler};
use crate::game::systems::{AiSystem, CombatSystem, MovementSystem, ProjectileSystem, WeaponSystem};
use crate::net::protocol::{GameStateSnapshot, HitReport, PlayerInput, PlayerState, WireMessage};
use crate::net::replication::{RemoteStateBuffer, SnapshotBuilder, SnapshotStats};
use crate::net::session::{LocalIdentity, NetworkSession, PeerId, SessionConfig, SessionError, SessionEvent};
use crate::util::time::unix_secs_f64;

/// Max health assumed for entities known only through snapshots
const REPLICATED_MAX_HEALTH: f32 = 100.0;
/// Radius of the ring bots are spawned on
const BOT_SPAWN_RADIUS: f32 = 15.0;

/// Read-only per-entity view handed to the presentation layer
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderState {
    pub id: EntityId,
    pub position: Vec3,
    pub rotation: Quat,
    pub health: f32,
    pub combat_state: CombatState,
}

/// Simulation pieces that only the tick loop mutates
struct Simulation {
    scheduler: TickScheduler,
    snapshots: SnapshotBuilder,
    stats: SnapshotStats,
}

/// Shared node state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<EntityStore>,
    pub inputs: Arc<InputQueue>,
    pub session: Arc<NetworkSession>,
    /// Latest snapshots per remote peer
    pub remote: Arc<DashMap<PeerId, RemoteStateBuffer>>,
    pub local_player: EntityId,
    simulation: Arc<Mutex<Simulation>>,
}

impl AppState {
    /// Spawn the local avatar (and bots when hosting), bind the network
    /// session and register the simulation systems.
    pub async fn new(config: Config) -> Result<(Self, mpsc::Receiver<SessionEvent>), SessionError> {
        let config = Arc::new(config);
        let store = Arc::new(EntityStore::new());

        let local_player = store.spawn();
        spawn_avatar(&store, local_player, PlayerControlled::local(), Vec3::ZERO);

        let identity = LocalIdentity {
            peer_id: Uuid::new_v4(),
            player_entity: local_player,
            display_name: config.display_name.clone(),
            room_id: config.room_id.clone(),
        };
        let session_config = SessionConfig {
            tcp_addr: config.peer_addr,
            udp_addr: config.peer_udp_addr,
            max_peers: config.max_peers,
        };
        let (session, events) = NetworkSession::bind(session_config, identity).await?;

        if config.role == SessionRole::Host {
            spawn_bots(&store, config.bot_count);
        }

        let mut scheduler = TickScheduler::new();
        scheduler.register(CombatSystem::new());
        scheduler.register(MovementSystem::new());
        scheduler.register(WeaponSystem::new());
        scheduler.register(AiSystem::new(rand::random()));
        scheduler.register(ProjectileSystem::new());

        let simulation = Simulation {
            scheduler,
            snapshots: SnapshotBuilder::for_rates(config.tick_rate, config.snapshot_rate),
            stats: SnapshotStats::default(),
        };

        info!(
            entity = %local_player,
            peer_id = %session.peer_id(),
            role = ?config.role,
            bots = store.query(&[ComponentType::of::<AiBrain>()]).len(),
            "Node state initialized"
        );

        Ok((
            Self {
                config,
                store,
                inputs: Arc::new(InputQueue::new()),
                session,
                remote: Arc::new(DashMap::new()),
                local_player,
                simulation: Arc::new(Mutex::new(simulation)),
            },
            events,
        ))
    }

    /// Input boundary: queue a locally sampled input for this node's avatar
    /// and relay it to every connected peer.
    pub fn submit_local_input(&self, input: PlayerInput) -> Result<(), InputRejection> {
        self.inputs.push(self.local_player, input.clone())?;
        match self.session.broadcast_reliable(&WireMessage::Input(input)) {
            Ok(sent) => debug!(peers = sent, "Local input relayed"),
            Err(e) => warn!(error = %e, "Failed to relay local input"),
        }
        Ok(())
    }

    /// Apply one session event between ticks
    pub fn handle_session_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::PeerConnected {
                peer_id,
                player_entity,
                display_name,
            } => {
                if !self.store.spawn_with_id(player_entity) {
                    warn!(peer_id = %peer_id, entity = %player_entity, "Avatar id already in use, ignoring peer avatar");
                    return;
                }
                spawn_avatar(&self.store, player_entity, PlayerControlled::remote(peer_id), Vec3::ZERO);
                self.remote.insert(peer_id, RemoteStateBuffer::new());
                // Newcomers get our state right away
                self.simulation.lock().snapshots.force_next();
                info!(peer_id = %peer_id, entity = %player_entity, name = %display_name, "Remote avatar spawned");
            }
            SessionEvent::PeerDisconnected { peer_id, player_entity } => {
                self.store.despawn(player_entity);
                self.inputs.remove(player_entity);
                self.remote.remove(&peer_id);
                info!(peer_id = %peer_id, entity = %player_entity, "Remote avatar removed");
            }
            SessionEvent::Input {
                peer_id,
                player_entity,
                input,
            } => {
                if !self.store.is_alive(player_entity) {
                    debug!(peer_id = %peer_id, "Input for unknown avatar dropped");
                    return;
                }
                if let Err(rejection) = self.inputs.push(player_entity, input) {
                    debug!(peer_id = %peer_id, ?rejection, "Remote input not queued");
                }
            }
            SessionEvent::Snapshot { peer_id, snapshot } => {
                let sequence = snapshot.sequence;
                let mut buffer = self.remote.entry(peer_id).or_default();
                if !buffer.accept(snapshot, unix_secs_f64()) {
                    debug!(peer_id = %peer_id, sequence, "Stale snapshot discarded");
                    return;
                }
                if let Some(latest) = buffer.latest() {
                    self.mirror_owner_health(peer_id, latest);
                }
            }
            SessionEvent::Hit { peer_id, hit } => {
                if hit.target != self.local_player {
                    debug!(peer_id = %peer_id, target_entity = %hit.target, "Hit for an avatar we do not own dropped");
                    return;
                }
                self.simulation.lock().scheduler.queue_damage(hit.into());
            }
        }
    }

    /// Copy owner-reported health onto our copies of that peer's avatars, so
    /// local systems see the same health the owner does
    fn mirror_owner_health(&self, peer_id: PeerId, snapshot: &GameStateSnapshot) {
        for player in &snapshot.players {
            let owned_by_sender = self
                .store
                .get::<PlayerControlled>(player.id)
                .map(|p| p.controller == Controller::Remote(peer_id))
                .unwrap_or(false);
            if !owned_by_sender {
                continue;
            }
            self.store.with_mut::<CombatComponent, _>(player.id, |combat| {
                combat.health = if player.is_alive {
                    player.health.clamp(0.0, combat.max_health)
                } else {
                    0.0
                };
                combat.refresh_state();
            });
        }
    }

    /// Run one tick, then broadcast a snapshot when one is due
    pub async fn step(&self, delta_time: f32) -> TickReport {
        let (report, snapshot) = {
            let mut sim = self.simulation.lock();
            let report = sim.scheduler.run_tick(&self.store, &self.inputs, delta_time);

            if report.events.iter().any(|e| matches!(e, GameEvent::Kill { .. })) {
                sim.snapshots.force_next();
            }

            let snapshot = if sim.snapshots.should_send() {
                let snapshot = sim.snapshots.build(&self.store, unix_secs_f64());
                let players = snapshot.players.len();
                let msg = WireMessage::Snapshot(snapshot);
                match msg.encode() {
                    Ok(bytes) => {
                        sim.stats.record(players, bytes.len());
                        Some(msg)
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to encode snapshot");
                        None
                    }
                }
            } else {
                None
            };
            (report, snapshot)
        };

        // Hits on remote avatars are resolved by the peer that owns them
        for remote in &report.remote_hits {
            let msg = WireMessage::Hit(HitReport::from(remote.request));
            if let Err(e) = self.session.send_reliable(remote.owner, &msg) {
                warn!(peer_id = %remote.owner, error = %e, "Failed to forward hit to owner");
            }
        }

        if let Some(msg) = snapshot {
            if let Err(e) = self.session.broadcast_unreliable(&msg).await {
                warn!(error = %e, "Snapshot broadcast failed");
            }
        }
        report
    }

    /// Render boundary: position, rotation and health of every combatant.
    ///
    /// Entities owned by remote peers are taken from their interpolated
    /// snapshots when one is available; entities known only through snapshots
    /// (a host's bots, seen from a joiner) are included too.
    pub fn render_view(&self, now: f64) -> Vec<RenderState> {
        let mut replicated: HashMap<EntityId, PlayerState> = self
            .remote
            .iter()
            .flat_map(|buffer| buffer.sample(now))
            .map(|p| (p.id, p))
            .collect();

        let mut view: Vec<RenderState> = self
            .store
            .query(&[ComponentType::of::<Transform>(), ComponentType::of::<CombatComponent>()])
            .into_iter()
            .filter_map(|id| {
                let transform = self.store.get::<Transform>(id)?;
                let combat = self.store.get::<CombatComponent>(id)?;
                Some(match replicated.remove(&id) {
                    Some(p) => RenderState {
                        id,
                        position: p.position,
                        rotation: p.rotation,
                        health: p.health,
                        combat_state: replicated_state(&p, combat.max_health),
                    },
                    None => RenderState {
                        id,
                        position: transform.position,
                        rotation: transform.rotation,
                        health: combat.health,
                        combat_state: combat.combat_state,
                    },
                })
            })
            .collect();

        view.extend(replicated.into_values().map(|p| RenderState {
            id: p.id,
            position: p.position,
            rotation: p.rotation,
            health: p.health,
            combat_state: replicated_state(&p, REPLICATED_MAX_HEALTH),
        }));
        view.sort_by_key(|r| r.id);
        view
    }

    pub fn tick(&self) -> u64 {
        self.simulation.lock().scheduler.tick()
    }

    pub fn snapshot_stats(&self) -> SnapshotStats {
        self.simulation.lock().stats.clone()
    }
}

fn replicated_state(player: &PlayerState, max_health: f32) -> CombatState {
    if player.is_alive {
        CombatState::from_health(player.health, max_health)
    } else {
        CombatState::Dead
    }
}

fn spawn_avatar(store: &EntityStore, id: EntityId, controller: PlayerControlled, position: Vec3) {
    store.set(id, Transform::at(position));
    store.set(id, Velocity::default());
    store.set(id, Collider::default());
    store.set(id, CombatComponent::default());
    store.set(id, controller);
    store.set(id, Weapon::rifle());
    store.set(id, Score::default());
}

fn spawn_bots(store: &EntityStore, count: usize) {
    for i in 0..count {
        let angle = i as f32 / count as f32 * std::f32::consts::TAU;
        let position = Vec3::new(angle.cos(), 0.0, angle.sin()) * BOT_SPAWN_RADIUS;

        let id = store.spawn();
        store.set(id, Transform::at(position));
        store.set(id, Velocity::default());
        store.set(id, Collider::default());
        store.set(id, CombatComponent::default());
        store.set(id, AiBrain::default());
        store.set(id, Weapon::rifle());
        store.set(id, Score::default());
    }
}
