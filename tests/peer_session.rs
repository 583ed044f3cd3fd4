//! Loopback sessions: handshake, reliable inputs, unreliable snapshots and
//! per-peer disconnection.

use std::time::Duration;

use glam::{Quat, Vec2, Vec3};
use tactical_mesh::ecs::EntityId;
use tactical_mesh::net::protocol::{Actions, GameStateSnapshot, PlayerInput, PlayerState, WireMessage};
use tactical_mesh::net::session::{
    ConnectionState, LocalIdentity, NetworkSession, SessionConfig, SessionEvent, SessionState,
};
use tokio::sync::mpsc;
use tokio::time::timeout;
use uuid::Uuid;

fn loopback() -> SessionConfig {
    SessionConfig {
        tcp_addr: "127.0.0.1:0".parse().expect("addr"),
        udp_addr: "127.0.0.1:0".parse().expect("addr"),
        max_peers: 4,
    }
}

fn identity(name: &str) -> LocalIdentity {
    LocalIdentity {
        peer_id: Uuid::new_v4(),
        player_entity: EntityId::new(),
        display_name: name.to_string(),
        room_id: "match-7".to_string(),
    }
}

fn input(sequence: u32) -> PlayerInput {
    PlayerInput {
        timestamp: 12.5,
        sequence,
        position: Vec3::new(1.0, 0.0, 2.0),
        rotation: Quat::IDENTITY,
        movement: Vec2::new(0.0, 1.0),
        actions: Actions::FIRING,
    }
}

async fn next_event(events: &mut mpsc::Receiver<SessionEvent>) -> SessionEvent {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("event within timeout")
        .expect("event channel open")
}

#[tokio::test]
async fn star_session_lifecycle() {
    let host_identity = identity("host");
    let (host, mut host_events) = NetworkSession::bind(loopback(), host_identity.clone()).await.expect("bind host");
    host.start_advertising().expect("advertise");
    assert_eq!(host.state(), SessionState::Advertising);

    let a_identity = identity("alpha");
    let (a, mut a_events) = NetworkSession::bind(loopback(), a_identity.clone()).await.expect("bind a");
    let b_identity = identity("bravo");
    let (b, mut b_events) = NetworkSession::bind(loopback(), b_identity.clone()).await.expect("bind b");

    // Handshake
    let host_id = a.connect(host.local_tcp_addr()).await.expect("a joins");
    assert_eq!(host_id, host_identity.peer_id);
    assert_eq!(a.addr_state(host.local_tcp_addr()), ConnectionState::Connected);
    match next_event(&mut host_events).await {
        SessionEvent::PeerConnected {
            peer_id,
            player_entity,
            display_name,
        } => {
            assert_eq!(peer_id, a_identity.peer_id);
            assert_eq!(player_entity, a_identity.player_entity);
            assert_eq!(display_name, "alpha");
        }
        other => panic!("unexpected event: {other:?}"),
    }
    assert!(matches!(
        next_event(&mut a_events).await,
        SessionEvent::PeerConnected { player_entity, .. } if player_entity == host_identity.player_entity
    ));

    b.connect(host.local_tcp_addr()).await.expect("b joins");
    assert!(matches!(next_event(&mut host_events).await, SessionEvent::PeerConnected { peer_id, .. } if peer_id == b_identity.peer_id));
    assert!(matches!(next_event(&mut b_events).await, SessionEvent::PeerConnected { .. }));
    assert_eq!(host.connected_count(), 2);

    // Reliable input, attributed to the sender's avatar
    assert_eq!(a.broadcast_reliable(&WireMessage::Input(input(1))).expect("send"), 1);
    match next_event(&mut host_events).await {
        SessionEvent::Input {
            peer_id,
            player_entity,
            input,
        } => {
            assert_eq!(peer_id, a_identity.peer_id);
            assert_eq!(player_entity, a_identity.player_entity);
            assert_eq!(input.sequence, 1);
        }
        other => panic!("unexpected event: {other:?}"),
    }

    // Unreliable snapshot to both joiners
    let snapshot = GameStateSnapshot {
        timestamp: 100.0,
        sequence: 9,
        players: vec![PlayerState {
            id: host_identity.player_entity,
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            health: 100.0,
            is_alive: true,
        }],
    };
    let sent = host
        .broadcast_unreliable(&WireMessage::Snapshot(snapshot.clone()))
        .await
        .expect("datagrams");
    assert_eq!(sent, 2);
    for events in [&mut a_events, &mut b_events] {
        match next_event(events).await {
            SessionEvent::Snapshot { peer_id, snapshot: got } => {
                assert_eq!(peer_id, host_identity.peer_id);
                assert_eq!(got.sequence, 9);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    // Dropping one peer leaves the other connected
    a.disconnect_peer(host_id).await.expect("disconnect");
    assert!(matches!(next_event(&mut a_events).await, SessionEvent::PeerDisconnected { .. }));
    match next_event(&mut host_events).await {
        SessionEvent::PeerDisconnected { peer_id, player_entity } => {
            assert_eq!(peer_id, a_identity.peer_id);
            assert_eq!(player_entity, a_identity.player_entity);
        }
        other => panic!("unexpected event: {other:?}"),
    }
    assert_eq!(host.peer_state(a_identity.peer_id), Some(ConnectionState::Disconnected));
    assert_eq!(host.peer_state(b_identity.peer_id), Some(ConnectionState::Connected));

    assert!(host.send_reliable(a_identity.peer_id, &WireMessage::Input(input(2))).is_err());
    host.send_reliable(b_identity.peer_id, &WireMessage::Input(input(2))).expect("send to b");
    assert!(matches!(next_event(&mut b_events).await, SessionEvent::Input { input, .. } if input.sequence == 2));

    a.shutdown().await;
    b.shutdown().await;
    host.shutdown().await;
    assert_eq!(host.state(), SessionState::Closed);
    assert_eq!(host.connected_count(), 0);
}

#[tokio::test]
async fn browsing_dials_found_peers() {
    let (host, mut host_events) = NetworkSession::bind(loopback(), identity("host")).await.expect("bind host");
    host.start_advertising().expect("advertise");
    let (joiner, _joiner_events) = NetworkSession::bind(loopback(), identity("joiner")).await.expect("bind joiner");

    let (found_tx, found_rx) = mpsc::channel(1);
    joiner.start_browsing(found_rx).expect("browse");
    assert_eq!(joiner.state(), SessionState::Browsing);
    found_tx.send(host.local_tcp_addr()).await.expect("found");

    assert!(matches!(next_event(&mut host_events).await, SessionEvent::PeerConnected { .. }));

    joiner.shutdown().await;
    host.shutdown().await;
}
