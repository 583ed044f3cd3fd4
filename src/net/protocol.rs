//! Peer-to-peer wire message definitions.
//! These are the types replicated between peers of one session.
//!
//! Every message is independently serializable. Field order and presence are
//! part of the compatibility contract; receivers ignore unknown fields so newer
//! peers can add fields without breaking older ones.

use std::fmt;

use bytes::{Bytes, BytesMut};
use glam::{Quat, Vec2, Vec3};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ecs::EntityId;
use crate::game::combat::{BodyPart, DamageRequest, DamageType};

use super::frame::{read_frame, write_frame, Frame, FrameError};

/// Action bit-set carried by `PlayerInput`.
///
/// Decoding never rejects unknown bits; the consuming system checks
/// [`Actions::is_valid`] and drops malformed inputs.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Actions(u8);

impl Actions {
    pub const NONE: Actions = Actions(0);
    pub const FIRING: Actions = Actions(1 << 0);
    pub const RELOADING: Actions = Actions(1 << 1);
    pub const JUMPING: Actions = Actions(1 << 2);
    pub const CROUCHING: Actions = Actions(1 << 3);

    const KNOWN: u8 = 0b1111;

    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: Actions) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Actions) {
        self.0 |= other.0;
    }

    /// No bits outside the known action set
    pub fn is_valid(self) -> bool {
        self.0 & !Self::KNOWN == 0
    }
}

impl std::ops::BitOr for Actions {
    type Output = Actions;

    fn bitor(self, rhs: Actions) -> Actions {
        Actions(self.0 | rhs.0)
    }
}

impl fmt::Debug for Actions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        for (flag, name) in [
            (Self::FIRING, "firing"),
            (Self::RELOADING, "reloading"),
            (Self::JUMPING, "jumping"),
            (Self::CROUCHING, "crouching"),
        ] {
            if self.contains(flag) {
                names.push(name);
            }
        }
        if !self.is_valid() {
            names.push("unknown");
        }
        write!(f, "Actions({})", names.join("|"))
    }
}

/// One local input sample (reliable channel)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerInput {
    /// Sender wall-clock seconds
    pub timestamp: f64,
    /// Monotonically increasing per sender
    pub sequence: u32,
    pub position: Vec3,
    pub rotation: Quat,
    /// Stick deflection: x strafe, y forward, each in [-1, 1]
    pub movement: Vec2,
    pub actions: Actions,
}

impl PlayerInput {
    /// Structural sanity check applied by consuming systems
    pub fn is_well_formed(&self) -> bool {
        self.timestamp.is_finite()
            && self.position.is_finite()
            && self.rotation.is_finite()
            && self.movement.is_finite()
            && self.movement.x.abs() <= 1.0 + f32::EPSILON
            && self.movement.y.abs() <= 1.0 + f32::EPSILON
            && self.actions.is_valid()
    }
}

/// Replicated state of one player in a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerState {
    pub id: EntityId,
    pub position: Vec3,
    pub rotation: Quat,
    pub health: f32,
    pub is_alive: bool,
}

/// Per-tick world snapshot (unreliable channel, latest wins)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameStateSnapshot {
    pub timestamp: f64,
    pub sequence: u32,
    pub players: Vec<PlayerState>,
}

/// Hit registered against an avatar the receiving peer owns (reliable channel).
/// The owner resolves it against its own `CombatComponent`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HitReport {
    pub target: EntityId,
    pub amount: f32,
    pub damage_type: DamageType,
    pub body_part: BodyPart,
    /// Attacker on the sending peer, if any
    pub source: Option<EntityId>,
}

impl From<DamageRequest> for HitReport {
    fn from(request: DamageRequest) -> Self {
        Self {
            target: request.target,
            amount: request.amount,
            damage_type: request.damage_type,
            body_part: request.body_part,
            source: request.source,
        }
    }
}

impl From<HitReport> for DamageRequest {
    fn from(hit: HitReport) -> Self {
        Self {
            target: hit.target,
            amount: hit.amount,
            damage_type: hit.damage_type,
            body_part: hit.body_part,
            source: hit.source,
        }
    }
}

/// Connection request sent by the dialing peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
    pub peer_id: Uuid,
    /// Entity id of the sender's avatar
    pub player_entity: EntityId,
    pub display_name: String,
    pub room_id: String,
    /// Port of the sender's unreliable channel (same host as the stream)
    pub udp_port: u16,
}

/// Accepted connection, sent back by the listening peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Welcome {
    pub peer_id: Uuid,
    pub player_entity: EntityId,
    pub display_name: String,
    pub udp_port: u16,
}

/// Any message that can appear on a channel
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    Input(PlayerInput),
    Snapshot(GameStateSnapshot),
    Hit(HitReport),
    Hello(Hello),
    Welcome(Welcome),
    Refused { reason: String },
    Goodbye,
}

/// Frame tags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    Input = 1,
    Snapshot = 2,
    Hello = 3,
    Welcome = 4,
    Refused = 5,
    Goodbye = 6,
    Hit = 7,
}

impl MessageKind {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::Input),
            2 => Some(Self::Snapshot),
            3 => Some(Self::Hello),
            4 => Some(Self::Welcome),
            5 => Some(Self::Refused),
            6 => Some(Self::Goodbye),
            7 => Some(Self::Hit),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("framing error: {0}")]
    Frame(#[from] FrameError),

    #[error("unknown message tag: {0}")]
    UnknownTag(u8),

    #[error("payload decode failed: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Serialize, Deserialize)]
struct RefusedBody {
    reason: String,
}

impl WireMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            WireMessage::Input(_) => MessageKind::Input,
            WireMessage::Snapshot(_) => MessageKind::Snapshot,
            WireMessage::Hit(_) => MessageKind::Hit,
            WireMessage::Hello(_) => MessageKind::Hello,
            WireMessage::Welcome(_) => MessageKind::Welcome,
            WireMessage::Refused { .. } => MessageKind::Refused,
            WireMessage::Goodbye => MessageKind::Goodbye,
        }
    }

    /// Serialize into a single framed buffer
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let payload = match self {
            WireMessage::Input(input) => serde_json::to_vec(input)?,
            WireMessage::Snapshot(snapshot) => serde_json::to_vec(snapshot)?,
            WireMessage::Hit(hit) => serde_json::to_vec(hit)?,
            WireMessage::Hello(hello) => serde_json::to_vec(hello)?,
            WireMessage::Welcome(welcome) => serde_json::to_vec(welcome)?,
            WireMessage::Refused { reason } => serde_json::to_vec(&RefusedBody {
                reason: reason.clone(),
            })?,
            WireMessage::Goodbye => Vec::new(),
        };

        let mut out = BytesMut::new();
        write_frame(&mut out, self.kind() as u8, &payload)?;
        Ok(out.freeze())
    }

    /// Decode one framed message (e.g. a whole datagram)
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = read_frame(bytes)?;
        Self::from_frame(&frame)
    }

    /// Dispatch a frame to the decoder for its tag
    pub fn from_frame(frame: &Frame) -> Result<Self, ProtocolError> {
        let kind = MessageKind::from_tag(frame.tag).ok_or(ProtocolError::UnknownTag(frame.tag))?;
        let payload = &frame.payload[..];

        let msg = match kind {
            MessageKind::Input => WireMessage::Input(serde_json::from_slice(payload)?),
            MessageKind::Snapshot => WireMessage::Snapshot(serde_json::from_slice(payload)?),
            MessageKind::Hit => WireMessage::Hit(serde_json::from_slice(payload)?),
            MessageKind::Hello => WireMessage::Hello(serde_json::from_slice(payload)?),
            MessageKind::Welcome => WireMessage::Welcome(serde_json::from_slice(payload)?),
            MessageKind::Refused => {
                let body: RefusedBody = serde_json::from_slice(payload)?;
                WireMessage::Refused { reason: body.reason }
            }
            MessageKind::Goodbye => WireMessage::Goodbye,
        };
        Ok(msg)
    }
}
