//! Peer networking: framing, wire messages, sessions and replication

pub mod frame;
pub mod protocol;
pub mod replication;
pub mod session;

pub use protocol::{Actions, GameStateSnapshot, PlayerInput, PlayerState, WireMessage};
pub use session::{NetworkSession, PeerId, SessionConfig, SessionEvent, SessionState};
