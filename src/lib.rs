//! Tactical Mesh - peer-to-peer simulation kernel for small-party tactical
//! shooter sessions.
//!
//! - `ecs`: typed entity/component store
//! - `game`: components, combat resolution, the tick scheduler and its systems
//! - `net`: wire format, peer session and snapshot replication
//! - `app`: node wiring plus the input and render boundaries
//! - `http`: read-only status endpoint

pub mod app;
pub mod config;
pub mod ecs;
pub mod game;
pub mod http;
pub mod net;
pub mod util;
