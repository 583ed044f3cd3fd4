//! Node wiring: simulation, replication and the network session

mod state;

pub use state::{AppState, RenderState};
