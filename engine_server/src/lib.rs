//! `engine_server`
//!
//! Server-side systems:
//! - Connection table and per-client state machine
//! - Fixed timestep, deterministic simulation
//! - Receives `PlayerCommand`s, picks at most one per client per tick
//! - Sends one `Snapshot` per tick to every ready client
//!
//! Networking model:
//! - TCP: handshake/control plane
//! - UDP: gameplay plane (commands/snapshots), same port as TCP

pub mod connection;
pub mod server;
pub mod sim;

pub use server::{bind_ephemeral, GameServer, ServerState};
