//! `engine_shared`
//!
//! Shared libraries used by both client and server.
//!
//! Design goals:
//! - Deterministic simulation: the movement step and world store are shared
//!   verbatim by the server tick and client prediction.
//! - Non-blocking I/O on the hot path; nothing waits on the network mid-tick.
//! - Traits at the collaborator seams (map loading, physics, rendering).
//! - No `unsafe`.

pub mod bsp;
pub mod codec;
pub mod config;
pub mod console;
pub mod ecs;
pub mod error;
pub mod map;
pub mod math;
pub mod movement;
pub mod net;
pub mod physics;
pub mod render;
pub mod transport;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::config::*;
    pub use crate::ecs::*;
    pub use crate::error::*;
    pub use crate::map::{LoadedMap, MapLoader};
    pub use crate::math::*;
    pub use crate::movement::InputButtons;
    pub use crate::net::*;
}
