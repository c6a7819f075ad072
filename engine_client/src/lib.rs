//! `engine_client`
//!
//! Client-side systems:
//! - Connection management (reliable + unreliable channels)
//! - Input capture and command generation
//! - Prediction and reconciliation of the own entity
//! - Interpolation for remote entity states
//! - Rendering through [`engine_shared::render::RenderBackend`]

pub mod client;
pub mod input;
pub mod interp;
pub mod prediction;

pub use client::{ClientState, DisconnectReason, GameClient};
