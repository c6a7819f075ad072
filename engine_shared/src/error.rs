//! Error taxonomy for the network core.
//!
//! Each variant maps to one recovery policy:
//! - `Protocol`: drop the frame, log it, keep the connection.
//! - `SequenceStale`: drop silently.
//! - `Handshake`: reject, disconnect if repeated.
//! - `MapMismatch`: kick with an explicit reason.
//! - `Timeout`: disconnect and free the `ClientId`.
//! - `CapacityExceeded`: reject the handshake, create no state.
//! - `ReliableChannel`: the connection is unusable.

use thiserror::Error;

use crate::net::MapChecksum;

/// Errors raised by the wire protocol, transports and connection state machines.
#[derive(Debug, Error)]
pub enum NetError {
    /// Malformed, truncated or oversized frame
    #[error("malformed frame: {0}")]
    Protocol(String),

    /// Unreliable message whose sequence is not newer than the last accepted one
    #[error("stale sequence {received} (last accepted {last_accepted})")]
    SequenceStale { received: u32, last_accepted: u32 },

    /// Message not valid for the current connection state
    #[error("unexpected {message} while {state}")]
    Handshake {
        message: &'static str,
        state: &'static str,
    },

    /// Client and server disagree on map content
    #[error("map checksum mismatch: expected {expected}, got {actual}")]
    MapMismatch {
        expected: MapChecksum,
        actual: MapChecksum,
    },

    /// No traffic received within the deadline
    #[error("no traffic for {0:?}")]
    Timeout(std::time::Duration),

    /// Connection table is full
    #[error("server full ({max} clients)")]
    CapacityExceeded { max: usize },

    /// Reliable stream cannot keep ordering or make progress
    #[error("reliable channel failed: {0}")]
    ReliableChannel(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl NetError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// True for errors that only invalidate the current frame.
    pub fn is_frame_local(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::SequenceStale { .. })
    }
}

/// Errors raised by map loaders.
#[derive(Debug, Error)]
pub enum MapError {
    #[error("map '{0}' not found")]
    NotFound(String),

    #[error("map '{name}' is corrupt: {reason}")]
    Corrupt { name: String, reason: String },

    #[error("invalid map name '{0}'")]
    InvalidName(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type NetResult<T> = Result<T, NetError>;
