//! Protocol messages.
//!
//! Two logical channels share one message enum:
//! - Reliable (TCP): handshake, map agreement, chat, kick/disconnect.
//! - Unreliable (UDP): player commands and snapshots.
//!
//! The binary layout lives in [`crate::codec`]; the channels in
//! [`crate::transport`].

use std::fmt;

use sha2::{Digest, Sha256};

use crate::{
    ecs::{ComponentBundle, EntityId},
    math::Vec3,
    movement::InputButtons,
};

/// Protocol version for compatibility checks.
pub const PROTOCOL_VERSION: u32 = 3;

/// Identifies a connected client. Small, unique per active connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientId(pub u16);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which channel a message travels on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Reliable,
    Unreliable,
}

/// Message discriminant as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgKind {
    Handshake = 1,
    Welcome = 2,
    MapInfo = 3,
    ClientReady = 4,
    PlayerCommand = 5,
    Snapshot = 6,
    Chat = 7,
    Kick = 8,
    Disconnect = 9,
}

impl MsgKind {
    pub fn from_u8(b: u8) -> Option<Self> {
        Some(match b {
            1 => Self::Handshake,
            2 => Self::Welcome,
            3 => Self::MapInfo,
            4 => Self::ClientReady,
            5 => Self::PlayerCommand,
            6 => Self::Snapshot,
            7 => Self::Chat,
            8 => Self::Kick,
            9 => Self::Disconnect,
            _ => return None,
        })
    }

    pub fn channel(self) -> Channel {
        match self {
            Self::PlayerCommand | Self::Snapshot => Channel::Unreliable,
            _ => Channel::Reliable,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Handshake => "Handshake",
            Self::Welcome => "Welcome",
            Self::MapInfo => "MapInfo",
            Self::ClientReady => "ClientReady",
            Self::PlayerCommand => "PlayerCommand",
            Self::Snapshot => "Snapshot",
            Self::Chat => "Chat",
            Self::Kick => "Kick",
            Self::Disconnect => "Disconnect",
        }
    }
}

/// High-level message envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum NetMsg {
    // ─── Connection handshake ───
    /// Client -> server. Carries the UDP port snapshots should go to.
    Handshake { protocol: u32, udp_port: u16 },
    /// Server -> client.
    Welcome { client_id: ClientId, tick_rate: u16 },

    // ─── Map agreement ───
    /// Server -> client: map to load.
    ///
    /// `epoch` counts map loads on the server; `start_tick` is the last tick
    /// simulated before the load, so every snapshot of this map is newer.
    MapInfo {
        info: MapInfo,
        epoch: u32,
        start_tick: u32,
    },
    /// Client -> server: map loaded, with the checksum the client computed
    /// and the epoch of the MapInfo it answers.
    ClientReady { checksum: MapChecksum, epoch: u32 },

    // ─── Gameplay (unreliable) ───
    PlayerCommand(PlayerCommand),
    Snapshot(Snapshot),

    // ─── Control ───
    Chat { text: String },
    /// Server -> client, followed by the server closing the connection.
    Kick { reason: KickReason, message: String },
    Disconnect,
}

impl NetMsg {
    pub fn kind(&self) -> MsgKind {
        match self {
            Self::Handshake { .. } => MsgKind::Handshake,
            Self::Welcome { .. } => MsgKind::Welcome,
            Self::MapInfo { .. } => MsgKind::MapInfo,
            Self::ClientReady { .. } => MsgKind::ClientReady,
            Self::PlayerCommand(_) => MsgKind::PlayerCommand,
            Self::Snapshot(_) => MsgKind::Snapshot,
            Self::Chat { .. } => MsgKind::Chat,
            Self::Kick { .. } => MsgKind::Kick,
            Self::Disconnect => MsgKind::Disconnect,
        }
    }

    pub fn channel(&self) -> Channel {
        self.kind().channel()
    }
}

/// Why a server closed a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum KickReason {
    Kicked = 1,
    MapMismatch = 2,
    Timeout = 3,
    CapacityExceeded = 4,
    ProtocolMismatch = 5,
    ServerShutdown = 6,
    ProtocolViolation = 7,
}

impl KickReason {
    pub fn from_u8(b: u8) -> Option<Self> {
        Some(match b {
            1 => Self::Kicked,
            2 => Self::MapMismatch,
            3 => Self::Timeout,
            4 => Self::CapacityExceeded,
            5 => Self::ProtocolMismatch,
            6 => Self::ServerShutdown,
            7 => Self::ProtocolViolation,
            _ => return None,
        })
    }
}

impl fmt::Display for KickReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Kicked => "kicked by operator",
            Self::MapMismatch => "map checksum mismatch",
            Self::Timeout => "timed out",
            Self::CapacityExceeded => "server is full",
            Self::ProtocolMismatch => "protocol version mismatch",
            Self::ServerShutdown => "server shutting down",
            Self::ProtocolViolation => "protocol violation",
        };
        f.write_str(s)
    }
}

/// SHA-256 digest of a map file.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MapChecksum(pub [u8; 32]);

impl MapChecksum {
    pub fn of(bytes: &[u8]) -> Self {
        Self(Sha256::digest(bytes).into())
    }
}

impl fmt::Display for MapChecksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough to tell maps apart in logs.
        for b in &self.0[..6] {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for MapChecksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MapChecksum({self})")
    }
}

/// Identity of a loaded map. Client and server must agree bitwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapInfo {
    /// Map name (e.g., "de_dust2").
    pub name: String,
    pub checksum: MapChecksum,
}

/// Client input for one local frame.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerCommand {
    pub client_id: ClientId,
    /// Strictly increasing per client.
    pub client_tick: u32,
    pub input_bits: InputButtons,
    /// Pitch, yaw, roll in degrees.
    pub view_angles: Vec3,
}

/// One entity as carried in a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityState {
    pub id: EntityId,
    pub bundle: ComponentBundle,
}

/// Full authoritative world state for one server tick.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub server_tick: u32,
    /// Newest `client_tick` of the recipient's commands applied so far.
    pub last_processed_client_tick: Option<u32>,
    pub entities: Vec<EntityState>,
}

impl Snapshot {
    pub fn entity(&self, id: EntityId) -> Option<&EntityState> {
        self.entities.iter().find(|e| e.id == id)
    }

    /// The entity controlled by `client`, if any.
    pub fn controlled_by(&self, client: ClientId) -> Option<&EntityState> {
        self.entities
            .iter()
            .find(|e| e.bundle.controller.is_some_and(|c| c.client == client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_channels() {
        for b in 1..=9u8 {
            let kind = MsgKind::from_u8(b).unwrap();
            assert_eq!(kind as u8, b);
            let unreliable = matches!(kind, MsgKind::PlayerCommand | MsgKind::Snapshot);
            assert_eq!(kind.channel() == Channel::Unreliable, unreliable);
        }
        assert!(MsgKind::from_u8(0).is_none());
        assert!(MsgKind::from_u8(10).is_none());
    }

    #[test]
    fn checksum_depends_on_content() {
        assert_eq!(MapChecksum::of(b"abc"), MapChecksum::of(b"abc"));
        assert_ne!(MapChecksum::of(b"abc"), MapChecksum::of(b"abd"));
        assert_eq!(MapChecksum::of(b"abc").to_string().len(), 12);
    }
}
