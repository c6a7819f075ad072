//! Binary wire format.
//!
//! Every frame, on either channel, starts with a fixed header
//! (little-endian):
//!
//! | field         | type  |
//! |---------------|-------|
//! | magic         | `u16` (`0x5053`) |
//! | kind          | `u8` ([`MsgKind`]) |
//! | sequence      | `u32` |
//! | payload_len   | `u16` |
//!
//! followed by `payload_len` bytes of payload. Strings are `u16`
//! length-prefixed UTF-8. Decoding never panics: short, oversized or
//! inconsistent input yields [`NetError::Protocol`].

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{
    ecs::{ComponentBundle, Controller, EntityId, Parent, Transform, Velocity},
    error::{NetError, NetResult},
    math::Vec3,
    movement::InputButtons,
    net::{
        ClientId, EntityState, KickReason, MapChecksum, MapInfo, MsgKind, NetMsg, PlayerCommand,
        Snapshot,
    },
};

pub const MAGIC: u16 = 0x5053;
/// Minimum frame length.
pub const HEADER_LEN: usize = 9;
pub const MAX_PAYLOAD_LEN: usize = 60_000;
/// Largest datagram either side will produce or accept.
pub const MAX_DATAGRAM_LEN: usize = HEADER_LEN + MAX_PAYLOAD_LEN;

pub const MAX_MAP_NAME_LEN: usize = 64;
pub const MAX_CHAT_LEN: usize = 256;
pub const MAX_KICK_MESSAGE_LEN: usize = 256;

const BUNDLE_TRANSFORM: u8 = 1 << 0;
const BUNDLE_VELOCITY: u8 = 1 << 1;
const BUNDLE_CONTROLLER: u8 = 1 << 2;
const BUNDLE_PARENT: u8 = 1 << 3;
const BUNDLE_ALL: u8 = BUNDLE_TRANSFORM | BUNDLE_VELOCITY | BUNDLE_CONTROLLER | BUNDLE_PARENT;

/// A decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub sequence: u32,
    pub msg: NetMsg,
}

/// Parsed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: MsgKind,
    pub sequence: u32,
    pub payload_len: usize,
}

impl FrameHeader {
    /// Validates the fixed header at the start of `buf`.
    pub fn parse(buf: &[u8]) -> NetResult<Self> {
        if buf.len() < HEADER_LEN {
            return Err(NetError::protocol(format!(
                "short frame: {} < {HEADER_LEN} bytes",
                buf.len()
            )));
        }
        let mut b = &buf[..HEADER_LEN];
        let magic = b.get_u16_le();
        if magic != MAGIC {
            return Err(NetError::protocol(format!("bad magic {magic:#06x}")));
        }
        let raw_kind = b.get_u8();
        let kind = MsgKind::from_u8(raw_kind)
            .ok_or_else(|| NetError::protocol(format!("unknown message kind {raw_kind}")))?;
        let sequence = b.get_u32_le();
        let payload_len = b.get_u16_le() as usize;
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(NetError::protocol(format!("payload too large: {payload_len}")));
        }
        Ok(Self {
            kind,
            sequence,
            payload_len,
        })
    }

    pub fn frame_len(&self) -> usize {
        HEADER_LEN + self.payload_len
    }
}

/// Sequence and total length of the frame at the start of a byte stream,
/// or `None` if the header is not complete yet.
///
/// Only the magic is checked. Kind and payload length are validated per
/// frame by [`FrameHeader::parse`], so a bad frame can be skipped without
/// losing the stream.
pub fn stream_frame(buf: &[u8]) -> NetResult<Option<(u32, usize)>> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }
    let mut b = &buf[..HEADER_LEN];
    let magic = b.get_u16_le();
    if magic != MAGIC {
        return Err(NetError::protocol(format!("bad magic {magic:#06x}")));
    }
    b.advance(1);
    let sequence = b.get_u32_le();
    let payload_len = b.get_u16_le() as usize;
    Ok(Some((sequence, HEADER_LEN + payload_len)))
}

/// Encodes `msg` as a single frame.
pub fn encode(msg: &NetMsg, sequence: u32) -> NetResult<Bytes> {
    let mut payload = BytesMut::with_capacity(64);
    match msg {
        NetMsg::Handshake { protocol, udp_port } => {
            payload.put_u32_le(*protocol);
            payload.put_u16_le(*udp_port);
        }
        NetMsg::Welcome {
            client_id,
            tick_rate,
        } => {
            payload.put_u16_le(client_id.0);
            payload.put_u16_le(*tick_rate);
        }
        NetMsg::MapInfo {
            info,
            epoch,
            start_tick,
        } => {
            put_str(&mut payload, &info.name, MAX_MAP_NAME_LEN)?;
            payload.put_slice(&info.checksum.0);
            payload.put_u32_le(*epoch);
            payload.put_u32_le(*start_tick);
        }
        NetMsg::ClientReady { checksum, epoch } => {
            payload.put_slice(&checksum.0);
            payload.put_u32_le(*epoch);
        }
        NetMsg::PlayerCommand(cmd) => {
            payload.put_u16_le(cmd.client_id.0);
            payload.put_u32_le(cmd.client_tick);
            payload.put_u16_le(cmd.input_bits.bits());
            put_vec3(&mut payload, cmd.view_angles);
        }
        NetMsg::Chat { text } => put_str(&mut payload, text, MAX_CHAT_LEN)?,
        NetMsg::Kick { reason, message } => {
            payload.put_u8(*reason as u8);
            put_str(&mut payload, message, MAX_KICK_MESSAGE_LEN)?;
        }
        NetMsg::Disconnect => {}
        NetMsg::Snapshot(s) => {
            let body = encode_snapshot_body(s.entities.iter().map(|e| (e.id, &e.bundle)))?;
            return encode_snapshot(sequence, s.server_tick, s.last_processed_client_tick, &body);
        }
    }
    frame(msg.kind(), sequence, &payload)
}

/// Decodes exactly one frame; trailing bytes are an error.
pub fn decode(buf: &[u8]) -> NetResult<Frame> {
    let header = FrameHeader::parse(buf)?;
    if buf.len() != header.frame_len() {
        return Err(NetError::protocol(format!(
            "frame length {} does not match header ({})",
            buf.len(),
            header.frame_len()
        )));
    }
    let mut r = Reader(&buf[HEADER_LEN..]);
    let msg = decode_payload(header.kind, &mut r)?;
    if r.0.has_remaining() {
        return Err(NetError::protocol(format!(
            "{} trailing bytes after {}",
            r.0.remaining(),
            header.kind.name()
        )));
    }
    Ok(Frame {
        sequence: header.sequence,
        msg,
    })
}

/// Encodes the entity list of a snapshot. The result is shared by every
/// recipient of the same tick.
pub fn encode_snapshot_body<'a>(
    entities: impl Iterator<Item = (EntityId, &'a ComponentBundle)>,
) -> NetResult<Bytes> {
    let mut body = BytesMut::with_capacity(1024);
    body.put_u16_le(0);
    let mut count: usize = 0;
    for (id, bundle) in entities {
        count += 1;
        body.put_u32_le(id.index);
        body.put_u32_le(id.generation);
        put_bundle(&mut body, bundle);
    }
    let count = u16::try_from(count)
        .map_err(|_| NetError::protocol(format!("too many entities in snapshot: {count}")))?;
    body[..2].copy_from_slice(&count.to_le_bytes());
    Ok(body.freeze())
}

/// Wraps a shared snapshot body with the per-recipient fields.
pub fn encode_snapshot(
    sequence: u32,
    server_tick: u32,
    last_processed_client_tick: Option<u32>,
    body: &Bytes,
) -> NetResult<Bytes> {
    let mut payload = BytesMut::with_capacity(9 + body.len());
    payload.put_u32_le(server_tick);
    match last_processed_client_tick {
        Some(t) => {
            payload.put_u8(1);
            payload.put_u32_le(t);
        }
        None => payload.put_u8(0),
    }
    payload.put_slice(body);
    frame(MsgKind::Snapshot, sequence, &payload)
}

fn frame(kind: MsgKind, sequence: u32, payload: &[u8]) -> NetResult<Bytes> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(NetError::protocol(format!(
            "{} payload too large: {} bytes",
            kind.name(),
            payload.len()
        )));
    }
    let mut out = BytesMut::with_capacity(HEADER_LEN + payload.len());
    out.put_u16_le(MAGIC);
    out.put_u8(kind as u8);
    out.put_u32_le(sequence);
    out.put_u16_le(payload.len() as u16);
    out.put_slice(payload);
    Ok(out.freeze())
}

fn decode_payload(kind: MsgKind, r: &mut Reader<'_>) -> NetResult<NetMsg> {
    Ok(match kind {
        MsgKind::Handshake => NetMsg::Handshake {
            protocol: r.u32()?,
            udp_port: r.u16()?,
        },
        MsgKind::Welcome => NetMsg::Welcome {
            client_id: ClientId(r.u16()?),
            tick_rate: r.u16()?,
        },
        MsgKind::MapInfo => NetMsg::MapInfo {
            info: MapInfo {
                name: r.string(MAX_MAP_NAME_LEN)?,
                checksum: r.checksum()?,
            },
            epoch: r.u32()?,
            start_tick: r.u32()?,
        },
        MsgKind::ClientReady => NetMsg::ClientReady {
            checksum: r.checksum()?,
            epoch: r.u32()?,
        },
        MsgKind::PlayerCommand => {
            let client_id = ClientId(r.u16()?);
            let client_tick = r.u32()?;
            let raw = r.u16()?;
            let input_bits = InputButtons::from_bits(raw)
                .ok_or_else(|| NetError::protocol(format!("unknown input bits {raw:#06x}")))?;
            NetMsg::PlayerCommand(PlayerCommand {
                client_id,
                client_tick,
                input_bits,
                view_angles: r.vec3()?,
            })
        }
        MsgKind::Snapshot => {
            let server_tick = r.u32()?;
            let last_processed_client_tick = match r.u8()? {
                0 => None,
                1 => Some(r.u32()?),
                other => return Err(NetError::protocol(format!("bad ack flag {other}"))),
            };
            let count = r.u16()? as usize;
            let mut entities = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                let id = EntityId {
                    index: r.u32()?,
                    generation: r.u32()?,
                };
                entities.push(EntityState {
                    id,
                    bundle: r.bundle()?,
                });
            }
            NetMsg::Snapshot(Snapshot {
                server_tick,
                last_processed_client_tick,
                entities,
            })
        }
        MsgKind::Chat => NetMsg::Chat {
            text: r.string(MAX_CHAT_LEN)?,
        },
        MsgKind::Kick => {
            let raw = r.u8()?;
            let reason = KickReason::from_u8(raw)
                .ok_or_else(|| NetError::protocol(format!("unknown kick reason {raw}")))?;
            NetMsg::Kick {
                reason,
                message: r.string(MAX_KICK_MESSAGE_LEN)?,
            }
        }
        MsgKind::Disconnect => NetMsg::Disconnect,
    })
}

fn put_str(out: &mut BytesMut, s: &str, max: usize) -> NetResult<()> {
    if s.len() > max {
        return Err(NetError::protocol(format!(
            "string too long: {} > {max} bytes",
            s.len()
        )));
    }
    out.put_u16_le(s.len() as u16);
    out.put_slice(s.as_bytes());
    Ok(())
}

fn put_vec3(out: &mut BytesMut, v: Vec3) {
    out.put_f32_le(v.x);
    out.put_f32_le(v.y);
    out.put_f32_le(v.z);
}

fn put_bundle(out: &mut BytesMut, b: &ComponentBundle) {
    let mut mask = 0u8;
    if b.transform.is_some() {
        mask |= BUNDLE_TRANSFORM;
    }
    if b.velocity.is_some() {
        mask |= BUNDLE_VELOCITY;
    }
    if b.controller.is_some() {
        mask |= BUNDLE_CONTROLLER;
    }
    if b.parent.is_some() {
        mask |= BUNDLE_PARENT;
    }
    out.put_u8(mask);
    if let Some(t) = b.transform {
        put_vec3(out, t.origin);
        put_vec3(out, t.angles);
    }
    if let Some(Velocity(v)) = b.velocity {
        put_vec3(out, v);
    }
    if let Some(c) = b.controller {
        out.put_u16_le(c.client.0);
    }
    if let Some(Parent(p)) = b.parent {
        out.put_u32_le(p.index);
        out.put_u32_le(p.generation);
    }
}

/// Bounds-checked reads over a payload slice.
struct Reader<'a>(&'a [u8]);

impl Reader<'_> {
    fn need(&self, n: usize) -> NetResult<()> {
        if self.0.remaining() < n {
            return Err(NetError::protocol(format!(
                "truncated payload: need {n}, have {}",
                self.0.remaining()
            )));
        }
        Ok(())
    }

    fn u8(&mut self) -> NetResult<u8> {
        self.need(1)?;
        Ok(self.0.get_u8())
    }

    fn u16(&mut self) -> NetResult<u16> {
        self.need(2)?;
        Ok(self.0.get_u16_le())
    }

    fn u32(&mut self) -> NetResult<u32> {
        self.need(4)?;
        Ok(self.0.get_u32_le())
    }

    fn f32(&mut self) -> NetResult<f32> {
        self.need(4)?;
        Ok(self.0.get_f32_le())
    }

    fn vec3(&mut self) -> NetResult<Vec3> {
        Ok(Vec3::new(self.f32()?, self.f32()?, self.f32()?))
    }

    fn checksum(&mut self) -> NetResult<MapChecksum> {
        self.need(32)?;
        let mut out = [0u8; 32];
        self.0.copy_to_slice(&mut out);
        Ok(MapChecksum(out))
    }

    fn string(&mut self, max: usize) -> NetResult<String> {
        let len = self.u16()? as usize;
        if len > max {
            return Err(NetError::protocol(format!("string too long: {len} > {max}")));
        }
        self.need(len)?;
        let (s, rest) = self.0.split_at(len);
        self.0 = rest;
        String::from_utf8(s.to_vec()).map_err(|_| NetError::protocol("invalid utf-8 string"))
    }

    fn bundle(&mut self) -> NetResult<ComponentBundle> {
        let mask = self.u8()?;
        if mask & !BUNDLE_ALL != 0 {
            return Err(NetError::protocol(format!("unknown component mask {mask:#04x}")));
        }
        let mut b = ComponentBundle::default();
        if mask & BUNDLE_TRANSFORM != 0 {
            b.transform = Some(Transform {
                origin: self.vec3()?,
                angles: self.vec3()?,
            });
        }
        if mask & BUNDLE_VELOCITY != 0 {
            b.velocity = Some(Velocity(self.vec3()?));
        }
        if mask & BUNDLE_CONTROLLER != 0 {
            b.controller = Some(Controller {
                client: ClientId(self.u16()?),
            });
        }
        if mask & BUNDLE_PARENT != 0 {
            b.parent = Some(Parent(EntityId {
                index: self.u32()?,
                generation: self.u32()?,
            }));
        }
        Ok(b)
    }
}
