//! Reliable (TCP) and unreliable (UDP) channels.
//!
//! Both channels are polled, never awaited, on the hot path: `poll_recv`
//! returns `Ok(None)` as soon as no complete frame is available, and the
//! reliable `flush` writes only what the socket accepts right now. Unsent
//! reliable frames stay in the connection's outbox until a later flush.

use std::{collections::VecDeque, io, net::SocketAddr, time::Duration};

use bytes::{Buf, Bytes, BytesMut};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::debug;

use crate::{
    codec::{self, FrameHeader, MAX_DATAGRAM_LEN},
    error::{NetError, NetResult},
    net::{Channel, NetMsg},
};

/// Flush attempts without progress before the reliable channel gives up.
pub const RELIABLE_RETRY_BUDGET: u32 = 256;

const READ_CHUNK: usize = 4096;

/// Tracks the newest accepted sequence number for one direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SequenceWindow {
    last_accepted: Option<u32>,
}

impl SequenceWindow {
    /// Accepts `seq` only if it is newer than everything accepted before.
    pub fn accept(&mut self, seq: u32) -> NetResult<()> {
        match self.last_accepted {
            Some(last) if seq <= last => Err(NetError::SequenceStale {
                received: seq,
                last_accepted: last,
            }),
            _ => {
                self.last_accepted = Some(seq);
                Ok(())
            }
        }
    }

    pub fn last_accepted(&self) -> Option<u32> {
        self.last_accepted
    }
}

/// Outgoing sequence numbers for one direction, starting at 1.
#[derive(Debug, Clone, Copy, Default)]
pub struct SequenceCounter {
    last: u32,
}

impl SequenceCounter {
    pub fn next(&mut self) -> u32 {
        self.last = self.last.wrapping_add(1);
        self.last
    }
}

/// Ordered, duplicate-free control channel over TCP.
#[derive(Debug)]
pub struct ReliableConn {
    stream: TcpStream,
    peer: SocketAddr,
    read_buf: BytesMut,
    outbox: VecDeque<Bytes>,
    send_seq: SequenceCounter,
    last_delivered: u32,
    stalled_flushes: u32,
    eof: bool,
}

impl ReliableConn {
    pub fn new(stream: TcpStream) -> NetResult<Self> {
        let peer = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            peer,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            outbox: VecDeque::new(),
            send_seq: SequenceCounter::default(),
            last_delivered: 0,
            stalled_flushes: 0,
            eof: false,
        })
    }

    pub async fn connect(addr: SocketAddr) -> NetResult<Self> {
        let stream = TcpStream::connect(addr).await?;
        Self::new(stream)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Queues a message for delivery. Nothing is written until [`Self::flush`].
    pub fn queue(&mut self, msg: &NetMsg) -> NetResult<()> {
        if msg.channel() != Channel::Reliable {
            return Err(NetError::protocol(format!(
                "{} is not a reliable message",
                msg.kind().name()
            )));
        }
        let frame = codec::encode(msg, self.send_seq.next())?;
        self.outbox.push_back(frame);
        Ok(())
    }

    /// Number of frames still waiting to be written.
    pub fn outstanding(&self) -> usize {
        self.outbox.len()
    }

    /// Writes as much of the outbox as the socket accepts without blocking.
    pub fn flush(&mut self) -> NetResult<()> {
        let mut progressed = false;
        while let Some(front) = self.outbox.front_mut() {
            match self.stream.try_write(front) {
                Ok(0) => return Err(NetError::ReliableChannel("peer closed while writing".into())),
                Ok(n) => {
                    progressed = true;
                    if n == front.len() {
                        self.outbox.pop_front();
                    } else {
                        front.advance(n);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }

        if progressed || self.outbox.is_empty() {
            self.stalled_flushes = 0;
        } else {
            self.stalled_flushes += 1;
            if self.stalled_flushes > RELIABLE_RETRY_BUDGET {
                return Err(NetError::ReliableChannel(format!(
                    "no progress after {RELIABLE_RETRY_BUDGET} flush attempts ({} frames pending)",
                    self.outbox.len()
                )));
            }
        }
        Ok(())
    }

    /// Flushes until the outbox is empty or `limit` elapses.
    pub async fn flush_all(&mut self, limit: Duration) -> NetResult<()> {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            self.flush()?;
            if self.outbox.is_empty() {
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, self.stream.writable())
                .await
                .is_err()
            {
                return Err(NetError::ReliableChannel(format!(
                    "{} frames unsent after {limit:?}",
                    self.outbox.len()
                )));
            }
        }
    }

    /// Returns the next in-order message if one is fully buffered.
    ///
    /// A malformed frame (unknown kind, oversized or bad payload) yields
    /// `Err(NetError::Protocol)` for that frame only; the caller may keep
    /// polling. A bad magic, a sequence gap or a closed peer yields
    /// `Err(NetError::ReliableChannel)`.
    pub fn poll_recv(&mut self) -> NetResult<Option<NetMsg>> {
        loop {
            if let Some((sequence, frame)) = self.take_frame()? {
                if sequence <= self.last_delivered {
                    debug!(peer = %self.peer, seq = sequence, "dropping duplicate reliable frame");
                    continue;
                }
                if sequence != self.last_delivered.wrapping_add(1) {
                    return Err(NetError::ReliableChannel(format!(
                        "sequence gap: expected {}, got {}",
                        self.last_delivered.wrapping_add(1),
                        sequence
                    )));
                }
                // The sequence is consumed even if the frame turns out bad.
                self.last_delivered = sequence;
                let header = FrameHeader::parse(&frame)?;
                if header.kind.channel() != Channel::Reliable {
                    return Err(NetError::protocol(format!(
                        "{} received on reliable channel",
                        header.kind.name()
                    )));
                }
                return Ok(Some(codec::decode(&frame)?.msg));
            }

            if self.eof {
                return Err(NetError::ReliableChannel("connection closed by peer".into()));
            }
            if !self.fill()? {
                return Ok(None);
            }
        }
    }

    /// Reads whatever is available. Returns whether any bytes arrived.
    fn fill(&mut self) -> NetResult<bool> {
        let mut got = false;
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.stream.try_read(&mut chunk) {
                Ok(0) => {
                    self.eof = true;
                    return Ok(true);
                }
                Ok(n) => {
                    self.read_buf.extend_from_slice(&chunk[..n]);
                    got = true;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(got),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Splits the next complete frame off the read buffer. Only a bad magic
    /// loses the stream; any other header problem is left for the caller to
    /// report against that one frame.
    fn take_frame(&mut self) -> NetResult<Option<(u32, Bytes)>> {
        let Some((sequence, len)) = codec::stream_frame(&self.read_buf)
            .map_err(|e| NetError::ReliableChannel(format!("stream framing lost: {e}")))?
        else {
            return Ok(None);
        };
        if self.read_buf.len() < len {
            return Ok(None);
        }
        Ok(Some((sequence, self.read_buf.split_to(len).freeze())))
    }

    /// Waits until a message arrives or `limit` elapses.
    pub async fn recv_timeout(&mut self, limit: Duration) -> NetResult<Option<NetMsg>> {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            if let Some(msg) = self.poll_recv()? {
                return Ok(Some(msg));
            }
            if tokio::time::timeout_at(deadline, self.stream.readable())
                .await
                .is_err()
            {
                return Ok(None);
            }
        }
    }
}

/// Best-effort gameplay channel over a connected UDP socket (client side).
#[derive(Debug)]
pub struct UnreliableConn {
    socket: UdpSocket,
    peer: SocketAddr,
    send_seq: SequenceCounter,
    recv_window: SequenceWindow,
    recv_buf: Vec<u8>,
}

impl UnreliableConn {
    pub async fn connect(bind_addr: SocketAddr, peer: SocketAddr) -> NetResult<Self> {
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(peer).await?;
        Ok(Self {
            socket,
            peer,
            send_seq: SequenceCounter::default(),
            recv_window: SequenceWindow::default(),
            recv_buf: vec![0u8; MAX_DATAGRAM_LEN],
        })
    }

    /// Sends one datagram. A full socket buffer drops it, as the network would.
    pub fn send(&mut self, msg: &NetMsg) -> NetResult<()> {
        if msg.channel() != Channel::Unreliable {
            return Err(NetError::protocol(format!(
                "{} is not an unreliable message",
                msg.kind().name()
            )));
        }
        let frame = codec::encode(msg, self.send_seq.next())?;
        match self.socket.try_send(&frame) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                debug!(peer = %self.peer, "udp send buffer full, datagram dropped");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Returns the next fresh datagram, if any.
    ///
    /// Malformed and stale datagrams come back as errors so the caller can
    /// log and keep polling.
    pub fn poll_recv(&mut self) -> NetResult<Option<NetMsg>> {
        let n = match self.socket.try_recv(&mut self.recv_buf) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let frame = decode_datagram(&self.recv_buf[..n])?;
        self.recv_window.accept(frame.sequence)?;
        Ok(Some(frame.msg))
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> NetResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

/// Decodes a datagram and checks it belongs on the unreliable channel.
pub fn decode_datagram(bytes: &[u8]) -> NetResult<codec::Frame> {
    let frame = codec::decode(bytes)?;
    if frame.msg.channel() != Channel::Unreliable {
        return Err(NetError::protocol(format!(
            "{} received on unreliable channel",
            frame.msg.kind().name()
        )));
    }
    Ok(frame)
}

/// TCP server listener.
pub struct ReliableListener {
    listener: TcpListener,
}

impl ReliableListener {
    pub async fn bind(addr: SocketAddr) -> NetResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    /// Accepts a pending connection without waiting for one.
    pub async fn try_accept(&self) -> NetResult<Option<ReliableConn>> {
        match tokio::time::timeout(Duration::ZERO, self.listener.accept()).await {
            Ok(Ok((stream, _))) => Ok(Some(ReliableConn::new(stream)?)),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Ok(None),
        }
    }

    pub fn local_addr(&self) -> NetResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}
