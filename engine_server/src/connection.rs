//! Per-client connection records and the table that owns them.
//!
//! A connection moves `Connecting -> Handshaking -> Ready -> Disconnected`.
//! Peers that have not sent a Handshake yet are `Connecting` and hold no
//! `ClientId`; everything else lives in [`ConnectionTable`], indexed by id.
//! The table holds protocol state only. Sockets are owned by the server.

use std::{
    collections::BTreeMap,
    fmt,
    net::SocketAddr,
    time::{Duration, Instant},
};

use engine_shared::{
    ecs::EntityId,
    error::{NetError, NetResult},
    net::{ClientId, KickReason, MapChecksum, MapInfo, PlayerCommand},
    transport::{SequenceCounter, SequenceWindow},
};

/// Out-of-state messages tolerated before the peer is kicked.
pub const MAX_HANDSHAKE_VIOLATIONS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// TCP accepted, no Handshake yet.
    Connecting,
    /// Welcome sent; waiting for a ClientReady matching the current map.
    Handshaking,
    /// Admitted to simulation and snapshot distribution.
    Ready,
    /// Terminal. The record stays until its outbox drains.
    Disconnected,
}

impl ConnState {
    pub fn name(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Handshaking => "handshaking",
            Self::Ready => "ready",
            Self::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Why a connection reached `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectCause {
    /// Server sent a Kick.
    Kick(KickReason),
    /// Peer sent Disconnect.
    ClientLeft,
    /// Reliable channel failed or closed.
    LinkLost,
}

impl fmt::Display for DisconnectCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kick(reason) => write!(f, "kicked ({reason})"),
            Self::ClientLeft => f.write_str("client left"),
            Self::LinkLost => f.write_str("connection lost"),
        }
    }
}

/// Protocol state of one admitted peer.
#[derive(Debug)]
pub struct Connection {
    pub id: ClientId,
    pub tcp_addr: SocketAddr,
    /// Where snapshots go and the only source commands are taken from:
    /// the TCP peer's IP with the port announced in Handshake.
    pub udp_addr: SocketAddr,
    pub entity: Option<EntityId>,
    state: ConnState,
    last_received: Instant,
    last_received_tick: u32,
    cmd_window: SequenceWindow,
    snapshot_seq: SequenceCounter,
    last_applied_cmd: Option<u32>,
    pending_cmd: Option<PlayerCommand>,
    violations: u32,
    disconnected: Option<(DisconnectCause, Instant)>,
}

impl Connection {
    /// Creates the record for a peer whose Handshake was just accepted.
    pub fn new(id: ClientId, tcp_addr: SocketAddr, udp_port: u16, now: Instant) -> Self {
        Self {
            id,
            tcp_addr,
            udp_addr: SocketAddr::new(tcp_addr.ip(), udp_port),
            entity: None,
            state: ConnState::Handshaking,
            last_received: now,
            last_received_tick: 0,
            cmd_window: SequenceWindow::default(),
            snapshot_seq: SequenceCounter::default(),
            last_applied_cmd: None,
            pending_cmd: None,
            violations: 0,
            disconnected: None,
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == ConnState::Ready
    }

    pub fn is_disconnected(&self) -> bool {
        self.state == ConnState::Disconnected
    }

    pub fn disconnect_cause(&self) -> Option<DisconnectCause> {
        self.disconnected.map(|(cause, _)| cause)
    }

    /// Newest `client_tick` applied by the simulation.
    pub fn last_applied_cmd(&self) -> Option<u32> {
        self.last_applied_cmd
    }

    /// Newest accepted command datagram sequence.
    pub fn last_acked_sequence(&self) -> Option<u32> {
        self.cmd_window.last_accepted()
    }

    pub fn last_received_tick(&self) -> u32 {
        self.last_received_tick
    }

    /// Records inbound traffic for timeout purposes.
    pub fn touch(&mut self, now: Instant, server_tick: u32) {
        self.last_received = now;
        self.last_received_tick = server_tick;
    }

    pub fn timed_out(&self, now: Instant, timeout: Duration) -> bool {
        !self.is_disconnected() && now.saturating_duration_since(self.last_received) > timeout
    }

    /// `Handshaking -> Ready` if `checksum` matches the map the server runs.
    ///
    /// A mismatch moves the connection to `Disconnected`; the caller still
    /// owes the peer a Kick.
    pub fn client_ready(
        &mut self,
        checksum: MapChecksum,
        map: Option<&MapInfo>,
        now: Instant,
    ) -> NetResult<()> {
        if self.state != ConnState::Handshaking {
            return Err(self.unexpected("ClientReady"));
        }
        let Some(map) = map else {
            return Err(NetError::Handshake {
                message: "ClientReady",
                state: "handshaking without a map",
            });
        };
        if map.checksum != checksum {
            self.disconnect(DisconnectCause::Kick(KickReason::MapMismatch), now);
            return Err(NetError::MapMismatch {
                expected: map.checksum,
                actual: checksum,
            });
        }
        self.state = ConnState::Ready;
        Ok(())
    }

    /// Sends the peer back through map agreement after a map change.
    pub fn restart_map_agreement(&mut self) {
        if matches!(self.state, ConnState::Ready | ConnState::Handshaking) {
            self.state = ConnState::Handshaking;
            self.entity = None;
            self.pending_cmd = None;
        }
    }

    /// Builds the error for a message that does not fit the current state.
    pub fn unexpected(&self, message: &'static str) -> NetError {
        NetError::Handshake {
            message,
            state: self.state.name(),
        }
    }

    /// Counts one out-of-state message. Returns true once the peer has used
    /// up its allowance.
    pub fn record_violation(&mut self) -> bool {
        self.violations += 1;
        self.violations >= MAX_HANDSHAKE_VIOLATIONS
    }

    /// Offers a command datagram. Datagrams from any address but `udp_addr`
    /// and stale datagrams are rejected; commands outside `Ready` or not
    /// newer than the last applied one are dropped. Returns whether the
    /// command became the pending one.
    pub fn offer_command(&mut self, sequence: u32, from: SocketAddr, cmd: PlayerCommand) -> NetResult<bool> {
        if from != self.udp_addr {
            return Err(NetError::protocol(format!(
                "command from {from}, expected {}",
                self.udp_addr
            )));
        }
        self.cmd_window.accept(sequence)?;
        if self.state != ConnState::Ready {
            return Ok(false);
        }
        if self.last_applied_cmd.is_some_and(|t| cmd.client_tick <= t) {
            return Ok(false);
        }
        if self
            .pending_cmd
            .as_ref()
            .is_some_and(|p| p.client_tick >= cmd.client_tick)
        {
            return Ok(false);
        }
        self.pending_cmd = Some(cmd);
        Ok(true)
    }

    /// Takes the command to apply this tick, at most one.
    pub fn take_command(&mut self) -> Option<PlayerCommand> {
        let cmd = self.pending_cmd.take()?;
        self.last_applied_cmd = Some(cmd.client_tick);
        Some(cmd)
    }

    /// Sequence for the next snapshot datagram to this peer.
    pub fn next_snapshot_seq(&mut self) -> u32 {
        self.snapshot_seq.next()
    }

    pub fn disconnect(&mut self, cause: DisconnectCause, now: Instant) {
        if self.is_disconnected() {
            return;
        }
        self.state = ConnState::Disconnected;
        self.pending_cmd = None;
        self.disconnected = Some((cause, now));
    }
}

/// Connection table indexed by `ClientId`, with id allocation.
#[derive(Debug)]
pub struct ConnectionTable {
    conns: BTreeMap<ClientId, Connection>,
    max_clients: usize,
}

impl ConnectionTable {
    pub fn new(max_clients: usize) -> Self {
        Self {
            conns: BTreeMap::new(),
            max_clients,
        }
    }

    pub fn max_clients(&self) -> usize {
        self.max_clients
    }

    /// Takes effect for future allocations only.
    pub fn set_max_clients(&mut self, max_clients: usize) {
        self.max_clients = max_clients;
    }

    /// Lowest id in `1..=max_clients` not held by any record. Records in
    /// `Disconnected` still hold their id until reaped.
    pub fn allocate(&self) -> NetResult<ClientId> {
        let max = u16::try_from(self.max_clients).unwrap_or(u16::MAX);
        (1..=max)
            .map(ClientId)
            .find(|id| !self.conns.contains_key(id))
            .ok_or(NetError::CapacityExceeded {
                max: self.max_clients,
            })
    }

    pub fn insert(&mut self, conn: Connection) {
        self.conns.insert(conn.id, conn);
    }

    pub fn get(&self, id: ClientId) -> Option<&Connection> {
        self.conns.get(&id)
    }

    pub fn get_mut(&mut self, id: ClientId) -> Option<&mut Connection> {
        self.conns.get_mut(&id)
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.conns.contains_key(&id)
    }

    /// All records in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.conns.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Connection> {
        self.conns.values_mut()
    }

    pub fn ids(&self) -> Vec<ClientId> {
        self.conns.keys().copied().collect()
    }

    /// Number of records that are not yet torn down.
    pub fn active(&self) -> usize {
        self.conns.values().filter(|c| !c.is_disconnected()).count()
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Removes `Disconnected` records whose outbound data is flushed, or which
    /// have lingered longer than `linger`. Returns the released ids.
    pub fn reap(&mut self, now: Instant, linger: Duration, flushed: impl Fn(ClientId) -> bool) -> Vec<ClientId> {
        let released: Vec<ClientId> = self
            .conns
            .values()
            .filter_map(|c| {
                let (_, since) = c.disconnected?;
                (flushed(c.id) || now.saturating_duration_since(since) >= linger).then_some(c.id)
            })
            .collect();
        for id in &released {
            self.conns.remove(id);
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine_shared::{math::Vec3, movement::InputButtons};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn map(bytes: &[u8]) -> MapInfo {
        MapInfo {
            name: "de_dust2".into(),
            checksum: MapChecksum::of(bytes),
        }
    }

    fn cmd(tick: u32) -> PlayerCommand {
        PlayerCommand {
            client_id: ClientId(1),
            client_tick: tick,
            input_bits: InputButtons::FORWARD,
            view_angles: Vec3::ZERO,
        }
    }

    fn ready_conn(now: Instant) -> Connection {
        let info = map(b"x");
        let mut c = Connection::new(ClientId(1), addr(5000), 6000, now);
        c.client_ready(info.checksum, Some(&info), now).unwrap();
        c
    }

    #[test]
    fn handshake_to_ready() {
        let now = Instant::now();
        let info = map(b"dust");
        let mut c = Connection::new(ClientId(1), addr(5000), 6000, now);
        assert_eq!(c.state(), ConnState::Handshaking);
        assert_eq!(c.udp_addr, addr(6000));

        assert!(matches!(
            c.client_ready(info.checksum, None, now),
            Err(NetError::Handshake { .. })
        ));
        assert_eq!(c.state(), ConnState::Handshaking);

        c.client_ready(info.checksum, Some(&info), now).unwrap();
        assert!(c.is_ready());

        // A second ClientReady is out of state.
        assert!(matches!(
            c.client_ready(info.checksum, Some(&info), now),
            Err(NetError::Handshake { state: "ready", .. })
        ));
    }

    #[test]
    fn checksum_mismatch_disconnects() {
        let now = Instant::now();
        let info = map(b"server copy");
        let mut c = Connection::new(ClientId(1), addr(5000), 6000, now);
        let err = c
            .client_ready(MapChecksum::of(b"client copy"), Some(&info), now)
            .unwrap_err();
        assert!(matches!(err, NetError::MapMismatch { .. }));
        assert_eq!(c.state(), ConnState::Disconnected);
        assert_eq!(
            c.disconnect_cause(),
            Some(DisconnectCause::Kick(KickReason::MapMismatch))
        );
    }

    #[test]
    fn map_change_restarts_agreement() {
        let now = Instant::now();
        let mut c = ready_conn(now);
        c.entity = Some(EntityId {
            index: 0,
            generation: 0,
        });
        c.offer_command(1, addr(6000), cmd(1)).unwrap();
        c.restart_map_agreement();
        assert_eq!(c.state(), ConnState::Handshaking);
        assert_eq!(c.entity, None);
        assert_eq!(c.take_command(), None);

        c.disconnect(DisconnectCause::ClientLeft, now);
        c.restart_map_agreement();
        assert_eq!(c.state(), ConnState::Disconnected);
    }

    #[test]
    fn violations_run_out() {
        let mut c = Connection::new(ClientId(1), addr(5000), 6000, Instant::now());
        assert!(!c.record_violation());
        assert!(!c.record_violation());
        assert!(c.record_violation());
    }

    #[test]
    fn newest_command_wins_and_older_are_discarded() {
        let now = Instant::now();
        let mut c = ready_conn(now);
        assert!(c.offer_command(1, addr(6000), cmd(5)).unwrap());
        assert!(c.offer_command(2, addr(6000), cmd(7)).unwrap());
        // Newer datagram but older command.
        assert!(!c.offer_command(3, addr(6000), cmd(6)).unwrap());

        assert_eq!(c.take_command().map(|c| c.client_tick), Some(7));
        assert_eq!(c.take_command(), None);
        assert_eq!(c.last_applied_cmd(), Some(7));

        // Duplicate of the applied tick, then a stale datagram.
        assert!(!c.offer_command(4, addr(6000), cmd(7)).unwrap());
        assert!(matches!(
            c.offer_command(4, addr(6000), cmd(8)),
            Err(NetError::SequenceStale { .. })
        ));
        assert!(c.offer_command(5, addr(6000), cmd(8)).unwrap());
        assert_eq!(c.last_acked_sequence(), Some(5));
    }

    #[test]
    fn commands_only_from_the_handshake_port() {
        let now = Instant::now();
        let mut c = ready_conn(now);
        // Same host, different port: rejected without touching the window.
        assert!(matches!(
            c.offer_command(9, addr(6001), cmd(1)),
            Err(NetError::Protocol(_))
        ));
        assert_eq!(c.udp_addr, addr(6000));
        assert_eq!(c.last_acked_sequence(), None);
        assert_eq!(c.take_command(), None);

        assert!(c.offer_command(1, addr(6000), cmd(1)).unwrap());
        assert_eq!(c.take_command().map(|c| c.client_tick), Some(1));
    }

    #[test]
    fn commands_before_ready_are_ignored() {
        let mut c = Connection::new(ClientId(1), addr(5000), 6000, Instant::now());
        assert!(!c.offer_command(1, addr(6000), cmd(1)).unwrap());
        assert_eq!(c.take_command(), None);
    }

    #[test]
    fn timeout_uses_last_traffic() {
        let start = Instant::now();
        let mut c = Connection::new(ClientId(1), addr(5000), 6000, start);
        let limit = Duration::from_secs(5);
        assert!(!c.timed_out(start + Duration::from_secs(4), limit));
        assert!(c.timed_out(start + Duration::from_secs(6), limit));
        c.touch(start + Duration::from_secs(6), 42);
        assert_eq!(c.last_received_tick(), 42);
        assert!(!c.timed_out(start + Duration::from_secs(10), limit));

        c.disconnect(DisconnectCause::Kick(KickReason::Timeout), start);
        assert!(!c.timed_out(start + Duration::from_secs(60), limit));
    }

    #[test]
    fn allocation_is_lowest_free_and_bounded() {
        let now = Instant::now();
        let mut table = ConnectionTable::new(2);
        let a = table.allocate().unwrap();
        assert_eq!(a, ClientId(1));
        table.insert(Connection::new(a, addr(1), 1, now));
        let b = table.allocate().unwrap();
        assert_eq!(b, ClientId(2));
        table.insert(Connection::new(b, addr(2), 2, now));
        assert!(matches!(
            table.allocate(),
            Err(NetError::CapacityExceeded { max: 2 })
        ));

        // Disconnected records keep their id until reaped.
        table
            .get_mut(a)
            .unwrap()
            .disconnect(DisconnectCause::Kick(KickReason::Kicked), now);
        assert!(table.allocate().is_err());
        assert_eq!(table.active(), 1);

        assert!(table.reap(now, Duration::from_secs(1), |_| false).is_empty());
        assert_eq!(table.reap(now, Duration::from_secs(1), |_| true), vec![a]);
        assert_eq!(table.allocate().unwrap(), ClientId(1));
    }

    #[test]
    fn reap_releases_after_linger() {
        let now = Instant::now();
        let mut table = ConnectionTable::new(4);
        table.insert(Connection::new(ClientId(1), addr(1), 1, now));
        table
            .get_mut(ClientId(1))
            .unwrap()
            .disconnect(DisconnectCause::LinkLost, now);
        let later = now + Duration::from_secs(2);
        assert_eq!(table.reap(later, Duration::from_secs(1), |_| false), vec![ClientId(1)]);
        assert!(table.is_empty());
    }
}
