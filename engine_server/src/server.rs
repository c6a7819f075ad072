//! Server implementation.
//!
//! An authoritative fixed-timestep server. Each tick runs:
//! - Ingest: accept peers, read control messages, drain command datagrams,
//!   pick at most one command per ready client
//! - Simulate: advance the world with those commands only
//! - Broadcast: encode the world once, send it to every ready client
//!
//! All socket I/O is non-blocking; nothing in a tick waits on the network.
//! Timeouts compare wall-clock deadlines before the simulation step.

use std::{
    collections::HashMap,
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::{Duration, Instant},
};

use anyhow::Context;
use engine_shared::{
    codec::{self, MAX_CHAT_LEN, MAX_DATAGRAM_LEN, MAX_KICK_MESSAGE_LEN},
    config::EngineConfig,
    console::{Console, ConsoleCommand, CvarFlags, CvarValue},
    ecs::World,
    error::NetError,
    map::MapLoader,
    net::{ClientId, KickReason, MapInfo, NetMsg, PlayerCommand, PROTOCOL_VERSION},
    transport::{self, ReliableConn, ReliableListener},
};
use tokio::{net::UdpSocket, sync::mpsc};
use tracing::{debug, error, info, trace, warn};

use crate::{
    connection::{ConnState, Connection, ConnectionTable, DisconnectCause, MAX_HANDSHAKE_VIOLATIONS},
    sim::Simulation,
};

/// How long a closed connection may keep flushing its last frames.
const CLOSE_LINGER: Duration = Duration::from_secs(1);
const SHUTDOWN_FLUSH: Duration = Duration::from_millis(500);
const MAX_ACCEPTS_PER_TICK: usize = 16;

/// Server lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// No map loaded. Handshakes are accepted, nothing is simulated.
    Idle,
    /// Map loaded, simulating and broadcasting.
    Running,
    /// `quit` was issued; the loop exits after this tick.
    Stopped,
}

/// TCP peer that has not sent a Handshake yet.
struct PendingPeer {
    link: ReliableConn,
    since: Instant,
    violations: u32,
}

/// Link with no connection record that is flushing a final Kick.
struct Closing {
    link: ReliableConn,
    since: Instant,
}

enum PendingPoll {
    Wait,
    Handshake { protocol: u32, udp_port: u16 },
    Reject(KickReason, String),
    Drop,
}

/// Game server.
pub struct GameServer {
    pub cfg: EngineConfig,
    pub console: Console,
    loader: Box<dyn MapLoader>,

    listener: ReliableListener,
    udp: UdpSocket,
    udp_buf: Vec<u8>,

    pending: Vec<PendingPeer>,
    closing: Vec<Closing>,
    conns: ConnectionTable,
    links: HashMap<ClientId, ReliableConn>,

    sim: Simulation,
    map: Option<MapInfo>,
    /// Incremented on every successful map load.
    map_epoch: u32,
    /// Tick the current map was loaded after.
    map_start_tick: u32,
    state: ServerState,
    overruns: u64,

    /// Channel for console commands from stdin.
    console_rx: Option<mpsc::Receiver<String>>,
}

impl GameServer {
    /// Binds TCP and UDP on `cfg.server_addr` (same port for both) and loads
    /// `cfg.start_map` if set.
    pub async fn new(cfg: EngineConfig, loader: Box<dyn MapLoader>) -> anyhow::Result<Self> {
        cfg.validate()?;
        let addr: SocketAddr = cfg.server_addr.parse().context("parse server_addr")?;
        let listener = ReliableListener::bind(addr).await.context("tcp bind")?;
        let local = listener.local_addr()?;
        let udp = UdpSocket::bind(local).await.context("udp bind")?;

        let mut server = Self {
            conns: ConnectionTable::new(cfg.max_clients),
            sim: Simulation::new(cfg.tick_hz),
            console: Console::new(),
            cfg,
            loader,
            listener,
            udp,
            udp_buf: vec![0u8; MAX_DATAGRAM_LEN],
            pending: Vec::new(),
            closing: Vec::new(),
            links: HashMap::new(),
            map: None,
            map_epoch: 0,
            map_start_tick: 0,
            state: ServerState::Idle,
            overruns: 0,
            console_rx: None,
        };
        server.cfg.server_addr = local.to_string();
        server.register_cvars();

        if let Some(map) = server.cfg.start_map.clone() {
            server.change_map(&map)?;
        }
        Ok(server)
    }

    fn register_cvars(&mut self) {
        self.console.register_cvar(
            "sv_tickrate",
            CvarValue::Int(i64::from(self.cfg.tick_hz)),
            "Server tick rate",
            CvarFlags::SERVER_ONLY | CvarFlags::READ_ONLY,
        );
        self.console.register_cvar(
            "sv_maxclients",
            CvarValue::Int(self.cfg.max_clients as i64),
            "Max connected clients",
            CvarFlags::SERVER_ONLY,
        );
        self.console.register_cvar(
            "sv_timeout",
            CvarValue::Float(self.cfg.timeout_secs),
            "Seconds without traffic before a client is dropped",
            CvarFlags::SERVER_ONLY,
        );
    }

    /// Copies cvar values back into the live configuration.
    fn apply_cvars(&mut self) {
        if let Some(n) = self.console.cvar_int("sv_maxclients") {
            match usize::try_from(n) {
                Ok(n) if (1..usize::from(u16::MAX)).contains(&n) => {
                    self.cfg.max_clients = n;
                    self.conns.set_max_clients(n);
                }
                _ => warn!(value = n, "ignoring out-of-range sv_maxclients"),
            }
        }
        if let Some(t) = self.console.cvar_float("sv_timeout") {
            if t > 0.0 {
                self.cfg.timeout_secs = t;
            }
        }
    }

    /// Sets the console input receiver.
    pub fn set_console_input(&mut self, rx: mpsc::Receiver<String>) {
        self.console_rx = Some(rx);
    }

    /// Address both sockets are bound to.
    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    /// Last completed tick.
    pub fn tick(&self) -> u32 {
        self.sim.tick()
    }

    pub fn map_info(&self) -> Option<&MapInfo> {
        self.map.as_ref()
    }

    /// Number of map loads so far; echoed back in ClientReady.
    pub fn map_epoch(&self) -> u32 {
        self.map_epoch
    }

    pub fn world(&self) -> &World {
        self.sim.world()
    }

    pub fn connections(&self) -> &ConnectionTable {
        &self.conns
    }

    pub fn connection_state(&self, id: ClientId) -> Option<ConnState> {
        self.conns.get(id).map(Connection::state)
    }

    /// Peers still in `Connecting`.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Ticks whose work exceeded the tick budget.
    pub fn overruns(&self) -> u64 {
        self.overruns
    }

    /// Unloads the world and loads `name`. On loader failure the current map
    /// stays active and the error is returned.
    pub fn change_map(&mut self, name: &str) -> anyhow::Result<()> {
        let loaded = match self.loader.load(name) {
            Ok(m) => m,
            Err(e) => {
                error!(map = %name, error = %e, "map change failed, keeping current map");
                return Err(e).with_context(|| format!("load map '{name}'"));
            }
        };

        self.sim.load_map(&loaded);
        self.map_epoch = self.map_epoch.wrapping_add(1);
        self.map_start_tick = self.sim.tick();
        let info = loaded.info;
        let announce = NetMsg::MapInfo {
            info: info.clone(),
            epoch: self.map_epoch,
            start_tick: self.map_start_tick,
        };
        for conn in self.conns.iter_mut() {
            if conn.is_disconnected() {
                continue;
            }
            conn.restart_map_agreement();
            if let Some(link) = self.links.get_mut(&conn.id) {
                if let Err(e) = link.queue(&announce) {
                    warn!(client_id = %conn.id, error = %e, "failed to queue MapInfo");
                }
            }
        }

        info!(
            map = %info.name,
            checksum = %info.checksum,
            epoch = self.map_epoch,
            entities = self.sim.world().len(),
            "map loaded"
        );
        self.map = Some(info);
        if self.state == ServerState::Idle {
            self.state = ServerState::Running;
        }
        Ok(())
    }

    fn map_announcement(&self) -> Option<NetMsg> {
        self.map.as_ref().map(|info| NetMsg::MapInfo {
            info: info.clone(),
            epoch: self.map_epoch,
            start_tick: self.map_start_tick,
        })
    }

    /// Runs fixed ticks until `quit`.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        self.run_until(None).await
    }

    /// Runs at most `ticks` fixed ticks at the configured rate.
    pub async fn run_for_ticks(&mut self, ticks: u32) -> anyhow::Result<()> {
        self.run_until(Some(ticks)).await
    }

    async fn run_until(&mut self, limit: Option<u32>) -> anyhow::Result<()> {
        let interval = self.cfg.tick_interval();
        let mut next_tick = tokio::time::Instant::now() + interval;
        let mut done = 0u32;

        while self.state != ServerState::Stopped && limit.map_or(true, |l| done < l) {
            let started = Instant::now();
            self.step().await?;
            done += 1;

            let now = tokio::time::Instant::now();
            if now > next_tick {
                // No catch-up: the next tick starts one interval from now.
                self.overruns += 1;
                warn!(
                    tick = self.sim.tick(),
                    took_ms = started.elapsed().as_secs_f64() * 1000.0,
                    budget_ms = interval.as_secs_f64() * 1000.0,
                    "tick overrun"
                );
                next_tick = now + interval;
            } else {
                tokio::time::sleep_until(next_tick).await;
                next_tick += interval;
            }
        }

        if self.state == ServerState::Stopped {
            self.finish_shutdown().await;
        }
        Ok(())
    }

    /// Executes one tick.
    pub async fn step(&mut self) -> anyhow::Result<()> {
        let now = Instant::now();
        self.process_console_input();
        if self.state == ServerState::Stopped {
            return Ok(());
        }

        self.accept_pending(now).await;
        self.poll_pending(now);
        self.poll_reliable(now);
        self.check_timeouts(now);
        let commands = self.ingest(now)?;

        if self.state == ServerState::Running {
            let tick = self.sim.step(&commands);
            self.broadcast(tick);
        }

        self.flush_and_reap(now);
        Ok(())
    }

    fn process_console_input(&mut self) {
        let Some(rx) = self.console_rx.as_mut() else {
            return;
        };
        let mut lines = Vec::new();
        while let Ok(line) = rx.try_recv() {
            lines.push(line);
        }
        for line in lines {
            for out in self.exec_console(&line) {
                println!("{out}");
            }
        }
    }

    /// Executes a console command and returns the lines to show the operator.
    pub fn exec_console(&mut self, line: &str) -> Vec<String> {
        match self.console.parse(line) {
            ConsoleCommand::Empty => Vec::new(),
            ConsoleCommand::Map(name) => match self.change_map(&name) {
                Ok(()) => vec![format!("Map '{name}' loaded")],
                Err(e) => vec![format!("Failed to load map: {e:#}")],
            },
            ConsoleCommand::Status => self.status(),
            ConsoleCommand::Kick(id) => {
                if self.kick(id, KickReason::Kicked, "kicked by operator", Instant::now()) {
                    vec![format!("Kicked {id}")]
                } else {
                    vec![format!("No connected client {id}")]
                }
            }
            ConsoleCommand::Say(text) => {
                self.broadcast_chat(&format!("Console: {text}"));
                Vec::new()
            }
            ConsoleCommand::Quit => {
                self.begin_shutdown();
                vec!["Server shutting down".to_string()]
            }
            ConsoleCommand::Cvar { name, value } => {
                let out = self.console.exec_cvar(&name, value.as_deref());
                if value.is_some() {
                    self.apply_cvars();
                }
                vec![out]
            }
            ConsoleCommand::Echo(text) => vec![text],
            ConsoleCommand::CvarList => self.console.cvar_list(),
            ConsoleCommand::Help => vec![
                "map <name>   change map".to_string(),
                "status       show connections".to_string(),
                "kick <id>    disconnect a client".to_string(),
                "say <text>   broadcast chat".to_string(),
                "cvarlist     list console variables".to_string(),
                "quit         shut the server down".to_string(),
            ],
            ConsoleCommand::Disconnect => vec!["disconnect is a client command".to_string()],
            ConsoleCommand::Invalid(msg) => vec![msg],
        }
    }

    fn status(&self) -> Vec<String> {
        let mut out = vec![
            format!("Server state: {:?}", self.state),
            format!("Tick: {} ({} Hz, {} overruns)", self.sim.tick(), self.cfg.tick_hz, self.overruns),
        ];
        match &self.map {
            Some(m) => out.push(format!("Map: {} ({})", m.name, m.checksum)),
            None => out.push("Map: none".to_string()),
        }
        let hash = self.sim.world().state_hash();
        out.push(format!(
            "Entities: {} (world hash {})",
            self.sim.world().len(),
            hash[..6].iter().map(|b| format!("{b:02x}")).collect::<String>()
        ));
        out.push(format!(
            "Clients: {}/{} ({} connecting)",
            self.conns.active(),
            self.conns.max_clients(),
            self.pending.len()
        ));
        for c in self.conns.iter() {
            out.push(format!(
                "  {} {} tcp={} udp={} last_cmd={:?} entity={:?}",
                c.id,
                c.state(),
                c.tcp_addr,
                c.udp_addr,
                c.last_applied_cmd(),
                c.entity
            ));
        }
        out
    }

    /// Kicks everyone and stops the loop after the current tick.
    fn begin_shutdown(&mut self) {
        info!("server shutting down");
        let now = Instant::now();
        for id in self.conns.ids() {
            self.kick(id, KickReason::ServerShutdown, "server shutting down", now);
        }
        self.state = ServerState::Stopped;
    }

    async fn finish_shutdown(&mut self) {
        for (id, link) in self.links.iter_mut() {
            if let Err(e) = link.flush_all(SHUTDOWN_FLUSH).await {
                debug!(client_id = %id, error = %e, "final flush failed");
            }
        }
        self.links.clear();
        self.pending.clear();
        self.closing.clear();
    }

    /// Kicks every client, flushes their links and stops.
    pub async fn shutdown(&mut self) {
        if self.state != ServerState::Stopped {
            self.begin_shutdown();
        }
        self.finish_shutdown().await;
    }

    async fn accept_pending(&mut self, now: Instant) {
        for _ in 0..MAX_ACCEPTS_PER_TICK {
            match self.listener.try_accept().await {
                Ok(Some(link)) => {
                    debug!(peer = %link.peer_addr(), "tcp connection accepted");
                    self.pending.push(PendingPeer {
                        link,
                        since: now,
                        violations: 0,
                    });
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn poll_pending(&mut self, now: Instant) {
        let timeout = self.cfg.timeout();
        for mut peer in std::mem::take(&mut self.pending) {
            match Self::poll_pending_peer(&mut peer) {
                PendingPoll::Wait if now.saturating_duration_since(peer.since) > timeout => {
                    debug!(peer = %peer.link.peer_addr(), "no handshake before timeout");
                }
                PendingPoll::Wait => self.pending.push(peer),
                PendingPoll::Handshake { protocol, udp_port } => {
                    self.admit(peer.link, protocol, udp_port, now);
                }
                PendingPoll::Reject(reason, message) => self.reject(peer.link, reason, message, now),
                PendingPoll::Drop => {}
            }
        }
    }

    fn poll_pending_peer(peer: &mut PendingPeer) -> PendingPoll {
        loop {
            match peer.link.poll_recv() {
                Ok(None) => return PendingPoll::Wait,
                Ok(Some(NetMsg::Handshake { protocol, udp_port })) => {
                    return PendingPoll::Handshake { protocol, udp_port }
                }
                Ok(Some(other)) => {
                    peer.violations += 1;
                    warn!(
                        peer = %peer.link.peer_addr(),
                        msg = other.kind().name(),
                        "message before handshake"
                    );
                    if peer.violations >= MAX_HANDSHAKE_VIOLATIONS {
                        return PendingPoll::Reject(
                            KickReason::ProtocolViolation,
                            "expected Handshake".to_string(),
                        );
                    }
                }
                Err(e) if e.is_frame_local() => {
                    debug!(peer = %peer.link.peer_addr(), error = %e, "dropping malformed frame");
                }
                Err(e) => {
                    debug!(peer = %peer.link.peer_addr(), error = %e, "connection lost before handshake");
                    return PendingPoll::Drop;
                }
            }
        }
    }

    /// `Connecting -> Handshaking`: allocate an id, send Welcome and the
    /// current map.
    fn admit(&mut self, mut link: ReliableConn, protocol: u32, udp_port: u16, now: Instant) {
        if protocol != PROTOCOL_VERSION {
            info!(peer = %link.peer_addr(), protocol, "protocol mismatch");
            let message = format!("server speaks protocol {PROTOCOL_VERSION}, client sent {protocol}");
            return self.reject(link, KickReason::ProtocolMismatch, message, now);
        }
        let id = match self.conns.allocate() {
            Ok(id) => id,
            Err(e) => {
                info!(peer = %link.peer_addr(), error = %e, "rejecting handshake");
                return self.reject(link, KickReason::CapacityExceeded, e.to_string(), now);
            }
        };

        let tick_rate = u16::try_from(self.cfg.tick_hz).unwrap_or(u16::MAX);
        let queued = link
            .queue(&NetMsg::Welcome {
                client_id: id,
                tick_rate,
            })
            .and_then(|()| match self.map_announcement() {
                Some(announce) => link.queue(&announce),
                None => Ok(()),
            });
        if let Err(e) = queued {
            warn!(peer = %link.peer_addr(), error = %e, "failed to queue welcome");
            return;
        }

        let mut conn = Connection::new(id, link.peer_addr(), udp_port, now);
        conn.touch(now, self.sim.tick());
        info!(client_id = %id, peer = %conn.tcp_addr, udp = %conn.udp_addr, "client connected");
        self.conns.insert(conn);
        self.links.insert(id, link);
    }

    /// Sends a Kick to a peer with no connection record and closes it.
    fn reject(&mut self, mut link: ReliableConn, reason: KickReason, message: String, now: Instant) {
        let kick = NetMsg::Kick {
            reason,
            message: clip(&message, MAX_KICK_MESSAGE_LEN),
        };
        match link.queue(&kick) {
            Ok(()) => self.closing.push(Closing { link, since: now }),
            Err(e) => debug!(peer = %link.peer_addr(), error = %e, "failed to queue kick"),
        }
    }

    fn poll_reliable(&mut self, now: Instant) {
        for id in self.conns.ids() {
            loop {
                if self.conns.get(id).map_or(true, Connection::is_disconnected) {
                    break;
                }
                let Some(link) = self.links.get_mut(&id) else {
                    break;
                };
                match link.poll_recv() {
                    Ok(None) => break,
                    Ok(Some(msg)) => {
                        let tick = self.sim.tick();
                        if let Some(conn) = self.conns.get_mut(id) {
                            conn.touch(now, tick);
                        }
                        self.on_reliable(id, msg, now);
                    }
                    Err(e) if e.is_frame_local() => {
                        warn!(client_id = %id, error = %e, "dropping malformed frame");
                    }
                    Err(e) => {
                        info!(client_id = %id, error = %e, "reliable channel closed");
                        self.links.remove(&id);
                        self.disconnect(id, DisconnectCause::LinkLost, now);
                        break;
                    }
                }
            }
        }
    }

    fn on_reliable(&mut self, id: ClientId, msg: NetMsg, now: Instant) {
        let Some(conn) = self.conns.get_mut(id) else {
            return;
        };
        match msg {
            NetMsg::ClientReady { epoch, .. } if epoch != self.map_epoch => {
                debug!(
                    client_id = %id,
                    epoch,
                    current = self.map_epoch,
                    "ignoring ClientReady for a previous map"
                );
            }
            NetMsg::ClientReady { checksum, .. } => {
                match conn.client_ready(checksum, self.map.as_ref(), now) {
                    Ok(()) => {
                        let entity = self.sim.spawn_player(id);
                        conn.entity = Some(entity);
                        info!(client_id = %id, ?entity, "client ready, player spawned");
                    }
                    Err(e @ NetError::MapMismatch { .. }) => {
                        warn!(client_id = %id, error = %e, "rejecting client");
                        self.send_kick(id, KickReason::MapMismatch, &e.to_string());
                    }
                    Err(e) => self.violation(id, e, now),
                }
            }
            NetMsg::Chat { text } => {
                info!(client_id = %id, %text, "chat");
                self.broadcast_chat(&format!("{id}: {text}"));
            }
            NetMsg::Disconnect => {
                info!(client_id = %id, "client disconnected");
                self.disconnect(id, DisconnectCause::ClientLeft, now);
            }
            other => {
                let e = conn.unexpected(other.kind().name());
                self.violation(id, e, now);
            }
        }
    }

    fn violation(&mut self, id: ClientId, e: NetError, now: Instant) {
        let Some(conn) = self.conns.get_mut(id) else {
            return;
        };
        warn!(client_id = %id, error = %e, "handshake violation");
        if conn.record_violation() {
            self.kick(id, KickReason::ProtocolViolation, &e.to_string(), now);
        }
    }

    /// Disconnects `id` with a Kick. Returns false if it was not connected.
    pub fn kick(&mut self, id: ClientId, reason: KickReason, message: &str, now: Instant) -> bool {
        match self.conns.get(id) {
            Some(c) if !c.is_disconnected() => {}
            _ => return false,
        }
        self.disconnect(id, DisconnectCause::Kick(reason), now);
        self.send_kick(id, reason, message);
        info!(client_id = %id, %reason, "client kicked");
        true
    }

    fn send_kick(&mut self, id: ClientId, reason: KickReason, message: &str) {
        self.queue_to(
            id,
            &NetMsg::Kick {
                reason,
                message: clip(message, MAX_KICK_MESSAGE_LEN),
            },
        );
    }

    fn disconnect(&mut self, id: ClientId, cause: DisconnectCause, now: Instant) {
        if let Some(conn) = self.conns.get_mut(id) {
            conn.disconnect(cause, now);
            conn.entity = None;
        }
        if self.sim.remove_player(id) {
            debug!(client_id = %id, "player entity removed");
        }
    }

    fn queue_to(&mut self, id: ClientId, msg: &NetMsg) {
        if let Some(link) = self.links.get_mut(&id) {
            if let Err(e) = link.queue(msg) {
                warn!(client_id = %id, msg = msg.kind().name(), error = %e, "failed to queue");
            }
        }
    }

    /// Chat to every connection that has not been torn down.
    fn broadcast_chat(&mut self, text: &str) {
        let msg = NetMsg::Chat {
            text: clip(text, MAX_CHAT_LEN),
        };
        for conn in self.conns.iter().filter(|c| !c.is_disconnected()) {
            if let Some(link) = self.links.get_mut(&conn.id) {
                if let Err(e) = link.queue(&msg) {
                    warn!(client_id = %conn.id, error = %e, "failed to queue chat");
                }
            }
        }
    }

    fn check_timeouts(&mut self, now: Instant) {
        let timeout = self.cfg.timeout();
        let expired: Vec<ClientId> = self
            .conns
            .iter()
            .filter(|c| c.timed_out(now, timeout))
            .map(|c| c.id)
            .collect();
        for id in expired {
            self.kick(id, KickReason::Timeout, &NetError::Timeout(timeout).to_string(), now);
        }
    }

    /// Drains command datagrams and selects this tick's command per client.
    fn ingest(&mut self, now: Instant) -> anyhow::Result<Vec<PlayerCommand>> {
        self.poll_datagrams(now)?;
        Ok(self
            .conns
            .iter_mut()
            .filter(|c| c.is_ready())
            .filter_map(Connection::take_command)
            .collect())
    }

    fn poll_datagrams(&mut self, now: Instant) -> anyhow::Result<()> {
        loop {
            let (n, from) = match self.udp.try_recv_from(&mut self.udp_buf) {
                Ok(r) => r,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                // ICMP port unreachable from an earlier send on some platforms.
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
                Err(e) => return Err(e).context("udp recv"),
            };
            let frame = match transport::decode_datagram(&self.udp_buf[..n]) {
                Ok(f) => f,
                Err(e) => {
                    debug!(%from, error = %e, "dropping datagram");
                    continue;
                }
            };
            let cmd = match frame.msg {
                NetMsg::PlayerCommand(cmd) => cmd,
                other => {
                    debug!(%from, msg = other.kind().name(), "unexpected datagram");
                    continue;
                }
            };

            let tick = self.sim.tick();
            let Some(conn) = self.conns.get_mut(cmd.client_id) else {
                debug!(%from, client_id = %cmd.client_id, "command for unknown client");
                continue;
            };
            if conn.is_disconnected() || conn.udp_addr != from {
                warn!(%from, client_id = %cmd.client_id, expected = %conn.udp_addr, "command from unexpected address");
                continue;
            }
            let id = conn.id;
            match conn.offer_command(frame.sequence, from, cmd) {
                Ok(_) => conn.touch(now, tick),
                Err(e) => trace!(client_id = %id, error = %e, "discarding command"),
            }
        }
    }

    /// Sends the tick's snapshot to every ready connection.
    fn broadcast(&mut self, tick: u32) {
        let body = match self.sim.snapshot_body() {
            Ok(b) => b,
            Err(e) => {
                error!(tick, error = %e, "snapshot encode failed");
                return;
            }
        };
        for conn in self.conns.iter_mut().filter(|c| c.is_ready()) {
            let seq = conn.next_snapshot_seq();
            let frame = match codec::encode_snapshot(seq, tick, conn.last_applied_cmd(), &body) {
                Ok(f) => f,
                Err(e) => {
                    error!(tick, client_id = %conn.id, error = %e, "snapshot encode failed");
                    continue;
                }
            };
            match self.udp.try_send_to(&frame, conn.udp_addr) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    trace!(client_id = %conn.id, tick, "udp buffer full, snapshot dropped");
                }
                Err(e) => debug!(client_id = %conn.id, error = %e, "snapshot send failed"),
            }
        }
    }

    fn flush_and_reap(&mut self, now: Instant) {
        let mut failed = Vec::new();
        for (id, link) in self.links.iter_mut() {
            if let Err(e) = link.flush() {
                failed.push((*id, e));
            }
        }
        for (id, e) in failed {
            self.links.remove(&id);
            if self.conns.get(id).is_some_and(|c| !c.is_disconnected()) {
                warn!(client_id = %id, error = %e, "reliable channel failed");
                self.disconnect(id, DisconnectCause::LinkLost, now);
            }
        }

        let links = &self.links;
        let released = self.conns.reap(now, CLOSE_LINGER, |id| {
            links.get(&id).map_or(true, |l| l.outstanding() == 0)
        });
        for id in released {
            self.links.remove(&id);
            debug!(client_id = %id, "connection released");
        }

        self.closing.retain_mut(|c| {
            c.link.flush().is_ok()
                && c.link.outstanding() > 0
                && now.saturating_duration_since(c.since) < CLOSE_LINGER
        });
    }
}

/// Truncates `s` to at most `max` bytes on a char boundary.
fn clip(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

/// Helper for tests: a server on an ephemeral localhost port.
pub async fn bind_ephemeral(cfg: EngineConfig, loader: Box<dyn MapLoader>) -> anyhow::Result<GameServer> {
    let cfg = EngineConfig {
        server_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0).to_string(),
        ..cfg
    };
    GameServer::new(cfg, loader).await
}
