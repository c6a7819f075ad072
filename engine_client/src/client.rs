//! Client implementation.
//!
//! The client maintains:
//! - A reliable control stream (handshake, map agreement, chat, kicks)
//! - An unreliable datagram socket (commands out, snapshots in)
//! - Snapshot history for interpolating remote entities
//! - A prediction overlay for the own entity
//! - Console for user commands
//!
//! [`GameClient::frame`] never waits on the network: every socket read is a
//! non-blocking poll at the start of the frame.

use std::{
    collections::VecDeque,
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    time::{Duration, Instant},
};

use anyhow::Context;
use engine_shared::{
    codec::MAX_CHAT_LEN,
    config::EngineConfig,
    console::{Console, ConsoleCommand, CvarFlags, CvarValue},
    error::NetError,
    map::{LoadedMap, MapLoader},
    net::{ClientId, KickReason, MapChecksum, MapInfo, NetMsg, Snapshot, PROTOCOL_VERSION},
    render::{NullRenderer, RenderBackend, RenderEntity},
    transport::{ReliableConn, UnreliableConn},
};
use tracing::{debug, error, info, trace, warn};

use crate::{
    input::{action_button, build_command, InputState},
    interp::SnapshotBuffer,
    prediction::Predictor,
};

const MAX_MESSAGES: usize = 64;

/// Why the client is no longer connected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    Kicked { reason: KickReason, message: String },
    /// Local map content differs from the server's.
    MapMismatch {
        expected: MapChecksum,
        actual: MapChecksum,
    },
    MapLoad(String),
    /// Server sent Disconnect.
    ServerClosed,
    ConnectionLost(String),
    /// `disconnect` or `quit` on the local console.
    Local,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kicked { reason, message } => write!(f, "kicked: {reason} ({message})"),
            Self::MapMismatch { expected, actual } => {
                write!(f, "map differs from server (server {expected}, local {actual})")
            }
            Self::MapLoad(e) => write!(f, "map load failed: {e}"),
            Self::ServerClosed => f.write_str("server closed the connection"),
            Self::ConnectionLost(e) => write!(f, "connection lost: {e}"),
            Self::Local => f.write_str("disconnected"),
        }
    }
}

/// Client connection state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientState {
    /// Sockets open, Handshake not sent yet.
    Connecting,
    /// Handshake sent, waiting for Welcome and MapInfo.
    Handshaking,
    /// Map loaded and ClientReady sent; waiting for the first snapshot.
    Loading,
    /// Receiving snapshots and sending commands.
    Ready,
    Disconnected(DisconnectReason),
}

/// High-level game client.
pub struct GameClient {
    pub cfg: EngineConfig,
    pub console: Console,
    /// Input sampled for the next command.
    pub input: InputState,
    state: ClientState,
    client_id: Option<ClientId>,
    tick_interval: Duration,

    reliable: ReliableConn,
    unreliable: UnreliableConn,
    loader: Box<dyn MapLoader>,
    map: Option<LoadedMap>,
    /// Epoch of the last MapInfo; echoed in ClientReady.
    map_epoch: u32,
    /// Snapshots at or below this tick belong to an earlier map.
    map_start_tick: u32,

    cmd_tick: u32,
    next_cmd_at: Option<Instant>,
    predictor: Predictor,
    snaps: SnapshotBuffer,

    /// Chat and server notices, oldest first.
    messages: VecDeque<String>,
    renderer: Box<dyn RenderBackend>,
}

impl GameClient {
    /// Opens both channels to `cfg.server_addr` and sends the Handshake.
    pub async fn connect(cfg: EngineConfig, loader: Box<dyn MapLoader>) -> anyhow::Result<Self> {
        let server_addr: SocketAddr = cfg.server_addr.parse().context("parse server_addr")?;
        info!(server = %server_addr, "Connecting to server");

        // Bind UDP first so we can tell the server where to send snapshots.
        let unspecified = match server_addr.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let unreliable = UnreliableConn::connect(SocketAddr::new(unspecified, 0), server_addr)
            .await
            .context("udp connect")?;
        let udp_port = unreliable.local_addr().context("udp local_addr")?.port();
        let reliable = ReliableConn::connect(server_addr).await.context("tcp connect")?;

        let tick_interval = cfg.tick_interval();
        let mut client = Self {
            predictor: Predictor::new(tick_interval.as_secs_f32()),
            snaps: SnapshotBuffer::new(cfg.snapshot_history),
            console: Console::new(),
            input: InputState::default(),
            state: ClientState::Connecting,
            client_id: None,
            tick_interval,
            reliable,
            unreliable,
            loader,
            map: None,
            map_epoch: 0,
            map_start_tick: 0,
            cmd_tick: 0,
            next_cmd_at: None,
            messages: VecDeque::new(),
            renderer: Box::new(NullRenderer),
            cfg,
        };
        client.register_cvars();

        client.reliable.queue(&NetMsg::Handshake {
            protocol: PROTOCOL_VERSION,
            udp_port,
        })?;
        client.reliable.flush()?;
        client.state = ClientState::Handshaking;
        debug!(udp_port, "handshake sent");
        Ok(client)
    }

    /// Replaces the default headless renderer.
    pub fn with_renderer(mut self, renderer: Box<dyn RenderBackend>) -> Self {
        self.renderer = renderer;
        self
    }

    fn register_cvars(&mut self) {
        self.console.register_cvar(
            "cl_interp",
            CvarValue::Float(self.cfg.interp_delay),
            "Interpolation interval when snapshot arrivals coincide",
            CvarFlags::CLIENT_ONLY,
        );
        self.console.register_cvar(
            "cl_predict",
            CvarValue::Bool(true),
            "Enable client prediction",
            CvarFlags::CLIENT_ONLY,
        );
        self.console.register_cvar(
            "cl_cmdrate",
            CvarValue::Int(i64::from(self.cfg.cmd_rate)),
            "Commands sent per second",
            CvarFlags::CLIENT_ONLY,
        );
        self.console.register_cvar(
            "name",
            CvarValue::String(self.cfg.player_name.clone()),
            "Player name",
            CvarFlags::ARCHIVE,
        );
    }

    fn apply_cvars(&mut self) {
        self.predictor.set_enabled(self.console.cvar_bool("cl_predict"));
        if let Some(v) = self.console.cvar_float("cl_interp") {
            if v >= 0.0 {
                self.cfg.interp_delay = v;
            }
        }
        if let Some(rate) = self.console.cvar_int("cl_cmdrate") {
            match u32::try_from(rate) {
                Ok(r) if r > 0 => self.cfg.cmd_rate = r,
                _ => warn!(value = rate, "ignoring invalid cl_cmdrate"),
            }
        }
        if let Some(CvarValue::String(name)) = self.console.get_cvar("name") {
            self.cfg.player_name = name.clone();
        }
    }

    pub fn state(&self) -> &ClientState {
        &self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == ClientState::Ready
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self.state, ClientState::Disconnected(_))
    }

    pub fn client_id(&self) -> Option<ClientId> {
        self.client_id
    }

    /// Server tick duration announced in Welcome.
    pub fn tick_interval(&self) -> Duration {
        self.tick_interval
    }

    pub fn map(&self) -> Option<&LoadedMap> {
        self.map.as_ref()
    }

    /// Epoch of the map currently loaded or loading.
    pub fn map_epoch(&self) -> u32 {
        self.map_epoch
    }

    pub fn snapshots(&self) -> &SnapshotBuffer {
        &self.snaps
    }

    pub fn predictor(&self) -> &Predictor {
        &self.predictor
    }

    pub fn messages(&self) -> impl Iterator<Item = &str> {
        self.messages.iter().map(String::as_str)
    }

    /// Runs one client frame: poll both channels, send a command if one is
    /// due, flush, render.
    pub fn frame(&mut self, now: Instant) {
        if self.is_disconnected() {
            return;
        }
        self.poll_reliable();
        self.poll_unreliable(now);
        if self.is_ready() {
            self.send_command(now);
        }
        if !self.is_disconnected() {
            if let Err(e) = self.reliable.flush() {
                self.lose(e);
            }
        }
        if self.is_ready() {
            self.render(now);
        }
    }

    fn poll_reliable(&mut self) {
        while !self.is_disconnected() {
            match self.reliable.poll_recv() {
                Ok(None) => break,
                Ok(Some(msg)) => self.on_reliable(msg),
                Err(e) if e.is_frame_local() => debug!(error = %e, "dropping malformed frame"),
                Err(e) => self.lose(e),
            }
        }
    }

    fn on_reliable(&mut self, msg: NetMsg) {
        match msg {
            NetMsg::Welcome {
                client_id,
                tick_rate,
            } if self.state == ClientState::Handshaking && self.client_id.is_none() => {
                self.client_id = Some(client_id);
                self.tick_interval = Duration::from_secs_f64(1.0 / f64::from(tick_rate.max(1)));
                self.predictor
                    .set_client(client_id, self.tick_interval.as_secs_f32());
                info!(client_id = %client_id, tick_rate, "Connected to server");
            }
            NetMsg::MapInfo {
                info,
                epoch,
                start_tick,
            } if self.client_id.is_some() => self.load_map(info, epoch, start_tick),
            NetMsg::Chat { text } => {
                info!(%text, "chat");
                self.log_message(text);
            }
            NetMsg::Kick { reason, message } => {
                warn!(%reason, %message, "kicked by server");
                self.log_message(format!("Kicked: {reason} ({message})"));
                self.state = ClientState::Disconnected(DisconnectReason::Kicked { reason, message });
            }
            NetMsg::Disconnect => {
                info!("server closed the connection");
                self.state = ClientState::Disconnected(DisconnectReason::ServerClosed);
            }
            other => warn!(msg = other.kind().name(), state = ?self.state, "unexpected message"),
        }
    }

    /// Loads the announced map and answers with ClientReady, or disconnects
    /// if the local copy differs.
    fn load_map(&mut self, info: MapInfo, epoch: u32, start_tick: u32) {
        info!(map = %info.name, checksum = %info.checksum, epoch, "Server sent map info");
        self.state = ClientState::Loading;
        self.map = None;
        self.map_epoch = epoch;
        self.map_start_tick = start_tick;
        self.snaps.clear();
        self.predictor.reset();

        let map = match self.loader.load(&info.name) {
            Ok(m) => m,
            Err(e) => {
                error!(map = %info.name, error = %e, "map load failed");
                self.disconnect_with(DisconnectReason::MapLoad(e.to_string()));
                return;
            }
        };
        if map.info.checksum != info.checksum {
            let e = NetError::MapMismatch {
                expected: info.checksum,
                actual: map.info.checksum,
            };
            error!(map = %info.name, error = %e, "refusing to play");
            self.disconnect_with(DisconnectReason::MapMismatch {
                expected: info.checksum,
                actual: map.info.checksum,
            });
            return;
        }

        match self.reliable.queue(&NetMsg::ClientReady {
            checksum: map.info.checksum,
            epoch,
        }) {
            Ok(()) => {
                info!(map = %info.name, entities = map.entities.len(), "Map loaded, ready sent");
                self.map = Some(map);
            }
            Err(e) => self.lose(e),
        }
    }

    fn poll_unreliable(&mut self, now: Instant) {
        while !self.is_disconnected() {
            match self.unreliable.poll_recv() {
                Ok(None) => break,
                Ok(Some(NetMsg::Snapshot(snap))) => self.on_snapshot(snap, now),
                Ok(Some(other)) => debug!(msg = other.kind().name(), "unexpected datagram"),
                Err(e @ NetError::SequenceStale { .. }) => trace!(error = %e, "stale datagram"),
                Err(e) if e.is_frame_local() => debug!(error = %e, "dropping malformed datagram"),
                Err(e) => {
                    // ICMP errors surface here on connected UDP sockets.
                    debug!(error = %e, "udp receive failed");
                    break;
                }
            }
        }
    }

    fn on_snapshot(&mut self, snap: Snapshot, now: Instant) {
        if snap.server_tick <= self.map_start_tick {
            trace!(
                tick = snap.server_tick,
                map_start = self.map_start_tick,
                "snapshot from a previous map"
            );
            return;
        }
        match self.state {
            ClientState::Loading => {
                info!(tick = snap.server_tick, "entered game");
                self.state = ClientState::Ready;
            }
            ClientState::Ready => {}
            _ => return,
        }
        self.predictor.on_snapshot(&snap);
        self.snaps.push(snap, now);
    }

    fn send_command(&mut self, now: Instant) {
        let Some(client_id) = self.client_id else {
            return;
        };
        if self.next_cmd_at.is_some_and(|t| now < t) {
            return;
        }
        self.next_cmd_at = Some(now + self.cfg.cmd_interval());
        self.cmd_tick += 1;

        let cmd = build_command(client_id, self.cmd_tick, self.input);
        if let Err(e) = self.unreliable.send(&NetMsg::PlayerCommand(cmd.clone())) {
            debug!(error = %e, "command send failed");
        }
        self.predictor.push_command(cmd);
    }

    fn render(&mut self, now: Instant) {
        let own = self
            .client_id
            .and_then(|id| self.snaps.latest()?.controlled_by(id))
            .map(|e| e.id);
        let fallback = Duration::from_secs_f64(self.cfg.interp_delay.max(0.0));

        self.renderer.begin_frame();
        for ent in self.snaps.interpolate(now, fallback, own) {
            self.renderer.draw_entity(&ent);
        }
        if let (Some(id), Some(state)) = (own, self.predictor.predicted()) {
            self.renderer.draw_entity(&RenderEntity {
                id,
                origin: state.transform.origin,
                angles: state.transform.angles,
                predicted: self.predictor.is_enabled(),
            });
        }
        self.renderer.end_frame();
    }

    fn log_message(&mut self, text: String) {
        self.messages.push_back(text);
        while self.messages.len() > MAX_MESSAGES {
            self.messages.pop_front();
        }
    }

    fn lose(&mut self, e: NetError) {
        warn!(error = %e, "connection lost");
        self.state = ClientState::Disconnected(DisconnectReason::ConnectionLost(e.to_string()));
    }

    /// Tells the server we are leaving and stops.
    fn disconnect_with(&mut self, reason: DisconnectReason) {
        if self.is_disconnected() {
            return;
        }
        if let Err(e) = self
            .reliable
            .queue(&NetMsg::Disconnect)
            .and_then(|()| self.reliable.flush())
        {
            debug!(error = %e, "could not send Disconnect");
        }
        info!(%reason, "disconnecting");
        self.state = ClientState::Disconnected(reason);
    }

    pub fn disconnect(&mut self) {
        self.disconnect_with(DisconnectReason::Local);
    }

    /// Sends a chat line to the server.
    pub fn say(&mut self, text: &str) -> anyhow::Result<()> {
        let mut end = text.len().min(MAX_CHAT_LEN);
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        self.reliable.queue(&NetMsg::Chat {
            text: text[..end].to_string(),
        })?;
        Ok(())
    }

    /// Executes a console command.
    pub fn exec_console(&mut self, line: &str) -> Vec<String> {
        let trimmed = line.trim();
        if let Some(action) = trimmed.strip_prefix('+').and_then(action_button) {
            self.input.press(action);
            return Vec::new();
        }
        if let Some(action) = trimmed.strip_prefix('-').and_then(action_button) {
            self.input.release(action);
            return Vec::new();
        }

        match self.console.parse(trimmed) {
            ConsoleCommand::Empty => Vec::new(),
            ConsoleCommand::Disconnect | ConsoleCommand::Quit => {
                self.disconnect();
                vec!["Disconnected".to_string()]
            }
            ConsoleCommand::Say(text) => match self.say(&text) {
                Ok(()) => Vec::new(),
                Err(e) => vec![format!("say failed: {e:#}")],
            },
            ConsoleCommand::Status => self.status(),
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
                "status        show connection state".to_string(),
                "say <text>    chat".to_string(),
                "+forward ...  hold a movement action, -forward releases".to_string(),
                "cvarlist      list console variables".to_string(),
                "disconnect    leave the server".to_string(),
                "quit          leave and exit".to_string(),
            ],
            ConsoleCommand::Map(_) | ConsoleCommand::Kick(_) => {
                vec!["That is a server command".to_string()]
            }
            ConsoleCommand::Invalid(msg) => vec![msg],
        }
    }

    fn status(&self) -> Vec<String> {
        let mut out = vec![format!("State: {:?}", self.state)];
        match self.client_id {
            Some(id) => out.push(format!("Client ID: {id}")),
            None => out.push("Client ID: none".to_string()),
        }
        if let Some(map) = &self.map {
            out.push(format!("Map: {} ({})", map.info.name, map.info.checksum));
        }
        out.push(format!("Commands sent: {}", self.cmd_tick));
        out.push(format!(
            "Snapshots buffered: {} (latest tick {:?})",
            self.snaps.len(),
            self.snaps.latest().map(|s| s.server_tick)
        ));
        out.push(format!(
            "Prediction: {} ({} unacknowledged)",
            if self.predictor.is_enabled() { "on" } else { "off" },
            self.predictor.pending()
        ));
        out
    }
}
