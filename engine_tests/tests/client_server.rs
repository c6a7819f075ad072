//! Socket-level integration tests for client ↔ server communication.
//!
//! The server is stepped by hand so every test controls tick boundaries.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use engine_client::{ClientState, DisconnectReason, GameClient};
use engine_server::{connection::ConnState, GameServer, ServerState};
use engine_shared::{
    codec,
    ecs::Transform,
    map::MapLoader,
    math::Vec3,
    movement::InputButtons,
    net::{ClientId, KickReason, MapChecksum, NetMsg, PlayerCommand, Snapshot, PROTOCOL_VERSION},
    transport::{ReliableConn, UnreliableConn},
};
use engine_tests::{connect, drive, init_tracing, maps, modified_maps, server_config, start_server};
use tokio::{io::AsyncWriteExt, net::TcpStream};

const WAIT: Duration = Duration::from_secs(1);

/// A hand-driven peer speaking the wire protocol directly.
struct RawPeer {
    tcp: ReliableConn,
    udp: UnreliableConn,
}

impl RawPeer {
    async fn connect(server: &GameServer) -> anyhow::Result<Self> {
        let addr = server.local_addr()?;
        let udp = UnreliableConn::connect(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0), addr).await?;
        let tcp = ReliableConn::connect(addr).await?;
        Ok(Self { tcp, udp })
    }

    async fn send(&mut self, msg: NetMsg) -> anyhow::Result<()> {
        self.tcp.queue(&msg)?;
        self.tcp.flush_all(WAIT).await?;
        Ok(())
    }

    async fn handshake(&mut self, protocol: u32) -> anyhow::Result<()> {
        let udp_port = self.udp.local_addr()?.port();
        self.send(NetMsg::Handshake { protocol, udp_port }).await
    }

    async fn recv(&mut self) -> anyhow::Result<NetMsg> {
        self.tcp
            .recv_timeout(WAIT)
            .await?
            .ok_or_else(|| anyhow::anyhow!("no reliable message within {WAIT:?}"))
    }

    /// Latest snapshot that arrived so far.
    fn latest_snapshot(&mut self) -> Option<Snapshot> {
        let mut latest = None;
        while let Ok(Some(msg)) = self.udp.poll_recv() {
            if let NetMsg::Snapshot(s) = msg {
                latest = Some(s);
            }
        }
        latest
    }

    fn command(&mut self, client_id: ClientId, client_tick: u32, buttons: InputButtons) -> anyhow::Result<()> {
        self.udp.send(&NetMsg::PlayerCommand(PlayerCommand {
            client_id,
            client_tick,
            input_bits: buttons,
            view_angles: Vec3::ZERO,
        }))?;
        Ok(())
    }
}

async fn settle(server: &mut GameServer, ticks: usize) -> anyhow::Result<()> {
    for _ in 0..ticks {
        server.step().await?;
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    Ok(())
}

fn dust_checksum() -> anyhow::Result<MapChecksum> {
    Ok(maps().load("de_dust2")?.info.checksum)
}

/// Handshake, Welcome, MapInfo and ClientReady for the start map.
async fn ready_peer(server: &mut GameServer) -> anyhow::Result<RawPeer> {
    let mut peer = RawPeer::connect(server).await?;
    peer.handshake(PROTOCOL_VERSION).await?;
    settle(server, 1).await?;
    assert!(matches!(peer.recv().await?, NetMsg::Welcome { .. }));
    assert!(matches!(peer.recv().await?, NetMsg::MapInfo { epoch: 1, .. }));
    peer.send(NetMsg::ClientReady {
        checksum: dust_checksum()?,
        epoch: 1,
    })
    .await?;
    settle(server, 2).await?;
    Ok(peer)
}

async fn expect_kick(peer: &mut RawPeer, expected: KickReason) -> anyhow::Result<()> {
    loop {
        match peer.recv().await? {
            NetMsg::Kick { reason, .. } => {
                assert_eq!(reason, expected);
                return Ok(());
            }
            NetMsg::Chat { .. } => continue,
            other => anyhow::bail!("expected Kick, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn raw_handshake_walkthrough() -> anyhow::Result<()> {
    init_tracing();
    let mut server = start_server(server_config()).await?;
    let mut peer = RawPeer::connect(&server).await?;

    peer.handshake(PROTOCOL_VERSION).await?;
    settle(&mut server, 1).await?;

    let me = ClientId(1);
    assert_eq!(
        peer.recv().await?,
        NetMsg::Welcome {
            client_id: me,
            tick_rate: 64
        }
    );
    let NetMsg::MapInfo { info, epoch, .. } = peer.recv().await? else {
        anyhow::bail!("expected MapInfo");
    };
    assert_eq!(epoch, 1);
    assert_eq!(info.name, "de_dust2");
    assert_eq!(info.checksum, dust_checksum()?);
    assert_eq!(server.connection_state(me), Some(ConnState::Handshaking));

    // Nothing is broadcast before the client is ready.
    settle(&mut server, 3).await?;
    assert!(peer.latest_snapshot().is_none());

    peer.send(NetMsg::ClientReady {
        checksum: info.checksum,
        epoch,
    })
    .await?;
    settle(&mut server, 2).await?;
    assert_eq!(server.connection_state(me), Some(ConnState::Ready));

    let snap = peer.latest_snapshot().ok_or_else(|| anyhow::anyhow!("no snapshot"))?;
    assert_eq!(snap.last_processed_client_tick, None);
    let own = snap.controlled_by(me).ok_or_else(|| anyhow::anyhow!("no own entity"))?;
    let origin = own.bundle.transform.map(|t| t.origin);
    assert_eq!(origin, Some(Vec3::new(0.0, 0.0, 64.0)));
    // Light plus the player.
    assert_eq!(snap.entities.len(), 2);

    // One command per tick; the ack follows the applied command.
    for t in 1..=3 {
        peer.command(me, t, InputButtons::FORWARD)?;
        tokio::time::sleep(Duration::from_millis(2)).await;
        settle(&mut server, 1).await?;
    }
    let snap = peer.latest_snapshot().ok_or_else(|| anyhow::anyhow!("no snapshot"))?;
    assert_eq!(snap.last_processed_client_tick, Some(3));
    let moved = snap
        .controlled_by(me)
        .and_then(|e| e.bundle.transform)
        .map(|t| t.origin.x)
        .unwrap_or_default();
    assert!(moved > 0.0, "player did not move: {moved}");
    Ok(())
}

#[tokio::test]
async fn map_mismatch_is_kicked_and_never_ready() -> anyhow::Result<()> {
    init_tracing();
    let mut server = start_server(server_config()).await?;
    let mut peer = RawPeer::connect(&server).await?;
    peer.handshake(PROTOCOL_VERSION).await?;
    settle(&mut server, 1).await?;
    assert!(matches!(peer.recv().await?, NetMsg::Welcome { .. }));
    assert!(matches!(peer.recv().await?, NetMsg::MapInfo { .. }));

    peer.send(NetMsg::ClientReady {
        checksum: MapChecksum::of(b"some other map"),
        epoch: 1,
    })
    .await?;
    settle(&mut server, 1).await?;

    match peer.recv().await? {
        NetMsg::Kick { reason, .. } => assert_eq!(reason, KickReason::MapMismatch),
        other => anyhow::bail!("expected Kick, got {other:?}"),
    }
    assert_ne!(server.connection_state(ClientId(1)), Some(ConnState::Ready));
    assert!(server.world().controlled_by(ClientId(1)).is_none());

    settle(&mut server, 3).await?;
    assert!(peer.latest_snapshot().is_none());
    Ok(())
}

#[tokio::test]
async fn capacity_and_protocol_rejections() -> anyhow::Result<()> {
    init_tracing();
    let mut server = start_server(engine_shared::config::EngineConfig {
        max_clients: 1,
        ..server_config()
    })
    .await?;

    let mut first = RawPeer::connect(&server).await?;
    first.handshake(PROTOCOL_VERSION).await?;
    settle(&mut server, 1).await?;
    assert!(matches!(first.recv().await?, NetMsg::Welcome { .. }));

    let mut second = RawPeer::connect(&server).await?;
    second.handshake(PROTOCOL_VERSION).await?;
    settle(&mut server, 1).await?;
    match second.recv().await? {
        NetMsg::Kick { reason, .. } => assert_eq!(reason, KickReason::CapacityExceeded),
        other => anyhow::bail!("expected Kick, got {other:?}"),
    }
    assert_eq!(server.connections().len(), 1);

    let mut old = RawPeer::connect(&server).await?;
    old.handshake(PROTOCOL_VERSION + 1).await?;
    settle(&mut server, 1).await?;
    match old.recv().await? {
        NetMsg::Kick { reason, .. } => assert_eq!(reason, KickReason::ProtocolMismatch),
        other => anyhow::bail!("expected Kick, got {other:?}"),
    }
    assert_eq!(server.connections().len(), 1);
    Ok(())
}

#[tokio::test]
async fn stale_and_duplicate_commands_are_ignored() -> anyhow::Result<()> {
    init_tracing();
    let mut server = start_server(server_config()).await?;
    let mut peer = RawPeer::connect(&server).await?;
    let me = ClientId(1);
    peer.handshake(PROTOCOL_VERSION).await?;
    settle(&mut server, 1).await?;
    peer.recv().await?;
    peer.recv().await?;
    peer.send(NetMsg::ClientReady {
        checksum: dust_checksum()?,
        epoch: 1,
    })
    .await?;
    settle(&mut server, 1).await?;

    peer.command(me, 10, InputButtons::FORWARD)?;
    tokio::time::sleep(Duration::from_millis(2)).await;
    settle(&mut server, 1).await?;
    let applied = server.connections().get(me).and_then(|c| c.last_applied_cmd());
    assert_eq!(applied, Some(10));

    // Older client tick on a newer datagram: not applied.
    peer.command(me, 4, InputButtons::BACK)?;
    tokio::time::sleep(Duration::from_millis(2)).await;
    settle(&mut server, 1).await?;
    let applied = server.connections().get(me).and_then(|c| c.last_applied_cmd());
    assert_eq!(applied, Some(10));
    Ok(())
}

#[tokio::test]
async fn silent_client_times_out() -> anyhow::Result<()> {
    init_tracing();
    let mut server = start_server(engine_shared::config::EngineConfig {
        timeout_secs: 0.2,
        ..server_config()
    })
    .await?;
    let mut peer = RawPeer::connect(&server).await?;
    peer.handshake(PROTOCOL_VERSION).await?;
    settle(&mut server, 1).await?;
    peer.recv().await?;
    peer.recv().await?;

    tokio::time::sleep(Duration::from_millis(300)).await;
    settle(&mut server, 1).await?;
    match peer.recv().await? {
        NetMsg::Kick { reason, .. } => assert_eq!(reason, KickReason::Timeout),
        other => anyhow::bail!("expected Kick, got {other:?}"),
    }
    assert_eq!(server.connections().active(), 0);
    Ok(())
}

async fn ready_client(server: &mut GameServer) -> anyhow::Result<GameClient> {
    let mut client = connect(server, maps()).await?;
    let ready = drive(server, &mut [&mut client], 200, |_, cs| cs[0].is_ready()).await?;
    assert!(ready, "client stuck in {:?}", client.state());
    Ok(client)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_reaches_ready_and_predicts() -> anyhow::Result<()> {
    init_tracing();
    let mut server = start_server(server_config()).await?;
    let mut client = ready_client(&mut server).await?;

    assert_eq!(client.client_id(), Some(ClientId(1)));
    assert_eq!(client.map().map(|m| m.info.name.as_str()), Some("de_dust2"));
    assert_eq!(client.tick_interval(), Duration::from_secs_f64(1.0 / 64.0));
    assert_eq!(server.connection_state(ClientId(1)), Some(ConnState::Ready));

    client.exec_console("+forward");
    let acked = drive(&mut server, &mut [&mut client], 300, |_, cs| {
        cs[0]
            .snapshots()
            .latest()
            .and_then(|s| s.last_processed_client_tick)
            .is_some_and(|t| t >= 10)
    })
    .await?;
    assert!(acked, "commands never acknowledged");

    let entity = server
        .world()
        .controlled_by(ClientId(1))
        .ok_or_else(|| anyhow::anyhow!("no player entity"))?;
    let server_x = server
        .world()
        .get::<Transform>(entity)
        .map(|t| t.origin.x)
        .unwrap_or_default();
    assert!(server_x > 0.0);

    let predicted = client.predictor().predicted().map(|s| s.transform.origin.x);
    let confirmed = client.predictor().confirmed_state().map(|s| s.transform.origin.x);
    match (predicted, confirmed) {
        (Some(p), Some(c)) => assert!(p >= c, "prediction behind confirmation: {p} < {c}"),
        other => anyhow::bail!("missing own state: {other:?}"),
    }

    client.exec_console("-forward");
    client.exec_console("disconnect");
    assert_eq!(client.state(), &ClientState::Disconnected(DisconnectReason::Local));
    let gone = drive(&mut server, &mut [], 50, |s, _| s.connections().active() == 0).await?;
    assert!(gone);
    Ok(())
}

#[tokio::test]
async fn client_detects_map_mismatch_locally() -> anyhow::Result<()> {
    init_tracing();
    let mut server = start_server(server_config()).await?;
    let mut client = connect(&server, modified_maps()).await?;

    let done = drive(&mut server, &mut [&mut client], 100, |_, cs| cs[0].is_disconnected()).await?;
    assert!(done);
    assert!(matches!(
        client.state(),
        ClientState::Disconnected(DisconnectReason::MapMismatch { .. })
    ));

    let gone = drive(&mut server, &mut [], 50, |s, _| s.connections().active() == 0).await?;
    assert!(gone);
    assert!(server.world().controlled_by(ClientId(1)).is_none());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn map_change_reloads_clients() -> anyhow::Result<()> {
    init_tracing();
    let mut server = start_server(server_config()).await?;
    let mut client = ready_client(&mut server).await?;
    let tick_before = server.tick();

    assert_eq!(server.exec_console("map de_nuke"), vec!["Map 'de_nuke' loaded"]);
    assert_eq!(server.connection_state(ClientId(1)), Some(ConnState::Handshaking));

    let back = drive(&mut server, &mut [&mut client], 200, |_, cs| {
        cs[0].is_ready() && cs[0].map().is_some_and(|m| m.info.name == "de_nuke")
    })
    .await?;
    assert!(back, "client stuck in {:?}", client.state());
    assert!(server.tick() > tick_before);

    let snap = client
        .snapshots()
        .latest()
        .ok_or_else(|| anyhow::anyhow!("no snapshot"))?;
    let origin = snap
        .controlled_by(ClientId(1))
        .and_then(|e| e.bundle.transform)
        .map(|t| t.origin);
    assert_eq!(origin, Some(Vec3::new(-512.0, 128.0, 0.0)));
    assert!(snap.server_tick > tick_before);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn chat_and_kick_reach_the_client() -> anyhow::Result<()> {
    init_tracing();
    let mut server = start_server(server_config()).await?;
    let mut client = ready_client(&mut server).await?;

    assert!(client.exec_console("say hello there").is_empty());
    let heard = drive(&mut server, &mut [&mut client], 100, |_, cs| {
        cs[0].messages().any(|m| m == "#1: hello there")
    })
    .await?;
    assert!(heard);

    assert_eq!(server.exec_console("kick #1"), vec!["Kicked #1"]);
    let kicked = drive(&mut server, &mut [&mut client], 100, |_, cs| cs[0].is_disconnected()).await?;
    assert!(kicked);
    assert!(matches!(
        client.state(),
        ClientState::Disconnected(DisconnectReason::Kicked {
            reason: KickReason::Kicked,
            ..
        })
    ));
    assert_eq!(server.state(), ServerState::Running);
    Ok(())
}

#[tokio::test]
async fn messages_before_handshake_are_rejected() -> anyhow::Result<()> {
    init_tracing();
    let mut server = start_server(server_config()).await?;
    let mut peer = RawPeer::connect(&server).await?;

    for text in ["hi", "hello", "anyone"] {
        peer.send(NetMsg::Chat { text: text.into() }).await?;
    }
    settle(&mut server, 3).await?;

    expect_kick(&mut peer, KickReason::ProtocolViolation).await?;
    assert_eq!(server.connections().len(), 0);
    Ok(())
}

#[tokio::test]
async fn repeated_out_of_state_messages_kick_the_client() -> anyhow::Result<()> {
    init_tracing();
    let mut server = start_server(server_config()).await?;
    let mut peer = RawPeer::connect(&server).await?;
    let me = ClientId(1);
    peer.handshake(PROTOCOL_VERSION).await?;
    settle(&mut server, 1).await?;
    peer.recv().await?;
    peer.recv().await?;

    let bogus = NetMsg::Welcome {
        client_id: me,
        tick_rate: 64,
    };
    for _ in 0..2 {
        peer.send(bogus.clone()).await?;
    }
    settle(&mut server, 2).await?;
    assert_eq!(server.connection_state(me), Some(ConnState::Handshaking));

    peer.send(bogus).await?;
    settle(&mut server, 2).await?;
    expect_kick(&mut peer, KickReason::ProtocolViolation).await?;
    assert_eq!(server.connections().active(), 0);
    assert!(server.world().controlled_by(me).is_none());
    Ok(())
}

#[tokio::test]
async fn bad_frame_before_handshake_keeps_the_stream() -> anyhow::Result<()> {
    init_tracing();
    let mut server = start_server(server_config()).await?;
    let addr = server.local_addr()?;
    let udp = UnreliableConn::connect(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0), addr).await?;
    let mut stream = TcpStream::connect(addr).await?;

    // Unknown kind at sequence 1, then a valid Handshake at sequence 2.
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&codec::MAGIC.to_le_bytes());
    bytes.push(200);
    bytes.extend_from_slice(&1u32.to_le_bytes());
    bytes.extend_from_slice(&2u16.to_le_bytes());
    bytes.extend_from_slice(b"??");
    let handshake = NetMsg::Handshake {
        protocol: PROTOCOL_VERSION,
        udp_port: udp.local_addr()?.port(),
    };
    bytes.extend_from_slice(&codec::encode(&handshake, 2)?);
    stream.write_all(&bytes).await?;
    stream.flush().await?;
    settle(&mut server, 2).await?;

    let mut tcp = ReliableConn::new(stream)?;
    match tcp.recv_timeout(WAIT).await? {
        Some(NetMsg::Welcome { client_id, .. }) => assert_eq!(client_id, ClientId(1)),
        other => anyhow::bail!("expected Welcome, got {other:?}"),
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn map_change_ignores_snapshots_from_previous_map() -> anyhow::Result<()> {
    init_tracing();
    let mut server = start_server(server_config()).await?;
    let mut client = ready_client(&mut server).await?;
    assert_eq!(client.map_epoch(), 1);

    // One more old-map snapshot goes out, then the map changes before the
    // client looks at its sockets.
    server.step().await?;
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(server.exec_console("map de_nuke"), vec!["Map 'de_nuke' loaded"]);
    let start_tick = server.tick();
    server.step().await?;
    tokio::time::sleep(Duration::from_millis(5)).await;

    client.frame(std::time::Instant::now());
    assert_eq!(client.state(), &ClientState::Loading);
    assert_eq!(client.map_epoch(), 2);
    assert!(client.snapshots().latest().is_none());

    let back = drive(&mut server, &mut [&mut client], 200, |_, cs| cs[0].is_ready()).await?;
    assert!(back, "client stuck in {:?}", client.state());
    assert_eq!(client.map().map(|m| m.info.name.as_str()), Some("de_nuke"));
    let first = client
        .snapshots()
        .latest()
        .map(|s| s.server_tick)
        .unwrap_or_default();
    assert!(first > start_tick, "snapshot {first} not after map start {start_tick}");
    Ok(())
}

#[tokio::test]
async fn ready_for_previous_map_is_ignored() -> anyhow::Result<()> {
    init_tracing();
    let mut server = start_server(server_config()).await?;
    let mut peer = ready_peer(&mut server).await?;
    let me = ClientId(1);
    assert_eq!(server.connection_state(me), Some(ConnState::Ready));

    assert_eq!(server.exec_console("map de_nuke"), vec!["Map 'de_nuke' loaded"]);
    let start = server.tick();
    assert_eq!(server.map_epoch(), 2);

    // Answer to the old MapInfo, still in flight when the map changed.
    peer.send(NetMsg::ClientReady {
        checksum: dust_checksum()?,
        epoch: 1,
    })
    .await?;
    settle(&mut server, 2).await?;
    assert_eq!(server.connection_state(me), Some(ConnState::Handshaking));

    let NetMsg::MapInfo {
        info,
        epoch,
        start_tick,
    } = peer.recv().await?
    else {
        anyhow::bail!("expected MapInfo");
    };
    assert_eq!(info.name, "de_nuke");
    assert_eq!(epoch, 2);
    assert_eq!(start_tick, start);

    peer.send(NetMsg::ClientReady {
        checksum: info.checksum,
        epoch,
    })
    .await?;
    settle(&mut server, 2).await?;
    assert_eq!(server.connection_state(me), Some(ConnState::Ready));
    Ok(())
}
