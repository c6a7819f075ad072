//! Shared fixtures for the integration tests.

use std::time::{Duration, Instant};

use engine_client::GameClient;
use engine_server::{bind_ephemeral, GameServer};
use engine_shared::{
    config::EngineConfig,
    map::{MapLoader, MemoryMapLoader},
};

pub const DUST: &str = r#"
{ "classname" "worldspawn" "message" "test map" }
{ "classname" "info_player_start" "origin" "0 0 64" "angles" "0 0 0" }
{ "classname" "info_player_deathmatch" "origin" "256 0 64" "angles" "0 180 0" }
{ "classname" "light" "origin" "0 0 256" }
"#;

pub const NUKE: &str = r#"
{ "classname" "worldspawn" }
{ "classname" "info_player_start" "origin" "-512 128 0" }
"#;

/// Installs a test-writer subscriber once per test binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_test_writer()
        .try_init();
}

pub fn maps() -> MemoryMapLoader {
    MemoryMapLoader::new()
        .with_map("de_dust2", DUST)
        .with_map("de_nuke", NUKE)
}

/// Same map names, different content.
pub fn modified_maps() -> MemoryMapLoader {
    MemoryMapLoader::new()
        .with_map("de_dust2", NUKE)
        .with_map("de_nuke", DUST)
}

pub fn server_config() -> EngineConfig {
    EngineConfig {
        start_map: Some("de_dust2".to_string()),
        ..Default::default()
    }
}

pub async fn start_server(cfg: EngineConfig) -> anyhow::Result<GameServer> {
    bind_ephemeral(cfg, Box::new(maps())).await
}

/// Client configured for `server`.
pub fn client_config(server: &GameServer) -> anyhow::Result<EngineConfig> {
    Ok(EngineConfig {
        server_addr: server.local_addr()?.to_string(),
        player_name: "tester".to_string(),
        ..Default::default()
    })
}

pub async fn connect(server: &GameServer, loader: impl MapLoader + 'static) -> anyhow::Result<GameClient> {
    GameClient::connect(client_config(server)?, Box::new(loader)).await
}

/// Alternates server ticks and client frames until `done` holds or
/// `max_rounds` pass. Returns whether `done` was reached.
pub async fn drive(
    server: &mut GameServer,
    clients: &mut [&mut GameClient],
    max_rounds: usize,
    mut done: impl FnMut(&GameServer, &[&mut GameClient]) -> bool,
) -> anyhow::Result<bool> {
    for _ in 0..max_rounds {
        server.step().await?;
        tokio::time::sleep(Duration::from_millis(2)).await;
        let now = Instant::now();
        for c in clients.iter_mut() {
            c.frame(now);
        }
        if done(server, clients) {
            return Ok(true);
        }
    }
    Ok(false)
}
