//! Standalone server binary.
//!
//! Usage:
//!   cargo run -p engine_server -- [--addr 127.0.0.1:40000] [--tick-hz 64] [--maps-dir maps] [--map de_dust2]
//!
//! The server listens for client connections, runs a fixed timestep simulation,
//! and broadcasts snapshots to connected clients.
//!
//! Console commands:
//!   map <mapname>  - Load a BSP map
//!   status         - Show server status
//!   kick <id>      - Disconnect a client
//!   say <text>     - Chat to everyone
//!   quit           - Shutdown server

use std::io::{BufRead, Write};
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use engine_server::GameServer;
use engine_shared::{config::EngineConfig, map::BspMapLoader};
use tokio::sync::mpsc;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "server", about = "Authoritative game server")]
struct Args {
    /// JSON config file; flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Listen address (TCP and UDP).
    #[arg(long)]
    addr: Option<String>,
    #[arg(long)]
    tick_hz: Option<u32>,
    #[arg(long)]
    maps_dir: Option<String>,
    /// Map to load at startup.
    #[arg(long)]
    map: Option<String>,
    #[arg(long)]
    max_clients: Option<usize>,
}

impl Args {
    fn into_config(self) -> anyhow::Result<EngineConfig> {
        let mut cfg = match &self.config {
            Some(path) => EngineConfig::load(path)?,
            None => EngineConfig::default(),
        };
        if let Some(addr) = self.addr {
            cfg.server_addr = addr;
        }
        if let Some(hz) = self.tick_hz {
            cfg.tick_hz = hz;
        }
        if let Some(dir) = self.maps_dir {
            cfg.maps_dir = dir;
        }
        if let Some(map) = self.map {
            cfg.start_map = Some(map);
        }
        if let Some(n) = self.max_clients {
            cfg.max_clients = n;
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = Args::parse().into_config()?;
    info!(addr = %cfg.server_addr, tick_hz = cfg.tick_hz, maps_dir = %cfg.maps_dir, "Starting server");

    let loader = BspMapLoader::new(&cfg.maps_dir);
    let mut server = GameServer::new(cfg, Box::new(loader))
        .await
        .context("create server")?;
    let local = server.local_addr()?;
    info!(%local, "Server listening");

    // Set up console input channel.
    let (console_tx, console_rx) = mpsc::channel::<String>(32);
    server.set_console_input(console_rx);

    // Stdin is blocking, so it gets its own thread.
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut stdout = std::io::stdout();
        loop {
            print!("] ");
            let _ = stdout.flush();
            let mut line = String::new();
            match stdin.lock().read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let line = line.trim().to_string();
            if !line.is_empty() && console_tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    println!("Server ready. Type 'map <mapname>' to load a map, 'status' for info, 'quit' to exit.");
    println!();

    server.run().await?;
    info!("Server stopped");
    Ok(())
}
