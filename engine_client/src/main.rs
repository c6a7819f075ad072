//! Standalone client binary.
//!
//! Usage:
//!   cargo run -p engine_client -- [--addr 127.0.0.1:40000] [--maps-dir maps] [--name player]
//!
//! The client connects to the server, loads the announced map, sends input
//! commands and renders received snapshots through the headless renderer.
//!
//! Console commands:
//!   +forward / -forward  - Hold or release a movement action
//!   disconnect           - Disconnect from server
//!   status               - Show client status
//!   say <message>        - Send chat message
//!   cl_predict 0|1       - Toggle prediction
//!   quit                 - Exit client

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context;
use clap::Parser;
use engine_client::{ClientState, GameClient};
use engine_shared::{config::EngineConfig, map::BspMapLoader};
use tokio::sync::mpsc;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "client", about = "Game client")]
struct Args {
    /// JSON config file; flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Server address.
    #[arg(long)]
    addr: Option<String>,
    #[arg(long)]
    maps_dir: Option<String>,
    #[arg(long)]
    name: Option<String>,
    /// Commands per second.
    #[arg(long)]
    cmd_rate: Option<u32>,
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
        if let Some(dir) = self.maps_dir {
            cfg.maps_dir = dir;
        }
        if let Some(name) = self.name {
            cfg.player_name = name;
        }
        if let Some(rate) = self.cmd_rate {
            cfg.cmd_rate = rate;
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
    info!(server = %cfg.server_addr, maps_dir = %cfg.maps_dir, "Starting client");

    let loader = BspMapLoader::new(&cfg.maps_dir);
    let mut client = GameClient::connect(cfg, Box::new(loader))
        .await
        .context("connect")?;

    // Set up console input channel.
    let (console_tx, mut console_rx) = mpsc::channel::<String>(32);

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

    println!("Connecting. Type 'status' for info, 'quit' to exit.");
    println!();

    let mut last_tick_logged = 0;
    loop {
        while let Ok(line) = console_rx.try_recv() {
            for out in client.exec_console(&line) {
                println!("{out}");
            }
        }

        client.frame(Instant::now());

        if let ClientState::Disconnected(reason) = client.state() {
            println!("Disconnected: {reason}");
            break;
        }

        if let Some(snap) = client.snapshots().latest() {
            if snap.server_tick / 64 != last_tick_logged {
                last_tick_logged = snap.server_tick / 64;
                info!(tick = snap.server_tick, entities = snap.entities.len(), "Snapshot");
            }
        }

        tokio::time::sleep(client.cfg.cmd_interval()).await;
    }

    Ok(())
}
