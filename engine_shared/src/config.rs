//! Configuration system.
//!
//! Loads engine configuration from JSON; binaries layer CLI flags on top.

use std::{path::Path, time::Duration};

use anyhow::{ensure, Context};
use serde::{Deserialize, Serialize};

/// Root configuration shared by client/server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Server listen (or connect) address, e.g. `127.0.0.1:40000`.
    pub server_addr: String,
    /// Fixed simulation tick rate.
    pub tick_hz: u32,
    /// Path to maps directory.
    #[serde(default = "default_maps_dir")]
    pub maps_dir: String,
    /// Player name (client only).
    #[serde(default = "default_player_name")]
    pub player_name: String,
    /// Connection table size (server only).
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    /// Seconds of silence before a connection is dropped.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: f64,
    /// Map loaded at server start.
    #[serde(default)]
    pub start_map: Option<String>,
    /// Commands per second sent by the client.
    #[serde(default = "default_cmd_rate")]
    pub cmd_rate: u32,
    /// Client interpolation delay in seconds.
    #[serde(default = "default_interp_delay")]
    pub interp_delay: f64,
    /// Snapshots kept for interpolation.
    #[serde(default = "default_snapshot_history")]
    pub snapshot_history: usize,
}

fn default_maps_dir() -> String {
    "maps".to_string()
}

fn default_player_name() -> String {
    "Player".to_string()
}

fn default_max_clients() -> usize {
    16
}

fn default_timeout_secs() -> f64 {
    10.0
}

fn default_cmd_rate() -> u32 {
    64
}

fn default_interp_delay() -> f64 {
    0.1
}

fn default_snapshot_history() -> usize {
    32
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:40000".to_string(),
            tick_hz: 64,
            maps_dir: default_maps_dir(),
            player_name: default_player_name(),
            max_clients: default_max_clients(),
            timeout_secs: default_timeout_secs(),
            start_map: None,
            cmd_rate: default_cmd_rate(),
            interp_delay: default_interp_delay(),
            snapshot_history: default_snapshot_history(),
        }
    }
}

impl EngineConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    /// Reads and validates a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let cfg = Self::from_json_str(&text)
            .with_context(|| format!("parse config {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(
            (1..=1000).contains(&self.tick_hz),
            "tick_hz must be within 1..=1000, got {}",
            self.tick_hz
        );
        ensure!(
            (1..usize::from(u16::MAX)).contains(&self.max_clients),
            "max_clients must be within 1..{}, got {}",
            u16::MAX,
            self.max_clients
        );
        ensure!(self.timeout_secs > 0.0, "timeout_secs must be positive");
        ensure!(self.cmd_rate > 0, "cmd_rate must be positive");
        ensure!(self.interp_delay >= 0.0, "interp_delay must not be negative");
        ensure!(self.snapshot_history >= 2, "snapshot_history must be at least 2");
        Ok(())
    }

    /// Fixed simulation step.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.tick_hz.max(1)))
    }

    pub fn cmd_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.cmd_rate.max(1)))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs.max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_json_fills_defaults() {
        let cfg = EngineConfig::from_json_str(
            r#"{ "server_addr": "0.0.0.0:27015", "tick_hz": 128, "start_map": "de_dust2" }"#,
        )
        .unwrap();
        assert_eq!(cfg.tick_hz, 128);
        assert_eq!(cfg.maps_dir, "maps");
        assert_eq!(cfg.max_clients, 16);
        assert_eq!(cfg.start_map.as_deref(), Some("de_dust2"));
        cfg.validate().unwrap();
        assert_eq!(cfg.tick_interval(), Duration::from_secs_f64(1.0 / 128.0));
    }

    #[test]
    fn validate_rejects_nonsense() {
        let cfg = EngineConfig {
            tick_hz: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = EngineConfig {
            max_clients: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());

        assert!(EngineConfig::default().validate().is_ok());
    }
}
