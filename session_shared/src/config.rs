//! Configuration.
//!
//! Server and client configuration parsed from JSON strings/files. Every
//! field has a default so partial files are valid.

use std::{path::Path, time::Duration};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::math::SpawnPoint;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address, e.g. `127.0.0.1:40000`. TCP and UDP share the port.
    #[serde(default = "default_server_addr")]
    pub server_addr: String,
    /// Fixed simulation tick rate.
    #[serde(default = "default_tick_hz")]
    pub tick_hz: u32,
    /// Scene loaded at startup; empty means wait for the `map` command.
    #[serde(default)]
    pub default_scene: String,
    /// Grace period before an unembodied player is respawned.
    #[serde(default = "default_respawn_delay_ms")]
    pub respawn_delay_ms: u64,
    /// Ticks between entity snapshots.
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval_ticks: u32,
    /// Peers still loading this long after a `LoadScene` are disconnected.
    /// `None` waits forever.
    #[serde(default = "default_load_timeout_secs")]
    pub load_timeout_secs: Option<u64>,
    /// Prefab instantiated for every player.
    #[serde(default = "default_player_prefab")]
    pub player_prefab: String,
    #[serde(default = "default_player_max_health")]
    pub player_max_health: u8,
    /// Seed for spawn-point selection. Random when absent.
    #[serde(default)]
    pub rng_seed: Option<u64>,
    #[serde(default)]
    pub spawn_points: Vec<SpawnPoint>,
}

fn default_server_addr() -> String {
    "127.0.0.1:40000".to_string()
}

fn default_tick_hz() -> u32 {
    64
}

fn default_respawn_delay_ms() -> u64 {
    5_000
}

fn default_snapshot_interval() -> u32 {
    1
}

fn default_load_timeout_secs() -> Option<u64> {
    Some(60)
}

fn default_player_prefab() -> String {
    "player".to_string()
}

fn default_player_max_health() -> u8 {
    100
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_addr: default_server_addr(),
            tick_hz: default_tick_hz(),
            default_scene: String::new(),
            respawn_delay_ms: default_respawn_delay_ms(),
            snapshot_interval_ticks: default_snapshot_interval(),
            load_timeout_secs: default_load_timeout_secs(),
            player_prefab: default_player_prefab(),
            player_max_health: default_player_max_health(),
            rng_seed: None,
            spawn_points: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    /// Reads and parses a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::from_json_str(&text).with_context(|| format!("parse config {}", path.display()))
    }

    pub fn respawn_delay(&self) -> Duration {
        Duration::from_millis(self.respawn_delay_ms)
    }

    pub fn load_timeout(&self) -> Option<Duration> {
        self.load_timeout_secs.map(Duration::from_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_hz.max(1) as f64)
    }
}

/// Client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_server_addr")]
    pub server_addr: String,
    #[serde(default = "default_player_name")]
    pub player_name: String,
    /// Client poll rate.
    #[serde(default = "default_tick_hz")]
    pub tick_hz: u32,
}

fn default_player_name() -> String {
    "Player".to_string()
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: default_server_addr(),
            player_name: default_player_name(),
            tick_hz: default_tick_hz(),
        }
    }
}

impl ClientConfig {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read client config {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parse client config {}", path.display()))
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_hz.max(1) as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_uses_defaults() {
        let cfg = ServerConfig::from_json_str(r#"{ "tick_hz": 30, "default_scene": "arena" }"#)
            .unwrap();
        assert_eq!(cfg.tick_hz, 30);
        assert_eq!(cfg.default_scene, "arena");
        assert_eq!(cfg.respawn_delay(), Duration::from_secs(5));
        assert_eq!(cfg.load_timeout(), Some(Duration::from_secs(60)));
        assert!(cfg.spawn_points.is_empty());
    }

    #[test]
    fn null_load_timeout_disables_eviction() {
        let cfg = ServerConfig::from_json_str(r#"{ "load_timeout_secs": null }"#).unwrap();
        assert_eq!(cfg.load_timeout(), None);
    }

    #[test]
    fn spawn_points_parse() {
        let cfg = ServerConfig::from_json_str(
            r#"{ "spawn_points": [ { "origin": { "x": 1.0, "y": 2.0, "z": 0.0 } } ] }"#,
        )
        .unwrap();
        assert_eq!(cfg.spawn_points.len(), 1);
        assert_eq!(cfg.spawn_points[0].origin.y, 2.0);
    }
}
