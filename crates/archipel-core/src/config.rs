//! Configuration system for Archipel.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $ARCHIPEL_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/archipel/config.toml
//!   3. ~/.config/archipel/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchipelConfig {
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
    pub storage: StorageConfig,
    pub relay: RelayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Path to the identity blob. Auto-generated on first run.
    pub identity_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Well-known discovery multicast group.
    pub multicast_group: String,
    /// Well-known discovery port.
    pub multicast_port: u16,
    /// Multicast TTL for announcements.
    pub multicast_ttl: u32,
    /// TCP session port. On bind conflict the next port is tried.
    pub tcp_port: u16,
    /// Seconds between discovery announcements.
    pub announce_interval_secs: u64,
    /// Seconds between peer-table pruning sweeps.
    pub prune_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the database and identity by default.
    pub data_dir: PathBuf,
    /// Source directory for outgoing shared files.
    pub shared_dir: PathBuf,
    /// Sink directory for completed downloads.
    pub downloads_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Hours a relay envelope stays queued before lazy expiry.
    pub ttl_hours: u64,
    /// Maximum queued envelopes per originating sender. Bounds the
    /// queue any single peer can fill.
    pub per_sender_cap: u32,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            identity_path: data_dir().join("identity.json"),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            multicast_group: "239.255.42.99".into(),
            multicast_port: 6000,
            multicast_ttl: 128,
            tcp_port: 7777,
            announce_interval_secs: 30,
            prune_interval_secs: 30,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: data_dir(),
            shared_dir: data_dir().join("shared"),
            downloads_dir: data_dir().join("downloads"),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            ttl_hours: 24,
            per_sender_cap: 64,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("archipel")
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("archipel")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl ArchipelConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            ArchipelConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("ARCHIPEL_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Apply ARCHIPEL_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("ARCHIPEL_NETWORK__TCP_PORT") {
            if let Ok(p) = v.parse() {
                self.network.tcp_port = p;
            }
        }
        if let Ok(v) = std::env::var("ARCHIPEL_NETWORK__MULTICAST_PORT") {
            if let Ok(p) = v.parse() {
                self.network.multicast_port = p;
            }
        }
        if let Ok(v) = std::env::var("ARCHIPEL_NETWORK__ANNOUNCE_INTERVAL_SECS") {
            if let Ok(p) = v.parse() {
                self.network.announce_interval_secs = p;
            }
        }
        if let Ok(v) = std::env::var("ARCHIPEL_STORAGE__DATA_DIR") {
            self.storage.data_dir = PathBuf::from(&v);
            self.storage.shared_dir = self.storage.data_dir.join("shared");
            self.storage.downloads_dir = self.storage.data_dir.join("downloads");
            self.identity.identity_path = self.storage.data_dir.join("identity.json");
        }
        if let Ok(v) = std::env::var("ARCHIPEL_RELAY__PER_SENDER_CAP") {
            if let Ok(p) = v.parse() {
                self.relay.per_sender_cap = p;
            }
        }
    }

    /// A config rooted entirely under `dir`. Used by tests and by
    /// multi-node setups on one host.
    pub fn rooted_at(dir: &std::path::Path) -> Self {
        let mut config = Self::default();
        config.storage.data_dir = dir.to_path_buf();
        config.storage.shared_dir = dir.join("shared");
        config.storage.downloads_dir = dir.join("downloads");
        config.identity.identity_path = dir.join("identity.json");
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let config = ArchipelConfig::default();
        assert_eq!(config.network.multicast_group, "239.255.42.99");
        assert_eq!(config.network.multicast_port, 6000);
        assert_eq!(config.network.tcp_port, 7777);
        assert_eq!(config.network.announce_interval_secs, 30);
        assert_eq!(config.relay.ttl_hours, 24);
    }

    #[test]
    fn rooted_config_keeps_everything_under_one_dir() {
        let config = ArchipelConfig::rooted_at(std::path::Path::new("/tmp/arch-test"));
        assert!(config.identity.identity_path.starts_with("/tmp/arch-test"));
        assert!(config.storage.downloads_dir.starts_with("/tmp/arch-test"));
    }

    #[test]
    fn config_round_trips_through_toml() {
        let config = ArchipelConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let back: ArchipelConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.network.tcp_port, config.network.tcp_port);
        assert_eq!(back.relay.per_sender_cap, config.relay.per_sender_cap);
    }
}
