//! Daemon configuration (§0, §4.4-4.6).
//!
//! Loaded from TOML, found via `directories::ProjectDirs` the same way
//! the working directory and hub/peer persistence files are — see
//! `default_path()`.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub network: NetworkConfig,
    pub slots: SlotConfig,
    pub paths: PathsConfig,
    pub hashing: HashingConfig,
    pub search: SearchConfig,
    pub share: ShareConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            slots: SlotConfig::default(),
            paths: PathsConfig::default(),
            hashing: HashingConfig::default(),
            search: SearchConfig::default(),
            share: ShareConfig::default(),
        }
    }
}

/// Peer-facing identity and listening configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub nick: String,
    /// Passive mode: no inbound listener, rely on `$RevConnectToMe`.
    pub passive: bool,
    /// TCP port for inbound peer connections (ignored when passive).
    pub port: u16,
    /// UDP port for passive search results.
    pub search_port: u16,
    /// Override the IP advertised to hubs (NAT traversal).
    pub ip_override: Option<IpAddr>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            nick: "shakespeer".to_string(),
            passive: false,
            port: 1412,
            search_port: 1413,
            ip_override: None,
        }
    }
}

/// Upload slot accounting (§4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SlotConfig {
    pub total_slots: u32,
    /// Extra slots granted per share-ratio/op-status rules beyond `total_slots`.
    pub extra_slots: u32,
    /// Track slot usage separately per hub instead of one global pool.
    pub per_hub: bool,
}

impl Default for SlotConfig {
    fn default() -> Self {
        Self { total_slots: 3, extra_slots: 0, per_hub: false }
    }
}

/// Download-side filesystem layout (§4.4, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub download_dir: PathBuf,
    pub incomplete_dir: PathBuf,
    pub working_dir: PathBuf,
    /// Move a directory's finished files out of the incomplete area
    /// as they complete, rather than waiting for the whole directory
    /// (resolved Open Question, default `false`).
    pub move_partial_directories: bool,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("downloads"),
            incomplete_dir: PathBuf::from("incomplete"),
            working_dir: PathBuf::from("."),
            move_partial_directories: false,
        }
    }
}

/// Hasher client priority knob (§4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HashingConfig {
    /// 0 (highest priority, no delay) through 4 (lowest, 500ms/file).
    pub priority: u8,
    /// Path to the `sphashd` helper binary.
    pub helper_path: PathBuf,
}

impl Default for HashingConfig {
    fn default() -> Self {
        Self { priority: 2, helper_path: PathBuf::from("sphashd") }
    }
}

/// Search dispatcher behavior (§4.4, §4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub auto_search_enabled: bool,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self { auto_search_enabled: true }
    }
}

/// Share scanner behavior (§4.1, §6 `rescan-share-interval`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShareConfig {
    /// How often to kick off a full rescan of every mountpoint, beyond
    /// the scan triggered immediately when a path is added.
    pub rescan_interval_secs: u64,
}

impl Default for ShareConfig {
    fn default() -> Self {
        Self { rescan_interval_secs: 3600 }
    }
}

impl Config {
    pub fn load() -> Self {
        match Self::default_path() {
            Some(path) => Self::load_from(&path).unwrap_or_else(|e| {
                warn!("failed to load config from {:?}: {}, using defaults", path, e);
                Self::default()
            }),
            None => {
                debug!("no config directory found, using defaults");
                Self::default()
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!("config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        info!("loaded config from {:?}", path);
        Ok(config)
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        match Self::default_path() {
            Some(path) => self.save_to(&path),
            None => Err(ConfigError::NoConfigDir),
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        info!("saved config to {:?}", path);
        Ok(())
    }

    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("net", "shakespeer", "shakespeer")
            .map(|dirs| dirs.config_dir().join("shakespeer.toml"))
    }

    pub fn sample() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sensible_slots() {
        let config = Config::default();
        assert_eq!(config.slots.total_slots, 3);
        assert!(!config.network.passive);
        assert!(!config.paths.move_partial_directories);
    }

    #[test]
    fn config_round_trips_through_toml() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.network.nick, config.network.nick);
    }

    #[test]
    fn partial_config_fills_in_defaults() {
        let toml_str = r#"
            [network]
            nick = "someone"
            passive = true
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.network.nick, "someone");
        assert!(config.network.passive);
        assert_eq!(config.slots.total_slots, 3);
    }

    #[test]
    fn load_missing_file_uses_defaults() {
        let config = Config::load_from(Path::new("/nonexistent/shakespeer.toml")).unwrap();
        assert_eq!(config.network.port, 1412);
    }

    #[test]
    fn sample_contains_every_section() {
        let sample = Config::sample();
        for section in ["[network]", "[slots]", "[paths]", "[hashing]", "[search]", "[share]"] {
            assert!(sample.contains(section), "missing {section}");
        }
    }
}
