//! Dashboard configuration loaded from `zapboard.toml`.
//!
//! This module provides a single configuration file that controls the HTTP
//! server, the database location, cache synchronization and upload limits.
//!
//! # Example zapboard.toml
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 3141
//! dev_mode = false
//!
//! [database]
//! path = ".zapboard/zapboard.db"
//!
//! [sync]
//! stats_poll_secs = 30
//! min_position_gap = 1e-9
//! webhook_timeout_secs = 30
//!
//! [uploads]
//! max_bytes = 10485760
//! media_base_url = "http://127.0.0.1:3141/media"
//! ```
//!
//! Lookup order is `<config dir>/zapboard.toml`, then the per-user file under
//! the platform config directory, then built-in defaults. `ZAPBOARD_HOST`,
//! `ZAPBOARD_PORT` and `ZAPBOARD_DB_PATH` override whatever the file says.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::board::position::DEFAULT_MIN_GAP;
use crate::board::server::ServerConfig;
use crate::board::service::BoardSettings;
use crate::board::sync::STATS_POLL_INTERVAL;
use crate::board::uploads::{DEFAULT_MAX_UPLOAD_BYTES, UploadPolicy};
use crate::board::webhooks::DEFAULT_WEBHOOK_TIMEOUT;

pub const CONFIG_FILE_NAME: &str = "zapboard.toml";

/// Default project-local directory holding the config file and database.
pub const DEFAULT_CONFIG_DIR: &str = ".zapboard";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Permissive CORS for a front-end served from another origin.
    #[serde(default)]
    pub dev_mode: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3141
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            dev_mode: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSection {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from(DEFAULT_CONFIG_DIR).join("zapboard.db")
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Cache synchronization and ordering settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSection {
    /// Dashboard statistics refresh cadence, in seconds.
    #[serde(default = "default_stats_poll_secs")]
    pub stats_poll_secs: u64,
    /// Smallest gap between neighbouring positions before a column is
    /// renormalized.
    #[serde(default = "default_min_position_gap")]
    pub min_position_gap: f64,
    #[serde(default = "default_webhook_timeout_secs")]
    pub webhook_timeout_secs: u64,
}

fn default_stats_poll_secs() -> u64 {
    STATS_POLL_INTERVAL.as_secs()
}

fn default_min_position_gap() -> f64 {
    DEFAULT_MIN_GAP
}

fn default_webhook_timeout_secs() -> u64 {
    DEFAULT_WEBHOOK_TIMEOUT.as_secs()
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            stats_poll_secs: default_stats_poll_secs(),
            min_position_gap: default_min_position_gap(),
            webhook_timeout_secs: default_webhook_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadsSection {
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,
    #[serde(default = "default_media_base_url")]
    pub media_base_url: String,
}

fn default_max_bytes() -> u64 {
    DEFAULT_MAX_UPLOAD_BYTES
}

fn default_media_base_url() -> String {
    BoardSettings::default().media_base_url
}

impl Default for UploadsSection {
    fn default() -> Self {
        Self {
            max_bytes: default_max_bytes(),
            media_base_url: default_media_base_url(),
        }
    }
}

/// Root configuration structure for zapboard.toml.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ZapboardConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub sync: SyncSection,
    #[serde(default)]
    pub uploads: UploadsSection,
}

impl ZapboardConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse zapboard.toml")
    }

    /// Load from `config_dir/zapboard.toml`, falling back to the per-user
    /// file and then to defaults.
    pub fn load_or_default(config_dir: &Path) -> Result<Self> {
        let local = config_dir.join(CONFIG_FILE_NAME);
        if local.exists() {
            return Self::load(&local);
        }
        match user_config_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = self.to_toml()?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize zapboard.toml")
    }

    /// Apply environment overrides from the process environment.
    pub fn apply_env(&mut self) -> Vec<String> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `ZAPBOARD_*` overrides from `lookup`. Returns a warning for each
    /// value that could not be used.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Vec<String> {
        let mut warnings = Vec::new();

        if let Some(host) = lookup("ZAPBOARD_HOST").filter(|h| !h.trim().is_empty()) {
            self.server.host = host;
        }
        if let Some(port) = lookup("ZAPBOARD_PORT") {
            match port.parse::<u16>() {
                Ok(p) => self.server.port = p,
                Err(_) => warnings.push(format!("Ignoring invalid ZAPBOARD_PORT '{}'", port)),
            }
        }
        if let Some(path) = lookup("ZAPBOARD_DB_PATH").filter(|p| !p.trim().is_empty()) {
            self.database.path = PathBuf::from(path);
        }

        warnings
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.server.port == 0 {
            warnings.push("server.port is 0; the OS will pick a random port".to_string());
        }
        if self.sync.stats_poll_secs == 0 {
            warnings.push("sync.stats_poll_secs must be at least 1".to_string());
        }
        if !(self.sync.min_position_gap.is_finite() && self.sync.min_position_gap > 0.0) {
            warnings.push(format!(
                "sync.min_position_gap must be a positive number, got {}",
                self.sync.min_position_gap
            ));
        }
        if self.sync.webhook_timeout_secs == 0 {
            warnings.push("sync.webhook_timeout_secs must be at least 1".to_string());
        }
        if self.uploads.max_bytes == 0 {
            warnings.push("uploads.max_bytes is 0; every attachment will be rejected".to_string());
        }
        let base = &self.uploads.media_base_url;
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            warnings.push(format!(
                "uploads.media_base_url '{}' should be an http(s) URL",
                base
            ));
        }

        warnings
    }

    pub fn to_server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.server.host.clone(),
            port: self.server.port,
            db_path: self.database.path.clone(),
            dev_mode: self.server.dev_mode,
        }
    }

    pub fn board_settings(&self) -> BoardSettings {
        BoardSettings {
            min_position_gap: self.sync.min_position_gap,
            uploads: UploadPolicy::new(self.uploads.max_bytes),
            media_base_url: self.uploads.media_base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn stats_poll_interval(&self) -> Duration {
        Duration::from_secs(self.sync.stats_poll_secs.max(1))
    }

    pub fn webhook_timeout(&self) -> Duration {
        Duration::from_secs(self.sync.webhook_timeout_secs.max(1))
    }
}

/// Per-user config file, e.g. `~/.config/zapboard/zapboard.toml`.
pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("zapboard").join(CONFIG_FILE_NAME))
}
