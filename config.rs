//! Configuration management with environment variable support.
//!
//! This module provides [`Config`] for loading and validating Strongbox
//! settings from JSON files and environment variables.
//!
//! ## Environment Variables
//!
//! - `STRONGBOX_CONFIG`: Override config file path
//! - `STRONGBOX_DATA_PATH`: Override the store image path
//! - `STRONGBOX_LISTEN`: Override the listen address
//! - `STRONGBOX_SESSION_IDLE_SECS`: Override the session idle timeout

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::auth::SessionPolicy;
use crate::keys::KdfParams;
use crate::stream::StreamLimits;

/// Environment variable names for configuration overrides
pub const ENV_CONFIG_PATH: &str = "STRONGBOX_CONFIG";
pub const ENV_DATA_PATH: &str = "STRONGBOX_DATA_PATH";
pub const ENV_LISTEN: &str = "STRONGBOX_LISTEN";
pub const ENV_SESSION_IDLE: &str = "STRONGBOX_SESSION_IDLE_SECS";

/// Room left in a frame for the packet envelope around a stream chunk.
const FRAME_ENVELOPE_BYTES: usize = 512;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Store image loaded at startup and written on shutdown. `None` keeps
    /// everything in memory.
    pub data_path: Option<String>,
    pub listen_addr: String,
    pub session_idle_timeout_secs: u64,
    pub session_max_age_secs: u64,
    /// Commands buffered per open stream before senders wait.
    pub stream_queue_depth: usize,
    pub max_frame_bytes: usize,
    /// Largest size a stream may grow a file to.
    pub max_file_bytes: u64,
    /// Gzip the store image.
    pub compress_image: bool,
    /// Argon2id cost for new password credentials.
    pub password_kdf: KdfParams,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_path: Some("./strongbox.db".to_string()),
            listen_addr: "127.0.0.1:7070".to_string(),
            session_idle_timeout_secs: 30 * 60,
            session_max_age_secs: 7 * 24 * 60 * 60,
            stream_queue_depth: 32,
            max_frame_bytes: 4 * 1024 * 1024,
            max_file_bytes: 64 * 1024 * 1024 * 1024,
            compress_image: true,
            password_kdf: KdfParams::default(),
        }
    }
}

impl Config {
    /// Load config from file path
    pub fn load(path: &str) -> Result<Self> {
        let s =
            fs::read_to_string(path).with_context(|| format!("reading config file {}", path))?;
        let mut config: Config =
            serde_json::from_str(&s).with_context(|| format!("parsing config file {}", path))?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load config with environment variable overrides
    /// Priority: ENV vars > config file > defaults
    pub fn load_with_env(path: Option<&str>) -> Result<Self> {
        let config_path = path
            .map(String::from)
            .or_else(|| env::var(ENV_CONFIG_PATH).ok());

        let mut config = match config_path {
            Some(ref p) if Path::new(p).exists() => {
                info!(path = p, "loading config from file");
                let s = fs::read_to_string(p)
                    .with_context(|| format!("reading config file {}", p))?;
                serde_json::from_str(&s).with_context(|| format!("parsing config file {}", p))?
            }
            _ => {
                debug!("using default configuration");
                Config::default()
            }
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to config
    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(data_path) = env::var(ENV_DATA_PATH) {
            debug!(data_path = %data_path, "overriding data_path from environment");
            self.data_path = Some(data_path).filter(|p| !p.is_empty());
        }

        if let Ok(listen) = env::var(ENV_LISTEN) {
            debug!(listen = %listen, "overriding listen_addr from environment");
            self.listen_addr = listen;
        }

        if let Ok(idle) = env::var(ENV_SESSION_IDLE) {
            self.session_idle_timeout_secs = idle
                .parse()
                .with_context(|| format!("{} must be a number of seconds", ENV_SESSION_IDLE))?;
            debug!(secs = self.session_idle_timeout_secs, "overriding session idle timeout from environment");
        }
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        self.listen_addr
            .parse::<SocketAddr>()
            .with_context(|| format!("listen_addr '{}' is not a socket address", self.listen_addr))?;

        if self.session_idle_timeout_secs == 0 {
            anyhow::bail!("session_idle_timeout_secs must be positive");
        }
        if self.session_max_age_secs < self.session_idle_timeout_secs {
            anyhow::bail!("session_max_age_secs cannot be shorter than the idle timeout");
        }
        if self.stream_queue_depth == 0 {
            anyhow::bail!("stream_queue_depth must be positive");
        }
        if self.password_kdf.memory_kib < 8 || self.password_kdf.iterations == 0 {
            anyhow::bail!("password_kdf needs at least 8 KiB and one iteration");
        }
        if self.max_frame_bytes < 1024 {
            anyhow::bail!("max_frame_bytes must be at least 1024");
        }
        if self.max_file_bytes == 0 {
            anyhow::bail!("max_file_bytes must be positive");
        }

        if let Some(path) = &self.data_path {
            if path.trim().is_empty() {
                anyhow::bail!("data_path cannot be blank; omit it to run in memory");
            }
            if path.contains("..") {
                warn!("data_path contains '..' - consider using absolute paths");
            }
        } else {
            warn!("no data_path configured; the store will not survive a restart");
        }

        Ok(())
    }

    /// A config that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            data_path: None,
            ..Self::default()
        }
    }

    pub fn session_policy(&self) -> SessionPolicy {
        SessionPolicy {
            idle: chrono::Duration::seconds(self.session_idle_timeout_secs as i64),
            max_age: chrono::Duration::seconds(self.session_max_age_secs as i64),
        }
    }

    /// Stream bounds: a read or write chunk must fit in one frame once
    /// base64 encoded.
    pub fn stream_limits(&self) -> StreamLimits {
        let payload = self.max_frame_bytes.saturating_sub(FRAME_ENVELOPE_BYTES);
        StreamLimits {
            max_chunk: (payload / 4 * 3).max(1),
            max_size: self.max_file_bytes,
        }
    }

    pub fn save(&self, path: &str) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).with_context(|| format!("writing config file {}", path))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        Config::default().validate().expect("defaults are valid");
        Config::in_memory().validate().expect("in-memory is valid");
    }

    #[test]
    fn partial_files_fill_in_defaults() {
        let config: Config = serde_json::from_str(r#"{"listen_addr": "0.0.0.0:9000"}"#).expect("parse");
        assert_eq!(config.listen_addr, "0.0.0.0:9000");
        assert_eq!(config.stream_queue_depth, Config::default().stream_queue_depth);
    }

    #[test]
    fn bad_values_are_rejected() {
        let mut config = Config::in_memory();
        config.listen_addr = "not an address".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::in_memory();
        config.session_idle_timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = Config::in_memory();
        config.session_max_age_secs = 10;
        config.session_idle_timeout_secs = 60;
        assert!(config.validate().is_err());

        let mut config = Config::in_memory();
        config.max_file_bytes = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        let path = path.to_string_lossy().to_string();

        let mut config = Config::in_memory();
        config.stream_queue_depth = 4;
        config.save(&path).expect("save");

        let loaded = Config::load(&path).expect("load");
        assert_eq!(loaded.stream_queue_depth, 4);
    }

    #[test]
    fn policy_follows_config() {
        let config = Config::default();
        let policy = config.session_policy();
        assert_eq!(policy.idle, chrono::Duration::minutes(30));
        assert_eq!(policy.max_age, chrono::Duration::days(7));
    }

    #[test]
    fn stream_chunks_fit_in_a_frame() {
        let mut config = Config::in_memory();
        config.max_frame_bytes = 64 * 1024;
        let limits = config.stream_limits();
        assert_eq!(limits.max_size, config.max_file_bytes);
        let encoded = limits.max_chunk.div_ceil(3) * 4;
        assert!(encoded + FRAME_ENVELOPE_BYTES <= config.max_frame_bytes);
        assert!(limits.max_chunk > 40 * 1024);
    }
}
