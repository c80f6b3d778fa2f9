//! Relay tunables, loaded from defaults, the environment, and an
//! optional TOML file.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Runtime limits and timings for the relay.
///
/// The defaults are the production values; tests construct a config with
/// much shorter windows so expiry paths run in milliseconds.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// TCP port for the HTTP/WebSocket listener.
    pub port: u16,
    /// A session is destroyed after this much idle time.
    pub session_timeout: Duration,
    /// Live sessions per password; the oldest is evicted on overflow.
    pub max_sessions_per_user: usize,
    /// Failed attempts before a password is locked out.
    pub max_failed_attempts: u32,
    /// Lockout window, measured from the last failed attempt.
    pub lockout_duration: Duration,
    /// Trusted devices expire this long after registration.
    pub trusted_device_expiry: Duration,
    /// Capacity of the security log ring.
    pub security_log_limit: usize,
    /// Uploads larger than this are rejected outright.
    pub max_file_size: u64,
    /// Recent-file descriptors retained per password.
    pub recent_files_limit: usize,
    /// Cadence of the ping/pong liveness probe.
    pub heartbeat_interval: Duration,
    /// Cadence of the expired-session sweep.
    pub cleanup_interval: Duration,
    /// Completed transfers are retained this long before purge.
    pub transfer_purge_grace: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            session_timeout: Duration::from_secs(30 * 60),
            max_sessions_per_user: 5,
            max_failed_attempts: 5,
            lockout_duration: Duration::from_secs(15 * 60),
            trusted_device_expiry: Duration::from_secs(30 * 24 * 60 * 60),
            security_log_limit: 100,
            max_file_size: 100 * 1024 * 1024,
            recent_files_limit: 10,
            heartbeat_interval: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(60),
            transfer_purge_grace: Duration::from_secs(60),
        }
    }
}

/// On-disk form of [`RelayConfig`]. Every field is optional; durations
/// are whole seconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfigFile {
    pub port: Option<u16>,
    pub session_timeout_secs: Option<u64>,
    pub max_sessions_per_user: Option<usize>,
    pub max_failed_attempts: Option<u32>,
    pub lockout_duration_secs: Option<u64>,
    pub trusted_device_expiry_secs: Option<u64>,
    pub security_log_limit: Option<usize>,
    pub max_file_size: Option<u64>,
    pub recent_files_limit: Option<usize>,
    pub heartbeat_interval_secs: Option<u64>,
    pub cleanup_interval_secs: Option<u64>,
    pub transfer_purge_grace_secs: Option<u64>,
}

/// Errors that can occur when loading config.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {0}: {1}")]
    ReadFailed(std::path::PathBuf, std::io::Error),
    #[error("failed to parse config {0}: {1}")]
    ParseFailed(std::path::PathBuf, toml::de::Error),
}

impl RelayConfigFile {
    /// Load from a TOML file path. Returns `Ok(None)` if the file doesn't
    /// exist.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let file: Self = toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        Ok(Some(file))
    }
}

impl RelayConfig {
    /// Apply the file's overrides on top of this config.
    pub fn merge_file(mut self, file: RelayConfigFile) -> Self {
        let secs = Duration::from_secs;
        if let Some(v) = file.port {
            self.port = v;
        }
        if let Some(v) = file.session_timeout_secs {
            self.session_timeout = secs(v);
        }
        if let Some(v) = file.max_sessions_per_user {
            self.max_sessions_per_user = v;
        }
        if let Some(v) = file.max_failed_attempts {
            self.max_failed_attempts = v;
        }
        if let Some(v) = file.lockout_duration_secs {
            self.lockout_duration = secs(v);
        }
        if let Some(v) = file.trusted_device_expiry_secs {
            self.trusted_device_expiry = secs(v);
        }
        if let Some(v) = file.security_log_limit {
            self.security_log_limit = v;
        }
        if let Some(v) = file.max_file_size {
            self.max_file_size = v;
        }
        if let Some(v) = file.recent_files_limit {
            self.recent_files_limit = v;
        }
        if let Some(v) = file.heartbeat_interval_secs {
            self.heartbeat_interval = secs(v);
        }
        if let Some(v) = file.cleanup_interval_secs {
            self.cleanup_interval = secs(v);
        }
        if let Some(v) = file.transfer_purge_grace_secs {
            self.transfer_purge_grace = secs(v);
        }
        self
    }
}
