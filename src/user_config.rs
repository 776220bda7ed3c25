use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, SupervisorError};

/// Optional operator settings read from `config.toml`.
///
/// Every field falls back to the built-in default when absent, so an empty
/// file and a missing file behave the same.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct UserConfig {
    /// Seconds between monitor polls
    pub poll_interval_secs: Option<u64>,
    /// Default timeout for ad hoc RPC calls
    pub rpc_timeout_secs: Option<u64>,
    /// Timeout for health probes issued by scans and start polling
    pub probe_timeout_ms: Option<u64>,
    /// How long `start` waits for the socket to come alive
    pub start_timeout_ms: Option<u64>,
    /// Interval between liveness polls during `start`
    pub start_poll_ms: Option<u64>,
    /// Grace period after SIGTERM before cleanup
    pub stop_grace_ms: Option<u64>,
    /// Pause between stop and start on restart
    pub restart_delay_ms: Option<u64>,
}

impl UserConfig {
    /// $SVCMGR_CONFIG_DIR/config.toml or ~/.config/svcmgr/config.toml
    pub fn config_path() -> PathBuf {
        crate::clienv::config_dir().join("config.toml")
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        tracing::trace!(path = %path.display(), "Loading user config");

        if !path.exists() {
            tracing::trace!("Config file does not exist, using defaults");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).map_err(|e| {
            SupervisorError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| {
            SupervisorError::Config(format!("failed to parse {}: {}", path.display(), e))
        })?;

        tracing::trace!(?config, "User config loaded");
        Ok(config)
    }

    pub fn settings(&self) -> SupervisorSettings {
        let d = SupervisorSettings::default();
        SupervisorSettings {
            poll_interval: self
                .poll_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(d.poll_interval),
            rpc_timeout: self
                .rpc_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(d.rpc_timeout),
            probe_timeout: self
                .probe_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(d.probe_timeout),
            start_timeout: self
                .start_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(d.start_timeout),
            start_poll: self
                .start_poll_ms
                .map(Duration::from_millis)
                .unwrap_or(d.start_poll),
            stop_grace: self
                .stop_grace_ms
                .map(Duration::from_millis)
                .unwrap_or(d.stop_grace),
            restart_delay: self
                .restart_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(d.restart_delay),
        }
    }
}

/// Resolved timings used by the scanner, supervisor and monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorSettings {
    pub poll_interval: Duration,
    pub rpc_timeout: Duration,
    pub probe_timeout: Duration,
    pub start_timeout: Duration,
    pub start_poll: Duration,
    pub stop_grace: Duration,
    pub restart_delay: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            rpc_timeout: crate::daemon::client::DEFAULT_TIMEOUT,
            probe_timeout: Duration::from_millis(2000),
            start_timeout: Duration::from_millis(5000),
            start_poll: Duration::from_millis(50),
            stop_grace: Duration::from_millis(3000),
            restart_delay: Duration::from_millis(500),
        }
    }
}
