//! Configuration System using Figment
//!
//! Configuration is layered from:
//! 1. Built-in defaults
//! 2. `config/daq_sync.toml` (or an explicit path)
//! 3. Environment variables prefixed with `DAQ_SYNC_`, using `__` between
//!    nesting levels (e.g. `DAQ_SYNC_MAILBOX__POLL_INTERVAL=20ms`)
//!
//! Durations are written as humantime strings (`"50ms"`, `"2s"`).
//!
//! # Example
//! ```no_run
//! use daq_sync::config::SyncConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SyncConfig::load()?;
//! config.validate()?;
//! println!("command port: {}", config.network.command_port);
//! # Ok(())
//! # }
//! ```

use crate::error::{SyncError, SyncResult};
use crate::hardware::CameraParams;
use crate::logging::OutputFormat;
use crate::mailbox::handshake::PollPolicy;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/daq_sync.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Socket endpoints
    pub network: NetworkConfig,
    /// Run record storage and handshake polling
    pub mailbox: MailboxConfig,
    /// Grab loop and frame writer settings
    pub acquisition: AcquisitionConfig,
    /// Camera acquisition retry settings
    pub nanny: NannyConfig,
    /// Viewer client settings
    pub viewer: ViewerConfig,
    /// Camera parameters used when a run does not override them
    pub camera: CameraParams,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format
    pub log_format: OutputFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "daq-sync".to_string(),
            log_level: "info".to_string(),
            log_format: OutputFormat::Pretty,
        }
    }
}

/// Command and viewer endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Interface to bind / host to connect to
    pub host: String,
    /// Command channel port
    pub command_port: u16,
    /// Broadcast channel port; `command_port + 1` when unset
    pub viewer_port: Option<u16>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            command_port: 5555,
            viewer_port: None,
        }
    }
}

impl NetworkConfig {
    /// Broadcast port, following the `command_port + 1` convention.
    pub fn viewer_port(&self) -> u16 {
        self.viewer_port
            .unwrap_or_else(|| self.command_port.wrapping_add(1))
    }

    /// Socket address of the command channel.
    pub fn command_addr(&self) -> SyncResult<SocketAddr> {
        parse_addr(&self.host, self.command_port)
    }

    /// Socket address of the broadcast channel.
    pub fn viewer_addr(&self) -> SyncResult<SocketAddr> {
        parse_addr(&self.host, self.viewer_port())
    }
}

fn parse_addr(host: &str, port: u16) -> SyncResult<SocketAddr> {
    format!("{host}:{port}")
        .parse()
        .map_err(|e| SyncError::Configuration(format!("Invalid address {host}:{port}: {e}")))
}

/// Run record storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MailboxConfig {
    /// Directory holding run record containers
    pub root: PathBuf,
    /// Interval between mailbox polls
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Emit a notice every N busy/absent polls
    pub busy_notice_every: u32,
    /// Overall handshake bound; zero waits forever
    #[serde(with = "humantime_serde")]
    pub handshake_timeout: Duration,
    /// Age after which a leftover `.busy` guard is removed; zero keeps it
    #[serde(with = "humantime_serde")]
    pub stale_guard_after: Duration,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data/runs"),
            poll_interval: Duration::from_millis(50),
            busy_notice_every: 20,
            handshake_timeout: Duration::ZERO,
            stale_guard_after: crate::mailbox::fs::DEFAULT_STALE_GUARD_AFTER,
        }
    }
}

impl MailboxConfig {
    /// Polling policy derived from this section.
    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy::new(self.poll_interval)
            .with_notice_every(self.busy_notice_every)
            .with_timeout(self.handshake_timeout)
    }
}

/// Acquisition pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Capacity of the grab loop to writer hand-off queue
    pub queue_capacity: usize,
    /// Writer wait on an empty queue before re-checking interruption
    #[serde(with = "humantime_serde")]
    pub writer_poll_interval: Duration,
    /// Per-frame device timeout
    #[serde(with = "humantime_serde")]
    pub grab_timeout: Duration,
    /// How long `run_complete` waits for outstanding frames
    #[serde(with = "humantime_serde")]
    pub completion_grace: Duration,
    /// How long `new_run` waits for the camera handshake
    #[serde(with = "humantime_serde")]
    pub camera_ready_timeout: Duration,
    /// Longest gap between frames of an armed run; zero waits forever
    #[serde(with = "humantime_serde")]
    pub frame_timeout: Duration,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 16,
            writer_poll_interval: Duration::from_millis(10),
            grab_timeout: Duration::from_secs(1),
            completion_grace: Duration::from_secs(2),
            camera_ready_timeout: Duration::from_secs(30),
            frame_timeout: Duration::from_secs(60),
        }
    }
}

/// Device nanny configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NannyConfig {
    /// Fixed backoff between open attempts
    #[serde(with = "humantime_serde")]
    pub retry_interval: Duration,
    /// Emit a notice every N failed attempts
    pub notice_every: u32,
}

impl Default for NannyConfig {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(1),
            notice_every: 10,
        }
    }
}

/// Viewer client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    /// Pause between reconnect attempts
    #[serde(with = "humantime_serde")]
    pub reconnect_interval: Duration,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            reconnect_interval: Duration::from_secs(1),
        }
    }
}

impl SyncConfig {
    /// Load configuration from `config/daq_sync.toml` and environment variables
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load() -> SyncResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> SyncResult<Self> {
        Ok(Self::figment(path.as_ref()).extract()?)
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(SyncConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("DAQ_SYNC_").split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> SyncResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(SyncError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.network.viewer_port() == self.network.command_port {
            return Err(SyncError::Configuration(format!(
                "viewer_port must differ from command_port ({})",
                self.network.command_port
            )));
        }

        if self.mailbox.poll_interval.is_zero() {
            return Err(SyncError::Configuration(
                "mailbox.poll_interval must be positive".to_string(),
            ));
        }

        if self.acquisition.queue_capacity == 0 {
            return Err(SyncError::Configuration(
                "acquisition.queue_capacity must be at least 1".to_string(),
            ));
        }

        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(SyncError::Configuration(format!(
                "Invalid camera frame size {}x{}",
                self.camera.width, self.camera.height
            )));
        }

        Ok(())
    }
}
