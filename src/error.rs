//! Custom error types for the synchronisation layer.
//!
//! This module defines `SyncError`, the single error type shared by the mailbox,
//! the acquisition pipeline and the socket protocol. Using the `thiserror` crate,
//! it gives every component the same vocabulary for the failure modes a run can
//! go through.
//!
//! ## Error Taxonomy
//!
//! - **`Busy`**: a run record is transiently held by the other process. Always
//!   retried by the poller that hit it, never surfaced past its owning component.
//! - **`NotFound`**: the run record does not exist. Retried while awaiting a new
//!   run, fatal once a handshake has already seen the record.
//! - **`Timeout`**: a handshake or grab exceeded the caller-supplied bound.
//! - **`DeviceUnavailable`**: the camera could not be opened or failed mid-grab.
//!   Retried by the device nanny while acquiring; fatal to the run otherwise.
//! - **`Interrupted`**: explicit external cancellation of the current run.
//! - **`ConnectionLost`**: a socket closed or broke during an exchange.
//! - **`ProtocolDesync`**: a marker arrived where a data frame was expected, or a
//!   peer answered with the wrong message.
//!
//! Everything except `Busy` terminates the current worker/writer pair and is
//! reported once through the run's completion signal.

use crate::mailbox::RunId;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type SyncResult<T> = std::result::Result<T, SyncError>;

/// Primary error type for run synchronisation and streaming.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Record is held open by the other process; retry.
    #[error("Run record {0} is busy")]
    Busy(RunId),

    /// Record does not exist on durable storage.
    #[error("Run record {0} not found")]
    NotFound(RunId),

    /// A bounded wait elapsed.
    #[error("Timed out after {elapsed:?} while {waiting_for}")]
    Timeout {
        /// What the caller was waiting for.
        waiting_for: String,
        /// Time spent waiting before giving up.
        elapsed: Duration,
    },

    /// Camera open/configure/grab failure.
    #[error("Camera '{camera_id}' unavailable: {message}")]
    DeviceUnavailable {
        /// Stable identifier of the physical camera.
        camera_id: String,
        /// Driver-level description of the failure.
        message: String,
    },

    /// External cancellation of the current run.
    #[error("Run interrupted")]
    Interrupted,

    /// Socket closed or broken.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Marker or message mismatch where data was expected.
    #[error("Protocol desync: {0}")]
    ProtocolDesync(String),

    /// Malformed record contents or a violated record invariant.
    #[error("Invalid run record: {0}")]
    InvalidRecord(String),

    /// MessagePack encoding or decoding failed.
    #[error("Codec error: {0}")]
    Codec(String),

    /// The peer answered with an error response.
    #[error("Remote error: {0}")]
    Remote(String),

    /// Configuration file parsing failed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration parsed but failed semantic validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// File or socket I/O not covered by a more specific variant.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Build a `Timeout` error.
    pub fn timeout(waiting_for: impl Into<String>, elapsed: Duration) -> Self {
        SyncError::Timeout {
            waiting_for: waiting_for.into(),
            elapsed,
        }
    }

    /// Build a `DeviceUnavailable` error from any displayable driver error.
    pub fn device(camera_id: impl Into<String>, err: impl std::fmt::Display) -> Self {
        SyncError::DeviceUnavailable {
            camera_id: camera_id.into(),
            message: err.to_string(),
        }
    }

    /// True for contention that the caller should simply retry.
    pub fn is_busy(&self) -> bool {
        matches!(self, SyncError::Busy(_))
    }

    /// True when the record is absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, SyncError::NotFound(_))
    }

    /// True when a poller should try again.
    ///
    /// `awaiting_new_run` covers the watcher and the first phase of the
    /// consumer handshake, where an absent record simply has not been
    /// created yet.
    pub fn is_retryable(&self, awaiting_new_run: bool) -> bool {
        match self {
            SyncError::Busy(_) => true,
            SyncError::NotFound(_) => awaiting_new_run,
            _ => false,
        }
    }

    /// True for every kind that ends the current worker/writer pair.
    ///
    /// `Busy` is recovered locally; everything else tears the run down.
    pub fn is_fatal_to_run(&self) -> bool {
        !self.is_busy()
    }
}

impl From<figment::Error> for SyncError {
    fn from(value: figment::Error) -> Self {
        SyncError::Config(Box::new(value))
    }
}

impl From<rmp_serde::encode::Error> for SyncError {
    fn from(value: rmp_serde::encode::Error) -> Self {
        SyncError::Codec(value.to_string())
    }
}

impl From<rmp_serde::decode::Error> for SyncError {
    fn from(value: rmp_serde::decode::Error) -> Self {
        SyncError::Codec(value.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(value: serde_json::Error) -> Self {
        SyncError::InvalidRecord(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_is_the_only_non_fatal_kind() {
        assert!(!SyncError::Busy(3).is_fatal_to_run());
        assert!(SyncError::NotFound(3).is_fatal_to_run());
        assert!(SyncError::Interrupted.is_fatal_to_run());
        assert!(SyncError::timeout("ack", Duration::from_millis(5)).is_fatal_to_run());
    }

    #[test]
    fn not_found_is_retryable_only_while_awaiting() {
        assert!(SyncError::Busy(1).is_retryable(false));
        assert!(SyncError::NotFound(1).is_retryable(true));
        assert!(!SyncError::NotFound(1).is_retryable(false));
        assert!(!SyncError::Interrupted.is_retryable(true));
    }

    #[test]
    fn device_error_keeps_camera_identity() {
        let err = SyncError::device("cam-0", anyhow::anyhow!("usb reset"));
        let text = err.to_string();
        assert!(text.contains("cam-0"));
        assert!(text.contains("usb reset"));
    }

    #[test]
    fn io_errors_convert_with_question_mark() {
        fn fails() -> SyncResult<()> {
            Err(std::io::Error::from(std::io::ErrorKind::PermissionDenied))?;
            Ok(())
        }
        assert!(matches!(fails(), Err(SyncError::Io(_))));
    }
}
