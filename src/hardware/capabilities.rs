//! Camera capability traits
//!
//! Drivers implement [`Camera`]; the SDK or bus that produces camera
//! instances implements [`CameraConnector`]. Both are async and use
//! `anyhow::Result`, leaving the mapping into run-level errors to the
//! device nanny and acquisition worker.
//!
//! # Example
//!
//! ```rust,ignore
//! let mut camera = connector.connect(&params).await?;
//! camera.open().await?;
//! camera.configure(&params).await?;
//! camera.start_grab(3).await?;
//! while let GrabEvent::Frame(frame) = camera.grab(Duration::from_secs(1)).await? {
//!     // hand off frame
//! }
//! camera.stop_grab().await?;
//! ```

use crate::hardware::{CameraParams, Frame};
use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Outcome of a single blocking grab call.
#[derive(Debug, Clone, PartialEq)]
pub enum GrabEvent {
    /// A frame was read out.
    Frame(Frame),
    /// The device timeout elapsed without a frame; the caller may retry.
    Timeout,
    /// The device delivered a marker where image data was expected.
    Marker(String),
}

/// Capability: triggered frame acquisition.
///
/// # Contract
/// - `open`/`close` manage the device session; `is_open` reports liveness
/// - `configure` may be called on an open camera at any time outside a grab
/// - `start_grab(count)` arms the device for exactly `count` frames
/// - `grab` blocks for at most `timeout`; it cannot be interrupted otherwise
/// - `stop_grab` is safe to call when no grab is active
#[async_trait]
pub trait Camera: Send + Sync {
    /// Stable identity of the physical device.
    fn id(&self) -> &str;

    /// Open a session with the device.
    async fn open(&mut self) -> Result<()>;

    /// Close the session. Closing a closed camera is a no-op.
    async fn close(&mut self) -> Result<()>;

    /// Whether the session is still alive.
    fn is_open(&self) -> bool;

    /// Apply exposure, gain, ROI and trigger settings.
    async fn configure(&mut self, params: &CameraParams) -> Result<()>;

    /// Arm the device for `count` frames.
    async fn start_grab(&mut self, count: usize) -> Result<()>;

    /// Wait up to `timeout` for the next frame.
    async fn grab(&mut self, timeout: Duration) -> Result<GrabEvent>;

    /// Abort or finish the current grab.
    async fn stop_grab(&mut self) -> Result<()>;

    /// Whether a grab is currently armed.
    fn is_grabbing(&self) -> bool;
}

/// Factory for camera sessions.
///
/// Holds whatever library handle the vendor SDK needs; it is constructed by
/// the application and handed to the device nanny, never stored globally.
#[async_trait]
pub trait CameraConnector: Send + Sync {
    /// Create a (not yet opened) camera for the given parameters.
    async fn connect(&self, params: &CameraParams) -> Result<Box<dyn Camera>>;
}
