//! Mock Hardware Implementations
//!
//! Simulated camera for tests, demos and the `serve` command without
//! physical hardware. All delays use `tokio::time::sleep`.
//!
//! `MockCameraConnector` hands out `MockCamera` sessions and keeps shared
//! counters so tests can observe how often the device was opened or
//! reconfigured. Faults are injected through [`MockFaults`].

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

use crate::hardware::capabilities::{Camera, CameraConnector, GrabEvent};
use crate::hardware::{CameraParams, Frame};

/// Fault injection knobs shared by every session of a connector.
#[derive(Debug, Default)]
pub struct MockFaults {
    /// Number of upcoming `open` calls that fail
    pub failing_opens: AtomicU32,
    /// Deliver a marker instead of the frame at this index
    pub marker_at: Option<usize>,
    /// Fail the grab at this index with a device error
    pub error_at: Option<usize>,
    /// Never deliver frames (every grab times out)
    pub stalled: AtomicBool,
    /// Number of upcoming liveness checks that find the session dropped
    pub dropped_sessions: AtomicU32,
}

#[derive(Debug, Default)]
struct MockCounters {
    connects: AtomicUsize,
    opens: AtomicUsize,
    configures: AtomicUsize,
}

/// Connector producing simulated cameras.
#[derive(Debug, Clone)]
pub struct MockCameraConnector {
    frame_interval: Duration,
    faults: Arc<MockFaults>,
    counters: Arc<MockCounters>,
}

impl MockCameraConnector {
    /// Create connector whose cameras read out a frame every `frame_interval`
    pub fn new(frame_interval: Duration) -> Self {
        Self::with_faults(frame_interval, MockFaults::default())
    }

    /// Create connector with fault injection
    pub fn with_faults(frame_interval: Duration, faults: MockFaults) -> Self {
        Self {
            frame_interval,
            faults: Arc::new(faults),
            counters: Arc::new(MockCounters::default()),
        }
    }

    /// Shared fault settings.
    pub fn faults(&self) -> &MockFaults {
        &self.faults
    }

    /// Number of camera sessions created.
    pub fn connect_count(&self) -> usize {
        self.counters.connects.load(Ordering::SeqCst)
    }

    /// Number of successful `open` calls across all sessions.
    pub fn open_count(&self) -> usize {
        self.counters.opens.load(Ordering::SeqCst)
    }

    /// Number of `configure` calls across all sessions.
    pub fn configure_count(&self) -> usize {
        self.counters.configures.load(Ordering::SeqCst)
    }
}

impl Default for MockCameraConnector {
    fn default() -> Self {
        Self::new(Duration::from_millis(5))
    }
}

#[async_trait]
impl CameraConnector for MockCameraConnector {
    async fn connect(&self, params: &CameraParams) -> Result<Box<dyn Camera>> {
        self.counters.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockCamera {
            id: params.camera_id.clone(),
            params: params.clone(),
            open: false,
            remaining: None,
            grabbed: 0,
            frame_interval: self.frame_interval,
            faults: Arc::clone(&self.faults),
            counters: Arc::clone(&self.counters),
        }))
    }
}

/// Simulated camera session
///
/// Produces a moving gradient test pattern with a little noise. Frames are
/// only delivered while a grab is armed and until the armed count is used up.
pub struct MockCamera {
    id: String,
    params: CameraParams,
    open: bool,
    remaining: Option<usize>,
    grabbed: usize,
    frame_interval: Duration,
    faults: Arc<MockFaults>,
    counters: Arc<MockCounters>,
}

impl MockCamera {
    fn pattern(&self) -> Frame {
        let (width, height) = (self.params.width, self.params.height);
        let offset = self.grabbed as u32;
        let mut rng = rand::thread_rng();
        let pixels: Vec<u16> = (0..width * height)
            .map(|i| (((i + offset) % 4096) as u16).saturating_add(rng.gen_range(0..16)))
            .collect();
        Frame::from_u16(width, height, &pixels)
    }
}

#[async_trait]
impl Camera for MockCamera {
    fn id(&self) -> &str {
        &self.id
    }

    async fn open(&mut self) -> Result<()> {
        let failing = self
            .faults
            .failing_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            bail!("MockCamera {}: device not responding", self.id);
        }
        self.open = true;
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.open = false;
        self.remaining = None;
        Ok(())
    }

    fn is_open(&self) -> bool {
        if !self.open {
            return false;
        }
        // Each injected drop is observed by exactly one liveness check
        let dropped = self
            .faults
            .dropped_sessions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        dropped.is_err()
    }

    async fn configure(&mut self, params: &CameraParams) -> Result<()> {
        if !self.open {
            bail!("MockCamera {}: configure on closed camera", self.id);
        }
        if self.remaining.is_some() {
            bail!("MockCamera {}: cannot configure during a grab", self.id);
        }
        if params.width == 0 || params.height == 0 {
            return Err(anyhow!("MockCamera {}: empty ROI", self.id));
        }
        self.params = params.clone();
        self.counters.configures.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn start_grab(&mut self, count: usize) -> Result<()> {
        if !self.open {
            bail!("MockCamera {}: start_grab on closed camera", self.id);
        }
        self.remaining = Some(count);
        self.grabbed = 0;
        Ok(())
    }

    async fn grab(&mut self, timeout: Duration) -> Result<GrabEvent> {
        let remaining = match self.remaining {
            Some(n) if self.open => n,
            _ => bail!("MockCamera {}: grab without an armed acquisition", self.id),
        };

        if remaining == 0 || self.faults.stalled.load(Ordering::SeqCst) {
            sleep(timeout).await;
            return Ok(GrabEvent::Timeout);
        }

        if self.frame_interval > timeout {
            sleep(timeout).await;
            return Ok(GrabEvent::Timeout);
        }
        sleep(self.frame_interval).await;

        let index = self.grabbed;
        if self.faults.error_at == Some(index) {
            self.open = false;
            bail!("MockCamera {}: readout failed at frame {}", self.id, index);
        }
        if self.faults.marker_at == Some(index) {
            self.grabbed += 1;
            self.remaining = Some(remaining - 1);
            return Ok(GrabEvent::Marker(format!("end-of-sequence@{index}")));
        }

        let frame = self.pattern();
        self.grabbed += 1;
        self.remaining = Some(remaining - 1);
        Ok(GrabEvent::Frame(frame))
    }

    async fn stop_grab(&mut self) -> Result<()> {
        self.remaining = None;
        Ok(())
    }

    fn is_grabbing(&self) -> bool {
        self.remaining.is_some()
    }
}
