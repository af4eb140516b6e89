//! Run acquisition pipeline
//!
//! A run is carried by two cooperating tasks joined by a bounded queue:
//!
//! ```text
//!  RunWatcher ──record──▶ RunPipeline
//!                            │
//!             ┌──────────────┴──────────────┐
//!             ▼                             ▼
//!   AcquisitionWorker ──FrameEnvelope──▶ FrameWriter ──▶ RecordStore
//!   (nanny, handshake,   bounded mpsc     (slot writes,     │
//!    grab loop)                            busy retry)      ▼
//!                                                      Broadcaster
//! ```
//!
//! The queue is the only hand-off between the two; when it is full the grab
//! loop waits, which is the pipeline's backpressure. Cancellation is an
//! [`Interrupt`] shared by both tasks and checked at every blocking point.

pub mod pipeline;
pub mod watcher;
pub mod worker;
pub mod writer;

pub use pipeline::{RunHandle, RunPipeline, RunReport};
pub use watcher::RunWatcher;
pub use worker::AcquisitionWorker;
pub use writer::FrameWriter;

use crate::error::SyncError;
use crate::mailbox::RunId;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};

/// Cooperative cancellation flag shared by the tasks of one run.
///
/// Raising is sticky; every clone observes it.
#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Interrupt {
    /// A fresh, lowered flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag and wake every sleeper.
    pub fn raise(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Whether the flag has been raised.
    pub fn is_raised(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Sleep for `duration`, returning early if raised.
    ///
    /// Returns `true` if the flag is raised when the call returns.
    pub async fn sleep(&self, duration: Duration) -> bool {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_raised() {
            return true;
        }
        tokio::select! {
            _ = notified => {}
            _ = tokio::time::sleep(duration) => {}
        }
        self.is_raised()
    }

    /// Resolve once the flag is raised.
    pub async fn raised(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_raised() {
                return;
            }
            notified.await;
        }
    }

    /// Raise the flag after `delay` from a background task.
    pub fn raise_after(&self, delay: Duration) {
        let interrupt = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            interrupt.raise();
        });
    }
}

/// One grabbed frame travelling from the grab loop to the writer.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameEnvelope {
    /// Raw image bytes
    pub data: Bytes,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Capture time, seconds since the Unix epoch
    pub timestamp: f64,
    /// Slot in the run's frame table
    pub index: usize,
}

/// How a worker or writer finished.
#[derive(Debug)]
pub enum RunOutcome {
    /// Every expected frame was handled.
    Completed {
        /// Frames handled
        frames: usize,
    },
    /// The task stopped early.
    Failed {
        /// Why the task stopped
        error: SyncError,
        /// Frames handled before stopping
        frames: usize,
    },
}

impl RunOutcome {
    /// Whether the task finished all of its frames.
    pub fn is_completed(&self) -> bool {
        matches!(self, RunOutcome::Completed { .. })
    }

    /// Frames handled either way.
    pub fn frames(&self) -> usize {
        match self {
            RunOutcome::Completed { frames } | RunOutcome::Failed { frames, .. } => *frames,
        }
    }
}

/// Lifecycle of one run as seen from outside the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    /// Acquiring the camera and hand-shaking
    Starting,
    /// Handshake done and the grab is armed
    CameraReady,
    /// Every frame persisted
    Complete,
    /// Run ended early
    Incomplete,
}

impl RunPhase {
    /// Whether the run has ended.
    pub fn is_finished(self) -> bool {
        matches!(self, RunPhase::Complete | RunPhase::Incomplete)
    }
}

/// Live counters of one run, shared with the command server.
#[derive(Debug)]
pub struct RunStatus {
    run_id: RunId,
    expected_frame_count: usize,
    grab_active: AtomicBool,
    frames_written: AtomicUsize,
    phase: watch::Sender<RunPhase>,
}

impl RunStatus {
    /// Fresh status in the `Starting` phase.
    pub fn new(run_id: RunId, expected_frame_count: usize) -> Self {
        let (phase, _) = watch::channel(RunPhase::Starting);
        Self {
            run_id,
            expected_frame_count,
            grab_active: AtomicBool::new(false),
            frames_written: AtomicUsize::new(0),
            phase,
        }
    }

    /// Run identifier.
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Frames the run will deliver.
    pub fn expected_frame_count(&self) -> usize {
        self.expected_frame_count
    }

    /// Current phase.
    pub fn phase(&self) -> RunPhase {
        *self.phase.borrow()
    }

    /// Move to a new phase; finished phases are final.
    pub(crate) fn set_phase(&self, phase: RunPhase) {
        self.phase.send_if_modified(|current| {
            if current.is_finished() || *current == phase {
                false
            } else {
                *current = phase;
                true
            }
        });
    }

    /// Whether the camera is armed for this run.
    pub fn camera_ready(&self) -> bool {
        self.phase() == RunPhase::CameraReady
    }

    /// Whether the grab loop is running.
    pub fn grab_active(&self) -> bool {
        self.grab_active.load(Ordering::SeqCst)
    }

    pub(crate) fn set_grab_active(&self, active: bool) {
        self.grab_active.store(active, Ordering::SeqCst);
    }

    /// Frames persisted so far.
    pub fn frames_written(&self) -> usize {
        self.frames_written.load(Ordering::SeqCst)
    }

    pub(crate) fn frame_written(&self) -> usize {
        self.frames_written.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Wait until the camera is armed or the run ended, whichever first.
    pub async fn wait_past_start(&self) -> RunPhase {
        let mut rx = self.phase.subscribe();
        let reached = match rx.wait_for(|phase| *phase != RunPhase::Starting).await {
            Ok(phase) => *phase,
            Err(_) => self.phase(),
        };
        reached
    }

    /// Wait until the run ended.
    pub async fn wait_finished(&self) -> RunPhase {
        let mut rx = self.phase.subscribe();
        let reached = match rx.wait_for(|phase| phase.is_finished()).await {
            Ok(phase) => *phase,
            Err(_) => self.phase(),
        };
        reached
    }
}
