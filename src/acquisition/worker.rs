//! Acquisition worker
//!
//! For one run: acquire the camera through the device nanny, complete the
//! consumer side of the handshake, arm the grab and push every frame onto
//! the hand-off queue. The worker never touches the record's frame table
//! and never deletes anything; it reports a [`RunOutcome`] and lets the
//! pipeline decide the cleanup.

use crate::acquisition::{FrameEnvelope, Interrupt, RunOutcome, RunPhase, RunStatus};
use crate::error::{SyncError, SyncResult};
use crate::hardware::nanny::{DeviceLease, DeviceNanny};
use crate::hardware::{CameraParams, GrabEvent};
use crate::mailbox::handshake::{ConsumerHandshake, PollPolicy};
use crate::mailbox::{RecordStore, RunId};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Camera side of one run.
pub struct AcquisitionWorker {
    store: Arc<dyn RecordStore>,
    nanny: Arc<DeviceNanny>,
    params: CameraParams,
    policy: PollPolicy,
    grab_timeout: Duration,
    frame_timeout: Duration,
}

impl AcquisitionWorker {
    /// Create a worker for one run.
    pub fn new(
        store: Arc<dyn RecordStore>,
        nanny: Arc<DeviceNanny>,
        params: CameraParams,
        policy: PollPolicy,
        grab_timeout: Duration,
    ) -> Self {
        Self {
            store,
            nanny,
            params,
            policy,
            grab_timeout,
            frame_timeout: Duration::ZERO,
        }
    }

    /// Fail the run when no frame arrives for `limit`; zero waits forever.
    pub fn with_frame_timeout(mut self, limit: Duration) -> Self {
        self.frame_timeout = limit;
        self
    }

    /// Run to completion or failure.
    ///
    /// The queue sender is dropped on return, which tells the writer no
    /// further frames are coming.
    #[instrument(skip_all, fields(run_id = run_id, camera_id = %self.params.camera_id))]
    pub async fn run(
        self,
        run_id: RunId,
        queue: mpsc::Sender<FrameEnvelope>,
        status: Arc<RunStatus>,
        interrupt: Interrupt,
    ) -> RunOutcome {
        let mut lease = match self.nanny.acquire(&self.params, &interrupt).await {
            Ok(lease) => lease,
            Err(error) => {
                warn!("Camera acquisition abandoned: {}", error);
                return RunOutcome::Failed { error, frames: 0 };
            }
        };

        let mut sent = 0;
        let result = self
            .acquire_run(run_id, &mut lease, &queue, &status, &interrupt, &mut sent)
            .await;
        status.set_grab_active(false);
        lease.release().await;

        match result {
            Ok(()) => {
                info!(frames = sent, "All frames grabbed");
                RunOutcome::Completed { frames: sent }
            }
            Err(error) => {
                if matches!(error, SyncError::Interrupted) {
                    info!(frames = sent, "Grab interrupted");
                } else {
                    error!(frames = sent, "Grab failed: {}", error);
                }
                RunOutcome::Failed {
                    error,
                    frames: sent,
                }
            }
        }
    }

    async fn acquire_run(
        &self,
        run_id: RunId,
        lease: &mut DeviceLease,
        queue: &mpsc::Sender<FrameEnvelope>,
        status: &RunStatus,
        interrupt: &Interrupt,
        sent: &mut usize,
    ) -> SyncResult<()> {
        let record = ConsumerHandshake::new(self.store.as_ref(), run_id, self.policy)
            .run(interrupt)
            .await?;
        let expected = record.attributes.expected_frame_count;

        let camera_id = lease.camera_id().to_string();
        let camera = lease.camera()?;
        camera
            .start_grab(expected)
            .await
            .map_err(|e| SyncError::device(&camera_id, e))?;
        status.set_grab_active(true);
        status.set_phase(RunPhase::CameraReady);
        info!(expected, "Camera armed");

        let mut last_frame = Instant::now();
        while *sent < expected {
            if interrupt.is_raised() {
                return Err(SyncError::Interrupted);
            }

            let event = camera
                .grab(self.grab_timeout)
                .await
                .map_err(|e| SyncError::device(&camera_id, e))?;

            let frame = match event {
                GrabEvent::Frame(frame) => frame,
                GrabEvent::Timeout => {
                    let silent = last_frame.elapsed();
                    if !self.frame_timeout.is_zero() && silent >= self.frame_timeout {
                        return Err(SyncError::timeout(
                            format!("frame {} from camera '{camera_id}'", *sent),
                            silent,
                        ));
                    }
                    debug!(index = *sent, "No trigger yet");
                    continue;
                }
                GrabEvent::Marker(marker) => {
                    return Err(SyncError::ProtocolDesync(format!(
                        "marker '{marker}' where frame {} was expected",
                        *sent
                    )));
                }
            };

            let envelope = FrameEnvelope {
                data: frame.data,
                width: frame.width,
                height: frame.height,
                timestamp: unix_seconds(),
                index: *sent,
            };

            tokio::select! {
                pushed = queue.send(envelope) => {
                    if pushed.is_err() {
                        // Writer is gone; nothing left to hand frames to
                        return Err(SyncError::Interrupted);
                    }
                }
                _ = interrupt.raised() => return Err(SyncError::Interrupted),
            }
            *sent += 1;
            last_frame = Instant::now();
        }

        camera
            .stop_grab()
            .await
            .map_err(|e| SyncError::device(&camera_id, e))?;
        Ok(())
    }
}

fn unix_seconds() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1e6
}
