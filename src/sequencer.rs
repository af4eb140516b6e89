//! Sequencer-side helper
//!
//! The hardware sequencer owns run creation. [`RunProducer`] bundles the
//! steps it performs for each run:
//!
//! 1. create the run record with both flags cleared
//! 2. raise `producer_ready`
//! 3. send `new_run` and wait for `camera_ready`; on failure the record is
//!    deleted, since nothing will ever fill it
//! 4. confirm the worker's `producer_ready_ack`; a timeout here is reported
//!    without deleting anything
//!
//! Triggering the hardware is outside this crate; once the sequence has run,
//! the caller sends `run_complete` through [`RunProducer::finish_run`].

use crate::acquisition::Interrupt;
use crate::error::{SyncError, SyncResult};
use crate::hardware::CameraParams;
use crate::mailbox::handshake::{await_ack, signal_ready, PollPolicy};
use crate::mailbox::{remove_record, ImagingMode, RecordStore, RunAttributes, RunId, RunRecord};
use crate::network::command::CommandClient;
use crate::network::protocol::{NewRun, StatusReport, Vars};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Everything the sequencer decides about a run up front.
#[derive(Debug, Clone, PartialEq)]
pub struct RunPlan {
    /// Identifier of the record to create
    pub run_id: RunId,
    /// Camera the imaging process should arm
    pub camera: CameraParams,
    /// Total frames, `shot_count * subframes_per_shot`
    pub expected_frame_count: usize,
    /// Shots the sequencer will trigger
    pub shot_count: usize,
    /// Frames per shot
    pub subframes_per_shot: usize,
    /// Imaging technique, passed through to viewers
    pub imaging_mode: ImagingMode,
    /// Keep the record; an abandoned saved run is deleted
    pub save_enabled: bool,
}

impl RunPlan {
    /// One frame per shot, absorption imaging, saved.
    pub fn new(run_id: RunId, camera: CameraParams, shots: usize) -> Self {
        Self {
            run_id,
            camera,
            expected_frame_count: shots,
            shot_count: shots,
            subframes_per_shot: 1,
            imaging_mode: ImagingMode::Absorption,
            save_enabled: true,
        }
    }

    /// Several frames per shot.
    pub fn with_subframes(mut self, subframes_per_shot: usize) -> Self {
        self.subframes_per_shot = subframes_per_shot.max(1);
        self.expected_frame_count = self.shot_count * self.subframes_per_shot;
        self
    }

    fn attributes(&self) -> RunAttributes {
        RunAttributes {
            run_id: self.run_id,
            producer_ready: false,
            producer_ready_ack: false,
            expected_frame_count: self.expected_frame_count,
            shot_count: self.shot_count,
            subframes_per_shot: self.subframes_per_shot,
            imaging_mode: self.imaging_mode,
            save_enabled: self.save_enabled,
            created_at: Utc::now(),
        }
    }
}

/// Producer side of the run handshake plus the command channel.
pub struct RunProducer {
    store: Arc<dyn RecordStore>,
    client: CommandClient,
    policy: PollPolicy,
    camera_ready_timeout: Duration,
    completion_timeout: Duration,
}

impl RunProducer {
    /// Create a producer over a shared mailbox and a command client.
    pub fn new(
        store: Arc<dyn RecordStore>,
        client: CommandClient,
        policy: PollPolicy,
        camera_ready_timeout: Duration,
    ) -> Self {
        Self {
            store,
            client,
            policy,
            camera_ready_timeout,
            completion_timeout: Duration::from_secs(10),
        }
    }

    /// Bound on the `run_complete` exchange.
    pub fn with_completion_timeout(mut self, completion_timeout: Duration) -> Self {
        self.completion_timeout = completion_timeout;
        self
    }

    /// Create the record and hand-shake with the imaging process.
    #[instrument(skip_all, fields(run_id = plan.run_id))]
    pub async fn start_run(&mut self, plan: &RunPlan) -> SyncResult<RunRecord> {
        let interrupt = Interrupt::new();
        let record = self.store.create(plan.attributes()).await?;
        signal_ready(self.store.as_ref(), plan.run_id, &self.policy, &interrupt).await?;

        let request = NewRun {
            run_id: plan.run_id,
            camera: plan.camera.clone(),
            filepath: record.location.clone(),
            save_enabled: plan.save_enabled,
            expected_frame_count: plan.expected_frame_count,
            shot_count: plan.shot_count,
            subframes_per_shot: plan.subframes_per_shot,
            imaging_mode: plan.imaging_mode,
        };
        if let Err(e) = self.client.new_run(request, self.camera_ready_timeout).await {
            warn!("Camera never became ready, removing record: {}", e);
            if let Err(cleanup) = remove_record(self.store.as_ref(), plan.run_id).await {
                warn!("Could not remove record: {}", cleanup);
            }
            return Err(e);
        }

        let attributes =
            await_ack(self.store.as_ref(), plan.run_id, &self.policy, &interrupt).await?;
        info!("Imaging process acknowledged run");
        Ok(RunRecord {
            location: record.location,
            attributes,
        })
    }

    /// Forward a variable snapshot for the current run.
    pub async fn send_xvars(&mut self, vars: Vars) -> SyncResult<()> {
        self.client.xvars(vars).await
    }

    /// Report that the sequence finished.
    pub async fn finish_run(&mut self) -> SyncResult<()> {
        self.client.run_complete(self.completion_timeout).await
    }

    /// Live state of the imaging process.
    pub async fn status(&mut self) -> SyncResult<StatusReport> {
        self.client.status().await
    }

    /// Check whether a finished run has a complete frame table.
    pub async fn verify_complete(&self, run_id: RunId) -> SyncResult<bool> {
        let record = match self.store.read(run_id).await {
            Ok(record) => record,
            Err(SyncError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        let written = self.store.written_indices(run_id).await?;
        Ok(written.len() == record.attributes.expected_frame_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::MemoryRecordStore;
    use tokio::net::TcpListener;

    #[test]
    fn subframes_scale_expected_count() {
        let plan = RunPlan::new(1, CameraParams::default(), 4).with_subframes(3);
        assert_eq!(plan.expected_frame_count, 12);
        let attrs = plan.attributes();
        assert!(!attrs.producer_ready && !attrs.producer_ready_ack);
        assert_eq!(attrs.shot_of(7), (2, 1));
    }

    #[tokio::test]
    async fn unreachable_server_removes_record() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let store = Arc::new(MemoryRecordStore::new());
        let client = CommandClient::new(addr, Duration::from_millis(100));
        let mut producer = RunProducer::new(
            store.clone(),
            client,
            PollPolicy::new(Duration::from_millis(2)),
            Duration::from_millis(100),
        );

        let result = producer
            .start_run(&RunPlan::new(9, CameraParams::default(), 2))
            .await;
        assert!(matches!(result, Err(SyncError::ConnectionLost(_))));
        assert!(!store.contains(9));
    }
}
