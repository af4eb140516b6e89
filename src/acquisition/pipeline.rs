//! Worker/writer supervision for one run
//!
//! [`RunPipeline::start`] spawns the writer, runs the worker, and once both
//! have returned applies the cleanup their outcomes call for. It is the only
//! place that emits the run's completion signal, so the signal fires exactly
//! once per run whichever side failed first.

use crate::acquisition::{
    AcquisitionWorker, FrameWriter, Interrupt, RunOutcome, RunPhase, RunStatus,
};
use crate::config::AcquisitionConfig;
use crate::error::{SyncError, SyncResult};
use crate::hardware::nanny::DeviceNanny;
use crate::hardware::CameraParams;
use crate::mailbox::handshake::PollPolicy;
use crate::mailbox::{remove_record, RecordStore, RunAttributes, RunId, RunRecord};
use crate::network::broadcast::Broadcaster;
use crate::network::protocol::Event;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Final account of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    /// Run identifier
    pub run_id: RunId,
    /// Whether every expected frame was persisted
    pub complete: bool,
    /// Frames persisted
    pub frames_written: usize,
    /// Why the run ended early
    pub reason: Option<String>,
}

/// A run in flight.
#[derive(Debug)]
pub struct RunHandle {
    run_id: RunId,
    status: Arc<RunStatus>,
    interrupt: Interrupt,
    task: JoinHandle<RunReport>,
}

impl RunHandle {
    /// Run identifier.
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Shared live counters.
    pub fn status(&self) -> &Arc<RunStatus> {
        &self.status
    }

    /// Ask both tasks to stop.
    pub fn interrupt(&self) {
        self.interrupt.raise();
    }

    /// Whether the supervising task has returned.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the final report.
    pub async fn join(self) -> SyncResult<RunReport> {
        self.task.await.map_err(|e| {
            SyncError::Io(std::io::Error::other(format!(
                "run {} task failed: {e}",
                self.run_id
            )))
        })
    }
}

/// Starts and supervises acquisition runs.
#[derive(Clone)]
pub struct RunPipeline {
    store: Arc<dyn RecordStore>,
    nanny: Arc<DeviceNanny>,
    broadcaster: Broadcaster,
    policy: PollPolicy,
    config: AcquisitionConfig,
}

impl RunPipeline {
    /// Create a pipeline over shared components.
    pub fn new(
        store: Arc<dyn RecordStore>,
        nanny: Arc<DeviceNanny>,
        broadcaster: Broadcaster,
        policy: PollPolicy,
        config: AcquisitionConfig,
    ) -> Self {
        Self {
            store,
            nanny,
            broadcaster,
            policy,
            config,
        }
    }

    /// Spawn the worker/writer pair for `record`.
    pub fn start(&self, record: RunRecord, params: CameraParams) -> RunHandle {
        let attributes = record.attributes;
        let run_id = attributes.run_id;
        let status = Arc::new(RunStatus::new(run_id, attributes.expected_frame_count));
        let interrupt = Interrupt::new();

        let pipeline = self.clone();
        let task = {
            let status = Arc::clone(&status);
            let interrupt = interrupt.clone();
            tokio::spawn(async move {
                let (tx, rx) = mpsc::channel(pipeline.config.queue_capacity.max(1));

                let writer = FrameWriter::new(
                    Arc::clone(&pipeline.store),
                    pipeline.config.writer_poll_interval,
                )
                .with_broadcaster(pipeline.broadcaster.clone())
                .with_notice_every(pipeline.policy.notice_every);
                let writer_task = tokio::spawn(writer.run(
                    attributes.clone(),
                    rx,
                    Arc::clone(&status),
                    interrupt.clone(),
                ));

                let worker = AcquisitionWorker::new(
                    Arc::clone(&pipeline.store),
                    Arc::clone(&pipeline.nanny),
                    params,
                    pipeline.policy,
                    pipeline.config.grab_timeout,
                )
                .with_frame_timeout(pipeline.config.frame_timeout);
                let worker_outcome = worker
                    .run(run_id, tx, Arc::clone(&status), interrupt.clone())
                    .await;
                if !worker_outcome.is_completed() {
                    interrupt.raise();
                }

                let writer_outcome = match writer_task.await {
                    Ok(outcome) => outcome,
                    Err(e) => RunOutcome::Failed {
                        error: SyncError::ProtocolDesync(format!("writer task failed: {e}")),
                        frames: status.frames_written(),
                    },
                };

                pipeline
                    .finish(&attributes, &status, worker_outcome, writer_outcome)
                    .await
            })
        };

        info!(run_id, "Run pipeline started");
        RunHandle {
            run_id,
            status,
            interrupt,
            task,
        }
    }

    async fn finish(
        &self,
        attributes: &RunAttributes,
        status: &RunStatus,
        worker: RunOutcome,
        writer: RunOutcome,
    ) -> RunReport {
        let run_id = attributes.run_id;
        let frames_written = status.frames_written();

        let failure = match (worker, writer) {
            (RunOutcome::Completed { .. }, RunOutcome::Completed { .. }) => None,
            (RunOutcome::Failed { error, .. }, _) | (_, RunOutcome::Failed { error, .. }) => {
                Some(error)
            }
        };

        match failure {
            None => {
                status.set_phase(RunPhase::Complete);
                info!(run_id, frames_written, "Run complete");
                self.broadcaster.publish(&Event::RunComplete {
                    run_id,
                    frames: frames_written,
                });
                RunReport {
                    run_id,
                    complete: true,
                    frames_written,
                    reason: None,
                }
            }
            Some(error) => {
                if attributes.save_enabled {
                    if let Err(e) = remove_record(self.store.as_ref(), run_id).await {
                        error!(run_id, "Failed to delete incomplete record: {}", e);
                    }
                }
                status.set_phase(RunPhase::Incomplete);
                warn!(run_id, frames_written, "Run incomplete: {}", error);
                let reason = error.to_string();
                self.broadcaster.publish(&Event::RunIncomplete {
                    run_id,
                    frames: frames_written,
                    reason: reason.clone(),
                });
                RunReport {
                    run_id,
                    complete: false,
                    frames_written,
                    reason: Some(reason),
                }
            }
        }
    }
}
