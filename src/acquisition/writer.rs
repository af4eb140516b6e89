//! Frame writer
//!
//! Drains the hand-off queue and places each frame into its slot of the run
//! record. Slot writes are retried while the record is busy. Each written
//! frame is also published to viewers as a `frame` event.
//!
//! The writer stops when every expected slot has been filled, when the
//! queue closes early, or when the run's interrupt is raised. In the last
//! two cases it deletes the record if the run asked for that.

use crate::acquisition::{FrameEnvelope, Interrupt, RunOutcome, RunStatus};
use crate::error::{SyncError, SyncResult};
use crate::mailbox::{remove_record, RecordStore, RunAttributes};
use crate::network::broadcast::Broadcaster;
use crate::network::protocol::{Event, FrameEvent};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

/// Persistence side of one run.
pub struct FrameWriter {
    store: Arc<dyn RecordStore>,
    broadcaster: Option<Broadcaster>,
    poll_interval: Duration,
    notice_every: u32,
}

impl FrameWriter {
    /// Create a writer; `poll_interval` bounds each wait on an empty queue.
    pub fn new(store: Arc<dyn RecordStore>, poll_interval: Duration) -> Self {
        Self {
            store,
            broadcaster: None,
            poll_interval,
            notice_every: 20,
        }
    }

    /// Warn every `notice_every` consecutive busy slot writes.
    pub fn with_notice_every(mut self, notice_every: u32) -> Self {
        self.notice_every = notice_every.max(1);
        self
    }

    /// Publish a `frame` event for every persisted frame.
    pub fn with_broadcaster(mut self, broadcaster: Broadcaster) -> Self {
        self.broadcaster = Some(broadcaster);
        self
    }

    /// Persist frames until the table is full or the run is abandoned.
    #[instrument(skip_all, fields(run_id = record.run_id))]
    pub async fn run(
        self,
        record: RunAttributes,
        mut queue: mpsc::Receiver<FrameEnvelope>,
        status: Arc<RunStatus>,
        interrupt: Interrupt,
    ) -> RunOutcome {
        let expected = record.expected_frame_count;
        let mut written = BTreeSet::new();

        while written.len() < expected {
            if interrupt.is_raised() {
                return self.abandon(&record, SyncError::Interrupted, written.len()).await;
            }

            let envelope = match timeout(self.poll_interval, queue.recv()).await {
                Ok(Some(envelope)) => envelope,
                Ok(None) => {
                    let error = SyncError::ProtocolDesync(format!(
                        "frame queue closed after {} of {} frames",
                        written.len(),
                        expected
                    ));
                    return self.abandon(&record, error, written.len()).await;
                }
                Err(_) => continue,
            };

            let index = envelope.index;
            if index >= expected {
                let error = SyncError::ProtocolDesync(format!(
                    "frame index {index} outside table of {expected}"
                ));
                return self.abandon(&record, error, written.len()).await;
            }
            if written.contains(&index) {
                warn!(index, "Duplicate frame index ignored");
                continue;
            }

            if let Err(error) = self.persist(&record, &envelope, &interrupt).await {
                return self.abandon(&record, error, written.len()).await;
            }
            written.insert(index);
            let count = status.frame_written();
            debug!(index, written = count, "Frame persisted");

            if let Some(broadcaster) = &self.broadcaster {
                let (shot, subframe) = record.shot_of(index);
                broadcaster.publish(&Event::Frame(FrameEvent {
                    run_id: record.run_id,
                    index,
                    shot,
                    subframe,
                    width: envelope.width,
                    height: envelope.height,
                    timestamp: envelope.timestamp,
                    data: envelope.data,
                }));
            }
        }

        info!(frames = written.len(), "Frame table complete");
        RunOutcome::Completed {
            frames: written.len(),
        }
    }

    /// Write one frame, retrying while the record is busy.
    async fn persist(
        &self,
        record: &RunAttributes,
        envelope: &FrameEnvelope,
        interrupt: &Interrupt,
    ) -> SyncResult<()> {
        let mut busy_polls: u32 = 0;
        loop {
            match self
                .store
                .write_frame(
                    record.run_id,
                    envelope.index,
                    &envelope.data,
                    envelope.timestamp,
                )
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) if !e.is_fatal_to_run() => {
                    busy_polls += 1;
                    if busy_polls % self.notice_every == 0 {
                        warn!(index = envelope.index, busy_polls, "Record still busy");
                    }
                    if interrupt.sleep(self.poll_interval).await {
                        return Err(SyncError::Interrupted);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn abandon(&self, record: &RunAttributes, error: SyncError, frames: usize) -> RunOutcome {
        warn!(frames, "Writer abandoning run: {}", error);
        if record.save_enabled {
            if let Err(e) = remove_record(self.store.as_ref(), record.run_id).await {
                warn!("Could not delete abandoned record: {}", e);
            }
        }
        RunOutcome::Failed { error, frames }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::MemoryRecordStore;
    use bytes::Bytes;
    use tracing_test::traced_test;

    fn envelope(index: usize) -> FrameEnvelope {
        FrameEnvelope {
            data: Bytes::from(vec![index as u8; 8]),
            width: 2,
            height: 2,
            timestamp: 1.5 + index as f64,
            index,
        }
    }

    async fn setup(frames: usize) -> (Arc<MemoryRecordStore>, RunAttributes) {
        let store = Arc::new(MemoryRecordStore::new());
        let record = store.create(RunAttributes::new(1, frames)).await.unwrap();
        (store, record.attributes)
    }

    #[tokio::test]
    async fn places_frames_out_of_order() {
        let (store, attrs) = setup(3).await;
        let (tx, rx) = mpsc::channel(4);
        for index in [2, 0, 1] {
            tx.send(envelope(index)).await.unwrap();
        }

        let status = Arc::new(RunStatus::new(1, 3));
        let writer = FrameWriter::new(store.clone(), Duration::from_millis(5));
        let outcome = writer.run(attrs, rx, Arc::clone(&status), Interrupt::new()).await;

        assert!(outcome.is_completed());
        assert_eq!(status.frames_written(), 3);
        for index in 0..3 {
            let frame = store.read_frame(1, index).await.unwrap().unwrap();
            assert_eq!(frame.data[0], index as u8);
        }
        assert_eq!(store.max_writes_per_slot(1), 1);
    }

    #[tokio::test]
    async fn busy_writes_are_retried() {
        let (store, attrs) = setup(1).await;
        store.inject_busy(1, 4);
        let (tx, rx) = mpsc::channel(1);
        tx.send(envelope(0)).await.unwrap();

        let writer = FrameWriter::new(store.clone(), Duration::from_millis(2));
        let outcome = writer
            .run(attrs, rx, Arc::new(RunStatus::new(1, 1)), Interrupt::new())
            .await;
        assert!(outcome.is_completed());
        assert_eq!(store.busy_reports(), 4);
    }

    #[tokio::test]
    #[traced_test]
    async fn busy_notices_follow_configured_cadence() {
        let (store, attrs) = setup(1).await;
        store.inject_busy(1, 3);
        let (tx, rx) = mpsc::channel(1);
        tx.send(envelope(0)).await.unwrap();

        let writer = FrameWriter::new(store.clone(), Duration::from_millis(1)).with_notice_every(2);
        let outcome = writer
            .run(attrs, rx, Arc::new(RunStatus::new(1, 1)), Interrupt::new())
            .await;

        assert!(outcome.is_completed());
        assert!(logs_contain("Record still busy"));
    }

    #[tokio::test]
    #[traced_test]
    async fn default_cadence_stays_quiet_on_short_contention() {
        let (store, attrs) = setup(1).await;
        store.inject_busy(1, 3);
        let (tx, rx) = mpsc::channel(1);
        tx.send(envelope(0)).await.unwrap();

        let writer = FrameWriter::new(store.clone(), Duration::from_millis(1));
        let outcome = writer
            .run(attrs, rx, Arc::new(RunStatus::new(1, 1)), Interrupt::new())
            .await;

        assert!(outcome.is_completed());
        assert!(!logs_contain("Record still busy"));
    }

    #[tokio::test]
    async fn interrupt_deletes_saved_record() {
        let (store, attrs) = setup(3).await;
        let (tx, rx) = mpsc::channel(1);
        tx.send(envelope(0)).await.unwrap();

        let interrupt = Interrupt::new();
        interrupt.raise_after(Duration::from_millis(20));
        let writer = FrameWriter::new(store.clone(), Duration::from_millis(5));
        let outcome = writer
            .run(attrs, rx, Arc::new(RunStatus::new(1, 3)), interrupt)
            .await;

        assert!(matches!(
            outcome,
            RunOutcome::Failed {
                error: SyncError::Interrupted,
                frames: 1
            }
        ));
        assert!(!store.contains(1));
        drop(tx);
    }

    #[tokio::test]
    async fn unsaved_record_survives_abandon() {
        let store = Arc::new(MemoryRecordStore::new());
        let mut attrs = RunAttributes::new(2, 2);
        attrs.save_enabled = false;
        store.create(attrs.clone()).await.unwrap();

        let (tx, rx) = mpsc::channel(1);
        drop(tx);
        let writer = FrameWriter::new(store.clone(), Duration::from_millis(5));
        let outcome = writer
            .run(attrs, rx, Arc::new(RunStatus::new(2, 2)), Interrupt::new())
            .await;

        assert!(!outcome.is_completed());
        assert!(store.contains(2));
    }
}
