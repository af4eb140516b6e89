//! In-memory run records for tests and demos.
//!
//! Behaves like [`FsRecordStore`](super::FsRecordStore) without touching the
//! disk, and can be told to report `Busy` for a number of accesses to a run
//! so contention handling can be exercised deterministically.

use crate::error::{SyncError, SyncResult};
use crate::mailbox::{FlagUpdate, RecordStore, RunAttributes, RunId, RunRecord, StoredFrame};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug)]
struct MemRecord {
    attributes: RunAttributes,
    frames: Vec<Option<StoredFrame>>,
    writes: Vec<u32>,
    modified: u64,
}

#[derive(Debug, Default)]
struct Inner {
    records: HashMap<RunId, MemRecord>,
    busy: HashMap<RunId, u32>,
    busy_reports: u32,
    clock: u64,
}

/// Run record store kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    inner: Mutex<Inner>,
}

impl MemoryRecordStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `Busy` for the next `accesses` calls touching `run_id`.
    ///
    /// May be set before the run exists.
    pub fn inject_busy(&self, run_id: RunId, accesses: u32) {
        self.with(|inner| {
            inner.busy.insert(run_id, accesses);
        });
    }

    /// Total number of `Busy` results handed out so far.
    pub fn busy_reports(&self) -> u32 {
        self.with(|inner| inner.busy_reports)
    }

    /// Highest number of times any single slot of `run_id` was written.
    pub fn max_writes_per_slot(&self, run_id: RunId) -> u32 {
        self.with(|inner| {
            inner
                .records
                .get(&run_id)
                .and_then(|r| r.writes.iter().copied().max())
                .unwrap_or(0)
        })
    }

    /// Whether a record exists.
    pub fn contains(&self, run_id: RunId) -> bool {
        self.with(|inner| inner.records.contains_key(&run_id))
    }

    fn with<T>(&self, f: impl FnOnce(&mut Inner) -> T) -> T {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut inner)
    }

    /// Run `f` against a record, honouring injected contention.
    fn access<T>(
        &self,
        run_id: RunId,
        f: impl FnOnce(&mut MemRecord, u64) -> SyncResult<T>,
    ) -> SyncResult<T> {
        self.with(|inner| {
            if let Some(remaining) = inner.busy.get_mut(&run_id) {
                if *remaining > 0 {
                    *remaining -= 1;
                    inner.busy_reports += 1;
                    return Err(SyncError::Busy(run_id));
                }
            }
            inner.clock += 1;
            let now = inner.clock;
            let record = inner
                .records
                .get_mut(&run_id)
                .ok_or(SyncError::NotFound(run_id))?;
            f(record, now)
        })
    }

    fn record(&self, attributes: RunAttributes) -> RunRecord {
        RunRecord {
            location: self.location(attributes.run_id),
            attributes,
        }
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn create(&self, attributes: RunAttributes) -> SyncResult<RunRecord> {
        attributes.validate()?;
        let run_id = attributes.run_id;
        self.with(|inner| {
            if inner.records.contains_key(&run_id) {
                return Err(SyncError::InvalidRecord(format!("run {run_id} already exists")));
            }
            inner.clock += 1;
            let slots = attributes.expected_frame_count;
            inner.records.insert(
                run_id,
                MemRecord {
                    attributes: attributes.clone(),
                    frames: vec![None; slots],
                    writes: vec![0; slots],
                    modified: inner.clock,
                },
            );
            Ok(())
        })?;
        Ok(self.record(attributes))
    }

    async fn read(&self, run_id: RunId) -> SyncResult<RunRecord> {
        let attributes = self.access(run_id, |r, _| Ok(r.attributes.clone()))?;
        Ok(self.record(attributes))
    }

    async fn set_flags(&self, run_id: RunId, update: FlagUpdate) -> SyncResult<RunAttributes> {
        self.access(run_id, |r, now| {
            r.attributes.apply(update)?;
            r.modified = now;
            Ok(r.attributes.clone())
        })
    }

    async fn write_frame(
        &self,
        run_id: RunId,
        index: usize,
        data: &[u8],
        timestamp: f64,
    ) -> SyncResult<()> {
        self.access(run_id, |r, _| {
            let slot_len = r.frames.iter().flatten().next().map(|f| f.data.len());
            if slot_len.is_some_and(|len| len != data.len()) {
                return Err(SyncError::InvalidRecord(format!(
                    "run {run_id}: frame {index} does not match table slot size"
                )));
            }
            let slots = r.frames.len();
            let slot = r.frames.get_mut(index).ok_or_else(|| {
                SyncError::InvalidRecord(format!(
                    "run {run_id}: frame index {index} outside table of {slots}"
                ))
            })?;
            *slot = Some(StoredFrame {
                data: Bytes::copy_from_slice(data),
                timestamp,
            });
            r.writes[index] += 1;
            Ok(())
        })
    }

    async fn read_frame(&self, run_id: RunId, index: usize) -> SyncResult<Option<StoredFrame>> {
        self.access(run_id, |r, _| {
            r.frames.get(index).cloned().ok_or_else(|| {
                SyncError::InvalidRecord(format!("run {run_id}: frame index {index} out of range"))
            })
        })
    }

    async fn written_indices(&self, run_id: RunId) -> SyncResult<Vec<usize>> {
        self.access(run_id, |r, _| {
            Ok(r.frames
                .iter()
                .enumerate()
                .filter(|(_, f)| f.is_some())
                .map(|(i, _)| i)
                .collect())
        })
    }

    async fn latest(&self) -> SyncResult<Option<RunId>> {
        Ok(self.with(|inner| {
            inner
                .records
                .iter()
                .max_by_key(|(id, r)| (r.modified, **id))
                .map(|(id, _)| *id)
        }))
    }

    async fn delete(&self, run_id: RunId) -> SyncResult<()> {
        self.access(run_id, |_, _| Ok(()))?;
        self.with(|inner| inner.records.remove(&run_id));
        Ok(())
    }

    fn location(&self, run_id: RunId) -> String {
        format!("memory://run_{run_id:08}")
    }
}
