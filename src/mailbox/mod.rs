//! Run records and the file mailbox
//!
//! A run record is the durable, per-run artifact both processes share. It
//! carries the handshake flags (`producer_ready`, `producer_ready_ack`), the
//! run metadata written by the sequencer, and a frame table filled by the
//! frame writer. The same record is what offline analysis reads once the
//! run completes.
//!
//! All access goes through [`RecordStore`]. Every call is a complete
//! open-mutate-close cycle; nothing holds a record open between calls, so
//! contention shows up as [`SyncError::Busy`] and is simply retried.

pub mod fs;
pub mod handshake;
pub mod memory;

pub use fs::FsRecordStore;
pub use memory::MemoryRecordStore;

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Externally supplied, monotonically increasing run identifier.
pub type RunId = u64;

/// How the frames of a run are exposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImagingMode {
    /// Atoms, probe and background frames per shot
    #[default]
    Absorption,
    /// Scattered light only
    Fluorescence,
    /// Several sub-frames shifted on the sensor within one readout
    FastKinetics,
}

/// Run metadata and handshake flags.
///
/// Flags are stored as 0/1 integers so the record stays readable by tooling
/// that has no notion of booleans.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunAttributes {
    /// Run identifier
    pub run_id: RunId,
    /// Set by the sequencer when the run is ready to be acquired
    #[serde(with = "flag")]
    pub producer_ready: bool,
    /// Set by the acquisition worker once it has seen `producer_ready`
    #[serde(with = "flag")]
    pub producer_ready_ack: bool,
    /// Number of frames the run will deliver
    pub expected_frame_count: usize,
    /// Number of experimental shots
    pub shot_count: usize,
    /// Frames captured per shot
    pub subframes_per_shot: usize,
    /// Exposure scheme
    pub imaging_mode: ImagingMode,
    /// Whether the record should be deleted if the run fails
    #[serde(with = "flag")]
    pub save_enabled: bool,
    /// Creation time of the record
    pub created_at: DateTime<Utc>,
}

impl RunAttributes {
    /// New attributes with both handshake flags cleared.
    pub fn new(run_id: RunId, expected_frame_count: usize) -> Self {
        Self {
            run_id,
            producer_ready: false,
            producer_ready_ack: false,
            expected_frame_count,
            shot_count: expected_frame_count,
            subframes_per_shot: 1,
            imaging_mode: ImagingMode::default(),
            save_enabled: true,
            created_at: Utc::now(),
        }
    }

    /// Apply a flag update, keeping `producer_ready_ack` implies `producer_ready`.
    pub fn apply(&mut self, update: FlagUpdate) -> SyncResult<()> {
        let ready = update.producer_ready.unwrap_or(self.producer_ready);
        let mut ack = update.producer_ready_ack.unwrap_or(self.producer_ready_ack);

        if update.producer_ready == Some(false) && update.producer_ready_ack.is_none() {
            ack = false;
        }
        if ack && !ready {
            return Err(SyncError::InvalidRecord(format!(
                "run {}: producer_ready_ack cannot be set without producer_ready",
                self.run_id
            )));
        }

        self.producer_ready = ready;
        self.producer_ready_ack = ack;
        Ok(())
    }

    /// Structural checks on metadata read back from storage.
    pub fn validate(&self) -> SyncResult<()> {
        if self.subframes_per_shot == 0 {
            return Err(SyncError::InvalidRecord(format!(
                "run {}: subframes_per_shot must be positive",
                self.run_id
            )));
        }
        if self.producer_ready_ack && !self.producer_ready {
            return Err(SyncError::InvalidRecord(format!(
                "run {}: acknowledgement set without ready flag",
                self.run_id
            )));
        }
        Ok(())
    }

    /// Shot and sub-frame position of a frame index.
    pub fn shot_of(&self, index: usize) -> (usize, usize) {
        let per_shot = self.subframes_per_shot.max(1);
        (index / per_shot, index % per_shot)
    }
}

/// Partial update of the handshake flags; `None` leaves a flag unchanged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlagUpdate {
    /// New value of `producer_ready`
    pub producer_ready: Option<bool>,
    /// New value of `producer_ready_ack`
    pub producer_ready_ack: Option<bool>,
}

impl FlagUpdate {
    /// Raise `producer_ready`.
    pub fn ready() -> Self {
        Self {
            producer_ready: Some(true),
            producer_ready_ack: None,
        }
    }

    /// Raise `producer_ready_ack`.
    pub fn acknowledge() -> Self {
        Self {
            producer_ready: None,
            producer_ready_ack: Some(true),
        }
    }
}

/// A run record as seen by either process.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    /// Where the record lives (path or store-specific locator)
    pub location: String,
    /// Metadata and flags
    pub attributes: RunAttributes,
}

impl RunRecord {
    /// Run identifier.
    pub fn run_id(&self) -> RunId {
        self.attributes.run_id
    }
}

/// One slot of the frame table.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredFrame {
    /// Raw image bytes
    pub data: Bytes,
    /// Capture time, seconds since the Unix epoch
    pub timestamp: f64,
}

/// Durable storage for run records.
///
/// Implementations must treat each call as a full open-mutate-close cycle
/// and report contention as `Busy` and absence as `NotFound`.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Create a new record with an empty frame table.
    async fn create(&self, attributes: RunAttributes) -> SyncResult<RunRecord>;

    /// Read metadata and flags.
    async fn read(&self, run_id: RunId) -> SyncResult<RunRecord>;

    /// Update handshake flags, returning the attributes after the update.
    async fn set_flags(&self, run_id: RunId, update: FlagUpdate) -> SyncResult<RunAttributes>;

    /// Place a frame at `index` in the frame table.
    async fn write_frame(
        &self,
        run_id: RunId,
        index: usize,
        data: &[u8],
        timestamp: f64,
    ) -> SyncResult<()>;

    /// Read a frame slot; `None` while the slot still holds the sentinel.
    async fn read_frame(&self, run_id: RunId, index: usize) -> SyncResult<Option<StoredFrame>>;

    /// Indices of all non-sentinel slots, ascending.
    async fn written_indices(&self, run_id: RunId) -> SyncResult<Vec<usize>>;

    /// The most recently modified record, if any.
    async fn latest(&self) -> SyncResult<Option<RunId>>;

    /// Remove a record from durable storage.
    async fn delete(&self, run_id: RunId) -> SyncResult<()>;

    /// Locator of a record, whether or not it exists.
    fn location(&self, run_id: RunId) -> String;
}

/// Delete a record, treating "already deleted" as success.
///
/// Returns `true` if this call removed the record.
pub async fn remove_record(store: &dyn RecordStore, run_id: RunId) -> SyncResult<bool> {
    match store.delete(run_id).await {
        Ok(()) => Ok(true),
        Err(SyncError::NotFound(_)) => {
            debug!(run_id, "Record already deleted");
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

mod flag {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &bool, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(u8::from(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        match u8::deserialize(deserializer)? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(serde::de::Error::custom(format!(
                "flag must be 0 or 1, got {other}"
            ))),
        }
    }
}
