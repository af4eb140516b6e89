//! Directory-backed run records
//!
//! Each run lives in its own container directory under the mailbox root:
//!
//! ```text
//! <root>/run_00000042.rec/
//!     attributes.json   metadata and 0/1 handshake flags
//!     frames.bin        fixed-size frame slots, sized on first write
//!     timestamps.bin    one little-endian f64 per slot, NaN = empty
//!     .busy             present while a process has the record open
//! ```
//!
//! Every operation creates `.busy` with `create_new` and removes it when the
//! operation finishes. If the guard already exists the other process has the
//! record open and the call fails with `Busy`. A guard older than
//! `stale_guard_after` was left behind by a process that died mid-operation;
//! it is removed and the operation retried once. Attribute updates are written
//! to a temporary file and renamed into place so a reader never observes a
//! half-written flag.

use crate::error::{SyncError, SyncResult};
use crate::mailbox::{FlagUpdate, RecordStore, RunAttributes, RunId, RunRecord, StoredFrame};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};

const ATTRIBUTES_FILE: &str = "attributes.json";
const FRAMES_FILE: &str = "frames.bin";
const TIMESTAMPS_FILE: &str = "timestamps.bin";
const GUARD_FILE: &str = ".busy";
const CONTAINER_EXT: &str = "rec";

/// Age after which a leftover `.busy` guard is considered abandoned.
pub const DEFAULT_STALE_GUARD_AFTER: Duration = Duration::from_secs(30);

/// Run record store rooted at a directory shared by both processes.
#[derive(Debug, Clone)]
pub struct FsRecordStore {
    root: PathBuf,
    stale_guard_after: Duration,
}

/// Contents of a `.busy` guard, for whoever finds it left behind.
#[derive(Debug, Serialize, Deserialize)]
struct GuardOwner {
    pid: u32,
    acquired_at: DateTime<Utc>,
}

/// Removes the `.busy` marker when the operation holding it ends.
struct WriteGuard {
    path: PathBuf,
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        // The container may already be gone after a delete
        let _ = std::fs::remove_file(&self.path);
    }
}

impl FsRecordStore {
    /// Open (creating if needed) a mailbox rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> SyncResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        info!(root = %root.display(), "Run record mailbox opened");
        Ok(Self {
            root,
            stale_guard_after: DEFAULT_STALE_GUARD_AFTER,
        })
    }

    /// Break `.busy` guards older than `after`; zero never breaks them.
    pub fn with_stale_guard_after(mut self, after: Duration) -> Self {
        self.stale_guard_after = after;
        self
    }

    /// Mailbox root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Container directory of a run.
    pub fn container(&self, run_id: RunId) -> PathBuf {
        self.root.join(format!("run_{run_id:08}.{CONTAINER_EXT}"))
    }

    fn parse_container_name(name: &str) -> Option<RunId> {
        name.strip_prefix("run_")?
            .strip_suffix(".rec")?
            .parse()
            .ok()
    }

    async fn lock(&self, run_id: RunId) -> SyncResult<WriteGuard> {
        let path = self.container(run_id).join(GUARD_FILE);
        match Self::try_guard(&path).await {
            Ok(guard) => return Ok(guard),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => return Err(map_io(run_id, e)),
        }
        if !self.break_stale_guard(run_id, &path).await? {
            return Err(SyncError::Busy(run_id));
        }
        match Self::try_guard(&path).await {
            Ok(guard) => Ok(guard),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(SyncError::Busy(run_id)),
            Err(e) => Err(map_io(run_id, e)),
        }
    }

    async fn try_guard(path: &Path) -> std::io::Result<WriteGuard> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await?;
        let guard = WriteGuard {
            path: path.to_path_buf(),
        };
        let owner = GuardOwner {
            pid: std::process::id(),
            acquired_at: Utc::now(),
        };
        // The body is informational; an empty guard excludes just as well
        match serde_json::to_vec(&owner) {
            Ok(body) => {
                if let Err(e) = file.write_all(&body).await {
                    debug!(path = %path.display(), "Could not record guard owner: {}", e);
                }
            }
            Err(e) => debug!("Could not encode guard owner: {}", e),
        }
        Ok(guard)
    }

    /// Remove a guard whose holder is gone. Returns whether a retry may succeed.
    async fn break_stale_guard(&self, run_id: RunId, path: &Path) -> SyncResult<bool> {
        if self.stale_guard_after.is_zero() {
            return Ok(false);
        }
        let age = match fs::metadata(path).await.and_then(|m| m.modified()) {
            Ok(modified) => SystemTime::now()
                .duration_since(modified)
                .unwrap_or_default(),
            // Released in the meantime
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(map_io(run_id, e)),
        };
        if age < self.stale_guard_after {
            return Ok(false);
        }

        let owner = fs::read(path)
            .await
            .ok()
            .and_then(|raw| serde_json::from_slice::<GuardOwner>(&raw).ok());
        warn!(
            run_id,
            ?age,
            holder_pid = owner.as_ref().map(|o| o.pid),
            acquired_at = ?owner.as_ref().map(|o| o.acquired_at),
            "Removing stale busy guard"
        );
        match fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(true),
            Err(e) => Err(map_io(run_id, e)),
        }
    }

    async fn load_attributes(&self, run_id: RunId) -> SyncResult<RunAttributes> {
        let raw = fs::read(self.container(run_id).join(ATTRIBUTES_FILE))
            .await
            .map_err(|e| map_io(run_id, e))?;
        let attributes: RunAttributes = serde_json::from_slice(&raw)?;
        if attributes.run_id != run_id {
            return Err(SyncError::InvalidRecord(format!(
                "container for run {run_id} holds attributes of run {}",
                attributes.run_id
            )));
        }
        attributes.validate()?;
        Ok(attributes)
    }

    async fn store_attributes(dir: &Path, attributes: &RunAttributes) -> SyncResult<()> {
        let tmp = dir.join(format!("{ATTRIBUTES_FILE}.tmp"));
        let raw = serde_json::to_vec_pretty(attributes)?;
        fs::write(&tmp, raw).await?;
        fs::rename(&tmp, dir.join(ATTRIBUTES_FILE)).await?;
        Ok(())
    }

    fn record(&self, attributes: RunAttributes) -> RunRecord {
        RunRecord {
            location: self.location(attributes.run_id),
            attributes,
        }
    }

    async fn read_timestamps(&self, run_id: RunId) -> SyncResult<Vec<f64>> {
        let raw = fs::read(self.container(run_id).join(TIMESTAMPS_FILE))
            .await
            .map_err(|e| map_io(run_id, e))?;
        Ok(raw
            .chunks_exact(8)
            .map(|chunk| {
                let mut le = [0u8; 8];
                le.copy_from_slice(chunk);
                f64::from_le_bytes(le)
            })
            .collect())
    }
}

fn map_io(run_id: RunId, err: std::io::Error) -> SyncError {
    if err.kind() == ErrorKind::NotFound {
        SyncError::NotFound(run_id)
    } else {
        SyncError::Io(err)
    }
}

#[async_trait]
impl RecordStore for FsRecordStore {
    async fn create(&self, attributes: RunAttributes) -> SyncResult<RunRecord> {
        attributes.validate()?;
        let run_id = attributes.run_id;
        let target = self.container(run_id);
        if fs::try_exists(&target).await? {
            return Err(SyncError::InvalidRecord(format!(
                "run {run_id} already exists at {}",
                target.display()
            )));
        }

        // Build the container under a scratch name so the watcher never sees
        // a record without attributes.
        let staging = self.root.join(format!("run_{run_id:08}.partial"));
        if fs::try_exists(&staging).await? {
            fs::remove_dir_all(&staging).await?;
        }
        fs::create_dir_all(&staging).await?;

        Self::store_attributes(&staging, &attributes).await?;
        fs::write(staging.join(FRAMES_FILE), b"").await?;
        let sentinel: Vec<u8> = std::iter::repeat(f64::NAN.to_le_bytes())
            .take(attributes.expected_frame_count)
            .flatten()
            .collect();
        fs::write(staging.join(TIMESTAMPS_FILE), sentinel).await?;

        fs::rename(&staging, &target).await?;
        info!(run_id, path = %target.display(), "Run record created");
        Ok(self.record(attributes))
    }

    async fn read(&self, run_id: RunId) -> SyncResult<RunRecord> {
        let _guard = self.lock(run_id).await?;
        let attributes = self.load_attributes(run_id).await?;
        Ok(self.record(attributes))
    }

    async fn set_flags(&self, run_id: RunId, update: FlagUpdate) -> SyncResult<RunAttributes> {
        let _guard = self.lock(run_id).await?;
        let mut attributes = self.load_attributes(run_id).await?;
        attributes.apply(update)?;
        Self::store_attributes(&self.container(run_id), &attributes).await?;
        debug!(
            run_id,
            ready = attributes.producer_ready,
            ack = attributes.producer_ready_ack,
            "Handshake flags updated"
        );
        Ok(attributes)
    }

    async fn write_frame(
        &self,
        run_id: RunId,
        index: usize,
        data: &[u8],
        timestamp: f64,
    ) -> SyncResult<()> {
        let _guard = self.lock(run_id).await?;
        let dir = self.container(run_id);
        let slots = self.read_timestamps(run_id).await?.len();
        if index >= slots {
            return Err(SyncError::InvalidRecord(format!(
                "run {run_id}: frame index {index} outside table of {slots}"
            )));
        }
        if data.is_empty() {
            return Err(SyncError::InvalidRecord(format!(
                "run {run_id}: empty frame at index {index}"
            )));
        }

        let mut frames = OpenOptions::new()
            .read(true)
            .write(true)
            .open(dir.join(FRAMES_FILE))
            .await
            .map_err(|e| map_io(run_id, e))?;
        let table_len = frames.metadata().await?.len();
        let slot_len = if table_len == 0 {
            frames.set_len((data.len() * slots) as u64).await?;
            data.len()
        } else {
            (table_len / slots as u64) as usize
        };
        if data.len() != slot_len {
            return Err(SyncError::InvalidRecord(format!(
                "run {run_id}: frame {index} has {} bytes, table slots hold {slot_len}",
                data.len()
            )));
        }
        frames
            .seek(SeekFrom::Start((index * slot_len) as u64))
            .await?;
        frames.write_all(data).await?;
        frames.flush().await?;

        let mut stamps = OpenOptions::new()
            .write(true)
            .open(dir.join(TIMESTAMPS_FILE))
            .await
            .map_err(|e| map_io(run_id, e))?;
        stamps.seek(SeekFrom::Start((index * 8) as u64)).await?;
        stamps.write_all(&timestamp.to_le_bytes()).await?;
        stamps.flush().await?;
        Ok(())
    }

    async fn read_frame(&self, run_id: RunId, index: usize) -> SyncResult<Option<StoredFrame>> {
        let _guard = self.lock(run_id).await?;
        let stamps = self.read_timestamps(run_id).await?;
        let Some(&timestamp) = stamps.get(index) else {
            return Err(SyncError::InvalidRecord(format!(
                "run {run_id}: frame index {index} outside table of {}",
                stamps.len()
            )));
        };
        if timestamp.is_nan() {
            return Ok(None);
        }

        let mut frames = fs::File::open(self.container(run_id).join(FRAMES_FILE))
            .await
            .map_err(|e| map_io(run_id, e))?;
        let slot_len = (frames.metadata().await?.len() / stamps.len() as u64) as usize;
        let mut data = vec![0u8; slot_len];
        frames
            .seek(SeekFrom::Start((index * slot_len) as u64))
            .await?;
        frames.read_exact(&mut data).await?;
        Ok(Some(StoredFrame {
            data: Bytes::from(data),
            timestamp,
        }))
    }

    async fn written_indices(&self, run_id: RunId) -> SyncResult<Vec<usize>> {
        let _guard = self.lock(run_id).await?;
        let stamps = self.read_timestamps(run_id).await?;
        Ok(stamps
            .iter()
            .enumerate()
            .filter(|(_, t)| !t.is_nan())
            .map(|(i, _)| i)
            .collect())
    }

    async fn latest(&self) -> SyncResult<Option<RunId>> {
        let mut entries = fs::read_dir(&self.root).await?;
        let mut newest: Option<(SystemTime, RunId)> = None;

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(run_id) = name.to_str().and_then(Self::parse_container_name) else {
                continue;
            };
            // Attribute file mtime, so frame writes and guard churn do not
            // make an older run look newer
            let attributes = entry.path().join(ATTRIBUTES_FILE);
            let modified = match fs::metadata(&attributes).await.and_then(|m| m.modified()) {
                Ok(modified) => modified,
                Err(e) => {
                    // Deleted between listing and stat
                    debug!(run_id, "Skipping container: {}", e);
                    continue;
                }
            };
            if newest.map_or(true, |best| (modified, run_id) > best) {
                newest = Some((modified, run_id));
            }
        }

        Ok(newest.map(|(_, run_id)| run_id))
    }

    async fn delete(&self, run_id: RunId) -> SyncResult<()> {
        let guard = self.lock(run_id).await?;
        let dir = self.container(run_id);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {
                drop(guard);
                warn!(run_id, path = %dir.display(), "Run record deleted");
                Ok(())
            }
            Err(e) => Err(map_io(run_id, e)),
        }
    }

    fn location(&self, run_id: RunId) -> String {
        self.container(run_id).display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::remove_record;
    use tempfile::TempDir;

    async fn store() -> (TempDir, FsRecordStore) {
        let dir = TempDir::new().unwrap();
        let store = FsRecordStore::open(dir.path().join("runs")).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn create_then_read_round_trips_attributes() {
        let (_dir, store) = store().await;
        let created = store.create(RunAttributes::new(7, 3)).await.unwrap();
        assert!(created.location.ends_with("run_00000007.rec"));

        let record = store.read(7).await.unwrap();
        assert_eq!(record.attributes, created.attributes);
        assert!(store.written_indices(7).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_create_is_rejected() {
        let (_dir, store) = store().await;
        store.create(RunAttributes::new(1, 1)).await.unwrap();
        assert!(matches!(
            store.create(RunAttributes::new(1, 1)).await,
            Err(SyncError::InvalidRecord(_))
        ));
    }

    #[tokio::test]
    async fn frames_land_in_their_slots_in_any_order() {
        let (_dir, store) = store().await;
        store.create(RunAttributes::new(2, 3)).await.unwrap();

        for index in [2usize, 0, 1] {
            let data = vec![index as u8; 4];
            store
                .write_frame(2, index, &data, 100.0 + index as f64)
                .await
                .unwrap();
        }

        for index in 0..3 {
            let frame = store.read_frame(2, index).await.unwrap().unwrap();
            assert_eq!(frame.data.as_ref(), &[index as u8; 4]);
            assert_eq!(frame.timestamp, 100.0 + index as f64);
        }
        assert_eq!(store.written_indices(2).await.unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn slot_size_is_fixed_by_first_frame() {
        let (_dir, store) = store().await;
        store.create(RunAttributes::new(3, 2)).await.unwrap();
        store.write_frame(3, 0, &[1, 2, 3, 4], 1.0).await.unwrap();
        assert!(matches!(
            store.write_frame(3, 1, &[1, 2], 2.0).await,
            Err(SyncError::InvalidRecord(_))
        ));
        assert!(store.read_frame(3, 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn held_guard_reports_busy() {
        let (_dir, store) = store().await;
        store.create(RunAttributes::new(4, 1)).await.unwrap();

        let guard = store.lock(4).await.unwrap();
        assert!(matches!(store.read(4).await, Err(SyncError::Busy(4))));
        drop(guard);
        assert!(store.read(4).await.is_ok());
    }

    #[tokio::test]
    async fn guard_names_its_holder() {
        let (_dir, store) = store().await;
        store.create(RunAttributes::new(12, 1)).await.unwrap();

        let _guard = store.lock(12).await.unwrap();
        let raw = std::fs::read(store.container(12).join(GUARD_FILE)).unwrap();
        let owner: GuardOwner = serde_json::from_slice(&raw).unwrap();
        assert_eq!(owner.pid, std::process::id());
    }

    #[tokio::test]
    async fn abandoned_guard_is_broken_once_stale() {
        let (_dir, store) = store().await;
        let store = store.with_stale_guard_after(Duration::from_millis(50));
        store.create(RunAttributes::new(13, 1)).await.unwrap();

        // Left behind by a process that died holding the record
        let leftover = store.container(13).join(GUARD_FILE);
        std::fs::write(&leftover, b"").unwrap();
        assert!(matches!(store.read(13).await, Err(SyncError::Busy(13))));

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(store.read(13).await.unwrap().run_id(), 13);
        assert!(!leftover.exists());
        store.set_flags(13, FlagUpdate::ready()).await.unwrap();
    }

    #[tokio::test]
    async fn zero_threshold_never_breaks_guards() {
        let (_dir, store) = store().await;
        let store = store.with_stale_guard_after(Duration::ZERO);
        store.create(RunAttributes::new(14, 1)).await.unwrap();

        std::fs::write(store.container(14).join(GUARD_FILE), b"").unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(matches!(store.read(14).await, Err(SyncError::Busy(14))));
    }

    #[tokio::test]
    async fn flags_persist_and_enforce_ordering() {
        let (_dir, store) = store().await;
        store.create(RunAttributes::new(5, 1)).await.unwrap();

        assert!(store.set_flags(5, FlagUpdate::acknowledge()).await.is_err());
        store.set_flags(5, FlagUpdate::ready()).await.unwrap();
        let attrs = store.set_flags(5, FlagUpdate::acknowledge()).await.unwrap();
        assert!(attrs.producer_ready_ack);

        let raw = std::fs::read_to_string(store.container(5).join(ATTRIBUTES_FILE)).unwrap();
        assert!(raw.contains("\"producer_ready_ack\": 1"));
    }

    #[tokio::test]
    async fn latest_follows_newest_container() {
        let (_dir, store) = store().await;
        assert_eq!(store.latest().await.unwrap(), None);
        store.create(RunAttributes::new(10, 1)).await.unwrap();
        store.create(RunAttributes::new(11, 1)).await.unwrap();
        assert_eq!(store.latest().await.unwrap(), Some(11));
    }

    #[tokio::test]
    async fn delete_twice_is_harmless() {
        let (_dir, store) = store().await;
        store.create(RunAttributes::new(6, 2)).await.unwrap();

        assert!(remove_record(&store, 6).await.unwrap());
        assert!(!remove_record(&store, 6).await.unwrap());
        assert!(matches!(store.read(6).await, Err(SyncError::NotFound(6))));
        assert!(!store.container(6).exists());
    }
}
