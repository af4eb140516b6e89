//! # DAQ Sync Library
//!
//! Run synchronisation and frame streaming between a hardware sequencer and
//! an imaging process. The two processes agree on each run through a shared
//! run record (the "mailbox"), talk over a small MessagePack command channel,
//! and the imaging side pushes every persisted frame to any number of live
//! viewers.
//!
//! ## Crate Structure
//!
//! - **`acquisition`**: the per-run worker/writer pair, the bounded hand-off
//!   queue between them, the run watcher and the supervision that decides
//!   cleanup once a run ends.
//! - **`config`**: figment-based configuration (`config/daq_sync.toml` plus
//!   `DAQ_SYNC_` environment overrides).
//! - **`error`**: the `SyncError` taxonomy shared by every component.
//! - **`hardware`**: the `Camera` capability trait, the mock camera and the
//!   device nanny that owns the cached camera session.
//! - **`logging`**: `tracing-subscriber` initialisation.
//! - **`mailbox`**: run records, their storage backends and the ready/ack
//!   handshake.
//! - **`network`**: length-prefixed framing, the command server/client and
//!   the broadcast server/viewer client.
//! - **`sequencer`**: the producer-side helper used by the sequencer process.
//! - **`service`**: assembly of the imaging process.

pub mod acquisition;
pub mod config;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod mailbox;
pub mod network;
pub mod sequencer;
pub mod service;

pub use error::{SyncError, SyncResult};
