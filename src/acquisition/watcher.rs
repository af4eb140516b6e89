//! New-run detection
//!
//! Polls the mailbox for the most recently modified record and yields it
//! once it matches the run id the command server is currently expecting.
//! A record is never yielded twice. Busy, absent and half-written records
//! are simply polled again; any other storage error is yielded once and
//! ends the stream.

use crate::error::{SyncError, SyncResult};
use crate::mailbox::{RecordStore, RunId, RunRecord};
use futures::stream::{self, Stream};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Watches the mailbox for the next expected run.
pub struct RunWatcher {
    store: Arc<dyn RecordStore>,
    expected: watch::Receiver<Option<RunId>>,
    poll_interval: Duration,
    last_emitted: Option<RunId>,
}

enum Poll {
    Found(RunRecord),
    Nothing,
    Failed(SyncError),
}

impl RunWatcher {
    /// Create a watcher fed by the expected-run channel.
    pub fn new(
        store: Arc<dyn RecordStore>,
        expected: watch::Receiver<Option<RunId>>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            expected,
            poll_interval,
            last_emitted: None,
        }
    }

    /// Stream of newly detected run records.
    ///
    /// Take a bounded number with `StreamExt::take`.
    pub fn into_stream(self) -> impl Stream<Item = SyncResult<RunRecord>> + Send {
        stream::unfold(Some(self), |state| async move {
            let mut watcher = state?;
            loop {
                match watcher.poll_once().await {
                    Poll::Found(record) => {
                        watcher.last_emitted = Some(record.run_id());
                        info!(run_id = record.run_id(), location = %record.location, "New run detected");
                        return Some((Ok(record), Some(watcher)));
                    }
                    Poll::Failed(e) => {
                        error!("Run watcher stopping: {}", e);
                        return Some((Err(e), None));
                    }
                    Poll::Nothing => {
                        tokio::time::sleep(watcher.poll_interval).await;
                    }
                }
            }
        })
    }

    async fn poll_once(&mut self) -> Poll {
        let expected = *self.expected.borrow();
        let Some(expected) = expected else {
            return Poll::Nothing;
        };
        if self.last_emitted == Some(expected) {
            return Poll::Nothing;
        }

        let latest = match self.store.latest().await {
            Ok(Some(run_id)) => run_id,
            Ok(None) => return Poll::Nothing,
            Err(e) => return Poll::Failed(e),
        };
        if latest != expected {
            debug!(latest, expected, "Latest record is not the expected run");
            return Poll::Nothing;
        }

        match self.store.read(latest).await {
            Ok(record) => Poll::Found(record),
            Err(SyncError::Busy(_) | SyncError::NotFound(_) | SyncError::InvalidRecord(_)) => {
                debug!(run_id = latest, "Record not readable yet");
                Poll::Nothing
            }
            Err(e) => Poll::Failed(e),
        }
    }
}
