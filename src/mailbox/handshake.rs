//! Two-flag handshake over a run record
//!
//! The sequencer (producer) and the acquisition worker (consumer) agree on a
//! run through two flags stored in the record itself:
//!
//! 1. the producer creates the record and raises `producer_ready`
//! 2. the consumer polls until the record exists and the flag is up, then
//!    raises `producer_ready_ack`
//! 3. the producer polls until it sees the acknowledgement
//!
//! Both sides poll on a fixed interval. `Busy` is always retried; a notice is
//! logged every `notice_every` consecutive busy or absent polls. The consumer
//! tolerates `NotFound` only until it has seen the record once.

use crate::acquisition::Interrupt;
use crate::error::{SyncError, SyncResult};
use crate::mailbox::{FlagUpdate, RecordStore, RunAttributes, RunId, RunRecord};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Consumer-side handshake state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Polling for the record to exist, be openable and carry `producer_ready`
    AwaitingRecord,
    /// Ready seen; acknowledgement being written
    AwaitingReadyAck,
    /// Acknowledgement written (terminal)
    Ready,
    /// Overall bound elapsed (terminal)
    TimedOut,
}

/// Polling cadence for handshake loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Delay between polls
    pub interval: Duration,
    /// Log a notice every N consecutive busy or absent polls
    pub notice_every: u32,
    /// Overall bound; `None` waits until interrupted
    pub timeout: Option<Duration>,
}

impl PollPolicy {
    /// Poll every `interval`, notice every 20 polls, no overall bound.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            notice_every: 20,
            timeout: None,
        }
    }

    /// Set how often repeated busy/absent polls are reported.
    pub fn with_notice_every(mut self, notice_every: u32) -> Self {
        self.notice_every = notice_every.max(1);
        self
    }

    /// Bound the whole wait; a zero duration means no bound.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = if timeout.is_zero() { None } else { Some(timeout) };
        self
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(50))
    }
}

/// Bookkeeping shared by the polling loops.
struct Poller<'a> {
    policy: &'a PollPolicy,
    interrupt: &'a Interrupt,
    run_id: RunId,
    waiting_for: &'static str,
    started: Instant,
    misses: u32,
}

impl<'a> Poller<'a> {
    fn new(
        policy: &'a PollPolicy,
        interrupt: &'a Interrupt,
        run_id: RunId,
        waiting_for: &'static str,
    ) -> Self {
        Self {
            policy,
            interrupt,
            run_id,
            waiting_for,
            started: Instant::now(),
            misses: 0,
        }
    }

    /// Fail if interrupted or out of time.
    fn check(&self) -> SyncResult<()> {
        if self.interrupt.is_raised() {
            return Err(SyncError::Interrupted);
        }
        if let Some(limit) = self.policy.timeout {
            let elapsed = self.started.elapsed();
            if elapsed >= limit {
                return Err(SyncError::timeout(
                    format!("{} for run {}", self.waiting_for, self.run_id),
                    elapsed,
                ));
            }
        }
        Ok(())
    }

    /// Record a busy or absent poll and emit the periodic notice.
    fn miss(&mut self, reason: &SyncError) {
        self.misses += 1;
        if self.misses % self.policy.notice_every == 0 {
            warn!(
                run_id = self.run_id,
                polls = self.misses,
                "Still {} ({})",
                self.waiting_for,
                reason
            );
        } else {
            debug!(run_id = self.run_id, polls = self.misses, "{}", reason);
        }
    }

    fn hit(&mut self) {
        self.misses = 0;
    }

    /// Sleep one interval; fails if interrupted meanwhile.
    async fn pause(&self) -> SyncResult<()> {
        if self.interrupt.sleep(self.policy.interval).await {
            return Err(SyncError::Interrupted);
        }
        Ok(())
    }
}

/// Consumer side of the handshake, run by the acquisition worker.
pub struct ConsumerHandshake<'a> {
    store: &'a dyn RecordStore,
    run_id: RunId,
    policy: PollPolicy,
    state: HandshakeState,
    seen: bool,
}

impl<'a> ConsumerHandshake<'a> {
    /// Prepare to hand-shake on `run_id`.
    pub fn new(store: &'a dyn RecordStore, run_id: RunId, policy: PollPolicy) -> Self {
        Self {
            store,
            run_id,
            policy,
            state: HandshakeState::AwaitingRecord,
            seen: false,
        }
    }

    /// Current state.
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Drive the handshake to `Ready`, returning the acknowledged record.
    pub async fn run(&mut self, interrupt: &Interrupt) -> SyncResult<RunRecord> {
        let policy = self.policy;
        let mut poller = Poller::new(&policy, interrupt, self.run_id, "waiting for producer_ready");

        loop {
            if let Err(e) = poller.check() {
                if matches!(e, SyncError::Timeout { .. }) {
                    self.state = HandshakeState::TimedOut;
                }
                return Err(e);
            }

            match self.state {
                HandshakeState::AwaitingRecord => match self.store.read(self.run_id).await {
                    Ok(record) => {
                        self.seen = true;
                        poller.hit();
                        if record.attributes.producer_ready {
                            debug!(run_id = self.run_id, "producer_ready observed");
                            self.state = HandshakeState::AwaitingReadyAck;
                            continue;
                        }
                    }
                    Err(e) if e.is_retryable(!self.seen) => poller.miss(&e),
                    Err(e) => return Err(e),
                },
                HandshakeState::AwaitingReadyAck => {
                    match self
                        .store
                        .set_flags(self.run_id, FlagUpdate::acknowledge())
                        .await
                    {
                        Ok(attributes) => {
                            self.state = HandshakeState::Ready;
                            info!(run_id = self.run_id, "Handshake complete, acknowledgement set");
                            return Ok(RunRecord {
                                location: self.store.location(self.run_id),
                                attributes,
                            });
                        }
                        Err(e) if e.is_retryable(false) => poller.miss(&e),
                        Err(e) => return Err(e),
                    }
                }
                HandshakeState::Ready | HandshakeState::TimedOut => {
                    return Err(SyncError::InvalidRecord(format!(
                        "handshake for run {} already finished ({:?})",
                        self.run_id, self.state
                    )));
                }
            }

            poller.pause().await?;
        }
    }
}

/// Producer side: raise `producer_ready`, retrying while the record is busy.
pub async fn signal_ready(
    store: &dyn RecordStore,
    run_id: RunId,
    policy: &PollPolicy,
    interrupt: &Interrupt,
) -> SyncResult<RunAttributes> {
    let mut poller = Poller::new(policy, interrupt, run_id, "raising producer_ready");
    loop {
        poller.check()?;
        match store.set_flags(run_id, FlagUpdate::ready()).await {
            Ok(attributes) => {
                debug!(run_id, "producer_ready raised");
                return Ok(attributes);
            }
            Err(e @ SyncError::Busy(_)) => poller.miss(&e),
            Err(e) => return Err(e),
        }
        poller.pause().await?;
    }
}

/// Producer side: wait for the consumer's acknowledgement.
///
/// A timeout is reported as-is; the record is left in place.
pub async fn await_ack(
    store: &dyn RecordStore,
    run_id: RunId,
    policy: &PollPolicy,
    interrupt: &Interrupt,
) -> SyncResult<RunAttributes> {
    let mut poller = Poller::new(policy, interrupt, run_id, "waiting for producer_ready_ack");
    loop {
        poller.check()?;
        match store.read(run_id).await {
            Ok(record) if record.attributes.producer_ready_ack => {
                debug!(run_id, "Acknowledgement observed");
                return Ok(record.attributes);
            }
            Ok(_) => poller.hit(),
            Err(e @ SyncError::Busy(_)) => poller.miss(&e),
            Err(e) => return Err(e),
        }
        poller.pause().await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::MemoryRecordStore;
    use std::sync::Arc;
    use tracing_test::traced_test;

    fn fast() -> PollPolicy {
        PollPolicy::new(Duration::from_millis(2)).with_notice_every(3)
    }

    #[tokio::test]
    async fn consumer_waits_for_record_and_ready_flag() {
        let store = Arc::new(MemoryRecordStore::new());
        let producer = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                store.create(RunAttributes::new(1, 2)).await.unwrap();
                tokio::time::sleep(Duration::from_millis(10)).await;
                signal_ready(&*store, 1, &fast(), &Interrupt::new())
                    .await
                    .unwrap();
                await_ack(&*store, 1, &fast(), &Interrupt::new()).await
            })
        };

        let mut handshake = ConsumerHandshake::new(&*store, 1, fast());
        let record = handshake.run(&Interrupt::new()).await.unwrap();
        assert_eq!(handshake.state(), HandshakeState::Ready);
        assert!(record.attributes.producer_ready_ack);

        let acked = producer.await.unwrap().unwrap();
        assert!(acked.producer_ready && acked.producer_ready_ack);
    }

    #[tokio::test]
    #[traced_test]
    async fn busy_record_is_retried_with_notices() {
        let store = MemoryRecordStore::new();
        let mut attrs = RunAttributes::new(2, 1);
        attrs.producer_ready = true;
        store.create(attrs).await.unwrap();
        store.inject_busy(2, 7);

        let mut handshake = ConsumerHandshake::new(&store, 2, fast());
        handshake.run(&Interrupt::new()).await.unwrap();

        assert_eq!(store.busy_reports(), 7);
        assert!(logs_contain("Still waiting for producer_ready"));
    }

    #[tokio::test]
    async fn record_vanishing_after_seen_is_fatal() {
        let store = Arc::new(MemoryRecordStore::new());
        store.create(RunAttributes::new(3, 1)).await.unwrap();

        let deleter = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(15)).await;
                store.delete(3).await.unwrap();
            })
        };

        let mut handshake = ConsumerHandshake::new(&*store, 3, fast());
        let result = handshake.run(&Interrupt::new()).await;
        deleter.await.unwrap();
        assert!(matches!(result, Err(SyncError::NotFound(3))));
    }

    #[tokio::test]
    async fn consumer_times_out() {
        let store = MemoryRecordStore::new();
        let policy = fast().with_timeout(Duration::from_millis(20));
        let mut handshake = ConsumerHandshake::new(&store, 4, policy);
        let result = handshake.run(&Interrupt::new()).await;
        assert!(matches!(result, Err(SyncError::Timeout { .. })));
        assert_eq!(handshake.state(), HandshakeState::TimedOut);
    }

    #[tokio::test]
    async fn producer_ack_timeout_keeps_record() {
        let store = MemoryRecordStore::new();
        store.create(RunAttributes::new(5, 1)).await.unwrap();
        signal_ready(&store, 5, &fast(), &Interrupt::new())
            .await
            .unwrap();

        let policy = fast().with_timeout(Duration::from_millis(15));
        let result = await_ack(&store, 5, &policy, &Interrupt::new()).await;
        assert!(matches!(result, Err(SyncError::Timeout { .. })));
        assert!(store.contains(5));
    }

    #[tokio::test]
    async fn interrupt_aborts_polling() {
        let store = MemoryRecordStore::new();
        let interrupt = Interrupt::new();
        interrupt.raise_after(Duration::from_millis(10));
        let mut handshake = ConsumerHandshake::new(&store, 6, fast());
        assert!(matches!(
            handshake.run(&interrupt).await,
            Err(SyncError::Interrupted)
        ));
    }

    #[test]
    fn zero_timeout_means_unbounded() {
        let policy = PollPolicy::new(Duration::from_millis(1)).with_timeout(Duration::ZERO);
        assert_eq!(policy.timeout, None);
    }
}
