//! Standby status update feedback scheduler (spec §4.E).
//!
//! Grounded on `src/utils/timestamp.rs`'s PostgreSQL-epoch shift and on
//! `tokio::sync::Semaphore` used as the binary "send_lock" the spec calls
//! for: the timer path does a zero-wait `try_acquire` and drops the tick if
//! busy, while a forced or reply-requested send acquires unconditionally.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore, TryAcquireError};
use tracing::{debug, trace, warn};

use crate::connector::{self, CopySink};
use crate::error::{Error, Result};
use crate::lsn::Lsn;

/// Microseconds between the Unix epoch and the PostgreSQL epoch
/// (2000-01-01T00:00:00 UTC).
pub const PG_EPOCH_OFFSET_MICROS: i64 = 946_684_800 * 1_000_000;

/// Current wall-clock time as microseconds since the PostgreSQL epoch,
/// per spec §9 Q2: UTC, not local time with a magic tick subtraction.
pub fn now_pg_micros() -> i64 {
    let now = chrono::Utc::now();
    now.timestamp_micros() - PG_EPOCH_OFFSET_MICROS
}

#[derive(Debug, Clone, Copy)]
pub struct StatusUpdateFrame {
    pub last_received_lsn: Lsn,
    pub last_flushed_lsn: Lsn,
    pub last_applied_lsn: Lsn,
    pub current_server_time_micros: i64,
    pub request_reply: bool,
}

impl StatusUpdateFrame {
    /// Encodes the frame body per spec §6.1: `'r'` then four 8-byte fields
    /// and a trailing reply-requested byte.
    pub fn encode(&self) -> [u8; 34] {
        let mut buf = [0u8; 34];
        buf[0] = b'r';
        buf[1..9].copy_from_slice(&self.last_received_lsn.as_u64().to_be_bytes());
        buf[9..17].copy_from_slice(&self.last_flushed_lsn.as_u64().to_be_bytes());
        buf[17..25].copy_from_slice(&self.last_applied_lsn.as_u64().to_be_bytes());
        buf[25..33].copy_from_slice(&self.current_server_time_micros.to_be_bytes());
        buf[33] = self.request_reply as u8;
        buf
    }
}

/// Shared, atomically-updated LSN triple a scheduler reads when building a
/// status update frame. `last_received_lsn` is written only by the WAL
/// reader side; `last_flushed_lsn`/`last_applied_lsn` only through
/// [`crate::session::ReplicationSession::send_status_update`].
#[derive(Debug, Default)]
pub struct FeedbackState {
    inner: Mutex<(Lsn, Lsn, Lsn)>,
}

impl FeedbackState {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new((Lsn::INVALID, Lsn::INVALID, Lsn::INVALID)),
        }
    }

    pub async fn set_received(&self, lsn: Lsn) {
        let mut guard = self.inner.lock().await;
        guard.0 = std::cmp::max(guard.0, lsn);
    }

    pub async fn set_flushed_applied(&self, flush: Option<Lsn>, apply: Option<Lsn>) {
        let mut guard = self.inner.lock().await;
        if let Some(flush) = flush {
            guard.1 = flush;
        }
        if let Some(apply) = apply {
            guard.2 = apply;
        }
    }

    pub async fn snapshot(&self) -> (Lsn, Lsn, Lsn) {
        *self.inner.lock().await
    }
}

/// The send_lock binary semaphore, the shared sink handle it guards, and
/// the interval used to reschedule timer ticks.
///
/// `send_lock` is the only mutex on the write path (spec §4.E/§5): the
/// periodic timer task spawned by [`crate::session::ReplicationSession`]
/// and the WAL stream decoder's reply-requested keepalive path both write
/// through the same `FeedbackScheduler` (cloned — every field is an `Arc`),
/// so both forms of send contend on one semaphore and one sink.
#[derive(Clone)]
pub struct FeedbackScheduler {
    send_lock: Arc<Semaphore>,
    state: Arc<FeedbackState>,
    sink: Arc<Mutex<CopySink>>,
    pub interval: Duration,
}

impl FeedbackScheduler {
    pub fn new(state: Arc<FeedbackState>, sink: Arc<Mutex<CopySink>>, interval: Duration) -> Self {
        Self {
            send_lock: Arc::new(Semaphore::new(1)),
            state,
            sink,
            interval,
        }
    }

    /// Timer-driven tick: tries to acquire `send_lock` without waiting. If
    /// another send is already in flight, the tick is silently dropped.
    pub async fn tick(&self) -> Result<()> {
        match self.send_lock.clone().try_acquire_owned() {
            Ok(permit) => {
                let result = self.do_send(false).await;
                drop(permit);
                result
            }
            Err(TryAcquireError::NoPermits) => {
                trace!("feedback tick dropped: a send is already in flight");
                Ok(())
            }
            Err(TryAcquireError::Closed) => Err(Error::Cancelled),
        }
    }

    /// A forced send (including reply-requested keepalive replies) waits
    /// for `send_lock` unconditionally.
    pub async fn force_send(&self) -> Result<()> {
        let permit = self
            .send_lock
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Cancelled)?;
        let result = self.do_send(true).await;
        drop(permit);
        result
    }

    async fn do_send(&self, request_reply: bool) -> Result<()> {
        let (received, flushed, applied) = self.state.snapshot().await;
        let frame = StatusUpdateFrame {
            last_received_lsn: received,
            last_flushed_lsn: flushed,
            last_applied_lsn: applied,
            current_server_time_micros: now_pg_micros(),
            request_reply,
        };
        debug!(?frame.last_received_lsn, "sending standby status update");
        let mut sink = self.sink.lock().await;
        connector::write_copy_frame(&mut sink, &frame.encode()).await
    }

    /// Spawns the timer task spec §5 calls for: fires `tick()` every
    /// `interval` until it sees a write error (the stream ended or the
    /// connection died), at which point it stops on its own. The caller
    /// (`ReplicationSession`) aborts the returned handle when streaming
    /// ends instead of waiting for that to happen.
    pub fn spawn_timer(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(err) = self.tick().await {
                    warn!(%err, "feedback timer stopping after a write failure");
                    break;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures_util::SinkExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    fn counting_sink(sent: Arc<AtomicUsize>) -> CopySink {
        Box::pin(futures_util::sink::unfold(sent, |sent, _frame: Bytes| async move {
            sent.fetch_add(1, Ordering::SeqCst);
            Ok::<_, Error>(sent)
        }))
    }

    fn recording_sink(frames: Arc<StdMutex<Vec<Bytes>>>) -> CopySink {
        Box::pin(futures_util::sink::unfold(frames, |frames, frame: Bytes| async move {
            frames.lock().unwrap().push(frame);
            Ok::<_, Error>(frames)
        }))
    }

    #[tokio::test]
    async fn tick_sends_when_lock_free() {
        let state = Arc::new(FeedbackState::new());
        state.set_received(Lsn::new(100)).await;
        let frames = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::new(Mutex::new(recording_sink(frames.clone())));
        let scheduler = FeedbackScheduler::new(state, sink, Duration::from_secs(10));

        scheduler.tick().await.unwrap();
        let sent = frames.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0][1..9], Lsn::new(100).as_u64().to_be_bytes());
    }

    #[tokio::test]
    async fn concurrent_tick_is_dropped_while_forced_send_in_flight() {
        let state = Arc::new(FeedbackState::new());
        let count = Arc::new(AtomicUsize::new(0));
        let sink = Arc::new(Mutex::new(counting_sink(count.clone())));
        let scheduler = Arc::new(FeedbackScheduler::new(state, sink, Duration::from_secs(10)));

        let permit = scheduler.send_lock.clone().try_acquire_owned().unwrap();
        scheduler.tick().await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
        drop(permit);
    }

    #[tokio::test]
    async fn status_update_does_not_lower_previous_values() {
        let state = FeedbackState::new();
        state.set_flushed_applied(Some(Lsn::new(10)), Some(Lsn::new(5))).await;
        state.set_flushed_applied(Some(Lsn::new(10)), Some(Lsn::new(5))).await;
        assert_eq!(state.snapshot().await, (Lsn::INVALID, Lsn::new(10), Lsn::new(5)));
    }

    #[test]
    fn encode_matches_wire_layout() {
        let frame = StatusUpdateFrame {
            last_received_lsn: Lsn::new(1),
            last_flushed_lsn: Lsn::new(2),
            last_applied_lsn: Lsn::new(3),
            current_server_time_micros: 42,
            request_reply: true,
        };
        let buf = frame.encode();
        assert_eq!(buf[0], b'r');
        assert_eq!(buf.len(), 34);
        assert_eq!(buf[33], 1);
    }
}
