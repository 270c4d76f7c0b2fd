//! WAL Stream Decoder (spec §4.G): decodes `'w'`/`'k'` CopyData frames off
//! a CopyBoth duplex into an async sequence of [`XLogData`] events.
//!
//! Grounded on `src/parser.rs`'s message-code dispatch (`match code`) and
//! cursor-style reads, reworked around the async duplex the [`Connector`]
//! hands back instead of libpq's blocking `PQgetCopyData`.

use std::sync::Arc;

use bytes::Bytes;
use futures_util::StreamExt;
use tracing::trace;

use crate::connector::CopyStream;
use crate::error::{Error, Result};
use crate::feedback::{FeedbackScheduler, FeedbackState};
use crate::lsn::Lsn;

/// One `'w'` XLogData frame (spec §3).
#[derive(Debug, Clone)]
pub struct XLogData {
    pub wal_start: Lsn,
    pub wal_end: Lsn,
    pub server_clock_micros: i64,
    pub payload: Bytes,
}

/// Minimum frame length for an XLogData frame: 1 (code) + 8 + 8 + 8.
const XLOG_DATA_HEADER_LEN: usize = 25;
/// Exact frame length for a Keepalive frame: 1 + 8 + 8 + 1.
const KEEPALIVE_LEN: usize = 18;

pub enum EndOfTimeline {
    /// The server replied `CommandComplete` right after `START_REPLICATION`
    /// instead of negotiating CopyBoth (spec §4.G).
    ImmediateCommandComplete,
}

pub struct WalStreamDecoder {
    stream: CopyStream,
    scheduler: Arc<FeedbackScheduler>,
    feedback: Arc<FeedbackState>,
    last_received_lsn: Lsn,
}

impl WalStreamDecoder {
    pub fn new(stream: CopyStream, scheduler: Arc<FeedbackScheduler>, feedback: Arc<FeedbackState>) -> Self {
        Self {
            stream,
            scheduler,
            feedback,
            last_received_lsn: Lsn::INVALID,
        }
    }

    pub fn last_received_lsn(&self) -> Lsn {
        self.last_received_lsn
    }

    async fn raise_received(&mut self, lsn: Lsn) {
        self.last_received_lsn = std::cmp::max(self.last_received_lsn, lsn);
        self.feedback.set_received(self.last_received_lsn).await;
    }

    /// Pulls and decodes the next CopyData frame. Returns `Ok(None)` on a
    /// clean end of stream (either `CopyDone` or a `query_canceled` server
    /// error, which the caller is expected to have already classified as
    /// normal termination — this layer just sees the stream end).
    pub async fn next_event(&mut self) -> Result<Option<XLogData>> {
        loop {
            let frame = match self.stream.next().await {
                Some(frame) => frame?,
                None => return Ok(None),
            };

            if frame.is_empty() {
                return Err(Error::protocol("empty CopyData frame"));
            }
            let code = frame[0];

            match code {
                b'w' => {
                    if frame.len() < XLOG_DATA_HEADER_LEN {
                        return Err(Error::protocol("XLogData frame shorter than 25 bytes"));
                    }
                    let wal_start = Lsn::new(u64::from_be_bytes(frame[1..9].try_into().unwrap()));
                    let wal_end = Lsn::new(u64::from_be_bytes(frame[9..17].try_into().unwrap()));
                    let server_clock_micros = i64::from_be_bytes(frame[17..25].try_into().unwrap());
                    let payload = frame.slice(XLOG_DATA_HEADER_LEN..);

                    self.raise_received(std::cmp::max(wal_start, wal_end)).await;

                    return Ok(Some(XLogData {
                        wal_start,
                        wal_end,
                        server_clock_micros,
                        payload,
                    }));
                }
                b'k' => {
                    if frame.len() != KEEPALIVE_LEN {
                        return Err(Error::protocol("Keepalive frame must be 18 bytes"));
                    }
                    let end_lsn = Lsn::new(u64::from_be_bytes(frame[1..9].try_into().unwrap()));
                    let reply_requested = frame[17] != 0;
                    self.raise_received(end_lsn).await;

                    if reply_requested {
                        trace!("keepalive requested an immediate reply");
                        self.send_immediate_reply().await?;
                    }
                    // Keepalives are not surfaced to the caller; keep reading.
                }
                other => {
                    return Err(Error::protocol(format!(
                        "unexpected CopyData message code {other:#x}"
                    )));
                }
            }
        }
    }

    /// Sends a reply-requested keepalive's status update through the
    /// scheduler's forced-send path (spec §4.E/§5: "the Feedback
    /// Scheduler's `send_lock` is the only mutex on the write path" —
    /// every write, timer-driven or not, goes through the same
    /// `FeedbackScheduler`).
    async fn send_immediate_reply(&mut self) -> Result<()> {
        self.scheduler.force_send().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::CopySink;
    use futures_util::{SinkExt, stream};
    use std::time::Duration;
    use tokio::sync::Mutex;

    fn feedback() -> Arc<FeedbackState> {
        Arc::new(FeedbackState::new())
    }

    fn scheduler(feedback: Arc<FeedbackState>) -> Arc<FeedbackScheduler> {
        Arc::new(FeedbackScheduler::new(
            feedback,
            Arc::new(Mutex::new(sink_stub())),
            Duration::from_secs(10),
        ))
    }

    fn xlog_frame(start: u64, end: u64, clock: i64, payload: &[u8]) -> Bytes {
        let mut buf = Vec::with_capacity(25 + payload.len());
        buf.push(b'w');
        buf.extend_from_slice(&start.to_be_bytes());
        buf.extend_from_slice(&end.to_be_bytes());
        buf.extend_from_slice(&clock.to_be_bytes());
        buf.extend_from_slice(payload);
        Bytes::from(buf)
    }

    fn keepalive_frame(end: u64, clock: i64, reply_requested: bool) -> Bytes {
        let mut buf = Vec::with_capacity(18);
        buf.push(b'k');
        buf.extend_from_slice(&end.to_be_bytes());
        buf.extend_from_slice(&clock.to_be_bytes());
        buf.push(reply_requested as u8);
        Bytes::from(buf)
    }

    fn sink_stub() -> CopySink {
        Box::pin(futures_util::sink::drain().sink_map_err(|_: std::convert::Infallible| {
            Error::protocol("unreachable")
        }))
    }

    #[tokio::test]
    async fn decodes_xlogdata_and_tracks_last_received_lsn() {
        let frames = vec![Ok(xlog_frame(100, 150, 42, b"payload"))];
        let stream: CopyStream = Box::pin(stream::iter(frames));
        let fb = feedback();
        let mut decoder = WalStreamDecoder::new(stream, scheduler(fb.clone()), fb);

        let event = decoder.next_event().await.unwrap().unwrap();
        assert_eq!(event.wal_start, Lsn::new(100));
        assert_eq!(event.wal_end, Lsn::new(150));
        assert_eq!(&event.payload[..], b"payload");
        assert_eq!(decoder.last_received_lsn(), Lsn::new(150));
    }

    #[tokio::test]
    async fn zero_length_payload_yields_empty_stream() {
        let frames = vec![Ok(xlog_frame(10, 10, 1, b""))];
        let stream: CopyStream = Box::pin(stream::iter(frames));
        let fb = feedback();
        let mut decoder = WalStreamDecoder::new(stream, scheduler(fb.clone()), fb);
        let event = decoder.next_event().await.unwrap().unwrap();
        assert!(event.payload.is_empty());
    }

    #[tokio::test]
    async fn keepalive_without_reply_is_swallowed_and_not_yielded() {
        let frames = vec![
            Ok(keepalive_frame(200, 1, false)),
            Ok(xlog_frame(200, 210, 2, b"x")),
        ];
        let stream: CopyStream = Box::pin(stream::iter(frames));
        let fb = feedback();
        let mut decoder = WalStreamDecoder::new(stream, scheduler(fb.clone()), fb);
        let event = decoder.next_event().await.unwrap().unwrap();
        assert_eq!(event.wal_start, Lsn::new(200));
    }

    #[tokio::test]
    async fn end_of_stream_yields_none() {
        let frames: Vec<Result<Bytes>> = vec![];
        let stream: CopyStream = Box::pin(stream::iter(frames));
        let fb = feedback();
        let mut decoder = WalStreamDecoder::new(stream, scheduler(fb.clone()), fb);
        assert!(decoder.next_event().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_code_is_a_protocol_violation() {
        let frames = vec![Ok(Bytes::from_static(b"\x01garbage"))];
        let stream: CopyStream = Box::pin(stream::iter(frames));
        let fb = feedback();
        let mut decoder = WalStreamDecoder::new(stream, scheduler(fb.clone()), fb);
        assert!(decoder.next_event().await.is_err());
    }

    #[tokio::test]
    async fn short_xlogdata_frame_is_rejected() {
        let frames = vec![Ok(Bytes::from_static(b"w\x00\x00"))];
        let stream: CopyStream = Box::pin(stream::iter(frames));
        let fb = feedback();
        let mut decoder = WalStreamDecoder::new(stream, scheduler(fb.clone()), fb);
        assert!(decoder.next_event().await.is_err());
    }

    #[tokio::test]
    async fn reply_requested_keepalive_writes_through_the_scheduler() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let sent = Arc::new(AtomicUsize::new(0));
        let sink: CopySink = Box::pin(futures_util::sink::unfold(sent.clone(), |sent, _frame: Bytes| async move {
            sent.fetch_add(1, Ordering::SeqCst);
            Ok::<_, Error>(sent)
        }));
        let fb = feedback();
        let sched = Arc::new(FeedbackScheduler::new(fb.clone(), Arc::new(Mutex::new(sink)), Duration::from_secs(10)));

        let frames = vec![
            Ok(keepalive_frame(50, 1, true)),
            Ok(xlog_frame(50, 60, 2, b"x")),
        ];
        let stream: CopyStream = Box::pin(stream::iter(frames));
        let mut decoder = WalStreamDecoder::new(stream, sched, fb);
        decoder.next_event().await.unwrap();
        assert_eq!(sent.load(Ordering::SeqCst), 1);
    }
}
