//! Replication session state machine (spec §4.F, §6.2).
//!
//! Grounded on `src/replication/state.rs`'s `ReplicationState` for the
//! Closed/Idle/Streaming shape, reworked so the decoder for an active
//! stream is handed back by value instead of borrowed, breaking the
//! slot-holds-a-reference-into-the-connection cycle the teacher's version
//! had (spec §9 Q "ephemeral borrow" redesign note).

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::commands;
use crate::config::SessionOptions;
use crate::connector::Connector;
use crate::error::{Error, Result};
use crate::feedback::{FeedbackScheduler, FeedbackState};
use crate::lsn::Lsn;
use crate::version::{self, ServerVersion};
use crate::wal_stream::WalStreamDecoder;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    Idle,
    Streaming,
    Disposed,
}

/// Response to `IDENTIFY_SYSTEM` (spec §6.2).
#[derive(Debug, Clone)]
pub struct IdentifySystemInfo {
    pub system_id: String,
    pub timeline: i32,
    pub xlog_pos: Lsn,
    pub database: Option<String>,
}

/// Why a streaming decoder stopped, so the caller can tell
/// [`ReplicationSession::finish_streaming`] how to settle the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEndReason {
    /// The decoder saw a clean `CopyDone`.
    Completed,
    /// The server ended the stream at a timeline boundary.
    EndOfTimeline,
    /// The session was cancelled mid-stream (spec §5: `query_canceled` /
    /// sqlstate 57014 counts as normal termination, not an error).
    Cancelled,
}

/// Drives one physical or logical replication connection through its
/// lifecycle. `C` is the narrow [`Connector`] facade, not the general
/// frontend protocol.
pub struct ReplicationSession<C: Connector> {
    connector: C,
    state: State,
    server_version: Option<ServerVersion>,
    feedback_state: Arc<FeedbackState>,
    options: SessionOptions,
    /// The scheduler backing the stream currently being read, if any (spec
    /// §4.F: F "orchestrates A–E plus the wire I/O"). `None` outside
    /// `Streaming`.
    active_scheduler: Option<Arc<FeedbackScheduler>>,
    /// The `tokio::time::interval`-driven task ticking `active_scheduler`
    /// (spec §5: "a separate timer task" runs concurrently with the read
    /// loop). Aborted whenever streaming ends.
    timer_handle: Option<JoinHandle<()>>,
}

impl<C: Connector> ReplicationSession<C> {
    pub fn new(connector: C, options: SessionOptions) -> Self {
        Self {
            connector,
            state: State::Closed,
            server_version: None,
            feedback_state: Arc::new(FeedbackState::new()),
            options,
            active_scheduler: None,
            timer_handle: None,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn server_version(&self) -> Option<&ServerVersion> {
        self.server_version.as_ref()
    }

    fn require_state(&self, expected: State) -> Result<()> {
        if self.state != expected {
            let expected = match expected {
                State::Closed => "Closed",
                State::Idle => "Idle",
                State::Streaming => "Streaming",
                State::Disposed => "Disposed",
            };
            return Err(Error::InvalidState { expected });
        }
        Ok(())
    }

    /// Queries `SHOW server_version` and parses it, transitioning
    /// `Closed` → `Idle`. Must be called once right after the underlying
    /// connection was established.
    pub async fn open(&mut self) -> Result<()> {
        self.require_state(State::Closed)?;

        let rows = self.connector.simple_query(&commands::show("server_version")).await?;
        let raw = rows
            .first()
            .and_then(|row| row.get("server_version"))
            .ok_or_else(|| Error::protocol("SHOW server_version returned no rows"))?;
        let (version, _portable) = version::parse(raw)?;
        info!(?version, "replication session opened");

        self.server_version = Some(version);
        self.state = State::Idle;
        Ok(())
    }

    pub async fn identify_system(&mut self) -> Result<IdentifySystemInfo> {
        self.require_state(State::Idle)?;
        let rows = self.connector.simple_query(&commands::identify_system()).await?;
        let row = rows
            .first()
            .ok_or_else(|| Error::protocol("IDENTIFY_SYSTEM returned no rows"))?;

        let system_id = row
            .get("systemid")
            .ok_or_else(|| Error::protocol("IDENTIFY_SYSTEM missing systemid"))?
            .to_string();
        let timeline = row.get_int("timeline")? as i32;
        let xlog_pos = row
            .get("xlogpos")
            .ok_or_else(|| Error::protocol("IDENTIFY_SYSTEM missing xlogpos"))?
            .parse::<Lsn>()
            .map_err(|_| Error::protocol("IDENTIFY_SYSTEM returned a malformed xlogpos"))?;
        let database = row.get("dbname").map(|s| s.to_string());

        Ok(IdentifySystemInfo {
            system_id,
            timeline,
            xlog_pos,
            database,
        })
    }

    pub async fn show(&mut self, param: &str) -> Result<Option<String>> {
        self.require_state(State::Idle)?;
        let rows = self.connector.simple_query(&commands::show(param)).await?;
        Ok(rows.first().and_then(|row| row.get(param)).map(|s| s.to_string()))
    }

    pub async fn timeline_history(&mut self, tli: i32) -> Result<Vec<u8>> {
        self.require_state(State::Idle)?;
        let rows = self.connector.simple_query(&commands::timeline_history(tli)).await?;
        let row = rows
            .first()
            .ok_or_else(|| Error::protocol("TIMELINE_HISTORY returned no rows"))?;
        let content = row
            .get("fileContent")
            .ok_or_else(|| Error::protocol("TIMELINE_HISTORY missing fileContent"))?;
        Ok(content.as_bytes().to_vec())
    }

    fn require_version(&self) -> Result<&ServerVersion> {
        self.server_version
            .as_ref()
            .ok_or_else(|| Error::protocol("server version unknown; call open() first"))
    }

    pub async fn create_replication_slot_physical(
        &mut self,
        name: &str,
        options: &commands::CreatePhysicalSlotOptions,
    ) -> Result<()> {
        self.require_state(State::Idle)?;
        let server = self.require_version()?.clone();
        let cmd = commands::create_replication_slot_physical(name, options, &server)?;
        self.connector.simple_query(&cmd).await?;
        Ok(())
    }

    pub async fn create_replication_slot_logical(
        &mut self,
        name: &str,
        plugin: &str,
        options: &commands::CreateLogicalSlotOptions,
    ) -> Result<()> {
        self.require_state(State::Idle)?;
        let server = self.require_version()?.clone();
        let cmd = commands::create_replication_slot_logical(name, plugin, options, &server)?;
        self.connector.simple_query(&cmd).await?;
        Ok(())
    }

    pub async fn drop_replication_slot(&mut self, name: &str, wait: bool) -> Result<()> {
        self.require_state(State::Idle)?;
        self.connector.simple_query(&commands::drop_replication_slot(name, wait)).await?;
        Ok(())
    }

    /// Starts physical streaming, transitioning `Idle` → `Streaming` and
    /// returning a fresh decoder the caller drives directly. Returns `Ok(None)`
    /// for the end-of-timeline edge case (spec §4.G): the session is left in
    /// `Idle` in that case since no stream was actually opened.
    pub async fn start_replication_physical(
        &mut self,
        slot: Option<&str>,
        lsn: Lsn,
        timeline: Option<i32>,
    ) -> Result<Option<WalStreamDecoder>> {
        self.require_state(State::Idle)?;
        let cmd = commands::start_replication_physical(slot, lsn, timeline);
        self.begin_streaming(&cmd).await
    }

    pub async fn start_replication_logical(
        &mut self,
        slot: &str,
        lsn: Lsn,
        options: &[(&str, &str)],
    ) -> Result<Option<WalStreamDecoder>> {
        self.require_state(State::Idle)?;
        let cmd = commands::start_replication_logical(slot, lsn, options);
        self.begin_streaming(&cmd).await
    }

    async fn begin_streaming(&mut self, cmd: &str) -> Result<Option<WalStreamDecoder>> {
        match self.connector.copy_both(cmd).await? {
            Some((stream, sink)) => {
                self.state = State::Streaming;
                let scheduler = Arc::new(FeedbackScheduler::new(
                    self.feedback_state.clone(),
                    Arc::new(Mutex::new(sink)),
                    self.options.wal_receiver_status_interval,
                ));
                self.timer_handle = Some(scheduler.clone().spawn_timer());
                self.active_scheduler = Some(scheduler.clone());
                Ok(Some(WalStreamDecoder::new(stream, scheduler, self.feedback_state.clone())))
            }
            None => {
                warn!("server completed the command without entering CopyBoth mode");
                Ok(None)
            }
        }
    }

    fn stop_timer(&mut self) {
        if let Some(handle) = self.timer_handle.take() {
            handle.abort();
        }
        self.active_scheduler = None;
    }

    /// Returns the session to `Idle` once the caller is done consuming a
    /// decoder handed back by `start_replication_*`. `reason` is currently
    /// informational only; every reason settles to `Idle` since all three
    /// are normal termination (spec §5: `query_canceled` is not an error).
    /// Stops the feedback timer task started by `begin_streaming`.
    pub fn finish_streaming(&mut self, reason: StreamEndReason) -> Result<()> {
        self.require_state(State::Streaming)?;
        info!(?reason, "replication stream ended");
        self.stop_timer();
        self.state = State::Idle;
        Ok(())
    }

    /// Requests cancellation of the in-progress stream via the Connector's
    /// side channel (spec §5).
    pub async fn cancel(&mut self) -> Result<()> {
        self.require_state(State::Streaming)?;
        self.connector.cancel().await
    }

    /// Sends a standby status update out of band from the read loop (spec
    /// §6.2: `send_status_update(flush?, apply?, force?)`). `flush`/`apply`
    /// first update the shared feedback state the next tick or forced send
    /// will report; `force` picks the scheduler's unconditional write path
    /// over its drop-if-busy timer path. Requires `Streaming`, since that is
    /// the only state with an active scheduler to send through.
    pub async fn send_status_update(&mut self, flush: Option<Lsn>, apply: Option<Lsn>, force: bool) -> Result<()> {
        self.require_state(State::Streaming)?;
        self.feedback_state.set_flushed_applied(flush, apply).await;
        let scheduler = self
            .active_scheduler
            .as_ref()
            .expect("active_scheduler is set whenever state is Streaming");
        if force {
            scheduler.force_send().await
        } else {
            scheduler.tick().await
        }
    }

    pub fn feedback_state(&self) -> Arc<FeedbackState> {
        self.feedback_state.clone()
    }

    /// Idempotent teardown, callable from any state.
    pub fn dispose(&mut self) {
        self.stop_timer();
        self.state = State::Disposed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{CommandRow, CopySink, CopyStream};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    struct StubConnector {
        query_responses: StdMutex<Vec<Vec<CommandRow>>>,
    }

    #[async_trait]
    impl Connector for StubConnector {
        async fn simple_query(&self, _command: &str) -> Result<Vec<CommandRow>> {
            let mut responses = self.query_responses.lock().unwrap();
            if responses.is_empty() {
                Ok(vec![])
            } else {
                Ok(responses.remove(0))
            }
        }

        async fn copy_both(&self, _command: &str) -> Result<Option<(CopyStream, CopySink)>> {
            Ok(None)
        }

        async fn cancel(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn guard_rejects_wrong_state() {
        let connector = StubConnector {
            query_responses: StdMutex::new(vec![]),
        };
        let mut session = ReplicationSession::new(connector, SessionOptions::default());
        let err = session.identify_system().await.unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
    }

    #[tokio::test]
    async fn identify_system_parses_rows() {
        let row = CommandRow::from_fields(&[
            ("systemid", "6900000000000000000"),
            ("timeline", "3"),
            ("xlogpos", "1/B374D848"),
            ("dbname", "postgres"),
        ]);
        let connector = StubConnector {
            query_responses: StdMutex::new(vec![vec![row]]),
        };
        let mut session = ReplicationSession::new(connector, SessionOptions::default());
        session.state = State::Idle;

        let info = session.identify_system().await.unwrap();
        assert_eq!(info.timeline, 3);
        assert_eq!(info.xlog_pos, Lsn::new(0x1B374D848));
        assert_eq!(info.database.as_deref(), Some("postgres"));
    }

    #[tokio::test]
    async fn end_of_timeline_leaves_session_idle() {
        let connector = StubConnector {
            query_responses: StdMutex::new(vec![]),
        };
        let mut session = ReplicationSession::new(connector, SessionOptions::default());
        session.state = State::Idle;
        session.server_version = Some(ServerVersion {
            major: 15,
            minor: Some(0),
            build: None,
            revision: None,
            release_type: crate::version::ReleaseType::Release,
            pre_release: None,
        });

        let decoder = session
            .start_replication_physical(None, Lsn::new(1), None)
            .await
            .unwrap();
        assert!(decoder.is_none());
        assert_eq!(session.state(), State::Idle);
    }

    #[tokio::test]
    async fn dispose_is_callable_from_any_state() {
        let connector = StubConnector {
            query_responses: StdMutex::new(vec![]),
        };
        let mut session = ReplicationSession::new(connector, SessionOptions::default());
        session.dispose();
        assert_eq!(session.state(), State::Disposed);
    }

    struct StreamingConnector {
        sent: Arc<std::sync::atomic::AtomicUsize>,
    }

    #[async_trait]
    impl Connector for StreamingConnector {
        async fn simple_query(&self, _command: &str) -> Result<Vec<CommandRow>> {
            Ok(vec![])
        }

        async fn copy_both(&self, _command: &str) -> Result<Option<(CopyStream, CopySink)>> {
            let stream: CopyStream = Box::pin(futures_util::stream::pending());
            let sent = self.sent.clone();
            let sink: CopySink = Box::pin(futures_util::sink::unfold(sent, |sent, _frame: bytes::Bytes| async move {
                sent.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok::<_, Error>(sent)
            }));
            Ok(Some((stream, sink)))
        }

        async fn cancel(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn streaming_spawns_a_timer_that_sends_status_updates() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::time::Duration;

        let sent = Arc::new(AtomicUsize::new(0));
        let mut options = SessionOptions::default();
        options.wal_receiver_status_interval = Duration::from_millis(10);
        let connector = StreamingConnector { sent: sent.clone() };
        let mut session = ReplicationSession::new(connector, options);
        session.state = State::Idle;
        session.server_version = Some(ServerVersion {
            major: 15,
            minor: Some(0),
            build: None,
            revision: None,
            release_type: crate::version::ReleaseType::Release,
            pre_release: None,
        });

        let decoder = session
            .start_replication_physical(None, Lsn::new(1), None)
            .await
            .unwrap();
        assert!(decoder.is_some());
        assert_eq!(session.state(), State::Streaming);

        tokio::time::advance(Duration::from_millis(35)).await;
        tokio::task::yield_now().await;
        assert!(sent.load(Ordering::SeqCst) >= 1);

        session.finish_streaming(StreamEndReason::Completed).unwrap();
    }
}
