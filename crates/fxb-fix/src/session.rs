//! Per-upstream FIX session actor.
//!
//! One session owns one logical connection: a reader loop (this task) and a
//! writer task. The writer serializes every outbound message and is the only
//! place sequence numbers are assigned, which keeps them monotonic. The
//! reader tracks the expected inbound sequence, buffers ahead-of-sequence
//! frames, and requests resends to close gaps, so application messages reach
//! the gateway exactly once and in order.
//!
//! Lifecycle: `disconnected -> connecting -> logging-on -> logged-on`, back
//! to `disconnected` on socket error, heartbeat timeout or logout, with a
//! bounded backoff before the next attempt. Logon rejection halts the
//! session until admin intervention.

use crate::codec::{encode_message, sending_time, FrameDecoder, RawMessage};
use crate::config::SessionConfig;
use crate::error::{FixError, FixResult};
use crate::fields::{msg_type, tag};
use crate::messages;
use crate::transport::Connector;
use fxb_telemetry::metrics::{
    FIX_MALFORMED_FRAMES, FIX_MESSAGES_TOTAL, FIX_RECONNECT_TOTAL, FIX_RESEND_REQUESTS,
    FIX_SESSION_STATE,
};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Outbound application messages the journal keeps for resend.
const JOURNAL_DEPTH: usize = 512;

/// Session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    LoggingOn,
    LoggedOn,
    /// Fatal (logon rejected); stays down until admin restart.
    Halted,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::LoggingOn => "logging-on",
            Self::LoggedOn => "logged-on",
            Self::Halted => "halted",
        }
    }
}

/// Events published to the gateway.
#[derive(Debug)]
pub enum SessionEvent {
    StateChanged {
        session: String,
        state: SessionState,
    },
    /// Logon handshake completed; subscriptions and unacked orders should
    /// be replayed now.
    LoggedOn { session: String },
    /// In-sequence application message.
    AppMessage {
        session: String,
        message: RawMessage,
    },
    /// Fatal condition; no further reconnect attempts.
    Halted { session: String, reason: String },
}

/// Outbound request accepted from the gateway.
#[derive(Debug)]
struct AppSend {
    msg_type: String,
    body: Vec<(u32, String)>,
}

/// Commands into the writer task.
#[derive(Debug)]
enum WriterCmd {
    Send {
        msg_type: String,
        body: Vec<(u32, String)>,
    },
    /// Answer an inbound ResendRequest for [begin, end] (end 0 = open).
    Resend { begin: u64, end: u64 },
}

/// Journal entry for one sent message.
#[derive(Debug, Clone)]
struct JournalEntry {
    msg_type: String,
    body: Vec<(u32, String)>,
    sent_at: String,
}

/// Sequence state shared by reader and writer.
#[derive(Debug)]
struct SessionCore {
    next_out: u64,
    expected_in: u64,
    journal: BTreeMap<u64, JournalEntry>,
}

impl SessionCore {
    fn new() -> Self {
        Self {
            next_out: 1,
            expected_in: 1,
            journal: BTreeMap::new(),
        }
    }

    fn reset(&mut self) {
        self.next_out = 1;
        self.expected_in = 1;
        self.journal.clear();
    }
}

/// Cloneable handle the gateway uses to talk to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    pub name: String,
    app_tx: mpsc::Sender<AppSend>,
    state: Arc<RwLock<SessionState>>,
}

impl SessionHandle {
    /// Queue an application message; it is sequenced and journaled by the
    /// writer in arrival order.
    pub async fn send_app(&self, mt: &str, body: Vec<(u32, String)>) -> FixResult<()> {
        self.app_tx
            .send(AppSend {
                msg_type: mt.to_string(),
                body,
            })
            .await
            .map_err(|_| FixError::ChannelClosed)
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub fn is_logged_on(&self) -> bool {
        self.state() == SessionState::LoggedOn
    }
}

/// Why one connection attempt ended.
enum ConnectionEnd {
    /// Socket error, EOF, heartbeat timeout or remote logout: reconnect.
    Retry(String),
    /// Logon rejected: halt.
    Fatal(String),
    /// Shutdown requested.
    Shutdown,
}

/// One upstream FIX session.
pub struct FixSession<C: Connector> {
    config: SessionConfig,
    connector: C,
    core: Arc<Mutex<SessionCore>>,
    state: Arc<RwLock<SessionState>>,
    app_rx: mpsc::Receiver<AppSend>,
    events_tx: mpsc::Sender<SessionEvent>,
}

impl<C: Connector> FixSession<C> {
    pub fn new(
        config: SessionConfig,
        connector: C,
        events_tx: mpsc::Sender<SessionEvent>,
    ) -> (SessionHandle, Self) {
        let (app_tx, app_rx) = mpsc::channel(256);
        let state = Arc::new(RwLock::new(SessionState::Disconnected));
        let handle = SessionHandle {
            name: config.name.clone(),
            app_tx,
            state: state.clone(),
        };
        let session = Self {
            config,
            connector,
            core: Arc::new(Mutex::new(SessionCore::new())),
            state,
            app_rx,
            events_tx,
        };
        (handle, session)
    }

    fn set_state(&self, state: SessionState) {
        {
            let mut guard = self.state.write();
            if *guard == state {
                return;
            }
            *guard = state;
        }
        for s in [
            SessionState::Disconnected,
            SessionState::Connecting,
            SessionState::LoggingOn,
            SessionState::LoggedOn,
            SessionState::Halted,
        ] {
            FIX_SESSION_STATE
                .with_label_values(&[&self.config.name, s.as_str()])
                .set(if s == state { 1.0 } else { 0.0 });
        }
        let _ = self.events_tx.try_send(SessionEvent::StateChanged {
            session: self.config.name.clone(),
            state,
        });
    }

    /// Connect-and-run until shutdown or a fatal condition.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let floor = Duration::from_secs(self.config.backoff_floor_secs.max(1));
        let cap = Duration::from_secs(self.config.backoff_cap_secs.max(1));
        let mut backoff = floor;

        loop {
            if shutdown.is_cancelled() {
                self.set_state(SessionState::Disconnected);
                return;
            }
            self.set_state(SessionState::Connecting);

            let connected = tokio::select! {
                c = self.connector.connect() => c,
                _ = shutdown.cancelled() => return,
            };

            let end = match connected {
                Ok((reader, writer)) => {
                    let end = self.run_connection(reader, writer, &shutdown).await;
                    if matches!(end, ConnectionEnd::Retry(_)) {
                        // A completed logon earns a fresh backoff.
                        backoff = floor;
                    }
                    end
                }
                Err(e) => ConnectionEnd::Retry(format!("connect failed: {e}")),
            };

            match end {
                ConnectionEnd::Shutdown => {
                    self.set_state(SessionState::Disconnected);
                    info!(session = %self.config.name, "session shut down");
                    return;
                }
                ConnectionEnd::Fatal(reason) => {
                    error!(session = %self.config.name, %reason, "session halted");
                    self.set_state(SessionState::Halted);
                    let _ = self
                        .events_tx
                        .send(SessionEvent::Halted {
                            session: self.config.name.clone(),
                            reason,
                        })
                        .await;
                    return;
                }
                ConnectionEnd::Retry(reason) => {
                    warn!(
                        session = %self.config.name,
                        %reason,
                        delay_ms = backoff.as_millis(),
                        "reconnecting"
                    );
                    self.set_state(SessionState::Disconnected);
                    FIX_RECONNECT_TOTAL
                        .with_label_values(&[&self.config.name])
                        .inc();
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = shutdown.cancelled() => return,
                    }
                    backoff = (backoff * 2).min(cap);
                }
            }
        }
    }

    /// Drive one connection: logon, then the read/dispatch loop.
    async fn run_connection<R, W>(
        &mut self,
        mut reader: R,
        writer: W,
        shutdown: &CancellationToken,
    ) -> ConnectionEnd
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let session = self.config.name.clone();
        if self.config.reset_seq_on_logon {
            self.core.lock().reset();
        }

        // The writer task is the single owner of outbound sequencing.
        let (wtr_tx, wtr_rx) = mpsc::channel::<WriterCmd>(256);
        let mut writer_task = tokio::spawn(writer_loop(
            writer,
            wtr_rx,
            self.core.clone(),
            self.config.clone(),
        ));

        self.set_state(SessionState::LoggingOn);
        let logon = messages::logon_body(
            self.config.heartbeat_secs,
            self.config.reset_seq_on_logon,
            self.config.username.as_deref(),
            self.config.password.as_deref(),
        );
        if send_cmd(&wtr_tx, msg_type::LOGON, logon).await.is_err() {
            return ConnectionEnd::Retry("writer unavailable".to_string());
        }

        let mut decoder = FrameDecoder::new();
        let mut read_buf = vec![0u8; 8192];
        let mut hb_interval = Duration::from_secs(self.config.heartbeat_secs.max(1));
        let mut check = tokio::time::interval(hb_interval / 2);
        check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_received = Instant::now();
        let mut last_sent = Instant::now();
        let mut test_request_pending = false;
        // Frames ahead of sequence, waiting for the gap to close.
        let mut pending: BTreeMap<u64, RawMessage> = BTreeMap::new();
        let mut resend_open = false;

        loop {
            tokio::select! {
                n = reader.read(&mut read_buf) => {
                    let n = match n {
                        Ok(0) => return ConnectionEnd::Retry("peer closed".to_string()),
                        Ok(n) => n,
                        Err(e) => return ConnectionEnd::Retry(format!("read error: {e}")),
                    };
                    decoder.push(&read_buf[..n]);
                    loop {
                        let frame = match decoder.next_frame() {
                            Ok(Some(frame)) => frame,
                            Ok(None) => break,
                            Err(e) => {
                                FIX_MALFORMED_FRAMES.with_label_values(&[&session]).inc();
                                return ConnectionEnd::Retry(format!("malformed frame: {e}"));
                            }
                        };
                        last_received = Instant::now();
                        test_request_pending = false;
                        match self
                            .handle_frame(frame, &wtr_tx, &mut pending, &mut resend_open, &mut hb_interval)
                            .await
                        {
                            FrameOutcome::Continue => {}
                            FrameOutcome::Disconnect(reason) => return ConnectionEnd::Retry(reason),
                            FrameOutcome::Fatal(reason) => return ConnectionEnd::Fatal(reason),
                        }
                    }
                }
                app = self.app_rx.recv() => {
                    match app {
                        Some(AppSend { msg_type: mt, body }) => {
                            if send_cmd(&wtr_tx, &mt, body).await.is_err() {
                                return ConnectionEnd::Retry("writer unavailable".to_string());
                            }
                            last_sent = Instant::now();
                        }
                        None => return ConnectionEnd::Shutdown,
                    }
                }
                _ = check.tick() => {
                    let idle_in = last_received.elapsed();
                    if idle_in > hb_interval.mul_f64(2.4) {
                        return ConnectionEnd::Retry("heartbeat timeout".to_string());
                    }
                    if idle_in > hb_interval.mul_f64(1.2) && !test_request_pending {
                        test_request_pending = true;
                        let _ = send_cmd(&wtr_tx, msg_type::TEST_REQUEST,
                            messages::test_request_body(&sending_time())).await;
                        last_sent = Instant::now();
                    } else if last_sent.elapsed() >= hb_interval {
                        let _ = send_cmd(&wtr_tx, msg_type::HEARTBEAT,
                            messages::heartbeat_body(None)).await;
                        last_sent = Instant::now();
                    }
                }
                _ = &mut writer_task => {
                    return ConnectionEnd::Retry("writer task ended".to_string());
                }
                _ = shutdown.cancelled() => {
                    let _ = send_cmd(&wtr_tx, msg_type::LOGOUT, messages::logout_body(Some("shutdown"))).await;
                    // Give the logout a moment on the wire.
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    return ConnectionEnd::Shutdown;
                }
            }
        }
    }

    /// Sequence-check one inbound frame, then dispatch it and any buffered
    /// successors that became in-sequence.
    async fn handle_frame(
        &self,
        frame: RawMessage,
        wtr_tx: &mpsc::Sender<WriterCmd>,
        pending: &mut BTreeMap<u64, RawMessage>,
        resend_open: &mut bool,
        hb_interval: &mut Duration,
    ) -> FrameOutcome {
        let session = &self.config.name;
        let mt = match frame.msg_type() {
            Ok(mt) => mt.to_string(),
            Err(_) => return FrameOutcome::Disconnect("frame without MsgType".to_string()),
        };
        FIX_MESSAGES_TOTAL
            .with_label_values(&[session, "in", &mt])
            .inc();

        // SequenceReset adjusts the expectation directly.
        if mt == msg_type::SEQUENCE_RESET {
            let new_seq: u64 = match frame.get_parsed(tag::NEW_SEQ_NO) {
                Ok(n) => n,
                Err(_) => return FrameOutcome::Disconnect("SequenceReset without NewSeqNo".into()),
            };
            let mut core = self.core.lock();
            debug!(session = %session, from = core.expected_in, to = new_seq, "sequence reset");
            core.expected_in = new_seq;
            drop(core);
            pending.retain(|&seq, _| seq >= new_seq);
            *resend_open = false;
            return self.drain_pending(pending, wtr_tx, resend_open, hb_interval).await;
        }

        let seq = match frame.seq_num() {
            Ok(seq) => seq,
            Err(_) => return FrameOutcome::Disconnect("frame without MsgSeqNum".to_string()),
        };
        let expected = self.core.lock().expected_in;

        if seq < expected {
            if frame.poss_dup() {
                debug!(session = %session, seq, expected, "duplicate frame ignored");
                return FrameOutcome::Continue;
            }
            return FrameOutcome::Disconnect(format!(
                "sequence too low: got {seq}, expected {expected}"
            ));
        }

        if seq > expected {
            debug!(session = %session, seq, expected, "sequence gap, buffering");
            pending.insert(seq, frame);
            if !*resend_open {
                *resend_open = true;
                FIX_RESEND_REQUESTS.with_label_values(&[session]).inc();
                let _ = send_cmd(
                    wtr_tx,
                    msg_type::RESEND_REQUEST,
                    messages::resend_request_body(expected, seq - 1),
                )
                .await;
            }
            return FrameOutcome::Continue;
        }

        self.core.lock().expected_in = seq + 1;
        let outcome = self.dispatch(frame, &mt, wtr_tx, hb_interval).await;
        if !matches!(outcome, FrameOutcome::Continue) {
            return outcome;
        }
        self.drain_pending(pending, wtr_tx, resend_open, hb_interval).await
    }

    /// Feed buffered frames that are now in sequence.
    async fn drain_pending(
        &self,
        pending: &mut BTreeMap<u64, RawMessage>,
        wtr_tx: &mpsc::Sender<WriterCmd>,
        resend_open: &mut bool,
        hb_interval: &mut Duration,
    ) -> FrameOutcome {
        loop {
            let expected = self.core.lock().expected_in;
            let Some(frame) = pending.remove(&expected) else {
                if pending.is_empty() {
                    *resend_open = false;
                }
                return FrameOutcome::Continue;
            };
            let mt = match frame.msg_type() {
                Ok(mt) => mt.to_string(),
                Err(_) => continue,
            };
            self.core.lock().expected_in = expected + 1;
            let outcome = self.dispatch(frame, &mt, wtr_tx, hb_interval).await;
            if !matches!(outcome, FrameOutcome::Continue) {
                return outcome;
            }
        }
    }

    /// Act on one in-sequence frame.
    async fn dispatch(
        &self,
        frame: RawMessage,
        mt: &str,
        wtr_tx: &mpsc::Sender<WriterCmd>,
        hb_interval: &mut Duration,
    ) -> FrameOutcome {
        let session = self.config.name.clone();
        match mt {
            msg_type::LOGON => {
                if let Ok(theirs) = frame.get_parsed::<u64>(tag::HEART_BT_INT) {
                    *hb_interval = Duration::from_secs(theirs.max(1));
                }
                info!(session = %session, "logged on");
                self.set_state(SessionState::LoggedOn);
                let _ = self
                    .events_tx
                    .send(SessionEvent::LoggedOn { session })
                    .await;
                FrameOutcome::Continue
            }
            msg_type::HEARTBEAT => FrameOutcome::Continue,
            msg_type::TEST_REQUEST => {
                let body = messages::heartbeat_body(frame.get(tag::TEST_REQ_ID));
                let _ = send_cmd(wtr_tx, msg_type::HEARTBEAT, body).await;
                FrameOutcome::Continue
            }
            msg_type::RESEND_REQUEST => {
                let begin = frame.get_parsed::<u64>(tag::BEGIN_SEQ_NO).unwrap_or(1);
                let end = frame.get_parsed::<u64>(tag::END_SEQ_NO).unwrap_or(0);
                let _ = wtr_tx.send(WriterCmd::Resend { begin, end }).await;
                FrameOutcome::Continue
            }
            msg_type::REJECT => {
                warn!(
                    session = %session,
                    text = frame.get(tag::TEXT).unwrap_or(""),
                    ref_seq = frame.get(tag::REF_SEQ_NUM).unwrap_or(""),
                    "session-level reject"
                );
                if *self.state.read() != SessionState::LoggedOn {
                    return FrameOutcome::Fatal("logon rejected".to_string());
                }
                FrameOutcome::Continue
            }
            msg_type::LOGOUT => {
                let text = frame.get(tag::TEXT).unwrap_or("").to_string();
                if *self.state.read() != SessionState::LoggedOn {
                    return FrameOutcome::Fatal(format!("logon rejected: {text}"));
                }
                let _ = send_cmd(wtr_tx, msg_type::LOGOUT, messages::logout_body(None)).await;
                FrameOutcome::Disconnect(format!("logged out by peer: {text}"))
            }
            _ => {
                let _ = self
                    .events_tx
                    .send(SessionEvent::AppMessage {
                        session,
                        message: frame,
                    })
                    .await;
                FrameOutcome::Continue
            }
        }
    }
}

enum FrameOutcome {
    Continue,
    Disconnect(String),
    Fatal(String),
}

async fn send_cmd(
    wtr_tx: &mpsc::Sender<WriterCmd>,
    mt: &str,
    body: Vec<(u32, String)>,
) -> FixResult<()> {
    wtr_tx
        .send(WriterCmd::Send {
            msg_type: mt.to_string(),
            body,
        })
        .await
        .map_err(|_| FixError::ChannelClosed)
}

/// Writer task: assigns sequence numbers, journals application messages,
/// answers resend requests, writes frames.
async fn writer_loop<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut rx: mpsc::Receiver<WriterCmd>,
    core: Arc<Mutex<SessionCore>>,
    config: SessionConfig,
) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WriterCmd::Send { msg_type: mt, body } => {
                let seq = {
                    let mut core = core.lock();
                    let seq = core.next_out;
                    core.next_out += 1;
                    if !msg_type::is_admin(&mt) {
                        core.journal.insert(
                            seq,
                            JournalEntry {
                                msg_type: mt.clone(),
                                body: body.clone(),
                                sent_at: sending_time(),
                            },
                        );
                        while core.journal.len() > JOURNAL_DEPTH {
                            core.journal.pop_first();
                        }
                    }
                    seq
                };
                let bytes = encode_message(
                    &mt,
                    seq,
                    &config.sender_comp_id,
                    &config.target_comp_id,
                    &body,
                );
                FIX_MESSAGES_TOTAL
                    .with_label_values(&[&config.name, "out", &mt])
                    .inc();
                if let Err(e) = writer.write_all(&bytes).await {
                    warn!(session = %config.name, ?e, "write failed");
                    return;
                }
            }
            WriterCmd::Resend { begin, end } => {
                if let Err(e) = resend_range(&mut writer, &core, &config, begin, end).await {
                    warn!(session = %config.name, ?e, "resend failed");
                    return;
                }
            }
        }
    }
}

/// Replay [begin, end] from the journal. Journaled application messages go
/// out again with PossDupFlag=Y and their original sequence numbers;
/// everything else is skipped with a SequenceReset-GapFill.
async fn resend_range<W: AsyncWrite + Unpin>(
    writer: &mut W,
    core: &Arc<Mutex<SessionCore>>,
    config: &SessionConfig,
    begin: u64,
    end: u64,
) -> FixResult<()> {
    let (entries, high) = {
        let core = core.lock();
        let high = core.next_out - 1;
        let end = if end == 0 { high } else { end.min(high) };
        let entries: Vec<(u64, Option<JournalEntry>)> = (begin..=end)
            .map(|seq| (seq, core.journal.get(&seq).cloned()))
            .collect();
        (entries, end)
    };
    info!(session = %config.name, begin, end = high, "answering resend request");

    let mut gap_start: Option<u64> = None;
    for (seq, entry) in entries {
        match entry {
            Some(entry) => {
                if let Some(start) = gap_start.take() {
                    write_gap_fill(writer, config, start, seq).await?;
                }
                let mut body = vec![
                    (tag::POSS_DUP_FLAG, "Y".to_string()),
                    (tag::ORIG_SENDING_TIME, entry.sent_at.clone()),
                ];
                body.extend(entry.body.clone());
                let bytes = encode_message(
                    &entry.msg_type,
                    seq,
                    &config.sender_comp_id,
                    &config.target_comp_id,
                    &body,
                );
                writer.write_all(&bytes).await?;
            }
            None => {
                if gap_start.is_none() {
                    gap_start = Some(seq);
                }
            }
        }
    }
    if let Some(start) = gap_start {
        write_gap_fill(writer, config, start, high + 1).await?;
    }
    Ok(())
}

async fn write_gap_fill<W: AsyncWrite + Unpin>(
    writer: &mut W,
    config: &SessionConfig,
    at_seq: u64,
    new_seq_no: u64,
) -> FixResult<()> {
    let mut body = vec![(tag::POSS_DUP_FLAG, "Y".to_string())];
    body.extend(messages::sequence_reset_gap_fill_body(new_seq_no));
    let bytes = encode_message(
        msg_type::SEQUENCE_RESET,
        at_seq,
        &config.sender_comp_id,
        &config.target_comp_id,
        &body,
    );
    writer.write_all(&bytes).await?;
    Ok(())
}
