//! End-to-end session tests over in-memory transport.
//!
//! A `Peer` plays the liquidity provider on the far end of a duplex pipe:
//! it answers the logon, injects sequence gaps, replays resends and drops
//! connections, while the assertions watch the session's outbound frames
//! and published events.

use fxb_fix::codec::{encode_message, FrameDecoder, RawMessage};
use fxb_fix::fields::{msg_type, tag};
use fxb_fix::session::{FixSession, SessionEvent, SessionHandle};
use fxb_fix::transport::DuplexConnector;
use fxb_fix::SessionConfig;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};
use tokio_util::sync::CancellationToken;

fn config(name: &str) -> SessionConfig {
    SessionConfig {
        name: name.to_string(),
        host: "localhost".to_string(),
        port: 0,
        sender_comp_id: "FXB".to_string(),
        target_comp_id: "LP1".to_string(),
        username: Some("user".to_string()),
        password: Some("pass".to_string()),
        heartbeat_secs: 30,
        reset_seq_on_logon: true,
        market_data: true,
        orders: true,
        backoff_floor_secs: 1,
        backoff_cap_secs: 30,
    }
}

/// The upstream side of the wire.
struct Peer {
    stream: DuplexStream,
    decoder: FrameDecoder,
    seq: u64,
}

impl Peer {
    fn new(stream: DuplexStream) -> Self {
        Self {
            stream,
            decoder: FrameDecoder::new(),
            seq: 1,
        }
    }

    /// Next frame of the wanted type; other session chatter is skipped.
    async fn recv_type(&mut self, mt: &str) -> RawMessage {
        timeout(Duration::from_secs(5), async {
            loop {
                if let Some(frame) = self.decoder.next_frame().unwrap() {
                    if frame.msg_type().unwrap() == mt {
                        return frame;
                    }
                    continue;
                }
                let mut buf = [0u8; 4096];
                let n = self.stream.read(&mut buf).await.unwrap();
                assert!(n > 0, "session closed the connection");
                self.decoder.push(&buf[..n]);
            }
        })
        .await
        .expect("timed out waiting for frame")
    }

    /// Send with the peer's own running sequence number.
    async fn send(&mut self, mt: &str, body: Vec<(u32, String)>) {
        let seq = self.seq;
        self.seq += 1;
        self.send_seq(mt, seq, body).await;
    }

    async fn send_seq(&mut self, mt: &str, seq: u64, body: Vec<(u32, String)>) {
        let bytes = encode_message(mt, seq, "LP1", "FXB", &body);
        self.stream.write_all(&bytes).await.unwrap();
    }

    async fn answer_logon(&mut self) {
        let logon = self.recv_type(msg_type::LOGON).await;
        assert_eq!(logon.get(tag::HEART_BT_INT), Some("30"));
        self.send(
            msg_type::LOGON,
            vec![
                (tag::ENCRYPT_METHOD, "0".to_string()),
                (tag::HEART_BT_INT, "30".to_string()),
            ],
        )
        .await;
    }
}

struct Fixture {
    peer: Peer,
    handle: SessionHandle,
    events_rx: mpsc::Receiver<SessionEvent>,
    shutdown: CancellationToken,
}

/// Spin up a session wired to `extra + 1` in-memory connections; the first
/// is returned as the active peer, the rest are queued for reconnects.
fn start_session(extra: usize) -> (Fixture, Vec<DuplexStream>) {
    let mut session_sides = Vec::new();
    let mut peer_sides = Vec::new();
    for _ in 0..=extra {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        session_sides.push(ours);
        peer_sides.push(theirs);
    }

    let (events_tx, events_rx) = mpsc::channel(256);
    let (handle, session) = FixSession::new(
        config("lp1-md"),
        DuplexConnector::new(session_sides),
        events_tx,
    );
    let shutdown = CancellationToken::new();
    tokio::spawn(session.run(shutdown.clone()));

    let peer = Peer::new(peer_sides.remove(0));
    (
        Fixture {
            peer,
            handle,
            events_rx,
            shutdown,
        },
        peer_sides,
    )
}

async fn wait_logged_on(handle: &SessionHandle) {
    for _ in 0..500 {
        if handle.is_logged_on() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("session never logged on");
}

/// Drain events until the next AppMessage, returning it.
async fn next_app_message(events_rx: &mut mpsc::Receiver<SessionEvent>) -> RawMessage {
    timeout(Duration::from_secs(5), async {
        loop {
            match events_rx.recv().await.expect("event channel closed") {
                SessionEvent::AppMessage { message, .. } => return message,
                _ => continue,
            }
        }
    })
    .await
    .expect("timed out waiting for app message")
}

fn md_body(req_id: &str) -> Vec<(u32, String)> {
    vec![
        (tag::MD_REQ_ID, req_id.to_string()),
        (tag::SYMBOL, "EURUSD".to_string()),
        (tag::NO_MD_ENTRIES, "2".to_string()),
        (tag::MD_ENTRY_TYPE, "0".to_string()),
        (tag::MD_ENTRY_PX, "1.0850".to_string()),
        (tag::MD_ENTRY_TYPE, "1".to_string()),
        (tag::MD_ENTRY_PX, "1.0851".to_string()),
    ]
}

#[tokio::test]
async fn logon_and_test_request() {
    let (mut fx, _spare) = start_session(0);
    fx.peer.answer_logon().await;
    wait_logged_on(&fx.handle).await;

    // A TestRequest is answered by a Heartbeat echoing the id.
    fx.peer
        .send(
            msg_type::TEST_REQUEST,
            vec![(tag::TEST_REQ_ID, "ping-1".to_string())],
        )
        .await;
    let heartbeat = fx.peer.recv_type(msg_type::HEARTBEAT).await;
    assert_eq!(heartbeat.get(tag::TEST_REQ_ID), Some("ping-1"));

    fx.shutdown.cancel();
}

#[tokio::test]
async fn sequence_gap_triggers_bounded_resend_request() {
    let (mut fx, _spare) = start_session(0);
    fx.peer.answer_logon().await;
    wait_logged_on(&fx.handle).await;

    // Jump the inbound sequence to 100.
    fx.peer
        .send(
            msg_type::SEQUENCE_RESET,
            vec![(tag::NEW_SEQ_NO, "100".to_string())],
        )
        .await;

    // 100 flows straight through.
    fx.peer.send_seq(msg_type::MARKET_DATA_SNAPSHOT, 100, md_body("m100")).await;
    let first = next_app_message(&mut fx.events_rx).await;
    assert_eq!(first.get(tag::MD_REQ_ID), Some("m100"));

    // 103 opens a gap: the session must ask for exactly 101..102.
    fx.peer.send_seq(msg_type::MARKET_DATA_SNAPSHOT, 103, md_body("m103")).await;
    let resend = fx.peer.recv_type(msg_type::RESEND_REQUEST).await;
    assert_eq!(resend.get(tag::BEGIN_SEQ_NO), Some("101"));
    assert_eq!(resend.get(tag::END_SEQ_NO), Some("102"));

    // Replay the gap with PossDup set; 103 is already buffered.
    for seq in [101u64, 102] {
        let mut body = vec![(tag::POSS_DUP_FLAG, "Y".to_string())];
        body.extend(md_body(&format!("m{seq}")));
        fx.peer.send_seq(msg_type::MARKET_DATA_SNAPSHOT, seq, body).await;
    }

    // Exactly once each, in order: 101, 102, then the buffered 103.
    for expected in ["m101", "m102", "m103"] {
        let msg = next_app_message(&mut fx.events_rx).await;
        assert_eq!(msg.get(tag::MD_REQ_ID), Some(expected));
    }

    // A duplicate replay of 101 is ignored, the stream continues at 104.
    let mut dup = vec![(tag::POSS_DUP_FLAG, "Y".to_string())];
    dup.extend(md_body("m101"));
    fx.peer.send_seq(msg_type::MARKET_DATA_SNAPSHOT, 101, dup).await;
    fx.peer.send_seq(msg_type::MARKET_DATA_SNAPSHOT, 104, md_body("m104")).await;
    let msg = next_app_message(&mut fx.events_rx).await;
    assert_eq!(msg.get(tag::MD_REQ_ID), Some("m104"));

    fx.shutdown.cancel();
}

#[tokio::test]
async fn answers_resend_with_journal_and_gap_fill() {
    let (mut fx, _spare) = start_session(0);
    fx.peer.answer_logon().await;
    wait_logged_on(&fx.handle).await;

    // One application message from our side (seq 2; logon took seq 1).
    fx.handle
        .send_app(
            msg_type::NEW_ORDER_SINGLE,
            vec![
                (tag::CL_ORD_ID, "fxb-1".to_string()),
                (tag::SYMBOL, "EURUSD".to_string()),
            ],
        )
        .await
        .unwrap();
    let order = fx.peer.recv_type(msg_type::NEW_ORDER_SINGLE).await;
    assert_eq!(order.seq_num().unwrap(), 2);

    // Ask for everything from 1: the admin logon is gap-filled, the order
    // is resent with PossDup and its original sequence number.
    fx.peer
        .send(
            msg_type::RESEND_REQUEST,
            vec![
                (tag::BEGIN_SEQ_NO, "1".to_string()),
                (tag::END_SEQ_NO, "0".to_string()),
            ],
        )
        .await;

    let gap_fill = fx.peer.recv_type(msg_type::SEQUENCE_RESET).await;
    assert_eq!(gap_fill.seq_num().unwrap(), 1);
    assert_eq!(gap_fill.get(tag::GAP_FILL_FLAG), Some("Y"));
    assert_eq!(gap_fill.get(tag::NEW_SEQ_NO), Some("2"));

    let replayed = fx.peer.recv_type(msg_type::NEW_ORDER_SINGLE).await;
    assert_eq!(replayed.seq_num().unwrap(), 2);
    assert!(replayed.poss_dup());
    assert_eq!(replayed.get(tag::CL_ORD_ID), Some("fxb-1"));
    assert!(replayed.get(tag::ORIG_SENDING_TIME).is_some());

    fx.shutdown.cancel();
}

#[tokio::test]
async fn reconnects_after_peer_drop() {
    let (mut fx, mut spares) = start_session(1);
    fx.peer.answer_logon().await;
    wait_logged_on(&fx.handle).await;

    // Kill the connection; the session backs off and dials again.
    drop(fx.peer);
    let mut second = Peer::new(spares.remove(0));
    second.answer_logon().await;
    wait_logged_on(&fx.handle).await;

    // The fresh connection works end to end.
    second
        .send(
            msg_type::TEST_REQUEST,
            vec![(tag::TEST_REQ_ID, "ping-2".to_string())],
        )
        .await;
    let heartbeat = second.recv_type(msg_type::HEARTBEAT).await;
    assert_eq!(heartbeat.get(tag::TEST_REQ_ID), Some("ping-2"));

    fx.shutdown.cancel();
}

#[tokio::test]
async fn logout_before_logon_halts_session() {
    let (mut fx, _spare) = start_session(0);
    let _logon = fx.peer.recv_type(msg_type::LOGON).await;
    // Reject the logon with an immediate logout.
    fx.peer
        .send(
            msg_type::LOGOUT,
            vec![(tag::TEXT, "invalid credentials".to_string())],
        )
        .await;

    let halted = timeout(Duration::from_secs(5), async {
        loop {
            match fx.events_rx.recv().await.expect("event channel closed") {
                SessionEvent::Halted { reason, .. } => return reason,
                _ => continue,
            }
        }
    })
    .await
    .expect("session did not halt");
    assert!(halted.contains("invalid credentials"));
}
