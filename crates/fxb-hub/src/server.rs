//! HTTP server and the per-connection WebSocket tasks.

use crate::client::{ClientHandle, CloseIntent};
use crate::hub::Hub;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use fxb_core::{now_ms, ClientRequest, StreamEvent, Symbol};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Policy violation: bad or missing token. Clients must not auto-reconnect.
const CLOSE_AUTH: u16 = 1008;
/// Going away: server shutdown.
const CLOSE_SHUTDOWN: u16 = 1001;
/// Try again later: the client could not keep up.
const CLOSE_SLOW: u16 = 1013;
/// Normal closure: idle timeout.
const CLOSE_IDLE: u16 = 1000;

/// Build the hub router: the WebSocket endpoint plus health and metrics.
pub fn router(hub: Arc<Hub>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(hub)
}

async fn healthz() -> impl IntoResponse {
    axum::Json(serde_json::json!({ "status": "ok", "timestamp": now_ms() }))
}

async fn metrics() -> impl IntoResponse {
    fxb_telemetry::gather_metrics()
}

/// Upgrade handler; authentication happens on the socket so the rejection
/// can use the distinguished close code.
async fn ws_handler(
    State(hub): State<Arc<Hub>>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let token = params.get("token").cloned().unwrap_or_default();
    ws.on_upgrade(move |socket| handle_socket(socket, hub, token))
}

async fn handle_socket(socket: WebSocket, hub: Arc<Hub>, token: String) {
    let (mut ws_tx, ws_rx) = socket.split();

    let Some(identity) = hub.authenticate(&token) else {
        warn!("websocket rejected: bad token");
        let _ = ws_tx
            .send(Message::Close(Some(CloseFrame {
                code: CLOSE_AUTH,
                reason: "authentication failed".into(),
            })))
            .await;
        return;
    };

    let (client, out_rx) = hub.register(identity);
    info!(client = %client.id, clients = hub.client_count(), "client connected");

    // Initial snapshot: the latest cached tick per enabled symbol.
    for tick in hub.snapshot_ticks() {
        if let Ok(payload) = serde_json::to_string(&StreamEvent::from_tick(&tick)) {
            if ws_tx.send(Message::Text(payload.into())).await.is_err() {
                hub.deregister(client.id);
                return;
            }
        }
    }

    // One task for inbound reads, the current task for outbound writes.
    let read_task = tokio::spawn(read_loop(ws_rx, hub.clone(), client.clone()));
    write_loop(&mut ws_tx, &hub, &client, out_rx).await;

    read_task.abort();
    hub.deregister(client.id);
    info!(client = %client.id, clients = hub.client_count(), "client disconnected");
}

/// Inbound: subscription management, snapshot requests, liveness.
async fn read_loop(mut ws_rx: SplitStream<WebSocket>, hub: Arc<Hub>, client: Arc<ClientHandle>) {
    while let Some(message) = ws_rx.next().await {
        match message {
            Ok(Message::Text(text)) => {
                client.record_inbound();
                handle_request(&hub, &client, &text);
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => client.record_inbound(),
            Ok(Message::Close(_)) => {
                client.close(CloseIntent::Shutdown);
                return;
            }
            Ok(_) => {}
            Err(e) => {
                debug!(client = %client.id, ?e, "websocket read error");
                client.close(CloseIntent::Shutdown);
                return;
            }
        }
    }
    client.close(CloseIntent::Shutdown);
}

fn handle_request(hub: &Hub, client: &ClientHandle, text: &str) {
    let request: ClientRequest = match serde_json::from_str(text) {
        Ok(request) => request,
        Err(e) => {
            hub.send_to(
                client,
                &StreamEvent::Error {
                    code: "bad-request".to_string(),
                    message: e.to_string(),
                    timestamp: now_ms(),
                },
            );
            return;
        }
    };

    match request {
        ClientRequest::Subscribe { symbols } => {
            let accepted: Vec<Symbol> = symbols
                .into_iter()
                .filter(|s| hub.symbol_enabled(s))
                .collect();
            client.subscribe(&accepted);
            hub.send_to(
                client,
                &StreamEvent::Subscribed {
                    symbols: accepted,
                    timestamp: now_ms(),
                },
            );
        }
        ClientRequest::Unsubscribe { symbols } => {
            client.unsubscribe(&symbols);
            hub.send_to(
                client,
                &StreamEvent::Unsubscribed {
                    symbols,
                    timestamp: now_ms(),
                },
            );
        }
        ClientRequest::Snapshot { symbols } => {
            for tick in hub.snapshot_for(&symbols) {
                hub.send_to(client, &StreamEvent::from_tick(&tick));
            }
        }
        ClientRequest::Pong => {}
    }
}

/// Outbound: drain the bounded queue, emit heartbeats, enforce idleness,
/// and honor close intents.
async fn write_loop(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    hub: &Hub,
    client: &Arc<ClientHandle>,
    mut out_rx: tokio::sync::mpsc::Receiver<String>,
) {
    let mut heartbeat =
        tokio::time::interval(Duration::from_secs(hub.config().heartbeat_secs.max(1)));
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut idle_check = tokio::time::interval(Duration::from_secs(5));
    let idle_timeout = Duration::from_secs(hub.config().idle_timeout_secs.max(1));

    loop {
        tokio::select! {
            payload = out_rx.recv() => {
                match payload {
                    Some(payload) => {
                        if ws_tx.send(Message::Text(payload.into())).await.is_err() {
                            return;
                        }
                    }
                    None => return,
                }
            }
            _ = heartbeat.tick() => {
                if let Ok(payload) = serde_json::to_string(&Hub::heartbeat_event()) {
                    if ws_tx.send(Message::Text(payload.into())).await.is_err() {
                        return;
                    }
                }
            }
            _ = idle_check.tick() => {
                if client.idle_for() > idle_timeout {
                    client.close(CloseIntent::Idle);
                }
            }
            _ = client.killed().cancelled() => {
                let (code, reason) = match client.close_intent() {
                    Some(CloseIntent::SlowConsumer) => (CLOSE_SLOW, "slow consumer"),
                    Some(CloseIntent::Idle) => (CLOSE_IDLE, "idle timeout"),
                    _ => (CLOSE_SHUTDOWN, "server shutdown"),
                };
                let _ = ws_tx
                    .send(Message::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    })))
                    .await;
                return;
            }
        }
    }
}

/// Bind and serve until shutdown; closes every client on the way out.
pub async fn run_server(hub: Arc<Hub>, shutdown: CancellationToken) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(&hub.config().listen).await?;
    info!(listen = %hub.config().listen, "hub server listening");
    let app = router(hub.clone());
    let result = axum::serve(listener, app)
        .with_graceful_shutdown({
            let shutdown = shutdown.clone();
            async move { shutdown.cancelled().await }
        })
        .await;
    hub.close_all();
    result
}
