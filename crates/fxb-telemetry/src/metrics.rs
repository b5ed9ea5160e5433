//! Prometheus metrics for the broker core.
//!
//! # Panics
//!
//! Metric registration uses `unwrap()` intentionally. If registration fails,
//! it indicates a fatal configuration error (e.g., duplicate metric names)
//! that should cause an immediate crash at startup rather than silent
//! failure. These panics only occur during static initialization, never at
//! runtime.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_int_counter, register_int_counter_vec,
    register_int_gauge, CounterVec, Encoder, GaugeVec, IntCounter, IntCounterVec, IntGauge,
    TextEncoder,
};

// === Quote pipeline ===

/// Ticks received from the gateway, by symbol.
pub static TICKS_RECEIVED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "fxb_ticks_received_total",
        "Raw ticks received from the gateway",
        &["symbol"]
    )
    .unwrap()
});

/// Ticks dropped as identical successive samples.
pub static TICKS_DEDUPED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "fxb_ticks_deduped_total",
        "Ticks dropped as duplicates",
        &["symbol"]
    )
    .unwrap()
});

/// Ticks dropped as stale or out of order.
pub static TICKS_DROPPED_STALE: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "fxb_ticks_dropped_stale_total",
        "Ticks dropped for age or timestamp regression",
        &["symbol"]
    )
    .unwrap()
});

/// Ticks dropped by the sanity stage.
pub static TICKS_DROPPED_INVALID: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "fxb_ticks_dropped_invalid_total",
        "Ticks dropped as crossed or spiking",
        &["symbol"]
    )
    .unwrap()
});

/// Broadcasts suppressed by the throttle.
pub static TICKS_THROTTLED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "fxb_ticks_throttled_total",
        "Broadcasts suppressed below the throttle epsilon",
        &["symbol"]
    )
    .unwrap()
});

/// Ticks handed to the hub for broadcast.
pub static TICKS_BROADCAST: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "fxb_ticks_broadcast_total",
        "Ticks broadcast to the hub",
        &["symbol"]
    )
    .unwrap()
});

// === FIX gateway ===

/// Session state machine, 1 for the active state.
pub static FIX_SESSION_STATE: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "fxb_fix_session_state",
        "FIX session state (1=active, 0=inactive)",
        &["session", "state"]
    )
    .unwrap()
});

/// Reconnection attempts per session.
pub static FIX_RECONNECT_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "fxb_fix_reconnect_total",
        "FIX session reconnection attempts",
        &["session"]
    )
    .unwrap()
});

/// Messages by direction and MsgType.
pub static FIX_MESSAGES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "fxb_fix_messages_total",
        "FIX messages processed",
        &["session", "direction", "msg_type"]
    )
    .unwrap()
});

/// Resend requests issued after a sequence gap.
pub static FIX_RESEND_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "fxb_fix_resend_requests_total",
        "ResendRequests issued after sequence gaps",
        &["session"]
    )
    .unwrap()
});

/// Frames dropped as malformed.
pub static FIX_MALFORMED_FRAMES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "fxb_fix_malformed_frames_total",
        "Inbound FIX frames rejected by the decoder",
        &["session"]
    )
    .unwrap()
});

// === WebSocket hub ===

/// Currently connected clients.
pub static HUB_CLIENTS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("fxb_hub_clients", "Connected WebSocket clients").unwrap()
});

/// Messages dropped on full client queues.
pub static HUB_DROPPED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "fxb_hub_dropped_total",
        "Broadcasts dropped on full client queues"
    )
    .unwrap()
});

/// Clients closed for falling behind.
pub static HUB_SLOW_CLOSED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "fxb_hub_slow_closed_total",
        "Clients closed as slow consumers"
    )
    .unwrap()
});

/// Events fanned out to client queues.
pub static HUB_BROADCAST_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("fxb_hub_broadcast_total", "Events fanned out by the hub").unwrap()
});

// === Tick store ===

/// Records flushed to disk.
pub static STORE_FLUSHED_RECORDS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "fxb_store_flushed_records_total",
        "Tick records flushed to day files"
    )
    .unwrap()
});

/// Writes collapsed by backpressure coalescing.
pub static STORE_COALESCED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "fxb_store_coalesced_total",
        "Tick writes coalesced under backpressure"
    )
    .unwrap()
});

/// Corrupt trailing records tolerated by the reader.
pub static STORE_CORRUPT_TAIL_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "fxb_store_corrupt_tail_total",
        "Corrupt tail records skipped while reading day files"
    )
    .unwrap()
});

/// Day files removed by the retention sweep.
pub static STORE_SWEPT_FILES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "fxb_store_swept_files_total",
        "Day files removed by the retention sweep"
    )
    .unwrap()
});

// === Engine ===

/// Order fills by side.
pub static ENGINE_FILLS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "fxb_engine_fills_total",
        "Orders filled by the engine",
        &["symbol", "side"]
    )
    .unwrap()
});

/// Order rejections by reason code.
pub static ENGINE_REJECTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "fxb_engine_rejects_total",
        "Orders rejected by the engine",
        &["reason"]
    )
    .unwrap()
});

/// Margin-call warnings emitted.
pub static ENGINE_MARGIN_CALLS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "fxb_engine_margin_calls_total",
        "Margin-call warnings emitted"
    )
    .unwrap()
});

/// Positions force-closed by stop-out.
pub static ENGINE_STOPOUTS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "fxb_engine_stopouts_total",
        "Positions force-closed by stop-out"
    )
    .unwrap()
});

/// Encode the default registry in Prometheus text format.
pub fn gather_metrics() -> String {
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_register_and_gather() {
        TICKS_RECEIVED.with_label_values(&["EURUSD"]).inc();
        HUB_DROPPED_TOTAL.inc();
        let text = gather_metrics();
        assert!(text.contains("fxb_ticks_received_total"));
        assert!(text.contains("fxb_hub_dropped_total"));
    }
}
