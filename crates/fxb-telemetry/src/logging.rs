//! Structured logging initialization.

use crate::error::{TelemetryError, TelemetryResult};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Output format for log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per event, with span context.
    Json,
    /// Multi-line human format with targets and thread names.
    Pretty,
}

impl LogFormat {
    /// Production deployments (`RUST_ENV=production`) log JSON lines;
    /// everything else gets the human format.
    pub fn from_env() -> Self {
        match std::env::var("RUST_ENV").as_deref() {
            Ok("production") => Self::Json,
            _ => Self::Pretty,
        }
    }
}

/// Install the global subscriber.
///
/// `default_filter` is the server's configured directive (see
/// `log_filter` in the top-level config); `RUST_LOG` overrides it.
pub fn init_logging(default_filter: &str, format: LogFormat) -> TelemetryResult<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_filter)
            .map_err(|e| TelemetryError::Init(format!("bad log filter {default_filter:?}: {e}")))?,
    };

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true),
            )
            .try_init(),
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .pretty()
                    .with_target(true)
                    .with_thread_names(true),
            )
            .try_init(),
    }
    .map_err(|e| TelemetryError::Init(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_filter_is_reported() {
        // An unparsable directive must surface as an error, not a panic.
        let result = init_logging("fxb=not-a-level", LogFormat::Pretty);
        assert!(matches!(result, Err(TelemetryError::Init(_))));
    }
}
