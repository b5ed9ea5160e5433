//! The session transport seam.
//!
//! A session needs a way to (re)connect and a split read/write byte pair;
//! everything else (framing, sequencing) lives above. Production connects
//! TCP; tests hand the session pre-wired in-memory duplex pairs so
//! reconnects and gaps can be driven deterministically.

use crate::error::{FixError, FixResult};
use std::collections::VecDeque;
use std::future::Future;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadHalf, WriteHalf};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::info;

/// Supplies a fresh byte stream for every (re)connection attempt.
pub trait Connector: Send + 'static {
    type Reader: AsyncRead + Unpin + Send + 'static;
    type Writer: AsyncWrite + Unpin + Send + 'static;

    fn connect(&mut self) -> impl Future<Output = FixResult<(Self::Reader, Self::Writer)>> + Send;
}

/// Production connector: plain TCP to the upstream.
pub struct TcpConnector {
    pub host: String,
    pub port: u16,
}

impl TcpConnector {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl Connector for TcpConnector {
    type Reader = OwnedReadHalf;
    type Writer = OwnedWriteHalf;

    async fn connect(&mut self) -> FixResult<(Self::Reader, Self::Writer)> {
        let addr = format!("{}:{}", self.host, self.port);
        info!(%addr, "connecting FIX transport");
        let stream = TcpStream::connect(&addr).await?;
        stream.set_nodelay(true)?;
        Ok(stream.into_split())
    }
}

/// Test connector backed by a queue of in-memory streams.
///
/// Each `connect` call takes the next session-side stream (the harness
/// keeps the peer end); an empty queue fails the attempt, which exercises
/// the backoff path.
pub struct DuplexConnector {
    streams: Mutex<VecDeque<DuplexStream>>,
}

impl DuplexConnector {
    pub fn new(streams: impl IntoIterator<Item = DuplexStream>) -> Self {
        Self {
            streams: Mutex::new(streams.into_iter().collect()),
        }
    }
}

impl Connector for DuplexConnector {
    type Reader = ReadHalf<DuplexStream>;
    type Writer = WriteHalf<DuplexStream>;

    async fn connect(&mut self) -> FixResult<(Self::Reader, Self::Writer)> {
        let stream = self
            .streams
            .lock()
            .await
            .pop_front()
            .ok_or_else(|| FixError::Halted("no more test connections".to_string()))?;
        Ok(tokio::io::split(stream))
    }
}
