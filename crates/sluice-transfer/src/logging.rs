/// Transfer logging trait for structured lifecycle events.
///
/// The server and client report what happens to each connection and frame
/// through a `TransferLogger`, so an embedding application can route events
/// to its own sink instead of (or besides) `tracing`.
use std::fmt;
use std::net::SocketAddr;

/// Structured log entry for one transfer.
#[derive(Debug, Clone)]
pub struct TransferLog {
    pub component: &'static str,
    pub content_hash: [u8; 16],
    pub event: TransferEvent,
}

#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// Server: listener bound
    Listening { bind_addr: SocketAddr },
    /// Server: preamble accepted, range about to be served
    RequestAccepted { peer: SocketAddr, start: u64, end: u64 },
    /// Server: preamble rejected, connection closed
    RequestRejected { peer: SocketAddr, reason: String },
    /// Server: a whole range was written to a client
    RangeServed { peer: SocketAddr, start: u64, end: u64 },
    /// Server: a connection failed mid-way
    ConnectionFailed { peer: SocketAddr, message: String },
    /// Server: every byte served at least once
    ServeComplete {
        total_bytes: u64,
        connections: u64,
        duration_ms: u64,
    },
    /// Client: frame worker started an attempt
    FrameStarted { start: u64, end: u64, attempt: u32 },
    /// Client: first attempt failed, retrying
    FrameRetry { start: u64, end: u64, reason: String },
    /// Client: frame written to disk
    FrameComplete { start: u64, end: u64, duration_ms: u64 },
    /// Client: all frames written
    DownloadComplete {
        total_bytes: u64,
        frames: usize,
        retries: u32,
        duration_ms: u64,
    },
    /// Error occurred
    Error { message: String },
}

impl fmt::Display for TransferEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Listening { bind_addr } => write!(f, "listening bind={}", bind_addr),
            Self::RequestAccepted { peer, start, end } => {
                write!(f, "request_accepted peer={} range=[{}, {})", peer, start, end)
            }
            Self::RequestRejected { peer, reason } => {
                write!(f, "request_rejected peer={} reason={}", peer, reason)
            }
            Self::RangeServed { peer, start, end } => {
                write!(f, "range_served peer={} range=[{}, {})", peer, start, end)
            }
            Self::ConnectionFailed { peer, message } => {
                write!(f, "connection_failed peer={} error={}", peer, message)
            }
            Self::ServeComplete { total_bytes, connections, duration_ms } => write!(
                f,
                "serve_complete bytes={} connections={} duration_ms={}",
                total_bytes, connections, duration_ms
            ),
            Self::FrameStarted { start, end, attempt } => {
                write!(f, "frame_started range=[{}, {}) attempt={}", start, end, attempt)
            }
            Self::FrameRetry { start, end, reason } => {
                write!(f, "frame_retry range=[{}, {}) reason={}", start, end, reason)
            }
            Self::FrameComplete { start, end, duration_ms } => {
                write!(f, "frame_complete range=[{}, {}) duration_ms={}", start, end, duration_ms)
            }
            Self::DownloadComplete { total_bytes, frames, retries, duration_ms } => write!(
                f,
                "download_complete bytes={} frames={} retries={} duration_ms={}",
                total_bytes, frames, retries, duration_ms
            ),
            Self::Error { message } => write!(f, "error: {}", message),
        }
    }
}

pub trait TransferLogger: Send + Sync {
    fn log(&self, entry: TransferLog);
}

/// Logger that uses the `tracing` crate.
pub struct TracingLogger;

impl TransferLogger for TracingLogger {
    fn log(&self, entry: TransferLog) {
        let hash = hex::encode(entry.content_hash);
        // info for lifecycle, warn for failures, debug for per-frame spam
        match &entry.event {
            TransferEvent::Listening { .. }
            | TransferEvent::ServeComplete { .. }
            | TransferEvent::DownloadComplete { .. } => {
                tracing::info!(component = entry.component, file = %hash, "{}", entry.event);
            }
            TransferEvent::RequestRejected { .. }
            | TransferEvent::ConnectionFailed { .. }
            | TransferEvent::FrameRetry { .. }
            | TransferEvent::Error { .. } => {
                tracing::warn!(component = entry.component, file = %hash, "{}", entry.event);
            }
            _ => {
                tracing::debug!(component = entry.component, file = %hash, "{}", entry.event);
            }
        }
    }
}

/// No-op logger that discards all log entries.
pub struct NullLogger;

impl TransferLogger for NullLogger {
    fn log(&self, _entry: TransferLog) {}
}
