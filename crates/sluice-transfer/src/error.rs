use sluice_net::ConnectionError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransferError {
    /// Hash or range validation failed. Local to one connection.
    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("transfer cancelled")]
    Cancelled,

    /// A frame failed on its first attempt and again on its retry.
    #[error("frame [{start}, {end}) failed after retry: {reason}")]
    FrameFailed { start: u64, end: u64, reason: String },

    #[error("invalid source: {0}")]
    InvalidSource(String),
}
