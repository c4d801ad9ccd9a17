use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed: {0}")]
    Closed(String),

    #[error("connection is not open")]
    NotConnected,

    #[error("connection task was already opened")]
    AlreadyOpen,

    #[error("{0} is not supported on this connection kind")]
    Unsupported(&'static str),

    #[error("datagram size mismatch: expected {expected} bytes, got {actual}")]
    DatagramSize { expected: usize, actual: usize },

    #[error("frame of {size} bytes exceeds limit of {limit}")]
    FrameTooLarge { size: usize, limit: usize },
}

#[derive(Debug, Error)]
pub enum MuxError {
    #[error("request timed out")]
    Timeout,

    #[error("connection lost: {0}")]
    Disconnected(String),

    #[error("payload codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("remote rejected request: {0}")]
    Remote(String),
}
