/// Sluice parallel transfer engine.
///
/// Moves one file between two peers by splitting it into byte-range frames,
/// each fetched over its own TCP connection:
/// - `planner`: decides frame boundaries from the file size and limits
/// - `protocol`: the fixed 32-byte request preamble
/// - `server`: serves any requested range until every byte was sent once
/// - `client`: fetches all frames concurrently, retrying each frame once
/// - `progress`: distinct-byte accounting shared by concurrent workers

pub mod client;
pub mod config;
pub mod error;
pub mod file;
pub mod logging;
pub mod planner;
pub mod progress;
pub mod protocol;
pub mod server;

pub use client::{DownloadReport, TransferClient, start_client};
pub use config::TransferConfig;
pub use error::TransferError;
pub use file::{SharedFile, SourceCheck, check_source, content_hash, describe};
pub use logging::{NullLogger, TracingLogger, TransferEvent, TransferLog, TransferLogger};
pub use planner::{Frame, plan};
pub use progress::{Coverage, TransferProgress};
pub use protocol::{PREAMBLE_LEN, Preamble};
pub use server::{ServeOutcome, TransferServer, start_server};
