/// Control-plane messages exchanged over the request/response multiplexer
/// before any bulk transfer starts.
///
/// Each request type has a fixed numeric id; the payloads are JSON.
use serde::{Deserialize, Serialize};

use crate::models::FileDescriptor;

/// Bumped whenever a message shape changes incompatibly.
pub const PROTOCOL_VERSION: u32 = 3;

pub const HANDSHAKE: u32 = 0;
pub const SCAN_DIR: u32 = 1;
pub const REQUEST_DOWNLOAD: u32 = 2;

/// Exchanged in both directions as the first request on a control connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub version: u32,
    pub file_separator: String,
}

impl Handshake {
    pub fn local() -> Self {
        Self {
            version: PROTOCOL_VERSION,
            file_separator: std::path::MAIN_SEPARATOR.to_string(),
        }
    }

    pub fn is_compatible(&self) -> bool {
        self.version == PROTOCOL_VERSION
    }
}

/// Ask the sharing side for the contents of a directory under its root.
/// An empty path means the root itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanDirRequest {
    pub path: String,
}

/// Ask the sharing side to start serving one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRequest {
    pub path: String,
}

/// Sent once the transfer listener is bound and ready for connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadOffer {
    pub file: FileDescriptor,
    pub port: u16,
}
