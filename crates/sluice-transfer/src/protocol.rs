/// Transfer request preamble, sent by the client on every frame connection.
///
/// Layout (big-endian):
///   [0..16]   Content hash (MD5 of the whole file)
///   [16..24]  Range start (i64)
///   [24..32]  Range end, exclusive (i64)
///   [32..]    Server → client: the raw bytes of [start, end)
///
/// The hash is an integrity tag that makes sure both sides mean the same
/// file instance. It is not an authentication mechanism.
use sluice_types::models::CONTENT_HASH_LEN;

use crate::error::TransferError;
use crate::planner::Frame;

pub const PREAMBLE_LEN: usize = CONTENT_HASH_LEN + 8 + 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preamble {
    pub content_hash: [u8; CONTENT_HASH_LEN],
    pub start: i64,
    pub end: i64,
}

impl Preamble {
    pub fn for_frame(content_hash: [u8; CONTENT_HASH_LEN], frame: Frame) -> Self {
        Preamble {
            content_hash,
            start: frame.start as i64,
            end: frame.end as i64,
        }
    }

    pub fn encode(&self) -> [u8; PREAMBLE_LEN] {
        let mut buf = [0u8; PREAMBLE_LEN];
        buf[0..16].copy_from_slice(&self.content_hash);
        buf[16..24].copy_from_slice(&self.start.to_be_bytes());
        buf[24..32].copy_from_slice(&self.end.to_be_bytes());
        buf
    }

    /// Parse a preamble. Returns None if the buffer is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < PREAMBLE_LEN {
            return None;
        }
        let mut content_hash = [0u8; CONTENT_HASH_LEN];
        content_hash.copy_from_slice(&buf[0..16]);
        let start = i64::from_be_bytes(buf[16..24].try_into().ok()?);
        let end = i64::from_be_bytes(buf[24..32].try_into().ok()?);
        Some(Preamble {
            content_hash,
            start,
            end,
        })
    }

    /// Check the request against the file being served.
    pub fn validate(
        &self,
        expected_hash: &[u8; CONTENT_HASH_LEN],
        total_size: u64,
    ) -> Result<Frame, TransferError> {
        if &self.content_hash != expected_hash {
            return Err(TransferError::ProtocolMismatch(format!(
                "content hash {} does not match {}",
                hex::encode(self.content_hash),
                hex::encode(expected_hash)
            )));
        }
        if self.start < 0 || self.start >= self.end || self.end as u64 > total_size {
            return Err(TransferError::ProtocolMismatch(format!(
                "invalid range [{}, {}) for file of {} bytes",
                self.start, self.end, total_size
            )));
        }
        Ok(Frame {
            start: self.start as u64,
            end: self.end as u64,
        })
    }
}
