/// Multiplexer frame format.
///
/// ```text
/// [0..4]   Message type (u32 BE)
/// [4..12]  Correlation id (u64 BE)
/// [12]     Kind: 0 = request, 1 = response, 2 = error
/// [13..]   Payload (JSON, or a UTF-8 reason for errors)
/// ```
use bytes::{BufMut, Bytes, BytesMut};

/// Header size in bytes.
pub const HEADER_LEN: usize = 13;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Response,
    Error,
}

impl MessageKind {
    fn to_byte(self) -> u8 {
        match self {
            Self::Request => 0,
            Self::Response => 1,
            Self::Error => 2,
        }
    }

    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Request),
            1 => Some(Self::Response),
            2 => Some(Self::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxMessage {
    pub kind: MessageKind,
    pub message_type: u32,
    pub correlation_id: u64,
    pub payload: Bytes,
}

impl MuxMessage {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u32(self.message_type);
        buf.put_u64(self.correlation_id);
        buf.put_u8(self.kind.to_byte());
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    /// Parse a frame. Returns None if it is too short or the kind is unknown.
    pub fn decode(mut frame: Bytes) -> Option<Self> {
        if frame.len() < HEADER_LEN {
            return None;
        }
        let message_type = u32::from_be_bytes(frame[0..4].try_into().ok()?);
        let correlation_id = u64::from_be_bytes(frame[4..12].try_into().ok()?);
        let kind = MessageKind::from_byte(frame[12])?;
        let payload = frame.split_off(HEADER_LEN);
        Some(MuxMessage {
            kind,
            message_type,
            correlation_id,
            payload,
        })
    }
}
