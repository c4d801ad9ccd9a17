/// Sluice networking primitives.
///
/// - `ConnectionTask`: one TCP stream or UDP socket with an observable
///   `Connecting -> Connected -> Disconnected` lifecycle and exact-size I/O
/// - `mux`: typed request/response exchanges multiplexed over one task,
///   with independently attachable client and server roles

pub mod connection;
pub mod error;
pub mod mux;

pub use connection::{ConnectionKind, ConnectionState, ConnectionTask, DEFAULT_MAX_FRAME_SIZE};
pub use error::{ConnectionError, MuxError};
pub use mux::{ClientRole, Endpoint, MuxConfig, RequestCallback, Responder, ServerRole};
