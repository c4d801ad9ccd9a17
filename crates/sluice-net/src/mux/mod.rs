//! Request/response multiplexing over one `ConnectionTask`.
//!
//! An `Endpoint` owns the single inbound read loop. Requests go to the
//! attached `ServerRole`, responses and errors to the attached `ClientRole`.
//! Either role can be attached or detached at any time without disturbing the
//! other's in-flight state.

mod client;
pub mod message;
mod server;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::ConnectionTask;

pub use client::{ClientRole, RequestCallback};
pub use message::{MessageKind, MuxMessage};
pub use server::{Responder, ServerRole};

/// Default deadline for a multiplexed request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MuxConfig {
    pub request_timeout: Duration,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl MuxConfig {
    /// Read `SLUICE_REQUEST_TIMEOUT_MS`, falling back to the default.
    pub fn from_env() -> Self {
        let request_timeout = std::env::var("SLUICE_REQUEST_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT);
        Self { request_timeout }
    }
}

/// A connection task with client and/or server capabilities attached.
pub struct Endpoint {
    inner: Arc<EndpointInner>,
    reader: JoinHandle<()>,
}

struct EndpointInner {
    task: Arc<ConnectionTask>,
    config: MuxConfig,
    client: RwLock<Option<ClientRole>>,
    server: RwLock<Option<ServerRole>>,
}

impl Endpoint {
    /// Start multiplexing over `task`, which should already be connected.
    pub fn new(task: Arc<ConnectionTask>, config: MuxConfig) -> Self {
        let inner = Arc::new(EndpointInner {
            task,
            config,
            client: RwLock::new(None),
            server: RwLock::new(None),
        });
        let reader = tokio::spawn(read_loop(inner.clone()));
        Self { inner, reader }
    }

    pub fn task(&self) -> &Arc<ConnectionTask> {
        &self.inner.task
    }

    /// The client role, attaching it on first use.
    pub fn client(&self) -> ClientRole {
        let mut slot = self.inner.client.write();
        slot.get_or_insert_with(|| {
            ClientRole::new(self.inner.task.clone(), self.inner.config.request_timeout)
        })
        .clone()
    }

    /// The server role, attaching it on first use.
    pub fn server(&self) -> ServerRole {
        let mut slot = self.inner.server.write();
        slot.get_or_insert_with(|| ServerRole::new(self.inner.task.clone()))
            .clone()
    }

    pub fn has_client(&self) -> bool {
        self.inner.client.read().is_some()
    }

    pub fn has_server(&self) -> bool {
        self.inner.server.read().is_some()
    }

    /// Detach the client role, failing its pending requests.
    pub fn detach_client(&self) {
        let detached = self.inner.client.write().take();
        if let Some(client) = detached {
            client.fail_all("client role detached");
        }
    }

    /// Detach the server role and drop all its handlers.
    pub fn detach_server(&self) {
        let detached = self.inner.server.write().take();
        if let Some(server) = detached {
            server.clear_all();
        }
    }

    pub async fn close(&self, reason: impl Into<String>) {
        self.inner.task.close(reason).await;
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop(inner: Arc<EndpointInner>) {
    let reason = loop {
        let frame = match inner.task.read_frame().await {
            Ok(frame) => frame,
            Err(e) => break e.to_string(),
        };
        let Some(message) = MuxMessage::decode(frame) else {
            warn!("dropping malformed multiplexer frame");
            continue;
        };

        match message.kind {
            MessageKind::Request => {
                let server = inner.server.read().clone();
                match server {
                    Some(server) => server.dispatch(message),
                    None => server::reject_unhandled(server::responder_for(&inner.task, &message)),
                }
            }
            MessageKind::Response | MessageKind::Error => {
                let client = inner.client.read().clone();
                match client {
                    Some(client) => client.deliver(message),
                    None => debug!(
                        "reply {} without a client role, dropping",
                        message.correlation_id
                    ),
                }
            }
        }
    };

    info!("multiplexer read loop ended: {}", reason);
    let client = inner.client.read().clone();
    if let Some(client) = client {
        client.fail_all(&reason);
    }
}
