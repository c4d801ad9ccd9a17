//! Server role: dispatch inbound requests to per-type handlers.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::connection::ConnectionTask;
use crate::error::MuxError;
use crate::mux::message::{MessageKind, MuxMessage};

type BoxedHandler = Arc<dyn Fn(Bytes, Responder) -> BoxFuture<'static, ()> + Send + Sync>;

/// Sends the correlated reply for one inbound request.
pub struct Responder {
    task: Arc<ConnectionTask>,
    message_type: u32,
    correlation_id: u64,
}

impl Responder {
    pub fn message_type(&self) -> u32 {
        self.message_type
    }

    pub fn correlation_id(&self) -> u64 {
        self.correlation_id
    }

    pub async fn reply<T: Serialize>(self, response: &T) -> Result<(), MuxError> {
        let payload = Bytes::from(serde_json::to_vec(response)?);
        self.send(MessageKind::Response, payload).await
    }

    /// Fail the caller's request with a reason.
    pub async fn reject(self, reason: impl Into<String>) -> Result<(), MuxError> {
        self.send(MessageKind::Error, Bytes::from(reason.into())).await
    }

    async fn send(self, kind: MessageKind, payload: Bytes) -> Result<(), MuxError> {
        let frame = MuxMessage {
            kind,
            message_type: self.message_type,
            correlation_id: self.correlation_id,
            payload,
        }
        .encode();
        self.task.write_frame(&frame).await?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct ServerRole {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    task: Arc<ConnectionTask>,
    handlers: RwLock<HashMap<u32, BoxedHandler>>,
}

impl ServerRole {
    pub(crate) fn new(task: Arc<ConnectionTask>) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                task,
                handlers: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Install the handler for `message_type`, replacing any existing one.
    pub fn register_handler<Req, F, Fut>(&self, message_type: u32, handler: F)
    where
        Req: DeserializeOwned + Send + 'static,
        F: Fn(Req, Responder) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let boxed: BoxedHandler = Arc::new(move |payload: Bytes, responder: Responder| {
            let handler = handler.clone();
            async move {
                match serde_json::from_slice::<Req>(&payload) {
                    Ok(request) => handler(request, responder).await,
                    Err(e) => {
                        warn!("malformed request for type {}: {}", responder.message_type, e);
                        let _ = responder.reject(format!("malformed request: {}", e)).await;
                    }
                }
            }
            .boxed()
        });

        if self.inner.handlers.write().insert(message_type, boxed).is_some() {
            debug!("replaced handler for type {}", message_type);
        }
    }

    pub fn unregister_handler(&self, message_type: u32) -> bool {
        self.inner.handlers.write().remove(&message_type).is_some()
    }

    pub fn clear_all(&self) {
        self.inner.handlers.write().clear();
    }

    pub fn has_handler(&self, message_type: u32) -> bool {
        self.inner.handlers.read().contains_key(&message_type)
    }

    /// Run the handler for an inbound request on its own task.
    pub(crate) fn dispatch(&self, message: MuxMessage) {
        let handler = self.inner.handlers.read().get(&message.message_type).cloned();
        let responder = responder_for(&self.inner.task, &message);
        match handler {
            Some(handler) => {
                tokio::spawn(handler(message.payload, responder));
            }
            None => {
                reject_unhandled(responder);
            }
        }
    }
}

/// Answer a request nobody can handle so the caller fails fast instead of
/// waiting for its deadline.
pub(crate) fn reject_unhandled(responder: Responder) {
    tokio::spawn(async move {
        let reason = format!("no handler for type {}", responder.message_type);
        debug!("{}", reason);
        let _ = responder.reject(reason).await;
    });
}

pub(crate) fn responder_for(task: &Arc<ConnectionTask>, message: &MuxMessage) -> Responder {
    Responder {
        task: task.clone(),
        message_type: message.message_type,
        correlation_id: message.correlation_id,
    }
}
