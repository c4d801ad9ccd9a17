//! Client role: issue typed requests and route correlated replies back to
//! their callbacks.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::connection::ConnectionTask;
use crate::error::MuxError;
use crate::mux::message::{MessageKind, MuxMessage};

/// Receives the outcome of one request. Exactly one method is called.
pub trait RequestCallback<T>: Send + 'static {
    fn on_success(self: Box<Self>, message_type: u32, correlation_id: u64, payload: T);
    fn on_fail(self: Box<Self>, error: MuxError);
}

type Resolver = Box<dyn FnOnce(Result<Bytes, MuxError>) + Send>;

struct PendingRequest {
    message_type: u32,
    deadline: Instant,
    /// Decodes the reply payload and hands it to the caller's callback.
    resolve: Resolver,
    timer: AbortHandle,
}

#[derive(Clone)]
pub struct ClientRole {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    task: Arc<ConnectionTask>,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingRequest>>,
    timeout: Duration,
}

impl ClientRole {
    pub(crate) fn new(task: Arc<ConnectionTask>, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                task,
                next_id: AtomicU64::new(1),
                pending: Mutex::new(HashMap::new()),
                timeout,
            }),
        }
    }

    /// Send a request without waiting for the reply. Must be called from
    /// within a Tokio runtime.
    pub fn request<Req, Resp, C>(&self, message_type: u32, request: &Req, callback: C)
    where
        Req: Serialize,
        Resp: DeserializeOwned + Send + 'static,
        C: RequestCallback<Resp>,
    {
        let callback = Box::new(callback);
        let payload = match serde_json::to_vec(request) {
            Ok(p) => Bytes::from(p),
            Err(e) => {
                callback.on_fail(e.into());
                return;
            }
        };

        let correlation_id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let resolve: Resolver = Box::new(move |result| {
            let decoded = result.and_then(|bytes| {
                serde_json::from_slice::<Resp>(&bytes).map_err(MuxError::from)
            });
            match decoded {
                Ok(value) => callback.on_success(message_type, correlation_id, value),
                Err(e) => callback.on_fail(e),
            }
        });

        let deadline = Instant::now() + self.inner.timeout;
        {
            // Register before writing so a fast reply always finds its entry.
            // The timer takes the same lock, so it cannot fire before the insert.
            let mut pending = self.inner.pending.lock();
            let inner = self.inner.clone();
            let timer = tokio::spawn(async move {
                tokio::time::sleep_until(deadline).await;
                inner.complete(correlation_id, Err(MuxError::Timeout));
            });
            pending.insert(
                correlation_id,
                PendingRequest {
                    message_type,
                    deadline,
                    resolve,
                    timer: timer.abort_handle(),
                },
            );
        }

        let frame = MuxMessage {
            kind: MessageKind::Request,
            message_type,
            correlation_id,
            payload,
        }
        .encode();
        let inner = self.inner.clone();
        tokio::spawn(async move {
            if let Err(e) = inner.task.write_frame(&frame).await {
                inner.complete(correlation_id, Err(e.into()));
            }
        });
    }

    /// Awaitable form of `request`.
    pub async fn request_async<Req, Resp>(
        &self,
        message_type: u32,
        request: &Req,
    ) -> Result<Resp, MuxError>
    where
        Req: Serialize,
        Resp: DeserializeOwned + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.request(message_type, request, OneshotCallback(tx));
        rx.await
            .map_err(|_| MuxError::Disconnected("request dropped".into()))?
    }

    /// Number of requests still waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Route an inbound response or error frame to its pending request.
    pub(crate) fn deliver(&self, message: MuxMessage) {
        let result = match message.kind {
            MessageKind::Response => Ok(message.payload),
            MessageKind::Error => Err(MuxError::Remote(
                String::from_utf8_lossy(&message.payload).into_owned(),
            )),
            MessageKind::Request => return,
        };
        if !self.inner.complete(message.correlation_id, result) {
            debug!(
                "reply for unknown request {} (type {}), dropping",
                message.correlation_id, message.message_type
            );
        }
    }

    /// Fail every pending request.
    pub(crate) fn fail_all(&self, reason: &str) {
        let drained: Vec<(u64, PendingRequest)> = self.inner.pending.lock().drain().collect();
        if !drained.is_empty() {
            warn!("failing {} pending requests: {}", drained.len(), reason);
        }
        for (_, pending) in drained {
            pending.timer.abort();
            (pending.resolve)(Err(MuxError::Disconnected(reason.to_string())));
        }
    }
}

impl ClientInner {
    /// Remove and resolve one pending request. Returns false if it was
    /// already gone.
    fn complete(&self, correlation_id: u64, result: Result<Bytes, MuxError>) -> bool {
        let Some(pending) = self.pending.lock().remove(&correlation_id) else {
            return false;
        };
        pending.timer.abort();
        if let Err(MuxError::Timeout) = &result {
            warn!(
                "request {} (type {}) timed out at {:?}",
                correlation_id, pending.message_type, pending.deadline
            );
        }
        (pending.resolve)(result);
        true
    }
}

struct OneshotCallback<T>(oneshot::Sender<Result<T, MuxError>>);

impl<T: Send + 'static> RequestCallback<T> for OneshotCallback<T> {
    fn on_success(self: Box<Self>, _message_type: u32, _correlation_id: u64, payload: T) {
        let _ = self.0.send(Ok(payload));
    }

    fn on_fail(self: Box<Self>, error: MuxError) {
        let _ = self.0.send(Err(error));
    }
}
