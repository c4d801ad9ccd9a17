//! Transfer server: serves arbitrary byte ranges of one file to any number of
//! concurrent connections.
//!
//! Per connection:
//!   1. read the 32-byte preamble (hash, start, end)
//!   2. reject and close on hash mismatch or a bad range
//!   3. stream `[start, end)` in transfer units
//!
//! The accept loop and every handler are cancelled together as soon as each
//! byte of the file has been served at least once.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use sluice_net::ConnectionTask;
use sluice_types::FileDescriptor;

use crate::config::TransferConfig;
use crate::error::TransferError;
use crate::file::{SharedFile, SourceCheck, check_source};
use crate::logging::{TracingLogger, TransferEvent, TransferLog, TransferLogger};
use crate::progress::TransferProgress;
use crate::protocol::{PREAMBLE_LEN, Preamble};

const COMPONENT: &str = "server";

/// Pause after a failed accept, e.g. when the process is out of descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServeOutcome {
    Completed { bytes: u64, connections: u64 },
    /// Source was missing, a directory, or empty. Nothing was served.
    Skipped(String),
}

pub struct TransferServer {
    listener: TcpListener,
    config: TransferConfig,
    logger: Arc<dyn TransferLogger>,
}

impl TransferServer {
    /// Bind the transfer listener with `SO_REUSEADDR` and a backlog of
    /// `max_connections`.
    pub async fn bind(addr: SocketAddr, config: TransferConfig) -> Result<Self, TransferError> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(config.max_connections.clamp(1, i32::MAX as usize) as i32)?;
        let std_listener: std::net::TcpListener = socket.into();
        let listener = TcpListener::from_std(std_listener)?;

        Ok(Self {
            listener,
            config,
            logger: Arc::new(TracingLogger),
        })
    }

    pub fn with_logger(mut self, logger: Arc<dyn TransferLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve `source` until every byte of it has been sent at least once.
    pub async fn serve<F>(
        self,
        descriptor: &FileDescriptor,
        source: impl AsRef<Path>,
        on_progress: F,
    ) -> Result<ServeOutcome, TransferError>
    where
        F: Fn(u64, u64) + Send + Sync + 'static,
    {
        let source = source.as_ref();
        let size = match check_source(source).await? {
            SourceCheck::Ready(size) => size,
            other => {
                let reason = format!("{}: {:?}", source.display(), other);
                info!("nothing to serve for {}", reason);
                return Ok(ServeOutcome::Skipped(reason));
            }
        };
        if size != descriptor.size {
            return Err(TransferError::InvalidSource(format!(
                "{} is {} bytes, descriptor says {}",
                source.display(),
                size,
                descriptor.size
            )));
        }

        let started = Instant::now();
        let ctx = Arc::new(ServeContext {
            file: SharedFile::open_read(source).await?,
            content_hash: descriptor.content_hash,
            total: descriptor.size,
            unit: self.config.transfer_unit_size.max(1),
            progress: TransferProgress::new(descriptor.size, Arc::new(on_progress)),
            finished: Notify::new(),
            logger: self.logger.clone(),
        });
        ctx.log(TransferEvent::Listening {
            bind_addr: self.listener.local_addr()?,
        });

        let mut handlers = JoinSet::new();
        let mut connections: u64 = 0;
        loop {
            tokio::select! {
                biased;
                _ = ctx.finished.notified() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        connections += 1;
                        let ctx = ctx.clone();
                        handlers.spawn(async move {
                            if let Err(e) = ctx.handle(stream, peer).await {
                                if !matches!(e, TransferError::ProtocolMismatch(_)) {
                                    ctx.log(TransferEvent::ConnectionFailed {
                                        peer,
                                        message: e.to_string(),
                                    });
                                }
                            }
                        });
                    }
                    Err(e) => {
                        error!("transfer accept error: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                Some(joined) = handlers.join_next(), if !handlers.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            warn!("transfer handler panicked: {}", e);
                        }
                    }
                }
            }
        }

        // Cancels in-flight handlers; their locks and sockets are released
        // as the futures drop.
        handlers.shutdown().await;

        ctx.log(TransferEvent::ServeComplete {
            total_bytes: ctx.total,
            connections,
            duration_ms: started.elapsed().as_millis() as u64,
        });
        Ok(ServeOutcome::Completed {
            bytes: ctx.total,
            connections,
        })
    }
}

/// Bind `bind_addr` and serve one file to completion.
pub async fn start_server<F>(
    descriptor: &FileDescriptor,
    source: impl AsRef<Path>,
    bind_addr: SocketAddr,
    config: TransferConfig,
    on_progress: F,
) -> Result<ServeOutcome, TransferError>
where
    F: Fn(u64, u64) + Send + Sync + 'static,
{
    TransferServer::bind(bind_addr, config)
        .await?
        .serve(descriptor, source, on_progress)
        .await
}

struct ServeContext {
    file: SharedFile,
    content_hash: [u8; 16],
    total: u64,
    unit: usize,
    progress: TransferProgress,
    finished: Notify,
    logger: Arc<dyn TransferLogger>,
}

impl ServeContext {
    fn log(&self, event: TransferEvent) {
        self.logger.log(TransferLog {
            component: COMPONENT,
            content_hash: self.content_hash,
            event,
        });
    }

    async fn handle(&self, stream: TcpStream, peer: SocketAddr) -> Result<(), TransferError> {
        let conn = ConnectionTask::from_tcp(stream)?;

        let head = conn.read_exactly(PREAMBLE_LEN).await?;
        let preamble = Preamble::decode(&head)
            .ok_or_else(|| TransferError::ProtocolMismatch("short preamble".into()))?;
        let frame = match preamble.validate(&self.content_hash, self.total) {
            Ok(frame) => frame,
            Err(e) => {
                self.log(TransferEvent::RequestRejected {
                    peer,
                    reason: e.to_string(),
                });
                conn.close(e.to_string()).await;
                return Err(e);
            }
        };
        self.log(TransferEvent::RequestAccepted {
            peer,
            start: frame.start,
            end: frame.end,
        });

        let mut offset = frame.start;
        while offset < frame.end {
            let len = (frame.end - offset).min(self.unit as u64) as usize;
            let chunk = self.file.read_at(offset, len).await?;
            conn.write_exactly(&chunk).await?;

            let served = self.progress.record(offset, len as u64);
            offset += len as u64;
            if served >= self.total {
                self.finished.notify_one();
            }
        }

        self.log(TransferEvent::RangeServed {
            peer,
            start: frame.start,
            end: frame.end,
        });
        conn.close("range served").await;
        Ok(())
    }
}
