//! Transfer client: downloads one file as a set of frames fetched in parallel.
//!
//! Every frame gets its own TCP connection and worker task. A worker that
//! fails is retried once from the frame's start offset. If the retry fails
//! too, the remaining workers are cancelled and the download fails.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinSet;
use tracing::warn;

use sluice_net::{ConnectionKind, ConnectionTask};
use sluice_types::FileDescriptor;

use crate::config::TransferConfig;
use crate::error::TransferError;
use crate::file::SharedFile;
use crate::logging::{TracingLogger, TransferEvent, TransferLog, TransferLogger};
use crate::planner::{Frame, plan};
use crate::progress::TransferProgress;
use crate::protocol::Preamble;

const COMPONENT: &str = "client";

/// Summary of a finished download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadReport {
    pub frames: usize,
    pub bytes: u64,
    /// Frames that needed their second attempt.
    pub retries: u32,
}

pub struct TransferClient {
    config: TransferConfig,
    logger: Arc<dyn TransferLogger>,
}

impl TransferClient {
    pub fn new(config: TransferConfig) -> Self {
        Self {
            config,
            logger: Arc::new(TracingLogger),
        }
    }

    pub fn with_logger(mut self, logger: Arc<dyn TransferLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Download `descriptor` from `server` into `dest`.
    ///
    /// `dest` is created (or truncated) and sized up front. `on_progress`
    /// receives `(bytes_completed, total_size)` after every unit written.
    pub async fn download<F>(
        &self,
        descriptor: &FileDescriptor,
        dest: impl AsRef<Path>,
        server: SocketAddr,
        on_progress: F,
    ) -> Result<DownloadReport, TransferError>
    where
        F: Fn(u64, u64) + Send + Sync + 'static,
    {
        let started = Instant::now();
        let total = descriptor.size;
        let file = SharedFile::create_sized(dest, total).await?;

        let frames: Vec<Frame> = plan(
            total,
            self.config.min_frame_size,
            self.config.max_connections,
        )
        .into_iter()
        .filter(|frame| frame.start < total)
        .collect();

        let ctx = Arc::new(FetchContext {
            file,
            server,
            content_hash: descriptor.content_hash,
            unit: self.config.transfer_unit_size.max(1),
            progress: TransferProgress::new(total, Arc::new(on_progress)),
            logger: self.logger.clone(),
        });

        let mut workers = JoinSet::new();
        for frame in &frames {
            let ctx = ctx.clone();
            let frame = *frame;
            workers.spawn(async move { ctx.fetch_with_retry(frame).await });
        }

        let mut retries = 0;
        while let Some(joined) = workers.join_next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) if e.is_cancelled() => Err(TransferError::Cancelled),
                Err(e) => Err(TransferError::Io(std::io::Error::other(format!(
                    "frame worker panicked: {}",
                    e
                )))),
            };
            match outcome {
                Ok(retried) => retries += retried as u32,
                Err(e) => {
                    ctx.log(TransferEvent::Error {
                        message: e.to_string(),
                    });
                    workers.shutdown().await;
                    return Err(e);
                }
            }
        }

        ctx.file.sync().await?;
        ctx.log(TransferEvent::DownloadComplete {
            total_bytes: total,
            frames: frames.len(),
            retries,
            duration_ms: started.elapsed().as_millis() as u64,
        });

        Ok(DownloadReport {
            frames: frames.len(),
            bytes: ctx.progress.completed(),
            retries,
        })
    }
}

/// Download one file with a client built from `config`.
pub async fn start_client<F>(
    descriptor: &FileDescriptor,
    dest: impl AsRef<Path>,
    server: SocketAddr,
    config: TransferConfig,
    on_progress: F,
) -> Result<DownloadReport, TransferError>
where
    F: Fn(u64, u64) + Send + Sync + 'static,
{
    TransferClient::new(config)
        .download(descriptor, dest, server, on_progress)
        .await
}

struct FetchContext {
    file: SharedFile,
    server: SocketAddr,
    content_hash: [u8; 16],
    unit: usize,
    progress: TransferProgress,
    logger: Arc<dyn TransferLogger>,
}

impl FetchContext {
    fn log(&self, event: TransferEvent) {
        self.logger.log(TransferLog {
            component: COMPONENT,
            content_hash: self.content_hash,
            event,
        });
    }

    /// Returns whether the frame needed its retry.
    async fn fetch_with_retry(&self, frame: Frame) -> Result<bool, TransferError> {
        let first = match self.fetch(frame, 1).await {
            Ok(()) => return Ok(false),
            Err(e) => e,
        };
        self.log(TransferEvent::FrameRetry {
            start: frame.start,
            end: frame.end,
            reason: first.to_string(),
        });

        match self.fetch(frame, 2).await {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!(
                    "frame [{}, {}) failed twice: first={} second={}",
                    frame.start, frame.end, first, e
                );
                Err(TransferError::FrameFailed {
                    start: frame.start,
                    end: frame.end,
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn fetch(&self, frame: Frame, attempt: u32) -> Result<(), TransferError> {
        let started = Instant::now();
        self.log(TransferEvent::FrameStarted {
            start: frame.start,
            end: frame.end,
            attempt,
        });

        let conn = ConnectionTask::open(ConnectionKind::Tcp);
        conn.connect(self.server).await?;
        conn.write_exactly(&Preamble::for_frame(self.content_hash, frame).encode())
            .await?;

        let mut offset = frame.start;
        while offset < frame.end {
            let len = (frame.end - offset).min(self.unit as u64) as usize;
            let chunk = conn.read_exactly(len).await?;
            self.file.write_at(offset, &chunk).await?;
            self.progress.record(offset, len as u64);
            offset += len as u64;
        }
        conn.close("frame complete").await;

        self.log(TransferEvent::FrameComplete {
            start: frame.start,
            end: frame.end,
            duration_ms: started.elapsed().as_millis() as u64,
        });
        Ok(())
    }
}
