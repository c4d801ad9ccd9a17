//! Sharing side: answers control requests and serves requested files.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use sluice_net::{ConnectionTask, Endpoint, MuxConfig, Responder, ServerRole};
use sluice_transfer::{
    ServeOutcome, SourceCheck, TransferConfig, TransferError, TransferServer, check_source,
    describe,
};
use sluice_types::explore::{
    DownloadOffer, DownloadRequest, HANDSHAKE, Handshake, REQUEST_DOWNLOAD, SCAN_DIR,
    ScanDirRequest,
};

use crate::config::AppConfig;
use crate::progress::log_every_tenth;
use crate::root::SharedRoot;

/// Pause after a failed accept, e.g. when the process is out of descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct ShareState {
    root: SharedRoot,
    bind_ip: IpAddr,
    transfer: TransferConfig,
}

pub async fn run(path: &Path, bind_ip: IpAddr, config: AppConfig) -> Result<()> {
    let state = Arc::new(ShareState::new(
        SharedRoot::open(path).await?,
        bind_ip,
        config.transfer,
    ));
    let listener = TcpListener::bind(SocketAddr::new(bind_ip, config.control_port)).await?;
    info!("control service listening on {}", listener.local_addr()?);

    tokio::select! {
        _ = serve_control(listener, state, config.mux) => {}
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C, shutting down..."),
    }
    Ok(())
}

/// Accept control connections until the listener fails.
pub async fn serve_control(listener: TcpListener, state: Arc<ShareState>, mux: MuxConfig) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("control accept error: {}", e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };
        let state = state.clone();
        tokio::spawn(async move {
            let task = match ConnectionTask::from_tcp(stream) {
                Ok(task) => Arc::new(task),
                Err(e) => {
                    warn!("control connection {} failed: {}", peer, e);
                    return;
                }
            };
            info!("control connection from {}", peer);
            let endpoint = Endpoint::new(task.clone(), mux);
            state.install(&endpoint.server(), &task);

            let reason = task.closed().await;
            info!("control connection {} closed: {}", peer, reason);
        });
    }
}

impl ShareState {
    pub fn new(root: SharedRoot, bind_ip: IpAddr, transfer: TransferConfig) -> Self {
        Self {
            root,
            bind_ip,
            transfer,
        }
    }

    fn install(self: &Arc<Self>, server: &ServerRole, control: &Arc<ConnectionTask>) {
        server.register_handler(HANDSHAKE, |remote: Handshake, responder: Responder| async move {
            if remote.is_compatible() {
                respond(responder, Ok(Handshake::local())).await;
            } else {
                let reason = format!("unsupported protocol version {}", remote.version);
                respond::<Handshake>(responder, Err(anyhow::anyhow!(reason))).await;
            }
        });

        let state = self.clone();
        server.register_handler(SCAN_DIR, move |request: ScanDirRequest, responder: Responder| {
            let state = state.clone();
            async move {
                respond(responder, state.root.scan(&request.path).await).await;
            }
        });

        let state = self.clone();
        let control = control.clone();
        server.register_handler(
            REQUEST_DOWNLOAD,
            move |request: DownloadRequest, responder: Responder| {
                let state = state.clone();
                let control = control.clone();
                async move {
                    respond(responder, state.offer(&request.path, control).await).await;
                }
            },
        );
    }

    /// Bind a transfer server for one file and start serving it. The
    /// listener is bound before the offer goes out, and is dropped with any
    /// open transfer connections once `control` closes.
    async fn offer(&self, relative: &str, control: Arc<ConnectionTask>) -> Result<DownloadOffer> {
        let Some(path) = self.root.resolve(relative) else {
            bail!("invalid path {:?}", relative);
        };
        match check_source(&path).await? {
            SourceCheck::Ready(_) => {}
            other => bail!("{:?} cannot be downloaded: {:?}", relative, other),
        }

        let file = describe(&path, relative).await?;
        let server = self.bind_transfer().await?;
        let port = server.local_addr()?.port();
        info!(
            "offering {} ({} bytes) on port {}",
            file.relative_path, file.size, port
        );

        let descriptor = file.clone();
        tokio::spawn(async move {
            let label = format!("serve {}", descriptor.relative_path);
            let outcome = tokio::select! {
                outcome = server.serve(&descriptor, &path, log_every_tenth(label)) => outcome,
                reason = control.closed() => {
                    info!(
                        "dropping transfer of {}: control connection closed: {}",
                        descriptor.relative_path, reason
                    );
                    return;
                }
            };
            match outcome {
                Ok(ServeOutcome::Completed { bytes, connections }) => info!(
                    "served {} ({} bytes over {} connections)",
                    descriptor.relative_path, bytes, connections
                ),
                Ok(ServeOutcome::Skipped(reason)) => warn!("skipped {}", reason),
                Err(e) => error!("serving {} failed: {}", descriptor.relative_path, e),
            }
        });

        Ok(DownloadOffer { file, port })
    }

    /// Bind the configured transfer port, or an ephemeral one if it is taken
    /// by a transfer still in flight.
    async fn bind_transfer(&self) -> Result<TransferServer, TransferError> {
        let addr = SocketAddr::new(self.bind_ip, self.transfer.port);
        match TransferServer::bind(addr, self.transfer).await {
            Err(TransferError::Io(e))
                if e.kind() == std::io::ErrorKind::AddrInUse && self.transfer.port != 0 =>
            {
                debug!("transfer port {} busy, using an ephemeral port", self.transfer.port);
                TransferServer::bind(SocketAddr::new(self.bind_ip, 0), self.transfer).await
            }
            other => other,
        }
    }
}

async fn respond<T: Serialize>(responder: Responder, result: Result<T>) {
    let message_type = responder.message_type();
    let sent = match result {
        Ok(value) => responder.reply(&value).await,
        Err(e) => {
            warn!("request type {} failed: {:#}", message_type, e);
            responder.reject(format!("{:#}", e)).await
        }
    };
    if let Err(e) = sent {
        debug!("reply for type {} not sent: {}", message_type, e);
    }
}
