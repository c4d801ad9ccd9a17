//! Fetching side: handshake, list the shared root, then download files one
//! at a time.

use std::net::SocketAddr;
use std::path::{Component, Path};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use tracing::info;

use sluice_net::{ConnectionKind, ConnectionTask, Endpoint};
use sluice_transfer::{DownloadReport, TransferClient};
use sluice_types::DirListing;
use sluice_types::explore::{
    DownloadOffer, DownloadRequest, HANDSHAKE, Handshake, REQUEST_DOWNLOAD, SCAN_DIR,
    ScanDirRequest,
};

use crate::config::AppConfig;
use crate::progress::log_every_tenth;

/// Accepts `host`, `host:port`, or an IP literal.
pub async fn resolve(host: &str, default_port: u16) -> Result<SocketAddr> {
    if let Ok(addr) = host.parse::<SocketAddr>() {
        return Ok(addr);
    }
    let addrs: Vec<SocketAddr> = match host.rsplit_once(':') {
        Some((_, port)) if port.parse::<u16>().is_ok() => tokio::net::lookup_host(host)
            .await
            .with_context(|| format!("resolving {}", host))?
            .collect(),
        _ => tokio::net::lookup_host((host, default_port))
            .await
            .with_context(|| format!("resolving {}", host))?
            .collect(),
    };
    addrs
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no address for {}", host))
}

/// A file name sent by the peer, checked to be one plain path component so
/// it cannot point outside the download directory.
fn local_name(name: &str) -> Result<&str> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(part)), None) if part == name => Ok(name),
        _ => bail!("refusing file name {:?} from peer", name),
    }
}

/// Download `only` (or every file in the shared root) into `out`.
pub async fn run(
    server: SocketAddr,
    only: Option<&str>,
    out: &Path,
    config: AppConfig,
) -> Result<Vec<DownloadReport>> {
    let task = ConnectionTask::open(ConnectionKind::Tcp);
    task.connect(server)
        .await
        .with_context(|| format!("connecting to {}", server))?;
    let endpoint = Endpoint::new(Arc::new(task), config.mux);
    let client = endpoint.client();

    let remote: Handshake = client.request_async(HANDSHAKE, &Handshake::local()).await?;
    if !remote.is_compatible() {
        bail!("peer speaks protocol version {}", remote.version);
    }

    let listing: DirListing = client
        .request_async(SCAN_DIR, &ScanDirRequest { path: String::new() })
        .await?;
    info!(
        "{} shares {} file(s) and {} folder(s)",
        server,
        listing.files.len(),
        listing.dirs.len()
    );

    let wanted: Vec<_> = match only {
        Some(name) => vec![
            listing
                .find_file(name)
                .ok_or_else(|| anyhow!("{} does not share {:?}", server, name))?
                .clone(),
        ],
        None => listing.files.clone(),
    };

    let transfer = TransferClient::new(config.transfer);
    let mut reports = Vec::with_capacity(wanted.len());
    for entry in wanted {
        // Nothing to transfer; the sharing side refuses empty sources.
        if entry.size == 0 {
            tokio::fs::create_dir_all(out).await?;
            tokio::fs::write(out.join(local_name(&entry.name)?), b"").await?;
            info!("created empty {}", entry.path);
            continue;
        }

        let offer: DownloadOffer = client
            .request_async(
                REQUEST_DOWNLOAD,
                &DownloadRequest {
                    path: entry.path.clone(),
                },
            )
            .await
            .with_context(|| format!("requesting {}", entry.path))?;

        let dest = out.join(local_name(&offer.file.name)?);
        let source = SocketAddr::new(server.ip(), offer.port);
        let label = format!("fetch {}", offer.file.relative_path);
        let report = transfer
            .download(&offer.file, &dest, source, log_every_tenth(label))
            .await
            .with_context(|| format!("downloading {}", offer.file.relative_path))?;
        info!(
            "saved {} ({} bytes, {} frames, {} retried)",
            dest.display(),
            report.bytes,
            report.frames,
            report.retries
        );
        reports.push(report);
    }

    endpoint.close("fetch finished").await;
    Ok(reports)
}
