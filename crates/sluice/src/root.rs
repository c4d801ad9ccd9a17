use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

use anyhow::{Result, bail};
use tokio::fs;
use tracing::{debug, info};

use sluice_types::{DirListing, FileEntry};

/// The directory (or single file) a peer exposes.
///
/// Every path coming from the wire is relative to the root and
/// `/`-separated. Paths that would leave the root are refused.
pub struct SharedRoot {
    dir: PathBuf,
    /// Set when a single file is shared: only this name is visible.
    only: Option<String>,
}

impl SharedRoot {
    pub async fn open(path: &Path) -> Result<Self> {
        let path = fs::canonicalize(path).await?;
        let metadata = fs::metadata(&path).await?;
        let root = if metadata.is_dir() {
            Self {
                dir: path,
                only: None,
            }
        } else {
            let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                bail!("cannot share {}", path.display());
            };
            let Some(dir) = path.parent().map(Path::to_path_buf) else {
                bail!("cannot share {}", path.display());
            };
            Self {
                dir,
                only: Some(name),
            }
        };
        info!("sharing {}", root.dir.display());
        Ok(root)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Map a wire path onto the filesystem, or `None` if it escapes the root.
    pub fn resolve(&self, relative: &str) -> Option<PathBuf> {
        let parts = normalize(relative)?;
        if let Some(only) = &self.only {
            if !(parts.is_empty() || parts == [only.as_str()]) {
                return None;
            }
        }
        let mut path = self.dir.clone();
        path.extend(parts);
        Some(path)
    }

    /// List one directory under the root.
    pub async fn scan(&self, relative: &str) -> Result<DirListing> {
        let Some(parts) = normalize(relative) else {
            bail!("invalid path {:?}", relative);
        };
        if self.only.is_some() && !parts.is_empty() {
            bail!("no such directory {:?}", relative);
        }
        let base = parts.join("/");
        let mut dir_path = self.dir.clone();
        dir_path.extend(&parts);

        let mut listing = DirListing {
            path: base.clone(),
            ..Default::default()
        };
        let mut entries = fs::read_dir(&dir_path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if self.only.as_deref().is_some_and(|only| only != name) {
                continue;
            }
            let metadata = match entry.metadata().await {
                Ok(m) => m,
                Err(e) => {
                    debug!("skipping {}: {}", entry.path().display(), e);
                    continue;
                }
            };
            let item = FileEntry {
                path: if base.is_empty() {
                    name.clone()
                } else {
                    format!("{}/{}", base, name)
                },
                name,
                size: if metadata.is_dir() { 0 } else { metadata.len() },
                modified: metadata
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_secs()),
            };
            if metadata.is_dir() {
                listing.dirs.push(item);
            } else {
                listing.files.push(item);
            }
        }

        listing.dirs.sort_by(|a, b| a.name.cmp(&b.name));
        listing.files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(listing)
    }
}

/// Split a wire path into plain components. `None` for `..`, absolute paths
/// and anything else that is not a plain name.
fn normalize(relative: &str) -> Option<Vec<&str>> {
    let mut parts = Vec::new();
    for part in relative.split('/') {
        if part.is_empty() || part == "." {
            continue;
        }
        let mut components = Path::new(part).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => parts.push(part),
            _ => return None,
        }
    }
    Some(parts)
}
