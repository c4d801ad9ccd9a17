//! File access for the transfer engine.
//!
//! All frame workers share one open handle. Positional operations take the
//! handle's lock for the whole seek + read/write, so no worker can move the
//! cursor out from under another.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use bytes::{Bytes, BytesMut};
use md5::{Digest, Md5};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::debug;

use sluice_types::FileDescriptor;
use sluice_types::models::CONTENT_HASH_LEN;

/// Read block used when hashing (4 MB).
const HASH_BLOCK: usize = 4 * 1024 * 1024;

/// One file handle shared by concurrent workers.
pub struct SharedFile {
    file: Mutex<File>,
    path: PathBuf,
}

impl SharedFile {
    pub async fn open_read(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).await?;
        Ok(Self {
            file: Mutex::new(file),
            path,
        })
    }

    /// Create or truncate the file, then extend it to `len` bytes.
    pub async fn create_sized(path: impl AsRef<Path>, len: u64) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .await?;
        file.set_len(len).await?;
        debug!("allocated {} ({} bytes)", path.display(), len);
        Ok(Self {
            file: Mutex::new(file),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read exactly `len` bytes starting at `offset`.
    pub async fn read_at(&self, offset: u64, len: usize) -> std::io::Result<Bytes> {
        let mut buf = BytesMut::zeroed(len);
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;
        file.read_exact(&mut buf).await?;
        Ok(buf.freeze())
    }

    /// Write all of `data` at `offset`.
    pub async fn write_at(&self, offset: u64, data: &[u8]) -> std::io::Result<()> {
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await
    }

    pub async fn len(&self) -> std::io::Result<u64> {
        Ok(self.file.lock().await.metadata().await?.len())
    }

    /// Flush and fsync.
    pub async fn sync(&self) -> std::io::Result<()> {
        let mut file = self.file.lock().await;
        file.flush().await?;
        file.sync_all().await
    }
}

/// What a path offers as a transfer source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceCheck {
    Ready(u64),
    Missing,
    Directory,
    Empty,
}

pub async fn check_source(path: impl AsRef<Path>) -> std::io::Result<SourceCheck> {
    let metadata = match fs::metadata(path).await {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(SourceCheck::Missing),
        Err(e) => return Err(e),
    };
    if metadata.is_dir() {
        return Ok(SourceCheck::Directory);
    }
    match metadata.len() {
        0 => Ok(SourceCheck::Empty),
        len => Ok(SourceCheck::Ready(len)),
    }
}

/// MD5 of the whole file.
pub async fn content_hash(path: impl AsRef<Path>) -> std::io::Result<[u8; CONTENT_HASH_LEN]> {
    let mut file = File::open(path).await?;
    let mut hasher = Md5::new();
    let mut buf = vec![0u8; HASH_BLOCK];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let digest = hasher.finalize();
    let mut hash = [0u8; CONTENT_HASH_LEN];
    hash.copy_from_slice(&digest);
    Ok(hash)
}

/// Build the descriptor for a file on disk.
pub async fn describe(
    path: impl AsRef<Path>,
    relative_path: impl Into<String>,
) -> std::io::Result<FileDescriptor> {
    let path = path.as_ref();
    let metadata = fs::metadata(path).await?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(FileDescriptor {
        name,
        relative_path: relative_path.into(),
        size: metadata.len(),
        content_hash: content_hash(path).await?,
    })
}
