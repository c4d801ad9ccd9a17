use serde::{Deserialize, Serialize};

/// Length of the content hash carried in every transfer preamble.
pub const CONTENT_HASH_LEN: usize = 16;

/// Identifies the exact file instance being transferred.
///
/// Negotiated once over the control connection and read-only afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub name: String,
    /// Path relative to the shared root, `/`-separated.
    pub relative_path: String,
    pub size: u64,
    pub content_hash: [u8; CONTENT_HASH_LEN],
}

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    /// Zero for directories.
    pub size: u64,
    /// Seconds since the Unix epoch, when the platform reports it.
    pub modified: Option<u64>,
}

/// Contents of one shared directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirListing {
    pub path: String,
    pub dirs: Vec<FileEntry>,
    pub files: Vec<FileEntry>,
}

impl DirListing {
    pub fn find_file(&self, name: &str) -> Option<&FileEntry> {
        self.files.iter().find(|f| f.name == name)
    }
}
