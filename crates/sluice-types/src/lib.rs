pub mod explore;
pub mod models;

pub use models::{DirListing, FileDescriptor, FileEntry};
