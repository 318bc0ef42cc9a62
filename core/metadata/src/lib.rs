//! Persistent operation history and content index.
//!
//! The [`MetadataStore`] keeps an append-only log of every file operation
//! outcome and an index of local files by content hash. Content hashes come
//! from [`content_hash`]; optional image attributes from [`probe_image`].

pub mod hash;
pub mod probe;
pub mod store;

pub use hash::{bytes_hash, content_hash};
pub use probe::{probe_image, ImageProbe};
pub use store::{
    BackupRecord, FileMetadataEntry, MetadataStore, NewRecord, RecordFilter, Statistics,
};
