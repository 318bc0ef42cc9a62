//! Transfer engine for image backups.
//!
//! [`DownloadOrchestrator`] pulls a provider's images into a local directory
//! with bounded parallelism, [`UploadOrchestrator`] pushes local files, and
//! [`BackupService`] ties both to the provider registry and the metadata
//! store.

pub mod download;
pub mod progress;
pub mod retry;
pub mod sanitize;
pub mod service;
pub mod upload;

pub use download::{BackupOptions, BackupSummary, DownloadOrchestrator};
pub use progress::{FileEvent, FileOutcome, LogProgress, ProgressSink};
pub use retry::{AttemptsExhausted, RetryPolicy};
pub use sanitize::{sanitize_filename, MAX_FILENAME_BYTES};
pub use service::{BackupAllReport, BackupService, ProviderInfo};
pub use upload::{collect_images, UploadOrchestrator, UploadSummary};
