//! Per-file progress reporting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info, warn};

/// Terminal outcome of one file in a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    Succeeded { size: u64 },
    Failed { reason: String },
    Skipped,
}

/// Progress notification for one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    pub filename: String,
    pub outcome: FileOutcome,
}

impl FileEvent {
    pub fn new(filename: impl Into<String>, outcome: FileOutcome) -> Self {
        Self {
            filename: filename.into(),
            outcome,
        }
    }
}

/// Receiver of run progress.
///
/// `advance` is called exactly once per file, whatever its outcome. `total`
/// is `None` when the provider cannot estimate it.
pub trait ProgressSink: Send + Sync {
    fn begin(&self, label: &str, total: Option<u64>);
    fn advance(&self, event: &FileEvent);
    fn finish(&self);
}

/// Progress sink that writes to the log.
#[derive(Default)]
pub struct LogProgress {
    label: Mutex<String>,
    total: Mutex<Option<u64>>,
    processed: AtomicU64,
}

impl LogProgress {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgressSink for LogProgress {
    fn begin(&self, label: &str, total: Option<u64>) {
        *self.label.lock().unwrap_or_else(PoisonError::into_inner) = label.to_string();
        *self.total.lock().unwrap_or_else(PoisonError::into_inner) = total;
        self.processed.store(0, Ordering::SeqCst);
        match total {
            Some(total) => info!("{}: processing {} images", label, total),
            None => info!("{}: processing images (total unknown)", label),
        }
    }

    fn advance(&self, event: &FileEvent) {
        let done = self.processed.fetch_add(1, Ordering::SeqCst) + 1;
        let position = match *self.total.lock().unwrap_or_else(PoisonError::into_inner) {
            Some(total) => format!("{}/{}", done, total),
            None => done.to_string(),
        };
        match &event.outcome {
            FileOutcome::Succeeded { size } => {
                debug!("[{}] {} ({} bytes)", position, event.filename, size)
            }
            FileOutcome::Skipped => debug!("[{}] {} skipped", position, event.filename),
            FileOutcome::Failed { reason } => {
                warn!("[{}] {} failed: {}", position, event.filename, reason)
            }
        }
    }

    fn finish(&self) {
        let label = self.label.lock().unwrap_or_else(PoisonError::into_inner);
        info!("{}: {} files processed", label, self.processed.load(Ordering::SeqCst));
    }
}
