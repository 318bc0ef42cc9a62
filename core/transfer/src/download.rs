//! Pull direction: copy a provider's images into a local directory.
//!
//! Enumeration is consumed on the calling task. Skip decisions are taken
//! there, in enumeration order, before anything is scheduled. Transfers run
//! on a `JoinSet` whose units each hold a semaphore permit while they talk
//! to the provider. Outcomes are collected on the calling task, which writes
//! the history and reports progress once per file.

use futures::{FutureExt, StreamExt};
use serde::Serialize;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::{Id, JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use imgbackup_common::{AppConfig, ImageInfo, Operation, RecordStatus};
use imgbackup_metadata::{
    content_hash, probe_image, FileMetadataEntry, ImageProbe, MetadataStore, NewRecord,
};
use imgbackup_storage::{ImageProvider, ProviderRegistry, RegistryError};

use crate::progress::{FileEvent, FileOutcome, ProgressSink};
use crate::retry::RetryPolicy;
use crate::sanitize::sanitize_filename;

/// Options of one backup run.
#[derive(Debug, Clone)]
pub struct BackupOptions {
    /// Stop after this many images.
    pub limit: Option<usize>,
    /// Treat an existing destination file as already backed up.
    pub skip_existing: bool,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            limit: None,
            skip_existing: true,
        }
    }
}

/// Counters of one backup run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupSummary {
    pub provider: String,
    pub total_estimate: Option<u64>,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
}

impl BackupSummary {
    fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            total_estimate: None,
            succeeded: 0,
            failed: 0,
            skipped: 0,
        }
    }

    /// Files that reached a terminal outcome.
    pub fn processed(&self) -> u64 {
        self.succeeded + self.failed + self.skipped
    }

    /// A run succeeds when no file failed.
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

/// Content facts of a downloaded file.
struct Written {
    hash: String,
    size: u64,
    probe: Option<ImageProbe>,
}

/// A transfer handed to the worker pool, keyed by its task id.
struct Scheduled {
    image: ImageInfo,
    filename: String,
    destination: PathBuf,
}

type Joined = Result<(Id, Result<Written, String>), JoinError>;

/// Drives backups of one provider at a time.
pub struct DownloadOrchestrator {
    registry: Arc<ProviderRegistry>,
    store: Arc<MetadataStore>,
    policy: RetryPolicy,
    concurrency: usize,
    chunk_size: usize,
}

impl DownloadOrchestrator {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        store: Arc<MetadataStore>,
        config: &AppConfig,
    ) -> Self {
        Self {
            registry,
            store,
            policy: RetryPolicy::from_config(config),
            concurrency: config.max_concurrent_downloads.max(1),
            chunk_size: config.chunk_size.max(1),
        }
    }

    /// Replace the retry policy.
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Back up `provider_name` into `output_dir/<provider_name>/`.
    ///
    /// # Errors
    /// - The provider cannot be resolved; nothing is transferred
    pub async fn run(
        &self,
        provider_name: &str,
        output_dir: &Path,
        options: &BackupOptions,
        progress: &dyn ProgressSink,
    ) -> Result<BackupSummary, RegistryError> {
        let provider = self.registry.get(provider_name)?;
        Ok(self.run_with(provider, output_dir, options, progress).await)
    }

    /// Back up an already resolved provider.
    pub async fn run_with(
        &self,
        provider: Arc<dyn ImageProvider>,
        output_dir: &Path,
        options: &BackupOptions,
        progress: &dyn ProgressSink,
    ) -> BackupSummary {
        let name = provider.name().to_string();
        let target_dir = output_dir.join(&name);
        if let Err(e) = tokio::fs::create_dir_all(&target_dir).await {
            error!(provider = %name, "Cannot create {}: {}", target_dir.display(), e);
        }

        let mut summary = BackupSummary::new(&name);
        summary.total_estimate = match (provider.get_image_count().await, options.limit) {
            (Some(count), Some(limit)) => Some(count.min(limit as u64)),
            (count, _) => count,
        };
        progress.begin(&name, summary.total_estimate);
        info!(provider = %name, "Starting backup to {}", target_dir.display());

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut units = JoinSet::new();
        let mut in_flight = HashMap::new();
        let mut destinations = HashSet::new();
        let mut images = provider.list_images(options.limit);

        while let Some(image) = images.next().await {
            let filename = sanitize_filename(&image.filename);
            let destination = target_dir.join(&filename);

            if options.skip_existing && tokio::fs::try_exists(&destination).await.unwrap_or(false) {
                debug!(provider = %name, "Skipping existing {}", filename);
                self.skip(
                    &name,
                    &image,
                    filename,
                    &destination,
                    "File already exists",
                    &mut summary,
                    progress,
                );
                continue;
            }
            if !destinations.insert(destination.clone()) {
                warn!(provider = %name, "{} maps to an already scheduled file", image.filename);
                self.skip(
                    &name,
                    &image,
                    filename,
                    &destination,
                    "Duplicate destination in this run",
                    &mut summary,
                    progress,
                );
                continue;
            }

            let handle = units.spawn(transfer_unit(
                Arc::clone(&provider),
                Arc::clone(&semaphore),
                self.policy.clone(),
                self.chunk_size,
                image.clone(),
                destination.clone(),
            ));
            in_flight.insert(
                handle.id(),
                Scheduled {
                    image,
                    filename,
                    destination,
                },
            );

            while let Some(joined) = units.try_join_next_with_id() {
                self.collect(&name, joined, &mut in_flight, &mut summary, progress);
            }
        }
        drop(images);

        while let Some(joined) = units.join_next_with_id().await {
            self.collect(&name, joined, &mut in_flight, &mut summary, progress);
        }

        progress.finish();
        info!(
            provider = %name,
            "Backup finished: {} succeeded, {} failed, {} skipped, {} total",
            summary.succeeded,
            summary.failed,
            summary.skipped,
            summary.processed()
        );
        summary
    }

    #[allow(clippy::too_many_arguments)]
    fn skip(
        &self,
        provider: &str,
        image: &ImageInfo,
        filename: String,
        destination: &Path,
        reason: &str,
        summary: &mut BackupSummary,
        progress: &dyn ProgressSink,
    ) {
        self.store.record(
            NewRecord::new(Operation::Download, provider, RecordStatus::Skipped)
                .paths(destination, image.remote_path())
                .message(reason),
        );
        summary.skipped += 1;
        progress.advance(&FileEvent::new(filename, FileOutcome::Skipped));
    }

    /// Record the outcome of one finished task, including tasks that died.
    fn collect(
        &self,
        provider: &str,
        joined: Joined,
        in_flight: &mut HashMap<Id, Scheduled>,
        summary: &mut BackupSummary,
        progress: &dyn ProgressSink,
    ) {
        let (id, result) = match joined {
            Ok(finished) => finished,
            Err(e) => {
                error!(provider = %provider, "Transfer task lost: {}", e);
                let reason = if e.is_panic() {
                    "transfer task panicked"
                } else {
                    "transfer task cancelled"
                };
                (e.id(), Err(reason.to_string()))
            }
        };

        let Some(unit) = in_flight.remove(&id) else {
            error!(provider = %provider, "Finished task {} was never scheduled", id);
            summary.failed += 1;
            progress.advance(&FileEvent::new(
                "<unknown>",
                FileOutcome::Failed {
                    reason: "untracked transfer task".to_string(),
                },
            ));
            return;
        };

        match result {
            Ok(written) => {
                self.store.record(
                    NewRecord::new(Operation::Download, provider, RecordStatus::Success)
                        .paths(&unit.destination, unit.image.remote_path())
                        .content(written.hash.clone(), written.size)
                        .message("Downloaded")
                        .metadata(unit.image.metadata.clone()),
                );

                let entry = FileMetadataEntry {
                    file_path: unit.destination.to_string_lossy().into_owned(),
                    file_hash: written.hash,
                    file_size: written.size,
                    width: written.probe.as_ref().map(|p| p.width),
                    height: written.probe.as_ref().map(|p| p.height),
                    format: written.probe.map(|p| p.format),
                };
                if let Err(e) = self.store.update_file_metadata(&entry) {
                    warn!(provider = %provider, "Failed to index {}: {}", unit.filename, e);
                }

                summary.succeeded += 1;
                progress.advance(&FileEvent::new(
                    unit.filename,
                    FileOutcome::Succeeded { size: written.size },
                ));
            }
            Err(reason) => {
                self.store.record(
                    NewRecord::new(Operation::Download, provider, RecordStatus::Failed)
                        .paths(&unit.destination, unit.image.remote_path())
                        .message(reason.clone()),
                );
                summary.failed += 1;
                progress.advance(&FileEvent::new(unit.filename, FileOutcome::Failed { reason }));
            }
        }
    }
}

/// One unit of work. Never panics past itself.
async fn transfer_unit(
    provider: Arc<dyn ImageProvider>,
    semaphore: Arc<Semaphore>,
    policy: RetryPolicy,
    chunk_size: usize,
    image: ImageInfo,
    destination: PathBuf,
) -> Result<Written, String> {
    let attempt = download_and_inspect(
        &*provider,
        &semaphore,
        &policy,
        chunk_size,
        &image,
        &destination,
    );
    AssertUnwindSafe(attempt)
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(format!("transfer panicked: {}", panic_message(&*panic))))
}

async fn download_and_inspect(
    provider: &dyn ImageProvider,
    semaphore: &Semaphore,
    policy: &RetryPolicy,
    chunk_size: usize,
    image: &ImageInfo,
    destination: &Path,
) -> Result<Written, String> {
    {
        let _permit = semaphore.acquire().await.map_err(|e| e.to_string())?;
        policy
            .run(move |attempt| async move {
                if provider.download_image(image, destination).await {
                    Ok(())
                } else {
                    Err(format!("download of {} failed on attempt {}", image.filename, attempt))
                }
            })
            .await
            .map_err(|e| e.to_string())?;
    }

    match inspect(destination.to_path_buf(), chunk_size).await {
        Ok(written) => Ok(written),
        Err(reason) => {
            let _ = tokio::fs::remove_file(destination).await;
            Err(reason)
        }
    }
}

/// Hash the written file and probe its header off the async threads.
async fn inspect(path: PathBuf, chunk_size: usize) -> Result<Written, String> {
    tokio::task::spawn_blocking(move || {
        let hash = content_hash(&path, chunk_size)
            .map_err(|e| format!("cannot hash {}: {}", path.display(), e))?;
        let size = std::fs::metadata(&path)
            .map_err(|e| format!("cannot stat {}: {}", path.display(), e))?
            .len();
        let probe = std::panic::catch_unwind(|| probe_image(&path)).ok().flatten();
        Ok(Written { hash, size, probe })
    })
    .await
    .map_err(|e| format!("inspection task failed: {}", e))?
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
