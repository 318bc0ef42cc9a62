//! Push direction: upload local files to a provider.
//!
//! Batches run sequentially; hosting APIs commonly rate-limit per caller.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use imgbackup_common::{is_image_path, AppConfig, Operation, RecordStatus, Result, UploadResult};
use imgbackup_metadata::{content_hash, MetadataStore, NewRecord};
use imgbackup_storage::{ImageProvider, ProviderRegistry, RegistryError};

use crate::progress::{FileEvent, FileOutcome, ProgressSink};
use crate::retry::RetryPolicy;

/// Outcome of an upload batch.
#[derive(Debug, Clone, Serialize)]
pub struct UploadSummary {
    pub provider: String,
    pub succeeded: u64,
    pub failed: u64,
    pub results: Vec<(PathBuf, UploadResult)>,
}

impl UploadSummary {
    /// A batch succeeds when every file was uploaded.
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

/// Uploads single files and batches.
pub struct UploadOrchestrator {
    registry: Arc<ProviderRegistry>,
    store: Arc<MetadataStore>,
    policy: RetryPolicy,
    chunk_size: usize,
}

impl UploadOrchestrator {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        store: Arc<MetadataStore>,
        config: &AppConfig,
    ) -> Self {
        Self {
            registry,
            store,
            policy: RetryPolicy::from_config(config),
            chunk_size: config.chunk_size.max(1),
        }
    }

    /// Replace the retry policy.
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Upload one file.
    ///
    /// A missing file yields a failed result without a history record.
    ///
    /// # Errors
    /// - The provider cannot be resolved
    pub async fn upload_file(
        &self,
        provider_name: &str,
        path: &Path,
        remote_path: Option<&str>,
    ) -> std::result::Result<UploadResult, RegistryError> {
        let provider = self.registry.get(provider_name)?;
        Ok(self.upload_with(provider.as_ref(), path, remote_path).await)
    }

    /// Upload files one after another.
    ///
    /// With a prefix, each remote path is the prefix followed by the file name.
    ///
    /// # Errors
    /// - The provider cannot be resolved; nothing is uploaded
    pub async fn upload_batch(
        &self,
        provider_name: &str,
        files: &[PathBuf],
        remote_prefix: Option<&str>,
        progress: &dyn ProgressSink,
    ) -> std::result::Result<UploadSummary, RegistryError> {
        let provider = self.registry.get(provider_name)?;
        let mut summary = UploadSummary {
            provider: provider_name.to_string(),
            succeeded: 0,
            failed: 0,
            results: Vec::with_capacity(files.len()),
        };

        progress.begin(provider_name, Some(files.len() as u64));
        for file in files {
            let filename = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| file.display().to_string());
            let remote = remote_prefix.map(|prefix| format!("{}{}", prefix, filename));

            let result = self.upload_with(provider.as_ref(), file, remote.as_deref()).await;
            let outcome = if result.success {
                summary.succeeded += 1;
                FileOutcome::Succeeded {
                    size: file_size(file).await,
                }
            } else {
                summary.failed += 1;
                FileOutcome::Failed {
                    reason: result.message.clone(),
                }
            };
            progress.advance(&FileEvent::new(filename, outcome));
            summary.results.push((file.clone(), result));
        }
        progress.finish();

        info!(
            provider = %provider_name,
            "Upload finished: {} succeeded, {} failed",
            summary.succeeded,
            summary.failed
        );
        Ok(summary)
    }

    async fn upload_with(
        &self,
        provider: &dyn ImageProvider,
        path: &Path,
        remote_path: Option<&str>,
    ) -> UploadResult {
        if !tokio::fs::metadata(path).await.map(|m| m.is_file()).unwrap_or(false) {
            warn!("File not found: {}", path.display());
            return UploadResult::failed(format!("File not found: {}", path.display()));
        }

        let record = |status| {
            NewRecord::new(Operation::Upload, provider.name(), status)
                .paths(path, remote_path.unwrap_or_default())
        };

        let (hash, size) = match hash_file(path.to_path_buf(), self.chunk_size).await {
            Ok(content) => content,
            Err(reason) => {
                self.store.record(record(RecordStatus::Failed).message(reason.clone()));
                return UploadResult::failed(reason);
            }
        };

        let attempt = self
            .policy
            .run(move |_| async move {
                let result = provider.upload_image(path, remote_path).await;
                if result.success {
                    Ok(result)
                } else {
                    Err(result.message)
                }
            })
            .await;

        match attempt {
            Ok(result) => {
                let remote = result
                    .url
                    .clone()
                    .or_else(|| remote_path.map(str::to_string))
                    .unwrap_or_default();
                self.store.record(
                    NewRecord::new(Operation::Upload, provider.name(), RecordStatus::Success)
                        .paths(path, remote)
                        .content(hash, size)
                        .message(result.message.clone())
                        .metadata(result.metadata.clone()),
                );
                info!("Uploaded {} to {}", path.display(), provider.name());
                result
            }
            Err(exhausted) => {
                self.store.record(
                    record(RecordStatus::Failed)
                        .content(hash, size)
                        .message(exhausted.last_reason.clone()),
                );
                UploadResult::failed(exhausted.last_reason)
            }
        }
    }
}

async fn hash_file(path: PathBuf, chunk_size: usize) -> std::result::Result<(String, u64), String> {
    tokio::task::spawn_blocking(move || {
        let hash = content_hash(&path, chunk_size)
            .map_err(|e| format!("cannot hash {}: {}", path.display(), e))?;
        let size = std::fs::metadata(&path)
            .map_err(|e| format!("cannot stat {}: {}", path.display(), e))?
            .len();
        Ok((hash, size))
    })
    .await
    .map_err(|e| format!("hashing task failed: {}", e))?
}

async fn file_size(path: &Path) -> u64 {
    tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0)
}

/// Image files directly inside `dir`, sorted by name.
///
/// `pattern` keeps only names containing it; `limit` caps the result.
pub fn collect_images(dir: &Path, pattern: Option<&str>, limit: Option<usize>) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() || !is_image_path(&path) {
            continue;
        }
        let matches = match (pattern, path.file_name()) {
            (Some(pattern), Some(name)) => name.to_string_lossy().contains(pattern),
            (Some(_), None) => false,
            (None, _) => true,
        };
        if matches {
            files.push(path);
        }
    }

    files.sort();
    if let Some(limit) = limit {
        files.truncate(limit);
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_collect_images() {
        let temp = TempDir::new().unwrap();
        for name in ["b_cat.png", "a_cat.jpg", "dog.gif", "notes.txt"] {
            std::fs::write(temp.path().join(name), b"x").unwrap();
        }
        std::fs::create_dir(temp.path().join("nested.png")).unwrap();

        let all = collect_images(temp.path(), None, None).unwrap();
        let names: Vec<String> = all
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a_cat.jpg", "b_cat.png", "dog.gif"]);

        let cats = collect_images(temp.path(), Some("cat"), Some(1)).unwrap();
        assert_eq!(cats.len(), 1);
        assert!(cats[0].ends_with("a_cat.jpg"));
    }

    #[test]
    fn test_collect_images_missing_dir() {
        let temp = TempDir::new().unwrap();
        assert!(collect_images(&temp.path().join("missing"), None, None).is_err());
    }
}
