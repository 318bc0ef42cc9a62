//! Caller-facing facade over the registry, the orchestrators and the store.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

use imgbackup_common::{AppConfig, Result, UploadResult};
use imgbackup_metadata::{BackupRecord, MetadataStore, RecordFilter, Statistics};
use imgbackup_storage::{ProviderRegistry, RegistryError};

use crate::download::{BackupOptions, BackupSummary, DownloadOrchestrator};
use crate::progress::ProgressSink;
use crate::retry::RetryPolicy;
use crate::upload::{UploadOrchestrator, UploadSummary};

/// Outcome of a multi-provider backup.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BackupAllReport {
    /// Success per attempted provider.
    pub results: BTreeMap<String, bool>,
    /// Counters per provider that could be resolved.
    pub summaries: BTreeMap<String, BackupSummary>,
}

impl BackupAllReport {
    /// True when at least one provider ran and every one succeeded.
    pub fn is_success(&self) -> bool {
        !self.results.is_empty() && self.results.values().all(|ok| *ok)
    }
}

/// Status of a configured provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderInfo {
    pub name: String,
    pub enabled: bool,
    pub config_valid: bool,
    pub connected: bool,
    pub image_count: Option<u64>,
}

/// Entry point used by the command line and by embedders.
pub struct BackupService {
    config: Arc<AppConfig>,
    registry: Arc<ProviderRegistry>,
    store: Arc<MetadataStore>,
    downloads: DownloadOrchestrator,
    uploads: UploadOrchestrator,
}

impl BackupService {
    pub fn new(
        config: Arc<AppConfig>,
        registry: Arc<ProviderRegistry>,
        store: Arc<MetadataStore>,
    ) -> Self {
        let downloads =
            DownloadOrchestrator::new(Arc::clone(&registry), Arc::clone(&store), &config);
        let uploads = UploadOrchestrator::new(Arc::clone(&registry), Arc::clone(&store), &config);
        Self {
            config,
            registry,
            store,
            downloads,
            uploads,
        }
    }

    /// Build a service with the built-in providers and the configured store.
    ///
    /// # Errors
    /// - The configuration is invalid
    /// - The metadata database cannot be opened
    pub fn open(config: AppConfig) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(MetadataStore::open(&config.metadata_path())?);
        let config = Arc::new(config);
        let registry = Arc::new(ProviderRegistry::new(Arc::clone(&config)));
        Ok(Self::new(config, registry, store))
    }

    /// Use `policy` for every transfer.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.downloads = self.downloads.with_policy(policy.clone());
        self.uploads = self.uploads.with_policy(policy);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    fn output_dir<'a>(&'a self, output_dir: Option<&'a Path>) -> &'a Path {
        output_dir.unwrap_or(&self.config.default_output_dir)
    }

    /// Back up one provider and return its counters.
    ///
    /// # Errors
    /// - The provider cannot be resolved
    pub async fn run_backup(
        &self,
        provider: &str,
        output_dir: Option<&Path>,
        options: &BackupOptions,
        progress: &dyn ProgressSink,
    ) -> std::result::Result<BackupSummary, RegistryError> {
        self.downloads
            .run(provider, self.output_dir(output_dir), options, progress)
            .await
    }

    /// Back up one provider. True when no file failed.
    pub async fn backup(
        &self,
        provider: &str,
        output_dir: Option<&Path>,
        options: &BackupOptions,
        progress: &dyn ProgressSink,
    ) -> bool {
        match self.run_backup(provider, output_dir, options, progress).await {
            Ok(summary) => summary.is_success(),
            Err(e) => {
                error!(provider = %provider, "Backup not started: {}", e);
                false
            }
        }
    }

    /// Back up every enabled provider with a valid configuration, one after another.
    pub async fn backup_all(
        &self,
        output_dir: Option<&Path>,
        options: &BackupOptions,
        progress: &dyn ProgressSink,
    ) -> BackupAllReport {
        let mut report = BackupAllReport::default();
        let providers = self.config.enabled_providers();
        if providers.is_empty() {
            warn!("No enabled providers");
            return report;
        }

        for name in providers {
            info!(provider = %name, "Backing up");
            match self.run_backup(&name, output_dir, options, progress).await {
                Ok(summary) => {
                    report.results.insert(name.clone(), summary.is_success());
                    report.summaries.insert(name, summary);
                }
                Err(e) => {
                    error!(provider = %name, "Backup not started: {}", e);
                    report.results.insert(name, false);
                }
            }
        }
        report
    }

    /// Upload one file; the result carries the url or the failure message.
    pub async fn upload(
        &self,
        provider: &str,
        file: &Path,
        remote_path: Option<&str>,
    ) -> UploadResult {
        self.uploads
            .upload_file(provider, file, remote_path)
            .await
            .unwrap_or_else(|e| {
                error!(provider = %provider, "Upload not started: {}", e);
                UploadResult::failed(e.to_string())
            })
    }

    /// Upload files sequentially and return per-file results.
    ///
    /// # Errors
    /// - The provider cannot be resolved
    pub async fn run_upload_batch(
        &self,
        provider: &str,
        files: &[PathBuf],
        remote_prefix: Option<&str>,
        progress: &dyn ProgressSink,
    ) -> std::result::Result<UploadSummary, RegistryError> {
        self.uploads
            .upload_batch(provider, files, remote_prefix, progress)
            .await
    }

    /// Upload files sequentially. True when every file was uploaded.
    pub async fn upload_batch(
        &self,
        provider: &str,
        files: &[PathBuf],
        remote_prefix: Option<&str>,
        progress: &dyn ProgressSink,
    ) -> bool {
        match self
            .run_upload_batch(provider, files, remote_prefix, progress)
            .await
        {
            Ok(summary) => summary.is_success(),
            Err(e) => {
                error!(provider = %provider, "Upload not started: {}", e);
                false
            }
        }
    }

    /// Names of every supported provider, built-ins first.
    pub fn list_providers(&self) -> Vec<String> {
        self.registry.list_providers()
    }

    /// Probe a provider's reachability.
    pub async fn test_provider(&self, name: &str) -> bool {
        match self.registry.get(name) {
            Ok(provider) => {
                let connected = provider.test_connection().await;
                if connected {
                    info!(provider = %name, "Connection OK");
                } else {
                    warn!(provider = %name, "Connection failed");
                }
                connected
            }
            Err(e) => {
                error!(provider = %name, "{}", e);
                false
            }
        }
    }

    /// Describe a configured provider.
    ///
    /// Disabled or invalid providers are reported without contacting them.
    ///
    /// # Errors
    /// - [`RegistryError::NotConfigured`] when no configuration names it
    pub async fn provider_info(
        &self,
        name: &str,
    ) -> std::result::Result<ProviderInfo, RegistryError> {
        let config = self
            .config
            .provider(name)
            .ok_or_else(|| RegistryError::NotConfigured(name.to_string()))?;

        let mut info = ProviderInfo {
            name: name.to_string(),
            enabled: config.enabled,
            config_valid: config.validate().is_ok(),
            connected: false,
            image_count: None,
        };
        if !info.enabled || !info.config_valid {
            return Ok(info);
        }

        match self.registry.get(name) {
            Ok(provider) => {
                info.connected = provider.test_connection().await;
                if info.connected {
                    info.image_count = provider.get_image_count().await;
                }
            }
            Err(e) => warn!(provider = %name, "{}", e),
        }
        Ok(info)
    }

    /// Aggregate counters over the whole history.
    pub fn statistics(&self) -> Result<Statistics> {
        self.store.statistics()
    }

    /// History records matching `filter`, newest first.
    pub fn history(&self, filter: &RecordFilter) -> Result<Vec<BackupRecord>> {
        self.store.get_records(filter)
    }

    /// Content hashes shared by more than one local file.
    pub fn find_duplicates(&self) -> Result<BTreeMap<String, BTreeSet<String>>> {
        self.store.find_duplicates()
    }
}
