//! Application and provider configuration.
//!
//! The configuration is stored as YAML. Provider entries are keyed by
//! provider name and tagged with the kind of backend they configure:
//!
//! ```yaml
//! default_output_dir: ./backup
//! max_concurrent_downloads: 5
//! providers:
//!   github:
//!     kind: repository
//!     enabled: true
//!     token: ghp_xxx
//!     owner: me
//!     repo: images
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::{Error, Result};

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Directory that receives `<provider>/` backup folders.
    pub default_output_dir: PathBuf,
    /// Size of the download worker pool.
    pub max_concurrent_downloads: usize,
    /// Per-request timeout handed to providers.
    pub timeout_seconds: u64,
    /// Retries after the initial attempt of a transfer.
    pub retry_count: u32,
    /// Base delay of the exponential backoff between attempts.
    pub retry_delay_ms: u64,
    /// Buffer size used for hashing and streaming writes.
    pub chunk_size: usize,
    /// Default log level when `RUST_LOG` is not set.
    pub log_level: String,
    /// Location of the metadata database; platform data dir when unset.
    pub metadata_db: Option<PathBuf>,
    /// Provider configurations by name.
    pub providers: BTreeMap<String, ProviderConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            default_output_dir: PathBuf::from("./backup"),
            max_concurrent_downloads: 5,
            timeout_seconds: 30,
            retry_count: 3,
            retry_delay_ms: 500,
            chunk_size: 8192,
            log_level: "info".to_string(),
            metadata_db: None,
            providers: BTreeMap::new(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a YAML file.
    ///
    /// A missing file yields the default configuration. A file that exists
    /// but cannot be parsed or fails validation is an error.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!("Configuration file not found: {}", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config = Self::from_yaml(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from YAML text.
    pub fn from_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let mut config: AppConfig = serde_yaml::from_str(content)?;
        for (name, provider) in config.providers.iter_mut() {
            provider.name = name.clone();
        }
        Ok(config)
    }

    /// Serialize configuration to YAML text.
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Write configuration to a YAML file, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_yaml()?)?;
        info!("Configuration saved to: {}", path.display());
        Ok(())
    }

    /// Check global settings.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_downloads == 0 {
            return Err(Error::Configuration(
                "max_concurrent_downloads must be at least 1".to_string(),
            ));
        }
        if self.timeout_seconds == 0 {
            return Err(Error::Configuration(
                "timeout_seconds must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Per-request timeout as a duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Get the configuration of a provider.
    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.get(name)
    }

    /// Insert or replace a provider configuration, keyed by its name.
    pub fn insert_provider(&mut self, config: ProviderConfig) {
        self.providers.insert(config.name.clone(), config);
    }

    /// Names of providers that are enabled and pass validation, in name order.
    pub fn enabled_providers(&self) -> Vec<String> {
        self.providers
            .values()
            .filter(|p| p.enabled && p.validate().is_ok())
            .map(|p| p.name.clone())
            .collect()
    }

    /// Resolved location of the metadata database.
    pub fn metadata_path(&self) -> PathBuf {
        self.metadata_db
            .clone()
            .unwrap_or_else(Self::default_metadata_path)
    }

    /// Platform-appropriate default path for the configuration file.
    ///
    /// Typically `$XDG_CONFIG_HOME/imgbackup/config.yaml` on Linux.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join("imgbackup")
            .join("config.yaml")
    }

    /// Platform-appropriate default path for the metadata database.
    pub fn default_metadata_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join("imgbackup")
            .join("metadata.db")
    }
}

/// Kind of backend a provider configuration describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Object storage: endpoint + bucket + prefix.
    Bucket,
    /// REST image gallery addressed by an API token.
    Gallery,
    /// Files stored in a source repository.
    Repository,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProviderKind::Bucket => "bucket",
            ProviderKind::Gallery => "gallery",
            ProviderKind::Repository => "repository",
        };
        f.write_str(s)
    }
}

/// Configuration of one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Provider name; filled from the map key when loaded.
    #[serde(skip)]
    pub name: String,
    /// Whether the provider may be used.
    #[serde(default)]
    pub enabled: bool,
    /// Backend-specific settings.
    #[serde(flatten)]
    pub settings: ProviderSettings,
}

impl ProviderConfig {
    /// Create a provider configuration.
    pub fn new(name: impl Into<String>, enabled: bool, settings: ProviderSettings) -> Self {
        Self {
            name: name.into(),
            enabled,
            settings,
        }
    }

    /// Disabled configuration with empty settings of the given kind.
    pub fn template(name: impl Into<String>, kind: ProviderKind) -> Self {
        Self::new(name, false, ProviderSettings::template(kind))
    }

    /// Kind of backend this configuration describes.
    pub fn kind(&self) -> ProviderKind {
        self.settings.kind()
    }

    /// Check that all settings required by the backend kind are present.
    pub fn validate(&self) -> Result<()> {
        let missing = self.settings.missing_fields();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::Configuration(format!(
                "provider '{}' is missing required settings: {}",
                self.name,
                missing.join(", ")
            )))
        }
    }
}

/// Backend-specific settings, tagged by `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProviderSettings {
    Bucket {
        /// Service endpoint; a directory path for filesystem buckets.
        #[serde(default)]
        endpoint: String,
        #[serde(default)]
        bucket: String,
        #[serde(default)]
        prefix: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        access_key_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        access_key_secret: Option<String>,
        /// Base URL under which objects are publicly reachable.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        public_url: Option<String>,
    },
    Gallery {
        #[serde(default)]
        api_token: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        endpoint: Option<String>,
    },
    Repository {
        #[serde(default)]
        token: String,
        #[serde(default)]
        owner: String,
        #[serde(default)]
        repo: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        branch: Option<String>,
        /// Directory inside the repository that holds images.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        endpoint: Option<String>,
    },
}

impl ProviderSettings {
    /// Empty settings of the given kind.
    pub fn template(kind: ProviderKind) -> Self {
        match kind {
            ProviderKind::Bucket => ProviderSettings::Bucket {
                endpoint: String::new(),
                bucket: String::new(),
                prefix: String::new(),
                access_key_id: None,
                access_key_secret: None,
                public_url: None,
            },
            ProviderKind::Gallery => ProviderSettings::Gallery {
                api_token: String::new(),
                endpoint: None,
            },
            ProviderKind::Repository => ProviderSettings::Repository {
                token: String::new(),
                owner: String::new(),
                repo: String::new(),
                branch: None,
                path: None,
                endpoint: None,
            },
        }
    }

    pub fn kind(&self) -> ProviderKind {
        match self {
            ProviderSettings::Bucket { .. } => ProviderKind::Bucket,
            ProviderSettings::Gallery { .. } => ProviderKind::Gallery,
            ProviderSettings::Repository { .. } => ProviderKind::Repository,
        }
    }

    fn missing_fields(&self) -> Vec<&'static str> {
        let blank = |s: &str| s.trim().is_empty();
        let mut missing = Vec::new();
        match self {
            ProviderSettings::Bucket {
                endpoint, bucket, ..
            } => {
                if blank(endpoint) {
                    missing.push("endpoint");
                }
                if blank(bucket) {
                    missing.push("bucket");
                }
            }
            ProviderSettings::Gallery { api_token, .. } => {
                if blank(api_token) {
                    missing.push("api_token");
                }
            }
            ProviderSettings::Repository {
                token, owner, repo, ..
            } => {
                if blank(token) {
                    missing.push("token");
                }
                if blank(owner) {
                    missing.push("owner");
                }
                if blank(repo) {
                    missing.push("repo");
                }
            }
        }
        missing
    }
}
