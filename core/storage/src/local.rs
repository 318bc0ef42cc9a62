//! Filesystem bucket provider.
//!
//! Treats `<endpoint>/<bucket>` as an object-storage bucket whose object
//! keys are the `/`-separated relative paths of the files below it. This
//! serves mounted or synchronised buckets and local mirrors.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{stream, StreamExt};
use std::collections::VecDeque;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tracing::{debug, error, warn};

use imgbackup_common::{
    is_image_path, Error, ImageInfo, ProviderConfig, ProviderSettings, Result, UploadResult,
};

use crate::provider::{limited, persist_bytes, ImageProvider, ImageStream, PROBE_TIMEOUT};

/// Filesystem bucket provider.
pub struct LocalProvider {
    config: ProviderConfig,
    root: PathBuf,
    prefix: String,
    public_url: Option<String>,
}

/// Pending state of a depth-first bucket walk.
struct Walk {
    pending: Vec<PathBuf>,
    ready: VecDeque<ImageInfo>,
}

impl LocalProvider {
    /// Create a new filesystem bucket provider.
    ///
    /// # Errors
    /// - Configuration is not bucket-style
    pub fn new(config: ProviderConfig) -> Result<Self> {
        let ProviderSettings::Bucket {
            endpoint,
            bucket,
            prefix,
            public_url,
            ..
        } = &config.settings
        else {
            return Err(Error::Configuration(format!(
                "provider '{}' requires bucket settings, got {}",
                config.name,
                config.kind()
            )));
        };

        let root = Path::new(endpoint).join(bucket);
        let prefix = prefix.trim_start_matches('/').to_string();
        let public_url = public_url.as_ref().map(|u| u.trim_end_matches('/').to_string());

        Ok(Self {
            root,
            prefix,
            public_url,
            config,
        })
    }

    /// Convert an object key to a filesystem path.
    fn object_path(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(Error::InvalidInput(format!("Invalid object key: {}", key)));
        }
        Ok(self.root.join(relative))
    }

    /// Convert a filesystem path below the root to an object key.
    fn key_for(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Some(parts.join("/"))
    }

    fn object_url(&self, key: &str, path: &Path) -> String {
        match &self.public_url {
            Some(base) => format!("{}/{}", base, key),
            None => format!("file://{}", path.display()),
        }
    }

    /// Directory where the walk starts: the directory part of the prefix.
    fn walk_start(&self) -> PathBuf {
        match self.prefix.rsplit_once('/') {
            Some((dir, _)) => self.root.join(dir),
            None => self.root.clone(),
        }
    }

    /// Read one directory: sorted subdirectories and matching images.
    async fn read_dir_sorted(&self, dir: &Path) -> std::io::Result<(Vec<PathBuf>, Vec<ImageInfo>)> {
        let mut entries = Vec::new();
        let mut reader = fs::read_dir(dir).await?;
        while let Some(entry) = reader.next_entry().await? {
            entries.push(entry);
        }
        entries.sort_by_key(|e| e.file_name());

        let mut dirs = Vec::new();
        let mut images = Vec::new();
        for entry in entries {
            let path = entry.path();
            let meta = entry.metadata().await?;
            if meta.is_dir() {
                dirs.push(path);
                continue;
            }
            if !meta.is_file() || !is_image_path(&path) {
                continue;
            }
            let Some(key) = self.key_for(&path) else {
                continue;
            };
            if !key.starts_with(&self.prefix) {
                continue;
            }

            let filename = entry.file_name().to_string_lossy().into_owned();
            let mut info = ImageInfo::new(self.object_url(&key, &path), filename)
                .with_size(meta.len())
                .with_meta("key", key);
            if let Ok(modified) = meta.modified() {
                info = info.with_created_at(DateTime::<Utc>::from(modified));
            }
            images.push(info);
        }
        Ok((dirs, images))
    }

    async fn copy_to(&self, image: &ImageInfo, destination: &Path) -> Result<u64> {
        let key = image
            .metadata
            .get("key")
            .map(String::as_str)
            .unwrap_or(&image.filename);
        let source = self.object_path(key)?;
        let data = fs::read(&source).await?;
        persist_bytes(destination, data).await
    }

    async fn store(&self, local_path: &Path, remote_path: Option<&str>) -> Result<UploadResult> {
        let filename = local_path
            .file_name()
            .ok_or_else(|| Error::InvalidInput("Upload path has no file name".to_string()))?
            .to_string_lossy()
            .into_owned();
        let key = match remote_path {
            Some(remote) => remote.trim_start_matches('/').to_string(),
            None => format!("{}{}", self.prefix, filename),
        };
        let target = self.object_path(&key)?;

        let data = fs::read(local_path).await?;
        let size = persist_bytes(&target, data).await?;

        Ok(UploadResult::ok(
            Some(self.object_url(&key, &target)),
            format!("Stored {} bytes as {}", size, key),
        )
        .with_meta("key", key))
    }
}

#[async_trait]
impl ImageProvider for LocalProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn config(&self) -> &ProviderConfig {
        &self.config
    }

    async fn test_connection(&self) -> bool {
        match tokio::time::timeout(PROBE_TIMEOUT, fs::metadata(&self.root)).await {
            Ok(Ok(meta)) => meta.is_dir(),
            Ok(Err(e)) => {
                error!("Bucket {} is not accessible: {}", self.root.display(), e);
                false
            }
            Err(_) => {
                error!("Bucket {} probe timed out", self.root.display());
                false
            }
        }
    }

    fn list_images(&self, limit: Option<usize>) -> ImageStream<'_> {
        let walk = Walk {
            pending: vec![self.walk_start()],
            ready: VecDeque::new(),
        };

        let images = stream::unfold(walk, move |mut walk| async move {
            loop {
                if let Some(image) = walk.ready.pop_front() {
                    return Some((image, walk));
                }
                let dir = walk.pending.pop()?;
                match self.read_dir_sorted(&dir).await {
                    Ok((dirs, images)) => {
                        walk.pending.extend(dirs.into_iter().rev());
                        walk.ready.extend(images);
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        debug!("Bucket directory {} does not exist", dir.display());
                    }
                    Err(e) => {
                        warn!("Listing {} stopped at {}: {}", self.name(), dir.display(), e);
                        return None;
                    }
                }
            }
        });

        limited(images.boxed(), limit)
    }

    async fn download_image(&self, image: &ImageInfo, destination: &Path) -> bool {
        match self.copy_to(image, destination).await {
            Ok(size) => {
                debug!("Copied {} ({} bytes)", image.filename, size);
                true
            }
            Err(e) if e.is_transient() => {
                warn!("Failed to download image {}: {}", image.filename, e);
                false
            }
            Err(e) => {
                error!("Failed to download image {}: {}", image.filename, e);
                false
            }
        }
    }

    async fn upload_image(&self, local_path: &Path, remote_path: Option<&str>) -> UploadResult {
        match self.store(local_path, remote_path).await {
            Ok(result) => result,
            Err(e) => {
                error!("Failed to upload {}: {}", local_path.display(), e);
                UploadResult::failed(e.to_string())
            }
        }
    }

    async fn get_image_count(&self) -> Option<u64> {
        Some(self.list_images(None).count().await as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn bucket_config(endpoint: &Path, prefix: &str) -> ProviderConfig {
        ProviderConfig::new(
            "local",
            true,
            ProviderSettings::Bucket {
                endpoint: endpoint.to_string_lossy().into_owned(),
                bucket: "images".to_string(),
                prefix: prefix.to_string(),
                access_key_id: None,
                access_key_secret: None,
                public_url: Some("https://cdn.example.com/".to_string()),
            },
        )
    }

    fn seed(temp: &TempDir) {
        let root = temp.path().join("images");
        std::fs::create_dir_all(root.join("2024/05")).unwrap();
        std::fs::write(root.join("b.png"), b"bbb").unwrap();
        std::fs::write(root.join("a.jpg"), b"aa").unwrap();
        std::fs::write(root.join("notes.txt"), b"not an image").unwrap();
        std::fs::write(root.join("2024/05/c.gif"), b"c").unwrap();
    }

    #[tokio::test]
    async fn test_listing_is_sorted_and_filtered() {
        let temp = TempDir::new().unwrap();
        seed(&temp);
        let provider = LocalProvider::new(bucket_config(temp.path(), "")).unwrap();

        let images: Vec<ImageInfo> = provider.list_images(None).collect().await;
        let keys: Vec<&str> = images.iter().map(|i| i.metadata["key"].as_str()).collect();

        assert_eq!(keys, vec!["a.jpg", "b.png", "2024/05/c.gif"]);
        assert_eq!(images[0].url, "https://cdn.example.com/a.jpg");
        assert_eq!(images[1].size, Some(3));
        assert_eq!(provider.get_image_count().await, Some(3));
    }

    #[tokio::test]
    async fn test_listing_respects_limit_and_prefix() {
        let temp = TempDir::new().unwrap();
        seed(&temp);

        let provider = LocalProvider::new(bucket_config(temp.path(), "")).unwrap();
        let limited: Vec<ImageInfo> = provider.list_images(Some(2)).collect().await;
        assert_eq!(limited.len(), 2);

        let provider = LocalProvider::new(bucket_config(temp.path(), "2024/")).unwrap();
        let prefixed: Vec<ImageInfo> = provider.list_images(None).collect().await;
        assert_eq!(prefixed.len(), 1);
        assert_eq!(prefixed[0].filename, "c.gif");
    }

    #[tokio::test]
    async fn test_missing_bucket() {
        let temp = TempDir::new().unwrap();
        let provider = LocalProvider::new(bucket_config(temp.path(), "")).unwrap();

        assert!(!provider.test_connection().await);
        assert_eq!(provider.list_images(None).count().await, 0);
    }

    #[tokio::test]
    async fn test_download_and_upload() {
        let temp = TempDir::new().unwrap();
        seed(&temp);
        let provider = LocalProvider::new(bucket_config(temp.path(), "up/")).unwrap();
        assert!(provider.test_connection().await);

        let image = ImageInfo::new("", "c.gif").with_meta("key", "2024/05/c.gif");
        let dest = temp.path().join("out").join("c.gif");
        assert!(provider.download_image(&image, &dest).await);
        assert_eq!(std::fs::read(&dest).unwrap(), b"c");

        let missing = ImageInfo::new("", "gone.png");
        assert!(!provider.download_image(&missing, &temp.path().join("out/gone.png")).await);
        assert!(!temp.path().join("out/gone.png").exists());

        let result = provider.upload_image(&dest, None).await;
        assert!(result.success);
        assert_eq!(result.metadata["key"], "up/c.gif");
        assert!(temp.path().join("images/up/c.gif").exists());
    }

    #[tokio::test]
    async fn test_upload_rejects_escaping_keys() {
        let temp = TempDir::new().unwrap();
        seed(&temp);
        let provider = LocalProvider::new(bucket_config(temp.path(), "")).unwrap();
        let source = temp.path().join("images/a.jpg");

        let result = provider.upload_image(&source, Some("../outside.jpg")).await;
        assert!(!result.success);
        assert!(!temp.path().join("outside.jpg").exists());
    }

    #[test]
    fn test_rejects_non_bucket_config() {
        let config = ProviderConfig::template("local", imgbackup_common::ProviderKind::Gallery);
        assert!(LocalProvider::new(config).is_err());
    }
}
