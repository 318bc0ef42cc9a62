//! In-memory image provider for testing.
//!
//! Holds a fixed, ordered set of images and can be scripted to fail
//! downloads or uploads, slow transfers down or cut a listing short. It
//! records every call so tests can inspect attempts and peak concurrency.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream, StreamExt};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

use imgbackup_common::{ImageInfo, ProviderConfig, ProviderSettings, UploadResult};

use crate::provider::{limited, persist_bytes, ImageProvider, ImageStream};

#[derive(Default)]
struct CallLog {
    download_failures: HashMap<String, u32>,
    attempts: HashMap<String, u32>,
    upload_failures: u32,
    uploads: Vec<String>,
}

/// In-memory image provider.
pub struct MemoryProvider {
    config: ProviderConfig,
    images: Vec<(ImageInfo, Bytes)>,
    count: Option<Option<u64>>,
    listing_fault_after: Option<usize>,
    transfer_delay: Duration,
    reachable: bool,
    calls: Mutex<CallLog>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl MemoryProvider {
    /// Create an empty, enabled provider.
    pub fn new(name: impl Into<String>) -> Self {
        let config = ProviderConfig::new(
            name,
            true,
            ProviderSettings::Bucket {
                endpoint: "memory".to_string(),
                bucket: "images".to_string(),
                prefix: String::new(),
                access_key_id: None,
                access_key_secret: None,
                public_url: None,
            },
        );

        Self {
            config,
            images: Vec::new(),
            count: None,
            listing_fault_after: None,
            transfer_delay: Duration::ZERO,
            reachable: true,
            calls: Mutex::new(CallLog::default()),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Add an image; listing order is insertion order.
    pub fn with_image(mut self, filename: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let filename = filename.into();
        let data = data.into();
        let info = ImageInfo::new(format!("memory://{}/{}", self.config.name, filename), filename)
            .with_size(data.len() as u64);
        self.images.push((info, data));
        self
    }

    /// Fail the first `times` download attempts of `filename`.
    pub fn fail_downloads(self, filename: impl Into<String>, times: u32) -> Self {
        self.log().download_failures.insert(filename.into(), times);
        self
    }

    /// Fail the first `times` upload attempts.
    pub fn fail_uploads(self, times: u32) -> Self {
        self.log().upload_failures = times;
        self
    }

    /// Hold every transfer for `delay`.
    pub fn with_transfer_delay(mut self, delay: Duration) -> Self {
        self.transfer_delay = delay;
        self
    }

    /// Override the reported image count.
    pub fn with_count(mut self, count: Option<u64>) -> Self {
        self.count = Some(count);
        self
    }

    /// End listings with a fault after `n` images.
    pub fn listing_fault_after(mut self, n: usize) -> Self {
        self.listing_fault_after = Some(n);
        self
    }

    /// Make connection probes fail.
    pub fn unreachable(mut self) -> Self {
        self.reachable = false;
        self
    }

    /// Number of download attempts made for `filename`.
    pub fn attempts(&self, filename: &str) -> u32 {
        self.log().attempts.get(filename).copied().unwrap_or(0)
    }

    /// Total download attempts across all images.
    pub fn total_attempts(&self) -> u32 {
        self.log().attempts.values().sum()
    }

    /// Highest number of downloads observed in flight at once.
    pub fn max_concurrent(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Remote paths of successful uploads, in call order.
    pub fn uploads(&self) -> Vec<String> {
        self.log().uploads.clone()
    }

    fn log(&self) -> MutexGuard<'_, CallLog> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Consume one scripted failure for `filename`, if any remain.
    fn take_download_failure(&self, filename: &str) -> bool {
        let mut log = self.log();
        *log.attempts.entry(filename.to_string()).or_insert(0) += 1;
        match log.download_failures.get_mut(filename) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    async fn transfer(&self, image: &ImageInfo, destination: &Path) -> bool {
        if self.take_download_failure(&image.filename) {
            debug!("Scripted download failure for {}", image.filename);
            return false;
        }
        let Some((_, data)) = self.images.iter().find(|(i, _)| i.filename == image.filename) else {
            warn!("Image {} not found in {}", image.filename, self.config.name);
            return false;
        };
        match persist_bytes(destination, data.clone()).await {
            Ok(_) => true,
            Err(e) => {
                warn!("Failed to write {}: {}", destination.display(), e);
                false
            }
        }
    }
}

#[async_trait]
impl ImageProvider for MemoryProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn config(&self) -> &ProviderConfig {
        &self.config
    }

    async fn test_connection(&self) -> bool {
        self.reachable
    }

    fn list_images(&self, limit: Option<usize>) -> ImageStream<'_> {
        let take = self.listing_fault_after.unwrap_or(self.images.len());
        if take < self.images.len() {
            warn!("Listing {} interrupted after {} images", self.config.name, take);
        }
        let images = stream::iter(self.images.iter().take(take).map(|(info, _)| info.clone()));
        limited(images.boxed(), limit)
    }

    async fn download_image(&self, image: &ImageInfo, destination: &Path) -> bool {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(current, Ordering::SeqCst);

        if !self.transfer_delay.is_zero() {
            tokio::time::sleep(self.transfer_delay).await;
        }
        let ok = self.transfer(image, destination).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        ok
    }

    async fn upload_image(&self, local_path: &Path, remote_path: Option<&str>) -> UploadResult {
        {
            let mut log = self.log();
            if log.upload_failures > 0 {
                log.upload_failures -= 1;
                return UploadResult::failed("Scripted upload failure");
            }
        }

        if let Err(e) = tokio::fs::metadata(local_path).await {
            return UploadResult::failed(format!("{}: {}", local_path.display(), e));
        }

        let remote = match remote_path {
            Some(remote) => remote.to_string(),
            None => local_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        };
        self.log().uploads.push(remote.clone());

        UploadResult::ok(
            Some(format!("memory://{}/{}", self.config.name, remote)),
            "Stored in memory",
        )
    }

    async fn get_image_count(&self) -> Option<u64> {
        match self.count {
            Some(count) => count,
            None => Some(self.images.len() as u64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_listing_order_and_limit() {
        let provider = MemoryProvider::new("mem")
            .with_image("a.png", &b"a"[..])
            .with_image("b.png", &b"b"[..])
            .with_image("c.png", &b"c"[..]);

        let names: Vec<String> = provider
            .list_images(Some(2))
            .map(|i| i.filename)
            .collect()
            .await;
        assert_eq!(names, vec!["a.png", "b.png"]);
        assert_eq!(provider.get_image_count().await, Some(3));
    }

    #[tokio::test]
    async fn test_scripted_failures() {
        let temp = TempDir::new().unwrap();
        let provider = MemoryProvider::new("mem")
            .with_image("a.png", &b"a"[..])
            .fail_downloads("a.png", 1);
        let image = provider.list_images(None).next().await.unwrap();
        let dest = temp.path().join("a.png");

        assert!(!provider.download_image(&image, &dest).await);
        assert!(!dest.exists());
        assert!(provider.download_image(&image, &dest).await);
        assert_eq!(provider.attempts("a.png"), 2);
        assert_eq!(provider.max_concurrent(), 1);
    }

    #[tokio::test]
    async fn test_listing_fault_truncates() {
        let provider = MemoryProvider::new("mem")
            .with_image("a.png", &b"a"[..])
            .with_image("b.png", &b"b"[..])
            .listing_fault_after(1);

        assert_eq!(provider.list_images(None).count().await, 1);
    }
}
