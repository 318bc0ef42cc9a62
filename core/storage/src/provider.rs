//! Image provider trait definition.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use imgbackup_common::{AppConfig, ImageInfo, ProviderConfig, Result, UploadResult};

/// Lazy sequence of images produced by a provider listing.
pub type ImageStream<'a> = BoxStream<'a, ImageInfo>;

/// Timeout applied to connection probes.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Runtime options handed to provider constructors.
#[derive(Debug, Clone)]
pub struct ProviderOptions {
    /// Per-request timeout.
    pub timeout: Duration,
    /// Buffer size for streaming reads.
    pub chunk_size: usize,
}

impl ProviderOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            timeout: config.timeout(),
            chunk_size: config.chunk_size.max(1),
        }
    }
}

impl Default for ProviderOptions {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// Image hosting backend.
///
/// One instance is shared by all download workers of a run, so
/// implementations must tolerate concurrent calls. No method returns a raw
/// error: faults are logged and reported as `false`, an empty or truncated
/// stream, `None` or a failed [`UploadResult`].
#[async_trait]
pub trait ImageProvider: Send + Sync {
    /// Get the provider name (e.g., "github", "smms", "local").
    fn name(&self) -> &str;

    /// Configuration the provider was built from.
    fn config(&self) -> &ProviderConfig;

    /// Lightweight reachability and credentials probe.
    ///
    /// Bounded by [`PROBE_TIMEOUT`]; any fault yields `false`.
    async fn test_connection(&self) -> bool;

    /// Enumerate images.
    ///
    /// The order is stable for a given provider and a fresh call restarts the
    /// enumeration. The stream ends after `limit` items even when more remain
    /// upstream. A fault mid-enumeration is logged and ends the stream, so
    /// callers receive the images listed so far.
    fn list_images(&self, limit: Option<usize>) -> ImageStream<'_>;

    /// Download one image to `destination`.
    ///
    /// # Postconditions
    /// - Parent directories of `destination` exist
    /// - `true` only once the content is durably written; on `false` no
    ///   file is left at `destination`
    async fn download_image(&self, image: &ImageInfo, destination: &Path) -> bool;

    /// Upload a local file, optionally to an explicit remote path.
    async fn upload_image(&self, local_path: &Path, remote_path: Option<&str>) -> UploadResult;

    /// Best-effort total number of images, used for progress estimation only.
    async fn get_image_count(&self) -> Option<u64>;

    /// Whether the provider's configuration is enabled.
    fn is_enabled(&self) -> bool {
        self.config().enabled
    }

    /// Whether the provider's configuration passes validation.
    fn validate_config(&self) -> bool {
        self.config().validate().is_ok()
    }
}

/// Apply an optional limit to a listing stream.
pub(crate) fn limited<'a>(stream: ImageStream<'a>, limit: Option<usize>) -> ImageStream<'a> {
    match limit {
        Some(limit) => stream.take(limit).boxed(),
        None => stream,
    }
}

fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    destination.with_file_name(name)
}

/// Write a byte stream to `destination` atomically.
///
/// Data goes to `<destination>.part`, is flushed to disk and then renamed into
/// place. On failure the partial file is removed. Returns the bytes written.
pub async fn persist_stream<S>(destination: &Path, mut chunks: S) -> Result<u64>
where
    S: Stream<Item = Result<Bytes>> + Unpin,
{
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent).await?;
    }

    let partial = partial_path(destination);
    let written = async {
        let mut file = fs::File::create(&partial).await?;
        let mut written = 0u64;
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.sync_all().await?;
        Ok::<_, imgbackup_common::Error>(written)
    }
    .await;

    match written {
        Ok(written) => match fs::rename(&partial, destination).await {
            Ok(()) => Ok(written),
            Err(e) => {
                let _ = fs::remove_file(&partial).await;
                Err(e.into())
            }
        },
        Err(e) => {
            let _ = fs::remove_file(&partial).await;
            Err(e)
        }
    }
}

/// Write an in-memory buffer to `destination` atomically.
pub async fn persist_bytes(destination: &Path, data: impl Into<Bytes>) -> Result<u64> {
    let data = data.into();
    persist_stream(destination, futures::stream::iter([Ok(data)])).await
}
