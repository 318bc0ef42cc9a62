//! Value types exchanged between providers, orchestrators and the metadata store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// File extensions recognised as images (lowercase, without the dot).
pub const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "bmp", "webp", "svg", "tiff", "tif", "ico",
];

/// Check whether a path or object key names an image file.
pub fn is_image_path(path: impl AsRef<Path>) -> bool {
    path.as_ref()
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            IMAGE_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

/// Descriptor of one remote image, produced by a provider's enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    /// Direct URL of the image (may be empty for backends without URLs).
    pub url: String,
    /// Remote file name.
    pub filename: String,
    /// Size in bytes, when the backend reports it.
    pub size: Option<u64>,
    /// Creation or last-modified time, when the backend reports it.
    pub created_at: Option<DateTime<Utc>>,
    /// Backend-specific attributes (object key, sha, delete url, ...).
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl ImageInfo {
    /// Create an image descriptor with no optional attributes.
    pub fn new(url: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            filename: filename.into(),
            size: None,
            created_at: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Set the size.
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    /// Set the creation time.
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    /// Add a metadata attribute.
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Remote location recorded in history: the URL, or the file name if there is none.
    pub fn remote_path(&self) -> &str {
        if self.url.is_empty() {
            &self.filename
        } else {
            &self.url
        }
    }
}

/// Outcome of a single upload call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResult {
    pub success: bool,
    pub url: Option<String>,
    pub message: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl UploadResult {
    /// Successful upload.
    pub fn ok(url: Option<String>, message: impl Into<String>) -> Self {
        Self {
            success: true,
            url,
            message: message.into(),
            metadata: BTreeMap::new(),
        }
    }

    /// Failed upload.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            url: None,
            message: message.into(),
            metadata: BTreeMap::new(),
        }
    }

    /// Add a metadata attribute.
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Direction of a recorded operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Download,
    Upload,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Download => "download",
            Operation::Upload => "upload",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "download" => Ok(Operation::Download),
            "upload" => Ok(Operation::Upload),
            other => Err(crate::Error::InvalidInput(format!(
                "Unknown operation '{}'",
                other
            ))),
        }
    }
}

/// Terminal status of a recorded operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Success,
    Failed,
    Skipped,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Success => "success",
            RecordStatus::Failed => "failed",
            RecordStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "success" => Ok(RecordStatus::Success),
            "failed" => Ok(RecordStatus::Failed),
            "skipped" => Ok(RecordStatus::Skipped),
            other => Err(crate::Error::InvalidInput(format!(
                "Unknown record status '{}'",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_image_path() {
        assert!(is_image_path("photos/cat.JPG"));
        assert!(is_image_path("a.webp"));
        assert!(!is_image_path("notes.txt"));
        assert!(!is_image_path("no_extension"));
    }

    #[test]
    fn test_remote_path_falls_back_to_filename() {
        let with_url = ImageInfo::new("https://img.example/a.png", "a.png");
        assert_eq!(with_url.remote_path(), "https://img.example/a.png");

        let without_url = ImageInfo::new("", "b.png");
        assert_eq!(without_url.remote_path(), "b.png");
    }

    #[test]
    fn test_operation_and_status_parse() {
        assert_eq!("Download".parse::<Operation>().unwrap(), Operation::Download);
        assert_eq!("skipped".parse::<RecordStatus>().unwrap(), RecordStatus::Skipped);
        assert!("sync".parse::<Operation>().is_err());
        assert_eq!(RecordStatus::Failed.to_string(), "failed");
    }

    #[test]
    fn test_image_info_serialization() {
        let info = ImageInfo::new("https://img.example/a.png", "a.png")
            .with_size(1024)
            .with_meta("key", "images/a.png");

        let json = serde_json::to_string(&info).unwrap();
        let restored: ImageInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, info);
    }
}
