//! Common utilities and types shared across the image backup crates.
//!
//! This crate provides the error taxonomy, the value types exchanged between
//! providers and orchestrators, and the configuration model.

pub mod config;
pub mod error;
pub mod types;

pub use config::{AppConfig, ProviderConfig, ProviderKind, ProviderSettings};
pub use error::{Error, Result};
pub use types::{is_image_path, ImageInfo, Operation, RecordStatus, UploadResult, IMAGE_EXTENSIONS};
