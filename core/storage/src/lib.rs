//! Image provider abstraction for the backup engine.
//!
//! This module provides a trait-based interface for image hosting backends
//! (object-storage buckets, REST galleries, source repositories) and a
//! provider registry that resolves configured providers by name.
//!
//! # Design Principles
//! - Provider isolation: no backend-specific logic in the orchestrators
//! - Faults stay inside providers: every contract method reports failure as
//!   `false`, an empty stream, `None` or a failed `UploadResult`
//! - Lazy enumeration: listings are streams that stop at the requested limit

pub mod github;
mod http;
pub mod local;
pub mod memory;
pub mod provider;
pub mod registry;
pub mod smms;

pub use github::GitHubProvider;
pub use local::LocalProvider;
pub use memory::MemoryProvider;
pub use provider::{persist_bytes, ImageProvider, ImageStream, ProviderOptions};
pub use registry::{builtin_providers, ProviderFactory, ProviderRegistry, RegistryError};
pub use smms::SmmsProvider;
