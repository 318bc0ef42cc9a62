//! Provider registry for name-based provider resolution.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tracing::{debug, info, warn};

use imgbackup_common::{AppConfig, ProviderConfig, ProviderKind, Result};

use crate::provider::{ImageProvider, ProviderOptions};

/// Factory function type for creating providers.
pub type ProviderFactory =
    Box<dyn Fn(&ProviderConfig, &ProviderOptions) -> Result<Arc<dyn ImageProvider>> + Send + Sync>;

/// Why a provider could not be resolved.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("provider '{0}' is not configured")]
    NotConfigured(String),

    #[error("provider '{0}' is disabled")]
    Disabled(String),

    #[error("provider '{name}' has an invalid configuration: {reason}")]
    InvalidConfig { name: String, reason: String },

    #[error("provider '{0}' has no implementation")]
    Unimplemented(String),

    #[error("failed to construct provider '{name}': {reason}")]
    Construction { name: String, reason: String },
}

/// Built-in provider table, in listing order.
pub fn builtin_providers() -> Vec<(&'static str, ProviderKind, ProviderFactory)> {
    vec![
        (
            "local",
            ProviderKind::Bucket,
            Box::new(|config: &ProviderConfig, _: &ProviderOptions| {
                Ok(Arc::new(crate::local::LocalProvider::new(config.clone())?)
                    as Arc<dyn ImageProvider>)
            }) as ProviderFactory,
        ),
        (
            "smms",
            ProviderKind::Gallery,
            Box::new(|config: &ProviderConfig, options: &ProviderOptions| {
                Ok(Arc::new(crate::smms::SmmsProvider::new(config.clone(), options)?)
                    as Arc<dyn ImageProvider>)
            }) as ProviderFactory,
        ),
        (
            "github",
            ProviderKind::Repository,
            Box::new(|config: &ProviderConfig, options: &ProviderOptions| {
                Ok(Arc::new(crate::github::GitHubProvider::new(config.clone(), options)?)
                    as Arc<dyn ImageProvider>)
            }) as ProviderFactory,
        ),
    ]
}

/// Names older configurations use for built-in implementations.
const ALIASES: &[(&str, &str)] = &[("sms", "smms")];

#[derive(Default)]
struct Catalog {
    discovered: bool,
    order: Vec<String>,
    factories: HashMap<String, ProviderFactory>,
    pending: Vec<(String, ProviderFactory)>,
}

impl Catalog {
    /// Merge one factory; the first registration of a name wins.
    fn insert(&mut self, name: String, factory: ProviderFactory) -> bool {
        if self.factories.contains_key(&name) {
            warn!("Provider '{}' is already registered, ignoring duplicate", name);
            return false;
        }
        self.order.push(name.clone());
        self.factories.insert(name, factory);
        true
    }

    /// Factory for `name`, falling back to the built-in an alias points at.
    fn factory(&self, name: &str) -> Option<&ProviderFactory> {
        self.factories.get(name).or_else(|| {
            ALIASES
                .iter()
                .find(|(alias, _)| *alias == name)
                .and_then(|(_, target)| self.factories.get(*target))
        })
    }

    fn ensure_discovered(&mut self) {
        if self.discovered {
            return;
        }
        for (name, _, factory) in builtin_providers() {
            self.insert(name.to_string(), factory);
        }
        for (name, factory) in std::mem::take(&mut self.pending) {
            self.insert(name, factory);
        }
        self.discovered = true;
        info!("Discovered {} providers: {}", self.order.len(), self.order.join(", "));
    }
}

/// Registry resolving provider names to validated, cached instances.
///
/// Discovery merges the built-in table with extension registrations once,
/// on first use. Instances are constructed lazily and cached per name.
pub struct ProviderRegistry {
    config: Arc<AppConfig>,
    options: ProviderOptions,
    cache: Mutex<HashMap<String, Arc<dyn ImageProvider>>>,
    catalog: Mutex<Catalog>,
}

impl ProviderRegistry {
    /// Create a registry over the given configuration.
    pub fn new(config: Arc<AppConfig>) -> Self {
        let options = ProviderOptions::from_config(&config);
        Self {
            config,
            options,
            cache: Mutex::new(HashMap::new()),
            catalog: Mutex::new(Catalog::default()),
        }
    }

    /// Queue an extension provider before discovery.
    pub fn with_extension(self, name: impl Into<String>, factory: ProviderFactory) -> Self {
        self.register(name, factory);
        self
    }

    /// Register an extension provider factory.
    ///
    /// Before discovery the factory is queued and merged after the
    /// built-ins; afterwards it is merged immediately. A name that is
    /// already known is logged and ignored.
    ///
    /// # Postconditions
    /// - Returns `true` if the factory was accepted
    pub fn register(&self, name: impl Into<String>, factory: ProviderFactory) -> bool {
        let name = name.into();
        let mut catalog = self.catalog();

        if catalog.discovered {
            return catalog.insert(name, factory);
        }

        let builtin = builtin_providers().iter().any(|(n, _, _)| *n == name);
        let queued = catalog.pending.iter().any(|(n, _)| *n == name);
        if builtin || queued {
            warn!("Provider '{}' is already registered, ignoring duplicate", name);
            return false;
        }
        catalog.pending.push((name, factory));
        true
    }

    /// Resolve a provider by name.
    ///
    /// # Errors
    /// In check order: not configured, disabled, invalid configuration,
    /// no implementation, constructor failure.
    pub fn get(&self, name: &str) -> std::result::Result<Arc<dyn ImageProvider>, RegistryError> {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(provider) = cache.get(name) {
            return Ok(Arc::clone(provider));
        }

        let config = self
            .config
            .provider(name)
            .ok_or_else(|| RegistryError::NotConfigured(name.to_string()))?;
        if !config.enabled {
            return Err(RegistryError::Disabled(name.to_string()));
        }
        config.validate().map_err(|e| RegistryError::InvalidConfig {
            name: name.to_string(),
            reason: e.to_string(),
        })?;

        let mut catalog = self.catalog();
        catalog.ensure_discovered();
        let factory = catalog
            .factory(name)
            .ok_or_else(|| RegistryError::Unimplemented(name.to_string()))?;

        let provider = factory(config, &self.options).map_err(|e| RegistryError::Construction {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
        debug!("Constructed provider '{}'", name);

        cache.insert(name.to_string(), Arc::clone(&provider));
        Ok(provider)
    }

    /// Evict a cached instance so the next `get` reconstructs it.
    pub fn refresh(&self, name: &str) {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if cache.remove(name).is_some() {
            debug!("Evicted provider '{}'", name);
        }
    }

    /// Evict every cached instance.
    pub fn clear_cache(&self) {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Whether an implementation exists for `name`.
    pub fn is_supported(&self, name: &str) -> bool {
        let mut catalog = self.catalog();
        catalog.ensure_discovered();
        catalog.factory(name).is_some()
    }

    /// Names of all implementations: built-ins first, then extensions.
    pub fn list_providers(&self) -> Vec<String> {
        let mut catalog = self.catalog();
        catalog.ensure_discovered();
        catalog.order.clone()
    }

    /// Names of configured providers that are enabled and valid.
    pub fn enabled_providers(&self) -> Vec<String> {
        self.config.enabled_providers()
    }

    /// Configuration the registry resolves against.
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    fn catalog(&self) -> MutexGuard<'_, Catalog> {
        self.catalog.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryProvider;
    use imgbackup_common::ProviderSettings;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn memory_factory() -> ProviderFactory {
        Box::new(|config: &ProviderConfig, _: &ProviderOptions| {
            Ok(Arc::new(MemoryProvider::new(config.name.clone())) as Arc<dyn ImageProvider>)
        })
    }

    fn config_with(providers: Vec<ProviderConfig>) -> Arc<AppConfig> {
        let mut config = AppConfig::default();
        for provider in providers {
            config.insert_provider(provider);
        }
        Arc::new(config)
    }

    fn bucket(name: &str, enabled: bool, bucket: &str) -> ProviderConfig {
        ProviderConfig::new(
            name,
            enabled,
            ProviderSettings::Bucket {
                endpoint: "/tmp/imgbackup-test".to_string(),
                bucket: bucket.to_string(),
                prefix: String::new(),
                access_key_id: None,
                access_key_secret: None,
                public_url: None,
            },
        )
    }

    #[test]
    fn test_list_builtins_then_extensions() {
        let registry = ProviderRegistry::new(config_with(vec![]))
            .with_extension("mem", memory_factory());

        assert_eq!(registry.list_providers(), vec!["local", "smms", "github", "mem"]);
        assert!(registry.is_supported("mem"));
        assert!(!registry.is_supported("oss"));
    }

    #[test]
    fn test_duplicate_registration_is_ignored() {
        let registry = ProviderRegistry::new(config_with(vec![bucket("local", true, "b")]));

        assert!(!registry.register("local", memory_factory()));
        assert!(registry.register("mem", memory_factory()));
        assert!(!registry.register("mem", memory_factory()));

        // The built-in still wins after discovery.
        let provider = registry.get("local").unwrap();
        assert_eq!(provider.config().kind(), ProviderKind::Bucket);
        assert!(!registry.register("smms", memory_factory()));
    }

    #[test]
    fn test_absent_reasons() {
        let registry = ProviderRegistry::new(config_with(vec![
            bucket("off", false, "b"),
            bucket("broken", true, ""),
            bucket("unknown", true, "b"),
        ]));

        assert_eq!(
            registry.get("missing").err(),
            Some(RegistryError::NotConfigured("missing".to_string()))
        );
        assert_eq!(
            registry.get("off").err(),
            Some(RegistryError::Disabled("off".to_string()))
        );
        assert!(matches!(
            registry.get("broken").err(),
            Some(RegistryError::InvalidConfig { .. })
        ));
        assert_eq!(
            registry.get("unknown").err(),
            Some(RegistryError::Unimplemented("unknown".to_string()))
        );
    }

    #[test]
    fn test_construction_failure() {
        let registry = ProviderRegistry::new(config_with(vec![bucket("bad", true, "b")]))
            .with_extension(
                "bad",
                Box::new(|_: &ProviderConfig, _: &ProviderOptions| {
                    Err(imgbackup_common::Error::Network("unreachable".to_string()))
                }),
            );

        assert!(matches!(
            registry.get("bad").err(),
            Some(RegistryError::Construction { .. })
        ));
    }

    #[test]
    fn test_instances_are_cached_until_refresh() {
        let built = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&built);
        let registry = ProviderRegistry::new(config_with(vec![bucket("mem", true, "b")]))
            .with_extension(
                "mem",
                Box::new(move |config: &ProviderConfig, _: &ProviderOptions| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(Arc::new(MemoryProvider::new(config.name.clone())) as Arc<dyn ImageProvider>)
                }),
            );

        let first = registry.get("mem").unwrap();
        let second = registry.get("mem").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(built.load(Ordering::SeqCst), 1);

        registry.refresh("mem");
        let third = registry.get("mem").unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(built.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_concurrent_get_constructs_once() {
        let built = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&built);
        let registry = Arc::new(
            ProviderRegistry::new(config_with(vec![bucket("mem", true, "b")])).with_extension(
                "mem",
                Box::new(move |config: &ProviderConfig, _: &ProviderOptions| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    std::thread::sleep(std::time::Duration::from_millis(20));
                    Ok(Arc::new(MemoryProvider::new(config.name.clone())) as Arc<dyn ImageProvider>)
                }),
            ),
        );

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || registry.get("mem").unwrap())
            })
            .collect();
        let instances: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(built.load(Ordering::SeqCst), 1);
        assert!(instances.iter().all(|p| Arc::ptr_eq(p, &instances[0])));
    }

    #[test]
    fn test_sms_alias_resolves_to_smms() {
        let registry = ProviderRegistry::new(config_with(vec![ProviderConfig::new(
            "sms",
            true,
            ProviderSettings::Gallery {
                api_token: "token".to_string(),
                endpoint: Some("http://127.0.0.1:9".to_string()),
            },
        )]));

        assert!(registry.is_supported("sms"));
        assert!(!registry.list_providers().contains(&"sms".to_string()));

        let provider = registry.get("sms").unwrap();
        assert_eq!(provider.name(), "sms");
        assert_eq!(provider.config().kind(), ProviderKind::Gallery);
    }

    #[test]
    fn test_enabled_providers() {
        let registry = ProviderRegistry::new(config_with(vec![
            bucket("a", true, "b"),
            bucket("b", false, "b"),
            bucket("c", true, ""),
        ]));
        assert_eq!(registry.enabled_providers(), vec!["a"]);
    }
}
