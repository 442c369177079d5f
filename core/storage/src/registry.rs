//! Provider registry for resolving a folder provider from configuration.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::provider::StorageProvider;
use peersync_common::{Error, Result};

/// Factory function type for creating providers.
pub type ProviderFactory = Box<dyn Fn(&Value) -> Result<Arc<dyn StorageProvider>> + Send + Sync>;

/// Registry for storage provider factories.
///
/// Configuration is a JSON object whose `provider` field names the factory;
/// the remaining fields are passed to it untouched.
pub struct ProviderRegistry {
    factories: HashMap<String, ProviderFactory>,
}

impl ProviderRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a provider factory.
    ///
    /// # Errors
    /// - Returns error if name is already registered
    pub fn register(&mut self, name: impl Into<String>, factory: ProviderFactory) -> Result<()> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(Error::AlreadyExists(format!(
                "Provider '{}' is already registered",
                name
            )));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Resolve a provider by name and configuration.
    ///
    /// # Errors
    /// - Provider not found
    /// - Configuration invalid
    pub fn resolve(&self, name: &str, config: &Value) -> Result<Arc<dyn StorageProvider>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("Provider '{}' is not registered", name)))?;
        factory(config)
    }

    /// Resolve using the `provider` field of the configuration itself.
    pub fn resolve_config(&self, config: &Value) -> Result<Arc<dyn StorageProvider>> {
        let name = config
            .get("provider")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::InvalidInput("Missing 'provider' field".to_string()))?;
        self.resolve(name, config)
    }

    /// Get list of registered provider names.
    pub fn providers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a registry with the built-in providers.
pub fn create_default_registry() -> ProviderRegistry {
    let mut factories: HashMap<String, ProviderFactory> = HashMap::new();

    factories.insert(
        "memory".to_string(),
        Box::new(|_config: &Value| -> Result<Arc<dyn StorageProvider>> {
            Ok(Arc::new(crate::memory::MemoryProvider::new()))
        }),
    );

    factories.insert(
        "local".to_string(),
        Box::new(|config: &Value| -> Result<Arc<dyn StorageProvider>> {
            let root = config
                .get("root")
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    Error::InvalidInput("Local provider requires 'root' path".to_string())
                })?;
            Ok(Arc::new(crate::local::LocalProvider::new(root)?))
        }),
    );

    ProviderRegistry { factories }
}
