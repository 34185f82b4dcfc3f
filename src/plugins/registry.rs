//! Plugin Registry
//!
//! Maps resource descriptors to the router backend serving them. Built once
//! from configuration and read-only afterwards.

use super::memory::InMemoryRouterBackend;
use crate::domain::ports::RouterBackendRef;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

// =============================================================================
// Configuration
// =============================================================================

/// Backend plugins to load
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginConfig {
    /// Descriptor of the backend receiving passthrough operations
    #[serde(default = "default_descriptor")]
    pub default: String,
    /// Descriptor -> provider name
    #[serde(default = "default_providers")]
    pub providers: BTreeMap<String, String>,
}

fn default_descriptor() -> String {
    "linuxbridge".to_string()
}

fn default_providers() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("linuxbridge".to_string(), "memory".to_string()),
        (
            crate::policy::DEFAULT_INSTANCE_DESCRIPTOR.to_string(),
            "memory".to_string(),
        ),
    ])
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            default: default_descriptor(),
            providers: default_providers(),
        }
    }
}

// =============================================================================
// Plugin Factory
// =============================================================================

/// Instantiates a backend for a provider name
pub trait PluginFactory: Send + Sync {
    /// Create the backend `provider` serving `descriptor`
    fn create(&self, provider: &str, descriptor: &str) -> Result<RouterBackendRef>;
}

/// Factory for the built-in router backends
pub struct BackendFactory;

impl PluginFactory for BackendFactory {
    fn create(&self, provider: &str, descriptor: &str) -> Result<RouterBackendRef> {
        match provider.to_lowercase().as_str() {
            "memory" | "in_memory" => Ok(Arc::new(InMemoryRouterBackend::new(descriptor))),
            _ => Err(Error::Configuration(format!(
                "unknown plugin provider '{}' for descriptor '{}'",
                provider, descriptor
            ))),
        }
    }
}

// =============================================================================
// Plugin Registry
// =============================================================================

/// Read-only descriptor -> backend map
pub struct PluginRegistry {
    /// Sorted by descriptor
    backends: BTreeMap<String, RouterBackendRef>,
    default_descriptor: String,
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("descriptors", &self.backends.keys().collect::<Vec<_>>())
            .field("default_descriptor", &self.default_descriptor)
            .finish()
    }
}

impl PluginRegistry {
    /// Instantiate every configured provider through `factory`
    pub fn from_config(config: &PluginConfig, factory: &dyn PluginFactory) -> Result<Self> {
        let mut backends = BTreeMap::new();

        for (descriptor, provider) in &config.providers {
            debug!("Loading plugin {} for descriptor {}", provider, descriptor);
            backends.insert(descriptor.clone(), factory.create(provider, descriptor)?);
        }

        Self::new(backends, config.default.clone())
    }

    /// Build from ready-made backends
    pub fn new(
        backends: impl IntoIterator<Item = (String, RouterBackendRef)>,
        default_descriptor: impl Into<String>,
    ) -> Result<Self> {
        let backends: BTreeMap<_, _> = backends.into_iter().collect();
        let default_descriptor = default_descriptor.into();

        if !backends.contains_key(&default_descriptor) {
            return Err(Error::Configuration(format!(
                "default plugin descriptor '{}' is not configured",
                default_descriptor
            )));
        }

        info!(
            "Plugin registry loaded {} backends (default: {})",
            backends.len(),
            default_descriptor
        );

        Ok(Self {
            backends,
            default_descriptor,
        })
    }

    /// Backend serving `descriptor`
    pub fn get(&self, descriptor: &str) -> Result<&RouterBackendRef> {
        self.backends
            .get(descriptor)
            .ok_or_else(|| Error::UnknownDescriptor {
                descriptor: descriptor.to_string(),
            })
    }

    pub fn contains(&self, descriptor: &str) -> bool {
        self.backends.contains_key(descriptor)
    }

    /// Backend receiving operations no binding can route
    pub fn default_backend(&self) -> &RouterBackendRef {
        // Presence is checked in `new`; the map is never mutated afterwards
        &self.backends[&self.default_descriptor]
    }

    pub fn default_descriptor(&self) -> &str {
        &self.default_descriptor
    }

    /// `(descriptor, backend)` pairs in descriptor order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &RouterBackendRef)> {
        self.backends.iter().map(|(d, b)| (d.as_str(), b))
    }

    pub fn descriptors(&self) -> Vec<&str> {
        self.backends.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}
