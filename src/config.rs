//! Broker Configuration
//!
//! YAML configuration for the policy driver, backend plugins, binding store
//! and REST API.
//!
//! ```yaml
//! policy:
//!   driver: local_pool
//!   instances:
//!     inst-1: 10.0.0.1
//! plugins:
//!   default: linuxbridge
//!   providers:
//!     linuxbridge: memory
//!     com.vyatta.vm: memory
//! store:
//!   database_url: "sqlite:/var/lib/router-broker/bindings.db"
//! api:
//!   bind_addr: "0.0.0.0:8090"
//! ```

use crate::error::{Error, Result};
use crate::plugins::PluginConfig;
use crate::policy::PolicyConfig;
use crate::store::StoreConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

// =============================================================================
// API Configuration
// =============================================================================

/// REST API settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// REST API bind address
    pub bind_addr: String,
    /// Per-request timeout in seconds
    pub request_timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8090".to_string(),
            request_timeout_secs: 30,
        }
    }
}

impl ApiConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        self.bind_addr
            .parse()
            .map_err(|e| Error::Configuration(format!("Invalid API address {}: {}", self.bind_addr, e)))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

// =============================================================================
// Broker Configuration
// =============================================================================

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub policy: PolicyConfig,
    pub plugins: PluginConfig,
    pub store: StoreConfig,
    pub api: ApiConfig,
}

impl BrokerConfig {
    /// Load and validate a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    /// Parse and validate YAML
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if !self.plugins.providers.contains_key(&self.plugins.default) {
            return Err(Error::Configuration(format!(
                "default plugin descriptor '{}' has no provider",
                self.plugins.default
            )));
        }

        if self.store.database_url.trim().is_empty() {
            return Err(Error::Configuration("store.database_url is empty".into()));
        }
        if self.store.query_timeout_secs == 0 {
            return Err(Error::Configuration(
                "store.query_timeout_secs must be positive".into(),
            ));
        }

        if let PolicyConfig::Remote(remote) = &self.policy {
            if remote.host.trim().is_empty() || remote.port == 0 {
                return Err(Error::Configuration(format!(
                    "invalid remote allocation endpoint {}:{}",
                    remote.host, remote.port
                )));
            }
        }

        self.api.socket_addr()?;
        Ok(())
    }
}
