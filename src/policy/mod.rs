//! Allocation Policies
//!
//! Provides the policy drivers that hand out scarce resources:
//! - Local pool: fixed in-memory pool seeded from configuration
//! - Remote: delegates to an HTTP allocation service
//!
//! [`PolicyManager`] holds the one driver selected by configuration.

pub mod local;
pub mod remote;

pub use local::*;
pub use remote::*;

use crate::domain::ports::{PolicyDriver, RequestContext, Resource};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Driver selection and its settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "driver", rename_all = "snake_case")]
pub enum PolicyConfig {
    LocalPool(LocalPoolConfig),
    Remote(RemoteAllocationConfig),
}

impl Default for PolicyConfig {
    fn default() -> Self {
        PolicyConfig::LocalPool(LocalPoolConfig::default())
    }
}

/// Factory for creating policy drivers
pub struct PolicyFactory;

impl PolicyFactory {
    /// Create the driver described by `config`
    pub fn create(config: &PolicyConfig) -> Result<Arc<dyn PolicyDriver>> {
        match config {
            PolicyConfig::LocalPool(local) => Ok(Arc::new(LocalPoolPolicy::new(local.clone())?)),
            PolicyConfig::Remote(remote) => Ok(Arc::new(RemoteAllocationPolicy::new(remote)?)),
        }
    }
}

/// Thin indirection over the configured policy driver
#[derive(Clone)]
pub struct PolicyManager {
    driver: Arc<dyn PolicyDriver>,
}

impl PolicyManager {
    /// Wrap an already constructed driver
    pub fn new(driver: Arc<dyn PolicyDriver>) -> Self {
        info!("Using policy driver: {}", driver.driver_name());
        Self { driver }
    }

    /// Construct the driver selected by configuration
    pub fn from_config(config: &PolicyConfig) -> Result<Self> {
        Ok(Self::new(PolicyFactory::create(config)?))
    }

    /// Get the configured driver
    pub fn driver(&self) -> &Arc<dyn PolicyDriver> {
        &self.driver
    }

    pub async fn acquire_resource(
        &self,
        ctx: &RequestContext,
        resource_type: &str,
    ) -> Result<Resource> {
        self.driver.acquire_resource(ctx, resource_type).await
    }

    pub async fn release_resource(&self, ctx: &RequestContext, resource_id: &str) -> Result<()> {
        self.driver.release_resource(ctx, resource_id).await
    }
}
