//! Local Pool Policy
//!
//! Hands out resources from a fixed pool seeded from configuration.
//! The pool lives in memory; allocation state is lost on restart.

use crate::domain::ports::{PolicyDriver, RequestContext, Resource, ResourceMetadata};
use crate::error::{Error, Result};
use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Resource type given to pool entries built from `instances`
pub const DEFAULT_INSTANCE_RESOURCE_TYPE: &str = "router";

/// Descriptor given to pool entries built from `instances`
pub const DEFAULT_INSTANCE_DESCRIPTOR: &str = "com.vyatta.vm";

// =============================================================================
// Configuration
// =============================================================================

/// A single pre-provisioned resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSeed {
    /// Fixed id; a UUID is generated when absent
    #[serde(default)]
    pub resource_id: Option<String>,
    pub resource_type: String,
    pub resource_descriptor: String,
    #[serde(default)]
    pub resource_metadata: ResourceMetadata,
}

/// Configuration for the local pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalPoolConfig {
    /// Explicit resources, seeded in order
    #[serde(default)]
    pub resources: Vec<ResourceSeed>,
    /// Router instances: instance id -> management IP
    #[serde(default)]
    pub instances: BTreeMap<String, String>,
    /// Resource type for entries built from `instances`
    #[serde(default = "default_instance_resource_type")]
    pub instance_resource_type: String,
    /// Descriptor for entries built from `instances`
    #[serde(default = "default_instance_descriptor")]
    pub instance_descriptor: String,
}

fn default_instance_resource_type() -> String {
    DEFAULT_INSTANCE_RESOURCE_TYPE.to_string()
}

fn default_instance_descriptor() -> String {
    DEFAULT_INSTANCE_DESCRIPTOR.to_string()
}

impl Default for LocalPoolConfig {
    fn default() -> Self {
        Self {
            resources: Vec::new(),
            instances: BTreeMap::new(),
            instance_resource_type: default_instance_resource_type(),
            instance_descriptor: default_instance_descriptor(),
        }
    }
}

// =============================================================================
// Local Pool Policy
// =============================================================================

/// Policy driver over a fixed in-memory pool
#[derive(Debug)]
pub struct LocalPoolPolicy {
    /// Pool in seed order; the scan picks the first free match
    resources: Mutex<IndexMap<String, Resource>>,
}

impl LocalPoolPolicy {
    /// Build the pool from configuration
    pub fn new(config: LocalPoolConfig) -> Result<Self> {
        let mut pool = IndexMap::new();

        for seed in config.resources {
            let resource = Resource {
                resource_id: seed
                    .resource_id
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                resource_type: seed.resource_type,
                allocated: false,
                resource_descriptor: seed.resource_descriptor,
                resource_metadata: seed.resource_metadata,
            };
            insert_unique(&mut pool, resource)?;
        }

        for (instance_id, instance_ip) in config.instances {
            let resource = resource_for_instance(
                &config.instance_resource_type,
                &config.instance_descriptor,
                &instance_id,
                &instance_ip,
            );
            insert_unique(&mut pool, resource)?;
        }

        info!("Local resource pool seeded with {} resources", pool.len());

        Ok(Self {
            resources: Mutex::new(pool),
        })
    }

    /// Build the pool from ready-made resources; they all start free
    pub fn from_resources(resources: impl IntoIterator<Item = Resource>) -> Self {
        let pool = resources
            .into_iter()
            .map(|mut resource| {
                resource.allocated = false;
                (resource.resource_id.clone(), resource)
            })
            .collect();

        Self {
            resources: Mutex::new(pool),
        }
    }

    /// Snapshot of a single pool entry
    pub fn resource(&self, resource_id: &str) -> Option<Resource> {
        self.resources.lock().get(resource_id).cloned()
    }

    /// Snapshot of the whole pool in seed order
    pub fn resources(&self) -> Vec<Resource> {
        self.resources.lock().values().cloned().collect()
    }

    /// Number of free resources of `resource_type`
    pub fn available(&self, resource_type: &str) -> usize {
        self.resources
            .lock()
            .values()
            .filter(|r| !r.allocated && r.resource_type == resource_type)
            .count()
    }
}

fn insert_unique(pool: &mut IndexMap<String, Resource>, resource: Resource) -> Result<()> {
    if pool.contains_key(&resource.resource_id) {
        return Err(Error::Configuration(format!(
            "duplicate resource id in local pool: {}",
            resource.resource_id
        )));
    }
    pool.insert(resource.resource_id.clone(), resource);
    Ok(())
}

/// Build a pool entry for a pre-provisioned router instance
fn resource_for_instance(
    resource_type: &str,
    descriptor: &str,
    instance_id: &str,
    instance_ip: &str,
) -> Resource {
    let mut metadata = ResourceMetadata::new();
    metadata.insert("instance_id".into(), Value::String(instance_id.to_string()));
    metadata.insert("instance_ip".into(), Value::String(instance_ip.to_string()));

    Resource {
        resource_id: uuid::Uuid::new_v4().to_string(),
        resource_type: resource_type.to_string(),
        allocated: false,
        resource_descriptor: descriptor.to_string(),
        resource_metadata: metadata,
    }
}

#[async_trait]
impl PolicyDriver for LocalPoolPolicy {
    async fn acquire_resource(
        &self,
        ctx: &RequestContext,
        resource_type: &str,
    ) -> Result<Resource> {
        let mut pool = self.resources.lock();

        let resource = pool
            .values_mut()
            .find(|r| !r.allocated && r.resource_type == resource_type)
            .ok_or_else(|| Error::NoMoreResources {
                resource_type: resource_type.to_string(),
            })?;

        resource.allocated = true;
        debug!(
            "[{}] Local pool allocated {} ({})",
            ctx.request_id, resource.resource_id, resource.resource_descriptor
        );

        Ok(resource.clone())
    }

    async fn release_resource(&self, ctx: &RequestContext, resource_id: &str) -> Result<()> {
        let mut pool = self.resources.lock();

        let resource = pool
            .get_mut(resource_id)
            .ok_or_else(|| Error::WrongResourceId {
                resource_id: resource_id.to_string(),
            })?;

        if !resource.allocated {
            warn!(
                "[{}] Releasing resource {} that was not allocated",
                ctx.request_id, resource_id
            );
        }
        resource.allocated = false;
        debug!("[{}] Local pool released {}", ctx.request_id, resource_id);

        Ok(())
    }

    fn driver_name(&self) -> &str {
        "local_pool"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn ctx() -> RequestContext {
        RequestContext::new("test")
    }

    fn ten_instances() -> LocalPoolConfig {
        LocalPoolConfig {
            instances: (0..10)
                .map(|i| (i.to_string(), format!("127.0.0.{}", i)))
                .collect(),
            ..Default::default()
        }
    }

    fn seed(id: &str) -> ResourceSeed {
        ResourceSeed {
            resource_id: Some(id.into()),
            resource_type: "router".into(),
            resource_descriptor: format!("backend-{}", id.to_lowercase()),
            resource_metadata: ResourceMetadata::new(),
        }
    }

    #[tokio::test]
    async fn test_acquire_resource() {
        let policy = LocalPoolPolicy::new(ten_instances()).unwrap();

        let res = policy.acquire_resource(&ctx(), "router").await.unwrap();
        assert!(res.allocated);
        assert_eq!(res.resource_descriptor, DEFAULT_INSTANCE_DESCRIPTOR);
        assert!(res.resource_metadata.contains_key("instance_ip"));
        assert_eq!(policy.available("router"), 9);
    }

    #[tokio::test]
    async fn test_acquire_unknown_type_fails() {
        let policy = LocalPoolPolicy::new(ten_instances()).unwrap();

        let err = policy
            .acquire_resource(&ctx(), "fake-resource-type")
            .await
            .unwrap_err();
        assert_matches!(err, Error::NoMoreResources { resource_type } if resource_type == "fake-resource-type");
    }

    #[tokio::test]
    async fn test_release_resource() {
        let policy = LocalPoolPolicy::new(ten_instances()).unwrap();

        let res = policy.acquire_resource(&ctx(), "router").await.unwrap();
        policy.release_resource(&ctx(), &res.resource_id).await.unwrap();

        assert!(!policy.resource(&res.resource_id).unwrap().allocated);
        assert_eq!(policy.available("router"), 10);
    }

    #[tokio::test]
    async fn test_release_unknown_resource_fails() {
        let policy = LocalPoolPolicy::new(ten_instances()).unwrap();

        let err = policy
            .release_resource(&ctx(), "fake-resource-id")
            .await
            .unwrap_err();
        assert_matches!(err, Error::WrongResourceId { .. });
    }

    #[tokio::test]
    async fn test_acquired_resource_is_a_copy() {
        let policy = LocalPoolPolicy::new(ten_instances()).unwrap();

        let mut res = policy.acquire_resource(&ctx(), "router").await.unwrap();
        res.allocated = false;
        res.resource_descriptor = "tampered".into();

        let internal = policy.resource(&res.resource_id).unwrap();
        assert!(internal.allocated);
        assert_eq!(internal.resource_descriptor, DEFAULT_INSTANCE_DESCRIPTOR);
    }

    #[tokio::test]
    async fn test_pool_exhaustion_in_seed_order() {
        let config = LocalPoolConfig {
            resources: vec![seed("A"), seed("B")],
            ..Default::default()
        };
        let policy = LocalPoolPolicy::new(config).unwrap();

        let first = policy.acquire_resource(&ctx(), "router").await.unwrap();
        let second = policy.acquire_resource(&ctx(), "router").await.unwrap();
        assert_eq!(first.resource_id, "A");
        assert_eq!(second.resource_id, "B");

        let err = policy.acquire_resource(&ctx(), "router").await.unwrap_err();
        assert_matches!(err, Error::NoMoreResources { resource_type } if resource_type == "router");
    }

    #[test]
    fn test_duplicate_seed_rejected() {
        let config = LocalPoolConfig {
            resources: vec![seed("A"), seed("A")],
            ..Default::default()
        };
        assert_matches!(LocalPoolPolicy::new(config), Err(Error::Configuration(_)));
    }

    #[tokio::test]
    async fn test_concurrent_acquire_never_shares_a_resource() {
        let policy = std::sync::Arc::new(LocalPoolPolicy::new(ten_instances()).unwrap());

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let policy = policy.clone();
                tokio::spawn(async move { policy.acquire_resource(&ctx(), "router").await })
            })
            .collect();

        let mut ids = std::collections::HashSet::new();
        for handle in handles {
            let res = handle.await.unwrap().unwrap();
            assert!(ids.insert(res.resource_id));
        }
        assert_eq!(ids.len(), 10);
        assert_eq!(policy.available("router"), 0);
    }
}
