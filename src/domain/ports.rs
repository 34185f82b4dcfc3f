//! Domain Ports - Core trait definitions for the router broker
//!
//! These traits define the boundaries between the broker logic and external
//! systems: allocation policies, the binding store and the router backends.
//! Adapters implement these traits to provide concrete functionality.

use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Opaque key/value map attached to resources by the policy driver
pub type ResourceMetadata = BTreeMap<String, Value>;

// =============================================================================
// Request Context
// =============================================================================

/// Per-call context threaded through every broker operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    /// Correlation id used in logs
    pub request_id: String,
    /// Tenant on whose behalf the call is made
    pub tenant_id: Option<String>,
    /// Whether the caller has administrative rights
    pub is_admin: bool,
}

impl RequestContext {
    /// Create a context with an explicit request id
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            tenant_id: None,
            is_admin: false,
        }
    }

    /// Create an administrative context with a fresh request id
    pub fn admin() -> Self {
        Self {
            request_id: format!("req-{}", uuid::Uuid::new_v4()),
            tenant_id: None,
            is_admin: true,
        }
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }
}

// =============================================================================
// Resources
// =============================================================================

/// An allocatable unit managed by a policy driver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    /// Identifier assigned by the policy driver
    pub resource_id: String,
    /// Category of resource (e.g. `router`)
    pub resource_type: String,
    /// Whether the driver considers this resource taken
    pub allocated: bool,
    /// Backend that owns objects created on this resource
    pub resource_descriptor: String,
    /// Driver-defined metadata
    #[serde(default)]
    pub resource_metadata: ResourceMetadata,
}

// =============================================================================
// Bindings
// =============================================================================

/// Lifecycle state of a persisted binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindingStatus {
    Active,
    Deleted,
}

impl std::fmt::Display for BindingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BindingStatus::Active => write!(f, "active"),
            BindingStatus::Deleted => write!(f, "deleted"),
        }
    }
}

/// Persisted mapping of a logical object to the resource and backend behind it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Binding {
    /// Surrogate key
    pub id: i64,
    /// External object identifier
    pub object_id: String,
    pub resource_type: String,
    pub resource_id: String,
    pub resource_metadata: Option<ResourceMetadata>,
    pub resource_descriptor: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    /// 0 while active, the binding's own `id` once soft-deleted
    pub deleted: i64,
}

impl Binding {
    /// Lifecycle view over the `deleted` marker
    pub fn status(&self) -> BindingStatus {
        if self.deleted == 0 {
            BindingStatus::Active
        } else {
            BindingStatus::Deleted
        }
    }

    pub fn is_active(&self) -> bool {
        self.status() == BindingStatus::Active
    }
}

/// Values for inserting a new binding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewBinding {
    pub object_id: String,
    pub resource_type: String,
    pub resource_id: String,
    pub resource_metadata: Option<ResourceMetadata>,
    pub resource_descriptor: String,
}

impl NewBinding {
    /// Build the binding values for `object_id` living on `resource`
    pub fn from_resource(object_id: impl Into<String>, resource: &Resource) -> Self {
        Self {
            object_id: object_id.into(),
            resource_type: resource.resource_type.clone(),
            resource_id: resource.resource_id.clone(),
            resource_metadata: Some(resource.resource_metadata.clone()),
            resource_descriptor: resource.resource_descriptor.clone(),
        }
    }

    /// Values recreating `binding` as a new active row
    pub fn from_binding(binding: &Binding) -> Self {
        Self {
            object_id: binding.object_id.clone(),
            resource_type: binding.resource_type.clone(),
            resource_id: binding.resource_id.clone(),
            resource_metadata: binding.resource_metadata.clone(),
            resource_descriptor: binding.resource_descriptor.clone(),
        }
    }
}

/// Partial update of a binding; only these fields may change
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BindingUpdate {
    #[serde(default)]
    pub resource_metadata: Option<ResourceMetadata>,
    #[serde(default)]
    pub resource_descriptor: Option<String>,
    #[serde(default)]
    pub resource_type: Option<String>,
    #[serde(default)]
    pub resource_id: Option<String>,
}

impl BindingUpdate {
    pub fn is_empty(&self) -> bool {
        self.resource_metadata.is_none()
            && self.resource_descriptor.is_none()
            && self.resource_type.is_none()
            && self.resource_id.is_none()
    }

    /// Merge the set fields into `binding`
    pub fn apply_to(&self, binding: &mut Binding) {
        if let Some(metadata) = &self.resource_metadata {
            binding.resource_metadata = Some(metadata.clone());
        }
        if let Some(descriptor) = &self.resource_descriptor {
            binding.resource_descriptor = descriptor.clone();
        }
        if let Some(resource_type) = &self.resource_type {
            binding.resource_type = resource_type.clone();
        }
        if let Some(resource_id) = &self.resource_id {
            binding.resource_id = resource_id.clone();
        }
    }
}

// =============================================================================
// Router Objects
// =============================================================================

/// Payload for creating or updating a router
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouterRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Metadata handed to the backend; resource metadata is merged in on create
    #[serde(default)]
    pub metadata: ResourceMetadata,
    /// Backend-specific attributes passed through untouched
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

/// Router object as returned by a backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Router {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub metadata: ResourceMetadata,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

/// Sort key for collection queries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    pub key: String,
    pub ascending: bool,
}

/// Collection query forwarded unchanged to every backend
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterQuery {
    /// Attribute name -> accepted values
    #[serde(default)]
    pub filters: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub fields: Option<Vec<String>>,
    #[serde(default)]
    pub sorts: Vec<SortKey>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub marker: Option<String>,
    #[serde(default)]
    pub page_reverse: bool,
}

// =============================================================================
// Policy Driver Port
// =============================================================================

/// Strategy for acquiring and releasing scarce resources
#[async_trait]
pub trait PolicyDriver: Send + Sync {
    /// Take a free resource of `resource_type`
    async fn acquire_resource(&self, ctx: &RequestContext, resource_type: &str)
        -> Result<Resource>;

    /// Return a previously acquired resource
    async fn release_resource(&self, ctx: &RequestContext, resource_id: &str) -> Result<()>;

    /// Get driver name
    fn driver_name(&self) -> &str;
}

// =============================================================================
// Binding Store Port
// =============================================================================

/// Durable object -> backend bindings with soft delete
#[async_trait]
pub trait BindingStore: Send + Sync {
    /// Insert a new active binding
    async fn add(&self, binding: NewBinding) -> Result<Binding>;

    /// Get the active binding for `object_id`
    async fn get(&self, object_id: &str) -> Result<Binding>;

    /// Merge permitted fields into the active binding
    async fn update(&self, object_id: &str, update: BindingUpdate) -> Result<Binding>;

    /// Soft-delete the active binding
    async fn delete(&self, object_id: &str) -> Result<()>;

    /// Distinct descriptors of active bindings of `resource_type`
    async fn list_by_type(&self, resource_type: &str) -> Result<Vec<String>>;

    /// Check store connectivity
    async fn health_check(&self) -> Result<()>;
}

// =============================================================================
// Router Backend Port
// =============================================================================

/// Operations every router backend plugin must support
#[async_trait]
pub trait RouterBackend: Send + Sync {
    async fn create_router(&self, ctx: &RequestContext, router: RouterRequest) -> Result<Router>;

    async fn update_router(
        &self,
        ctx: &RequestContext,
        id: &str,
        router: RouterRequest,
    ) -> Result<Router>;

    async fn get_router(
        &self,
        ctx: &RequestContext,
        id: &str,
        fields: Option<&[String]>,
    ) -> Result<Router>;

    async fn delete_router(&self, ctx: &RequestContext, id: &str) -> Result<()>;

    async fn get_routers(&self, ctx: &RequestContext, query: &RouterQuery) -> Result<Vec<Router>>;

    async fn add_router_interface(
        &self,
        ctx: &RequestContext,
        router_id: &str,
        interface_info: Value,
    ) -> Result<Value>;

    async fn remove_router_interface(
        &self,
        ctx: &RequestContext,
        router_id: &str,
        interface_info: Value,
    ) -> Result<Value>;

    /// Invoke an operation outside the router capability set
    async fn invoke(&self, _ctx: &RequestContext, operation: &str, _args: Value) -> Result<Value> {
        Err(Error::UnsupportedOperation {
            backend: self.backend_name().to_string(),
            operation: operation.to_string(),
        })
    }

    /// Get backend name
    fn backend_name(&self) -> &str;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type PolicyDriverRef = Arc<dyn PolicyDriver>;
pub type BindingStoreRef = Arc<dyn BindingStore>;
pub type RouterBackendRef = Arc<dyn RouterBackend>;
