//! Request Router
//!
//! Presents a single router API over many backends. Creation goes through the
//! broker so every router lands on an allocated resource; later calls find the
//! owning backend through the router's binding.

use crate::broker::ResourceBroker;
use crate::domain::ports::{RequestContext, Router, RouterBackendRef, RouterQuery, RouterRequest};
use crate::error::{Error, Result};
use crate::plugins::PluginRegistry;
use futures::future::try_join_all;
use indexmap::IndexMap;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Resource type under which routers are allocated and bound
pub const ROUTER_RESOURCE_TYPE: &str = "router";

/// Dispatches router operations to the backend owning each router
pub struct RequestRouter {
    broker: Arc<ResourceBroker>,
    registry: Arc<PluginRegistry>,
}

impl RequestRouter {
    pub fn new(broker: Arc<ResourceBroker>, registry: Arc<PluginRegistry>) -> Self {
        Self { broker, registry }
    }

    pub fn broker(&self) -> &Arc<ResourceBroker> {
        &self.broker
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    /// Backend owning `object_id`, found through its binding
    async fn backend_for(&self, ctx: &RequestContext, object_id: &str) -> Result<RouterBackendRef> {
        let binding = self.broker.get_resource(ctx, object_id).await?;
        Ok(self.registry.get(&binding.resource_descriptor)?.clone())
    }

    // =========================================================================
    // Router Operations
    // =========================================================================

    /// Allocate a router resource and create the router on its backend
    pub async fn create_router(
        &self,
        ctx: &RequestContext,
        mut request: RouterRequest,
    ) -> Result<Router> {
        let registry = &self.registry;

        let (router, binding) = self
            .broker
            .allocate(ctx, ROUTER_RESOURCE_TYPE, |mut pending| async move {
                let resource = pending.resource();
                request.metadata.extend(
                    resource
                        .resource_metadata
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone())),
                );

                let backend = registry.get(&resource.resource_descriptor)?;
                let created = backend.create_router(ctx, request).await?;
                pending.bind_object(created.id.clone());

                Ok::<_, Error>((pending, created))
            })
            .await?;

        info!(
            "[{}] Router {} created on {}",
            ctx.request_id, router.id, binding.resource_descriptor
        );
        Ok(router)
    }

    pub async fn update_router(
        &self,
        ctx: &RequestContext,
        id: &str,
        request: RouterRequest,
    ) -> Result<Router> {
        let backend = self.backend_for(ctx, id).await?;
        backend.update_router(ctx, id, request).await
    }

    pub async fn get_router(
        &self,
        ctx: &RequestContext,
        id: &str,
        fields: Option<&[String]>,
    ) -> Result<Router> {
        let backend = self.backend_for(ctx, id).await?;
        backend.get_router(ctx, id, fields).await
    }

    /// Delete the router and release its resource once the backend confirms
    pub async fn delete_router(&self, ctx: &RequestContext, id: &str) -> Result<()> {
        let registry = &self.registry;

        self.broker
            .deallocate(ctx, id, |binding| async move {
                let backend = registry.get(&binding.resource_descriptor)?;
                backend.delete_router(ctx, id).await
            })
            .await?;

        info!("[{}] Router {} deleted", ctx.request_id, id);
        Ok(())
    }

    /// Routers of every backend holding at least one router binding.
    ///
    /// Backends are queried concurrently with the same query; when several
    /// return the same router id the first one, in descriptor order, wins.
    pub async fn get_routers(&self, ctx: &RequestContext, query: &RouterQuery) -> Result<Vec<Router>> {
        let descriptors = self
            .broker
            .get_descriptors(ctx, ROUTER_RESOURCE_TYPE)
            .await?;

        let backends = descriptors
            .iter()
            .map(|descriptor| self.registry.get(descriptor))
            .collect::<Result<Vec<_>>>()?;

        debug!(
            "[{}] Listing routers across {} backends",
            ctx.request_id,
            backends.len()
        );

        let batches = try_join_all(
            backends
                .iter()
                .map(|backend| backend.get_routers(ctx, query)),
        )
        .await?;

        let mut merged: IndexMap<String, Router> = IndexMap::new();
        for router in batches.into_iter().flatten() {
            merged.entry(router.id.clone()).or_insert(router);
        }

        Ok(merged.into_values().collect())
    }

    /// Number of distinct routers matching `filters`
    pub async fn get_routers_count(
        &self,
        ctx: &RequestContext,
        filters: BTreeMap<String, Vec<String>>,
    ) -> Result<usize> {
        let query = RouterQuery {
            filters,
            ..Default::default()
        };
        Ok(self.get_routers(ctx, &query).await?.len())
    }

    pub async fn add_router_interface(
        &self,
        ctx: &RequestContext,
        router_id: &str,
        interface_info: Value,
    ) -> Result<Value> {
        let backend = self.backend_for(ctx, router_id).await?;
        backend
            .add_router_interface(ctx, router_id, interface_info)
            .await
    }

    pub async fn remove_router_interface(
        &self,
        ctx: &RequestContext,
        router_id: &str,
        interface_info: Value,
    ) -> Result<Value> {
        let backend = self.backend_for(ctx, router_id).await?;
        backend
            .remove_router_interface(ctx, router_id, interface_info)
            .await
    }

    // =========================================================================
    // Default Backend
    // =========================================================================

    /// Backend serving everything outside the router capability set
    pub fn default_backend(&self) -> &RouterBackendRef {
        self.registry.default_backend()
    }

    /// Forward `operation` verbatim to the default backend
    pub async fn passthrough(
        &self,
        ctx: &RequestContext,
        operation: &str,
        args: Value,
    ) -> Result<Value> {
        debug!(
            "[{}] Passing {} through to {}",
            ctx.request_id,
            operation,
            self.registry.default_descriptor()
        );
        self.default_backend().invoke(ctx, operation, args).await
    }
}
