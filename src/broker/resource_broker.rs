//! Resource Broker
//!
//! Couples resource allocation with binding persistence. A caller-supplied
//! scope runs between acquiring a resource and recording the binding; any
//! failure inside that window returns the resource to the policy driver.

use crate::domain::ports::{
    Binding, BindingStoreRef, BindingUpdate, NewBinding, RequestContext, Resource,
};
use crate::error::{Error, Result};
use crate::metrics::{BrokerMetrics, Outcome};
use crate::policy::PolicyManager;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tracing::{debug, error, info, warn};

// =============================================================================
// Pending Binding
// =============================================================================

/// An acquired resource waiting for the object that will live on it
#[derive(Debug, Clone)]
pub struct PendingBinding {
    resource: Resource,
    object_id: Option<String>,
}

impl PendingBinding {
    fn new(resource: Resource) -> Self {
        Self {
            resource,
            object_id: None,
        }
    }

    /// The resource handed out by the policy driver
    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    /// Record the id of the object created on this resource
    pub fn bind_object(&mut self, object_id: impl Into<String>) {
        self.object_id = Some(object_id.into());
    }

    pub fn object_id(&self) -> Option<&str> {
        self.object_id.as_deref()
    }
}

// =============================================================================
// Resource Broker
// =============================================================================

/// Allocation and binding lifecycle on top of a policy driver and a binding store
pub struct ResourceBroker {
    policy: PolicyManager,
    store: BindingStoreRef,
    metrics: BrokerMetrics,
}

impl ResourceBroker {
    pub fn new(policy: PolicyManager, store: BindingStoreRef, metrics: BrokerMetrics) -> Self {
        Self {
            policy,
            store,
            metrics,
        }
    }

    pub fn policy(&self) -> &PolicyManager {
        &self.policy
    }

    pub fn store(&self) -> &BindingStoreRef {
        &self.store
    }

    pub fn metrics(&self) -> &BrokerMetrics {
        &self.metrics
    }

    /// Acquire a resource of `resource_type`, run `scope`, then persist the binding.
    ///
    /// `scope` receives the [`PendingBinding`] and must hand it back with an
    /// object id set through [`PendingBinding::bind_object`]. The acquired
    /// resource is released again when `scope` fails or panics, when no object
    /// id was bound, or when the binding cannot be stored. The original error
    /// (or panic) is always the one surfaced to the caller.
    pub async fn allocate<F, Fut, T>(
        &self,
        ctx: &RequestContext,
        resource_type: &str,
        scope: F,
    ) -> Result<(T, Binding)>
    where
        F: FnOnce(PendingBinding) -> Fut,
        Fut: Future<Output = Result<(PendingBinding, T)>>,
    {
        let resource = match self.policy.acquire_resource(ctx, resource_type).await {
            Ok(resource) => resource,
            Err(e) => {
                warn!(
                    "[{}] No {} resource could be acquired: {}",
                    ctx.request_id, resource_type, e
                );
                self.metrics.record_allocation(Outcome::Failure);
                return Err(e);
            }
        };

        let resource_id = resource.resource_id.clone();
        info!(
            "[{}] Allocated {} resource {} on {}",
            ctx.request_id, resource_type, resource_id, resource.resource_descriptor
        );

        let pending = PendingBinding::new(resource);
        let outcome = AssertUnwindSafe(async move { scope(pending).await })
            .catch_unwind()
            .await;

        let (pending, value) = match outcome {
            Ok(Ok(done)) => done,
            Ok(Err(e)) => {
                error!(
                    "[{}] Allocation scope for {} failed: {}",
                    ctx.request_id, resource_id, e
                );
                self.rollback(ctx, &resource_id).await;
                return Err(e);
            }
            Err(panic) => {
                error!(
                    "[{}] Allocation scope for {} panicked",
                    ctx.request_id, resource_id
                );
                self.rollback(ctx, &resource_id).await;
                std::panic::resume_unwind(panic);
            }
        };

        let object_id = match pending.object_id() {
            Some(object_id) => object_id.to_string(),
            None => {
                error!(
                    "[{}] No object was bound to resource {}",
                    ctx.request_id, resource_id
                );
                self.rollback(ctx, &resource_id).await;
                return Err(Error::MissingObjectId { resource_id });
            }
        };

        let binding = match self
            .store
            .add(NewBinding::from_resource(&object_id, pending.resource()))
            .await
        {
            Ok(binding) => binding,
            Err(e) => {
                error!(
                    "[{}] Failed to persist binding for {}: {}",
                    ctx.request_id, object_id, e
                );
                self.rollback(ctx, &resource_id).await;
                return Err(e);
            }
        };

        self.metrics.record_allocation(Outcome::Success);
        info!(
            "[{}] Bound {} to resource {} ({})",
            ctx.request_id, object_id, resource_id, binding.resource_descriptor
        );

        Ok((value, binding))
    }

    /// Run `scope` on the binding of `object_id`, then release its resource.
    ///
    /// Release and binding removal only happen when `scope` succeeds; a failing
    /// scope leaves both the resource and the binding in place. The binding is
    /// removed before the resource is released, and restored when the release
    /// fails, so a free resource never keeps an active binding.
    pub async fn deallocate<F, Fut, T>(
        &self,
        ctx: &RequestContext,
        object_id: &str,
        scope: F,
    ) -> Result<T>
    where
        F: FnOnce(Binding) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let result = self.deallocate_inner(ctx, object_id, scope).await;
        let outcome = if result.is_ok() {
            Outcome::Success
        } else {
            Outcome::Failure
        };
        self.metrics.record_deallocation(outcome);
        result
    }

    async fn deallocate_inner<F, Fut, T>(
        &self,
        ctx: &RequestContext,
        object_id: &str,
        scope: F,
    ) -> Result<T>
    where
        F: FnOnce(Binding) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let binding = self.store.get(object_id).await?;
        let resource_id = binding.resource_id.clone();
        let restore = NewBinding::from_binding(&binding);

        let value = scope(binding).await.map_err(|e| {
            warn!(
                "[{}] Deallocation scope for {} failed, keeping binding: {}",
                ctx.request_id, object_id, e
            );
            e
        })?;

        self.store.delete(object_id).await.map_err(|e| {
            error!(
                "[{}] Failed to remove binding for {}, keeping resource {}: {}",
                ctx.request_id, object_id, resource_id, e
            );
            e
        })?;

        if let Err(e) = self.policy.release_resource(ctx, &resource_id).await {
            error!(
                "[{}] Failed to release resource {} held by {}: {}",
                ctx.request_id, resource_id, object_id, e
            );
            if let Err(restore_err) = self.store.add(restore).await {
                error!(
                    "[{}] Failed to restore binding for {}: {}",
                    ctx.request_id, object_id, restore_err
                );
            }
            return Err(e);
        }

        info!(
            "[{}] Released resource {} held by {}",
            ctx.request_id, resource_id, object_id
        );

        Ok(value)
    }

    /// Active binding of `object_id`
    pub async fn get_resource(&self, ctx: &RequestContext, object_id: &str) -> Result<Binding> {
        debug!("[{}] Looking up binding for {}", ctx.request_id, object_id);
        self.store.get(object_id).await
    }

    /// Distinct descriptors of active bindings of `resource_type`
    pub async fn get_descriptors(
        &self,
        ctx: &RequestContext,
        resource_type: &str,
    ) -> Result<Vec<String>> {
        debug!("[{}] Listing descriptors for {}", ctx.request_id, resource_type);
        self.store.list_by_type(resource_type).await
    }

    /// Merge `update` into the active binding of `object_id`
    pub async fn update_resource(
        &self,
        ctx: &RequestContext,
        object_id: &str,
        update: BindingUpdate,
    ) -> Result<Binding> {
        debug!("[{}] Updating binding for {}", ctx.request_id, object_id);
        self.store.update(object_id, update).await
    }

    async fn rollback(&self, ctx: &RequestContext, resource_id: &str) {
        self.metrics.record_allocation(Outcome::Failure);
        self.metrics.record_rollback();

        match self.policy.release_resource(ctx, resource_id).await {
            Ok(()) => info!("[{}] Rolled back resource {}", ctx.request_id, resource_id),
            Err(e) => error!(
                "[{}] Failed to release resource {} during rollback: {}",
                ctx.request_id, resource_id, e
            ),
        }
    }
}
