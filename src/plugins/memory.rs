//! In-Memory Router Backend
//!
//! Keeps routers and their interfaces in process memory. Serves as the
//! `memory` provider and as the reference backend in tests.

use crate::domain::ports::{RequestContext, Router, RouterBackend, RouterQuery, RouterRequest};
use crate::error::{Error, Result};
use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::{json, Map, Value};
use std::cmp::Ordering;
use tokio::sync::RwLock;
use tracing::{debug, info};

// =============================================================================
// Router State
// =============================================================================

/// Internal tracking of a router and its attached interfaces
#[derive(Debug, Clone)]
struct RouterState {
    router: Router,
    interfaces: Vec<Value>,
}

// =============================================================================
// In-Memory Backend
// =============================================================================

/// Router backend holding all state in memory
pub struct InMemoryRouterBackend {
    name: String,
    /// Routers in creation order
    routers: RwLock<IndexMap<String, RouterState>>,
}

impl InMemoryRouterBackend {
    /// Create an empty backend registered under `name`
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            routers: RwLock::new(IndexMap::new()),
        }
    }

    /// Store an existing router as-is, replacing any router with the same id
    pub async fn insert(&self, router: Router) {
        self.routers.write().await.insert(
            router.id.clone(),
            RouterState {
                router,
                interfaces: Vec::new(),
            },
        );
    }

    /// Number of routers held
    pub async fn len(&self) -> usize {
        self.routers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.routers.read().await.is_empty()
    }

    /// Interfaces currently attached to `router_id`
    pub async fn interfaces(&self, router_id: &str) -> Result<Vec<Value>> {
        let routers = self.routers.read().await;
        let state = routers
            .get(router_id)
            .ok_or_else(|| self.not_found("get_router_interfaces", router_id))?;
        Ok(state.interfaces.clone())
    }

    fn not_found(&self, operation: &str, router_id: &str) -> Error {
        debug!("{} has no router {} for {}", self.name, router_id, operation);
        Error::RouterNotFound {
            backend: self.name.clone(),
            router_id: router_id.to_string(),
        }
    }

    fn invalid(&self, operation: &str, reason: impl Into<String>) -> Error {
        Error::BackendOperationFailed {
            backend: self.name.clone(),
            operation: operation.to_string(),
            reason: reason.into(),
        }
    }
}

/// Value of a router attribute as used by filters and sorts
fn attribute(router: &Router, key: &str) -> Option<Value> {
    match key {
        "id" => Some(Value::String(router.id.clone())),
        "name" => router.name.clone().map(Value::String),
        _ => router.attributes.get(key).cloned(),
    }
}

fn attribute_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn matches_filters(router: &Router, query: &RouterQuery) -> bool {
    query.filters.iter().all(|(key, accepted)| {
        attribute(router, key)
            .map(|value| accepted.contains(&attribute_text(&value)))
            .unwrap_or(false)
    })
}

fn compare(a: &Router, b: &Router, query: &RouterQuery) -> Ordering {
    for sort in &query.sorts {
        let left = attribute(a, &sort.key).map(|v| attribute_text(&v));
        let right = attribute(b, &sort.key).map(|v| attribute_text(&v));
        let ordering = if sort.ascending {
            left.cmp(&right)
        } else {
            right.cmp(&left)
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

/// Drop attribute keys that collide with the router's own fields
fn strip_reserved(mut attributes: Map<String, Value>) -> Map<String, Value> {
    for key in ["id", "name", "metadata"] {
        attributes.remove(key);
    }
    attributes
}

/// Keep only the requested fields; `id` always survives
fn project(router: &Router, fields: Option<&[String]>) -> Router {
    let Some(fields) = fields else {
        return router.clone();
    };
    let wanted = |key: &str| fields.iter().any(|f| f == key);

    Router {
        id: router.id.clone(),
        name: router.name.clone().filter(|_| wanted("name")),
        metadata: if wanted("metadata") {
            router.metadata.clone()
        } else {
            Default::default()
        },
        attributes: router
            .attributes
            .iter()
            .filter(|(key, _)| wanted(key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect(),
    }
}

#[async_trait]
impl RouterBackend for InMemoryRouterBackend {
    async fn create_router(&self, ctx: &RequestContext, request: RouterRequest) -> Result<Router> {
        let router = Router {
            id: uuid::Uuid::new_v4().to_string(),
            name: request.name,
            metadata: request.metadata,
            attributes: strip_reserved(request.attributes),
        };

        self.insert(router.clone()).await;

        info!("[{}] {} created router {}", ctx.request_id, self.name, router.id);
        Ok(router)
    }

    async fn update_router(
        &self,
        ctx: &RequestContext,
        id: &str,
        request: RouterRequest,
    ) -> Result<Router> {
        let mut routers = self.routers.write().await;
        let state = routers
            .get_mut(id)
            .ok_or_else(|| self.not_found("update_router", id))?;

        if request.name.is_some() {
            state.router.name = request.name;
        }
        state.router.metadata.extend(request.metadata);
        state
            .router
            .attributes
            .extend(strip_reserved(request.attributes));

        debug!("[{}] {} updated router {}", ctx.request_id, self.name, id);
        Ok(state.router.clone())
    }

    async fn get_router(
        &self,
        _ctx: &RequestContext,
        id: &str,
        fields: Option<&[String]>,
    ) -> Result<Router> {
        let routers = self.routers.read().await;
        let state = routers
            .get(id)
            .ok_or_else(|| self.not_found("get_router", id))?;
        Ok(project(&state.router, fields))
    }

    async fn delete_router(&self, ctx: &RequestContext, id: &str) -> Result<()> {
        self.routers
            .write()
            .await
            .shift_remove(id)
            .ok_or_else(|| self.not_found("delete_router", id))?;

        info!("[{}] {} deleted router {}", ctx.request_id, self.name, id);
        Ok(())
    }

    async fn get_routers(&self, _ctx: &RequestContext, query: &RouterQuery) -> Result<Vec<Router>> {
        let routers = self.routers.read().await;

        let mut selected: Vec<&Router> = routers
            .values()
            .map(|state| &state.router)
            .filter(|router| matches_filters(router, query))
            .collect();
        selected.sort_by(|a, b| compare(a, b, query));
        if query.page_reverse {
            selected.reverse();
        }

        let start = match &query.marker {
            Some(marker) => selected
                .iter()
                .position(|router| &router.id == marker)
                .map(|pos| pos + 1)
                .unwrap_or(0),
            None => 0,
        };
        let limit = query.limit.unwrap_or(usize::MAX);

        Ok(selected
            .into_iter()
            .skip(start)
            .take(limit)
            .map(|router| project(router, query.fields.as_deref()))
            .collect())
    }

    async fn add_router_interface(
        &self,
        ctx: &RequestContext,
        router_id: &str,
        interface_info: Value,
    ) -> Result<Value> {
        let Value::Object(mut info) = interface_info else {
            return Err(self.invalid("add_router_interface", "interface info must be an object"));
        };

        let mut routers = self.routers.write().await;
        let state = routers
            .get_mut(router_id)
            .ok_or_else(|| self.not_found("add_router_interface", router_id))?;

        if !info.contains_key("port_id") {
            info.insert(
                "port_id".into(),
                Value::String(uuid::Uuid::new_v4().to_string()),
            );
        }
        info.insert("id".into(), Value::String(router_id.to_string()));

        let interface = Value::Object(info);
        state.interfaces.push(interface.clone());

        debug!(
            "[{}] {} attached interface to router {}",
            ctx.request_id, self.name, router_id
        );
        Ok(interface)
    }

    async fn remove_router_interface(
        &self,
        ctx: &RequestContext,
        router_id: &str,
        interface_info: Value,
    ) -> Result<Value> {
        let mut routers = self.routers.write().await;
        let state = routers
            .get_mut(router_id)
            .ok_or_else(|| self.not_found("remove_router_interface", router_id))?;

        let selector = |key: &str| interface_info.get(key).filter(|v| !v.is_null());
        let port_id = selector("port_id");
        let subnet_id = selector("subnet_id");
        if port_id.is_none() && subnet_id.is_none() {
            return Err(self.invalid(
                "remove_router_interface",
                "either port_id or subnet_id is required",
            ));
        }

        let position = state
            .interfaces
            .iter()
            .position(|iface| {
                port_id.map_or(true, |p| iface.get("port_id") == Some(p))
                    && subnet_id.map_or(true, |s| iface.get("subnet_id") == Some(s))
            })
            .ok_or_else(|| {
                self.invalid(
                    "remove_router_interface",
                    format!("no matching interface on router {}", router_id),
                )
            })?;

        let removed = state.interfaces.remove(position);
        debug!(
            "[{}] {} detached interface from router {}",
            ctx.request_id, self.name, router_id
        );
        Ok(removed)
    }

    async fn invoke(&self, ctx: &RequestContext, operation: &str, args: Value) -> Result<Value> {
        match operation {
            "get_router_interfaces" => {
                let router_id = args
                    .get("router_id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| self.invalid(operation, "router_id is required"))?;
                Ok(Value::Array(self.interfaces(router_id).await?))
            }
            "get_backend_info" => {
                let count = self.len().await;
                let mut info = Map::new();
                info.insert("backend".into(), json!(self.name));
                info.insert("routers".into(), json!(count));
                Ok(Value::Object(info))
            }
            _ => {
                debug!(
                    "[{}] {} does not support {}",
                    ctx.request_id, self.name, operation
                );
                Err(Error::UnsupportedOperation {
                    backend: self.name.clone(),
                    operation: operation.to_string(),
                })
            }
        }
    }

    fn backend_name(&self) -> &str {
        &self.name
    }
}
