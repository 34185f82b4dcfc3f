//! API Server
//!
//! Serves the REST API with request tracing, a per-request timeout and
//! graceful shutdown.

use crate::config::ApiConfig;
use crate::error::{Error, Result};
use crate::router::RequestRouter;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use super::rest::RestRouter;

// =============================================================================
// API Server
// =============================================================================

/// REST API server for the request router
pub struct ApiServer {
    config: ApiConfig,
    router: Arc<RequestRouter>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ApiServer {
    /// Create a new API server
    pub fn new(config: ApiConfig, router: Arc<RequestRouter>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            router,
            shutdown_tx,
        }
    }

    /// Build the full application with middleware applied
    pub fn app(&self) -> axum::Router {
        RestRouter::new(self.router.clone())
            .build()
            .layer(TimeoutLayer::new(self.config.request_timeout()))
            .layer(TraceLayer::new_for_http())
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(&self) -> Result<()> {
        let addr: SocketAddr = self.config.socket_addr()?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Internal(format!("Failed to bind REST server: {}", e)))?;

        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown
    pub async fn serve(&self, listener: tokio::net::TcpListener) -> Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let app = self.app();

        if let Ok(addr) = listener.local_addr() {
            info!("REST API listening on {}", addr);
        }

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                tokio::select! {
                    _ = shutdown_rx.recv() => {}
                    _ = tokio::signal::ctrl_c() => {}
                }
                info!("REST server shutting down");
            })
            .await
            .map_err(|e| Error::Internal(format!("REST server error: {}", e)))?;

        Ok(())
    }

    /// Trigger graceful shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::ResourceBroker;
    use crate::store::SqliteBindingStore;
    use crate::metrics::BrokerMetrics;
    use crate::plugins::{BackendFactory, PluginConfig, PluginRegistry};
    use crate::policy::{PolicyConfig, PolicyManager};
    use crate::domain::ports::{
        RequestContext, ResourceMetadata, Router as RouterObject, RouterBackend, RouterQuery,
        RouterRequest,
    };
    use crate::plugins::InMemoryRouterBackend;
    use crate::policy::{LocalPoolConfig, LocalPoolPolicy, ResourceSeed};
    use crate::router::ROUTER_RESOURCE_TYPE;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use serde_json::Value;
    use std::time::Duration;
    use tower::ServiceExt;

    /// Backend that takes longer to create a router than the API allows
    struct SlowBackend(InMemoryRouterBackend);

    #[async_trait]
    impl RouterBackend for SlowBackend {
        async fn create_router(&self, ctx: &RequestContext, router: RouterRequest) -> Result<RouterObject> {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            self.0.create_router(ctx, router).await
        }

        async fn update_router(
            &self,
            ctx: &RequestContext,
            id: &str,
            router: RouterRequest,
        ) -> Result<RouterObject> {
            self.0.update_router(ctx, id, router).await
        }

        async fn get_router(
            &self,
            ctx: &RequestContext,
            id: &str,
            fields: Option<&[String]>,
        ) -> Result<RouterObject> {
            self.0.get_router(ctx, id, fields).await
        }

        async fn delete_router(&self, ctx: &RequestContext, id: &str) -> Result<()> {
            self.0.delete_router(ctx, id).await
        }

        async fn get_routers(&self, ctx: &RequestContext, query: &RouterQuery) -> Result<Vec<RouterObject>> {
            self.0.get_routers(ctx, query).await
        }

        async fn add_router_interface(
            &self,
            ctx: &RequestContext,
            router_id: &str,
            interface_info: Value,
        ) -> Result<Value> {
            self.0.add_router_interface(ctx, router_id, interface_info).await
        }

        async fn remove_router_interface(
            &self,
            ctx: &RequestContext,
            router_id: &str,
            interface_info: Value,
        ) -> Result<Value> {
            self.0.remove_router_interface(ctx, router_id, interface_info).await
        }

        fn backend_name(&self) -> &str {
            self.0.backend_name()
        }
    }

    async fn server() -> Arc<ApiServer> {
        let policy = PolicyManager::from_config(&PolicyConfig::default()).unwrap();
        let store = Arc::new(SqliteBindingStore::in_memory().await.unwrap());
        let broker = Arc::new(ResourceBroker::new(policy, store, BrokerMetrics::new().unwrap()));
        let registry = PluginRegistry::from_config(&PluginConfig::default(), &BackendFactory).unwrap();
        let router = Arc::new(RequestRouter::new(broker, Arc::new(registry)));

        Arc::new(ApiServer::new(ApiConfig::default(), router))
    }

    #[tokio::test]
    async fn test_timed_out_create_still_binds_resource() {
        let pool = Arc::new(
            LocalPoolPolicy::new(LocalPoolConfig {
                resources: vec![ResourceSeed {
                    resource_id: Some("A".into()),
                    resource_type: ROUTER_RESOURCE_TYPE.into(),
                    resource_descriptor: "slow".into(),
                    resource_metadata: ResourceMetadata::new(),
                }],
                ..Default::default()
            })
            .unwrap(),
        );
        let store = Arc::new(SqliteBindingStore::in_memory().await.unwrap());
        let broker = Arc::new(ResourceBroker::new(
            PolicyManager::new(pool.clone()),
            store,
            BrokerMetrics::new().unwrap(),
        ));
        let backend: crate::domain::ports::RouterBackendRef =
            Arc::new(SlowBackend(InMemoryRouterBackend::new("slow")));
        let registry = PluginRegistry::new([("slow".to_string(), backend)], "slow").unwrap();
        let router = Arc::new(RequestRouter::new(broker.clone(), Arc::new(registry)));

        let config = ApiConfig {
            request_timeout_secs: 1,
            ..Default::default()
        };
        let app = ApiServer::new(config, router).app();

        let request = Request::post("/v1/routers")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"name": "edge"}"#))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);

        // The allocation keeps running after the request gave up
        tokio::time::sleep(Duration::from_millis(1500)).await;

        let ctx = RequestContext::new("test");
        assert_eq!(pool.available(ROUTER_RESOURCE_TYPE), 0);
        assert_eq!(
            broker.get_descriptors(&ctx, ROUTER_RESOURCE_TYPE).await.unwrap(),
            vec!["slow"]
        );
    }

    #[tokio::test]
    async fn test_serves_health_and_shuts_down() {
        let server = server().await;
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn({
            let server = server.clone();
            async move { server.serve(listener).await }
        });

        let body = reqwest::get(format!("http://{}/health", addr))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "ok");

        server.shutdown();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
