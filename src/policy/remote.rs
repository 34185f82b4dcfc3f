//! Remote Allocation Policy
//!
//! Delegates resource allocation to a remote allocation service over HTTP.
//!
//! The service exposes a `resources` collection:
//! - `GET  <base>/resources/?limit=1&class=<type>&processing=false&unused=true`
//! - `PUT  <base>/resources/<id>` with `{"resource": {"allocated": <bool>}}`
//!
//! Claiming is list-then-update; the service is expected to reject a claim on
//! a resource that was allocated in between.

use crate::domain::ports::{PolicyDriver, RequestContext, Resource, ResourceMetadata};
use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the remote allocation service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteAllocationConfig {
    /// URL scheme (http or https)
    pub scheme: String,
    /// Service host
    pub host: String,
    /// Service port
    pub port: u16,
    /// API version path segment
    pub version: String,
    /// Timeout for every request in seconds
    pub request_timeout_secs: u64,
}

impl Default for RemoteAllocationConfig {
    fn default() -> Self {
        Self {
            scheme: "http".to_string(),
            host: "localhost".to_string(),
            port: 8080,
            version: "v1".to_string(),
            request_timeout_secs: 30,
        }
    }
}

impl RemoteAllocationConfig {
    /// Base URL including the version segment
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}/{}", self.scheme, self.host, self.port, self.version)
    }
}

// =============================================================================
// Remote Allocation Policy
// =============================================================================

/// Policy driver backed by a remote allocation service
pub struct RemoteAllocationPolicy {
    client: Client,
    /// `<base>/resources/`
    resources_url: String,
    timeout: Duration,
}

impl RemoteAllocationPolicy {
    /// Create a driver from configuration
    pub fn new(config: &RemoteAllocationConfig) -> Result<Self> {
        Self::with_base_url(
            config.base_url(),
            Duration::from_secs(config.request_timeout_secs),
        )
    }

    /// Create a driver against an explicit base URL (`http://host:port/v1`)
    pub fn with_base_url(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let base_url = base_url.into();
        let client = Client::builder().timeout(timeout).build()?;

        info!("Remote allocation service at {}", base_url);

        Ok(Self {
            client,
            resources_url: format!("{}/resources/", base_url.trim_end_matches('/')),
            timeout,
        })
    }

    /// Fetch at most one free candidate of `resource_class`
    async fn list_candidates(&self, resource_class: &str) -> Result<Vec<Value>> {
        let request = self.client.get(&self.resources_url).query(&[
            ("limit", "1"),
            ("class", resource_class),
            ("processing", "false"),
            ("unused", "true"),
        ]);

        let (_, body) = self.send(request, "list_resources").await?;

        match body.get("resources") {
            Some(Value::Array(resources)) => Ok(resources.clone()),
            Some(Value::Null) | None => Err(Error::MalformedResponse(
                "list response has no 'resources' field".into(),
            )),
            Some(other) => Err(Error::MalformedResponse(format!(
                "'resources' is not a list: {}",
                other
            ))),
        }
    }

    /// Flip the allocated flag; `None` when the service does not know the id
    async fn update_allocated(
        &self,
        resource_id: &str,
        allocated: bool,
    ) -> Result<Option<Map<String, Value>>> {
        let url = format!("{}{}", self.resources_url, urlencoding::encode(resource_id));
        let request = self
            .client
            .put(url)
            .json(&json!({ "resource": { "allocated": allocated } }));

        let (status, body) = self.send(request, "update_resource").await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        match body.get("resource") {
            Some(Value::Object(resource)) if !resource.is_empty() => Ok(Some(resource.clone())),
            _ => Ok(None),
        }
    }

    /// Send a request and decode the JSON body; an empty body decodes as `{}`
    async fn send(&self, request: RequestBuilder, operation: &str) -> Result<(StatusCode, Value)> {
        let response = request
            .send()
            .await
            .map_err(|e| self.map_transport_error(e, operation))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| self.map_transport_error(e, operation))?;

        if status == StatusCode::NOT_FOUND {
            return Ok((status, Value::Object(Map::new())));
        }
        if !status.is_success() {
            return Err(Error::RemoteService {
                status: status.as_u16(),
                reason: text,
            });
        }

        if text.trim().is_empty() {
            return Ok((status, Value::Object(Map::new())));
        }

        let body = serde_json::from_str(&text)
            .map_err(|e| Error::MalformedResponse(format!("{}: {}", operation, e)))?;

        Ok((status, body))
    }

    fn map_transport_error(&self, err: reqwest::Error, operation: &str) -> Error {
        if err.is_timeout() {
            Error::Timeout {
                operation: operation.to_string(),
                duration: self.timeout,
            }
        } else {
            Error::Http(err)
        }
    }
}

/// Accept string or numeric ids from the service
fn id_from_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Translate the service's representation into a [`Resource`]
fn resource_from_remote(
    mut remote: Map<String, Value>,
    fallback_id: &str,
    resource_type: &str,
) -> Result<Resource> {
    let resource_id = remote
        .remove("id")
        .and_then(|v| id_from_value(&v))
        .unwrap_or_else(|| fallback_id.to_string());

    let allocated = match remote.remove("allocated") {
        Some(Value::Bool(b)) => b,
        Some(other) => {
            return Err(Error::MalformedResponse(format!(
                "'allocated' is not a boolean: {}",
                other
            )))
        }
        None => true,
    };

    let resource_descriptor = match remote.remove("type") {
        Some(Value::String(t)) => t,
        _ => {
            return Err(Error::MalformedResponse(format!(
                "resource {} has no 'type'",
                resource_id
            )))
        }
    };

    let resource_metadata: ResourceMetadata = remote.into_iter().collect();

    Ok(Resource {
        resource_id,
        resource_type: resource_type.to_string(),
        allocated,
        resource_descriptor,
        resource_metadata,
    })
}

#[async_trait]
impl PolicyDriver for RemoteAllocationPolicy {
    async fn acquire_resource(
        &self,
        ctx: &RequestContext,
        resource_type: &str,
    ) -> Result<Resource> {
        let candidates = self.list_candidates(resource_type).await?;

        let candidate = candidates.first().ok_or_else(|| Error::NoMoreResources {
            resource_type: resource_type.to_string(),
        })?;
        let candidate_id = candidate
            .get("id")
            .and_then(id_from_value)
            .ok_or_else(|| Error::MalformedResponse("candidate resource has no 'id'".into()))?;

        debug!(
            "[{}] Claiming remote resource {} of class {}",
            ctx.request_id, candidate_id, resource_type
        );

        let claimed = self
            .update_allocated(&candidate_id, true)
            .await?
            .ok_or_else(|| {
                warn!(
                    "[{}] Remote service rejected claim on {}",
                    ctx.request_id, candidate_id
                );
                Error::WrongResourceId {
                    resource_id: candidate_id.clone(),
                }
            })?;

        let resource = match resource_from_remote(claimed, &candidate_id, resource_type) {
            Ok(resource) => resource,
            Err(err) => {
                // The claim went through; hand the resource back before failing
                if let Err(release_err) = self.update_allocated(&candidate_id, false).await {
                    warn!(
                        "[{}] Failed to release unusable remote resource {}: {}",
                        ctx.request_id, candidate_id, release_err
                    );
                }
                return Err(err);
            }
        };
        info!(
            "[{}] Acquired remote resource {} ({})",
            ctx.request_id, resource.resource_id, resource.resource_descriptor
        );

        Ok(resource)
    }

    async fn release_resource(&self, ctx: &RequestContext, resource_id: &str) -> Result<()> {
        match self.update_allocated(resource_id, false).await? {
            Some(_) => {
                info!("[{}] Released remote resource {}", ctx.request_id, resource_id);
                Ok(())
            }
            None => Err(Error::WrongResourceId {
                resource_id: resource_id.to_string(),
            }),
        }
    }

    fn driver_name(&self) -> &str {
        "remote"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use wiremock::matchers::{body_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ctx() -> RequestContext {
        RequestContext::new("test")
    }

    fn policy_for(server: &MockServer) -> RemoteAllocationPolicy {
        RemoteAllocationPolicy::with_base_url(
            format!("{}/v1", server.uri()),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn test_default_base_url() {
        let config = RemoteAllocationConfig::default();
        assert_eq!(config.base_url(), "http://localhost:8080/v1");
    }

    #[tokio::test]
    async fn test_acquire_resource_claims_first_candidate() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v1/resources/"))
            .and(query_param("limit", "1"))
            .and(query_param("class", "router"))
            .and(query_param("processing", "false"))
            .and(query_param("unused", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "resources": [{"id": "x", "type": "T", "allocated": false}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("PUT"))
            .and(path("/v1/resources/x"))
            .and(body_json(json!({"resource": {"allocated": true}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "resource": {"id": "x", "type": "T", "allocated": true}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let policy = policy_for(&server);
        let resource = policy.acquire_resource(&ctx(), "router").await.unwrap();

        assert_eq!(
            resource,
            Resource {
                resource_id: "x".into(),
                resource_type: "router".into(),
                allocated: true,
                resource_descriptor: "T".into(),
                resource_metadata: ResourceMetadata::new(),
            }
        );
    }

    #[tokio::test]
    async fn test_extra_fields_become_metadata() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v1/resources/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "resources": [{"id": 42, "type": "com.vyatta.vm", "allocated": false}]
            })))
            .mount(&server)
            .await;

        Mock::given(method("PUT"))
            .and(path("/v1/resources/42"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "resource": {
                    "id": 42,
                    "type": "com.vyatta.vm",
                    "allocated": true,
                    "instance_ip": "10.0.0.5"
                }
            })))
            .mount(&server)
            .await;

        let policy = policy_for(&server);
        let resource = policy.acquire_resource(&ctx(), "router").await.unwrap();

        assert_eq!(resource.resource_id, "42");
        assert_eq!(
            resource.resource_metadata.get("instance_ip"),
            Some(&json!("10.0.0.5"))
        );
        assert!(!resource.resource_metadata.contains_key("type"));
    }

    #[tokio::test]
    async fn test_acquire_with_no_candidates() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v1/resources/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"resources": []})))
            .mount(&server)
            .await;

        let policy = policy_for(&server);
        let err = policy.acquire_resource(&ctx(), "L3").await.unwrap_err();
        assert_matches!(err, Error::NoMoreResources { resource_type } if resource_type == "L3");
    }

    #[tokio::test]
    async fn test_release_resource() {
        let server = MockServer::start().await;

        Mock::given(method("PUT"))
            .and(path("/v1/resources/res-1"))
            .and(body_json(json!({"resource": {"allocated": false}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "resource": {"id": "res-1", "allocated": false}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let policy = policy_for(&server);
        policy.release_resource(&ctx(), "res-1").await.unwrap();
    }

    #[tokio::test]
    async fn test_release_with_empty_response_is_wrong_id() {
        let server = MockServer::start().await;

        Mock::given(method("PUT"))
            .and(path("/v1/resources/missing"))
            .respond_with(ResponseTemplate::new(200).set_body_string(""))
            .mount(&server)
            .await;

        let policy = policy_for(&server);
        let err = policy.release_resource(&ctx(), "missing").await.unwrap_err();
        assert_matches!(err, Error::WrongResourceId { resource_id } if resource_id == "missing");
    }

    #[tokio::test]
    async fn test_server_error_is_connectivity() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v1/resources/"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;

        let policy = policy_for(&server);
        let err = policy.acquire_resource(&ctx(), "router").await.unwrap_err();
        assert!(err.is_connectivity());
        assert_matches!(err, Error::RemoteService { status: 503, .. });
    }

    #[tokio::test]
    async fn test_untranslatable_claim_is_released() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v1/resources/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "resources": [{"id": "x", "type": "T"}]
            })))
            .mount(&server)
            .await;

        Mock::given(method("PUT"))
            .and(path("/v1/resources/x"))
            .and(body_json(json!({"resource": {"allocated": true}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "resource": {"id": "x", "allocated": true}
            })))
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("PUT"))
            .and(path("/v1/resources/x"))
            .and(body_json(json!({"resource": {"allocated": false}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "resource": {"id": "x", "allocated": false}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let policy = policy_for(&server);
        let err = policy.acquire_resource(&ctx(), "router").await.unwrap_err();
        assert_matches!(err, Error::MalformedResponse(_));

        server.verify().await;
    }

    #[tokio::test]
    async fn test_slow_service_times_out() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v1/resources/"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"resources": []}))
                    .set_delay(Duration::from_millis(800)),
            )
            .mount(&server)
            .await;

        let policy = RemoteAllocationPolicy::with_base_url(
            format!("{}/v1", server.uri()),
            Duration::from_millis(100),
        )
        .unwrap();

        let err = policy.acquire_resource(&ctx(), "router").await.unwrap_err();
        assert!(err.is_connectivity());
        assert_matches!(err, Error::Timeout { ref operation, .. } if operation == "list_resources");
    }

    #[tokio::test]
    async fn test_malformed_list_response() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v1/resources/"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let policy = policy_for(&server);
        let err = policy.acquire_resource(&ctx(), "router").await.unwrap_err();
        assert_matches!(err, Error::MalformedResponse(_));
    }
}
