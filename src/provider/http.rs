//! JSON-over-HTTP bridge to an external provider plugin.
//!
//! Each operation is a `POST {endpoint}/{diff,create,update,delete}` with a
//! JSON body carrying the kind, inputs, current record and context. A bearer
//! token is sent when the context carries credentials.

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::trace;

use super::{DiffOutcome, Provider, ProviderContext, ProviderResponse, ProviderResult};
use crate::error::{ProviderError, Result, StackweaveError};
use crate::model::ResolvedInputs;
use crate::state::StateRecord;

/// HTTP plugin provider.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    /// HTTP client.
    client: Client,
    /// Base URL without trailing slash.
    endpoint: String,
}

#[derive(Debug, Serialize)]
struct PluginRequest<'a> {
    kind: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    inputs: Option<&'a ResolvedInputs>,
    #[serde(skip_serializing_if = "Option::is_none")]
    state: Option<&'a JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    outputs: Option<&'a BTreeMap<String, JsonValue>>,
    context: &'a ProviderContext,
}

#[derive(Debug, Deserialize)]
struct DiffReply {
    outcome: DiffOutcome,
}

#[derive(Debug, Deserialize)]
struct ErrorReply {
    message: String,
    #[serde(default)]
    transient: bool,
}

impl HttpProvider {
    /// Creates a provider talking to `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StackweaveError::internal(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }

    async fn send(&self, operation: &str, ctx: &ProviderContext, request: &PluginRequest<'_>) -> ProviderResult<String> {
        let url = format!("{}/{operation}", self.endpoint);
        trace!("POST {url} ({})", request.kind);

        let mut builder = self
            .client
            .post(&url)
            .header(header::CONTENT_TYPE, "application/json")
            .json(request);
        if let Some(token) = &ctx.credentials {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }

        let response = builder.send().await.map_err(|e| map_transport_error(operation, &e))?;
        let status = response.status();
        let body = response.text().await.map_err(|e| map_transport_error(operation, &e))?;

        if !status.is_success() {
            return Err(map_status_error(operation, status, &body));
        }
        Ok(body)
    }

    async fn call<T: for<'de> Deserialize<'de>>(
        &self,
        operation: &str,
        ctx: &ProviderContext,
        request: &PluginRequest<'_>,
    ) -> ProviderResult<T> {
        let body = self.send(operation, ctx, request).await?;
        serde_json::from_str(&body)
            .map_err(|e| ProviderError::permanent(format!("{operation}: invalid plugin response: {e}")))
    }
}

fn map_transport_error(operation: &str, error: &reqwest::Error) -> ProviderError {
    if error.is_timeout() {
        ProviderError::timeout(format!("{operation}: request timed out: {error}"))
    } else if error.is_connect() || error.is_request() {
        ProviderError::transient(format!("{operation}: request failed: {error}"))
    } else {
        ProviderError::permanent(format!("{operation}: request failed: {error}"))
    }
}

fn map_status_error(operation: &str, status: StatusCode, body: &str) -> ProviderError {
    let reply = serde_json::from_str::<ErrorReply>(body).ok();
    let message = reply
        .as_ref()
        .map_or_else(|| body.to_string(), |r| r.message.clone());
    let message = format!("{operation}: {} {message}", status.as_u16());

    if status == StatusCode::TOO_MANY_REQUESTS {
        return ProviderError::transient(message);
    }
    if status.is_server_error() {
        // The plugin may have acted before failing; only diff is read-only.
        return if operation == "diff" {
            ProviderError::transient(message)
        } else {
            ProviderError::indeterminate(message)
        };
    }
    if status == StatusCode::REQUEST_TIMEOUT {
        return ProviderError::timeout(message);
    }
    if reply.is_some_and(|r| r.transient) {
        return ProviderError::transient(message);
    }
    ProviderError::permanent(message)
}

#[async_trait]
impl Provider for HttpProvider {
    async fn diff(
        &self,
        ctx: &ProviderContext,
        kind: &str,
        desired: &ResolvedInputs,
        current: &StateRecord,
    ) -> ProviderResult<DiffOutcome> {
        let request = PluginRequest {
            kind,
            inputs: Some(desired),
            state: Some(&current.provider_state),
            outputs: Some(&current.outputs),
            context: ctx,
        };
        let reply: DiffReply = self.call("diff", ctx, &request).await?;
        Ok(reply.outcome)
    }

    async fn create(&self, ctx: &ProviderContext, kind: &str, inputs: &ResolvedInputs) -> ProviderResult<ProviderResponse> {
        let request = PluginRequest {
            kind,
            inputs: Some(inputs),
            state: None,
            outputs: None,
            context: ctx,
        };
        self.call("create", ctx, &request).await
    }

    async fn update(
        &self,
        ctx: &ProviderContext,
        kind: &str,
        inputs: &ResolvedInputs,
        current: &StateRecord,
    ) -> ProviderResult<ProviderResponse> {
        let request = PluginRequest {
            kind,
            inputs: Some(inputs),
            state: Some(&current.provider_state),
            outputs: Some(&current.outputs),
            context: ctx,
        };
        self.call("update", ctx, &request).await
    }

    async fn delete(&self, ctx: &ProviderContext, kind: &str, current: &StateRecord) -> ProviderResult<()> {
        let request = PluginRequest {
            kind,
            inputs: None,
            state: Some(&current.provider_state),
            outputs: Some(&current.outputs),
            context: ctx,
        };
        self.send("delete", ctx, &request).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ProviderId, ResourceId};
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ctx() -> ProviderContext {
        ProviderContext {
            project: String::from("demo"),
            environment: String::from("dev"),
            stack: String::from("network"),
            provider: String::from("aws"),
            settings: BTreeMap::new(),
            credentials: Some(String::from("tok")),
        }
    }

    fn inputs() -> ResolvedInputs {
        BTreeMap::from([(String::from("cidr"), json!("10.0.0.0/16"))])
    }

    fn provider(server: &MockServer) -> HttpProvider {
        HttpProvider::new(&server.uri(), Duration::from_secs(5)).expect("client")
    }

    #[tokio::test]
    async fn test_create_posts_inputs_with_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/create"))
            .and(header("authorization", "Bearer tok"))
            .and(body_partial_json(json!({
                "kind": "aws:ec2/vpc",
                "inputs": { "cidr": "10.0.0.0/16" },
                "context": { "stack": "network", "environment": "dev" }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "state": { "arn": "arn:aws:ec2:vpc/vpc-123" },
                "outputs": { "id": "vpc-123" }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let response = provider(&server)
            .create(&ctx(), "aws:ec2/vpc", &inputs())
            .await
            .expect("create");

        assert_eq!(response.outputs["id"], json!("vpc-123"));
        assert_eq!(response.provider_state["arn"], json!("arn:aws:ec2:vpc/vpc-123"));
    }

    #[tokio::test]
    async fn test_diff_parses_outcome() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/diff"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "outcome": "replace" })))
            .mount(&server)
            .await;

        let current = StateRecord::new(ResourceId::new("vpc"), "aws:ec2/vpc", ProviderId::new("aws"), "h");
        let outcome = provider(&server)
            .diff(&ctx(), "aws:ec2/vpc", &inputs(), &current)
            .await
            .expect("diff");

        assert_eq!(outcome, DiffOutcome::Replace);
    }

    #[tokio::test]
    async fn test_throttling_and_server_errors_are_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/create"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/update"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let provider = provider(&server);
        let err = provider
            .create(&ctx(), "aws:ec2/vpc", &inputs())
            .await
            .expect_err("throttled");
        assert!(err.transient);
        assert!(!err.indeterminate);
        assert!(err.message.contains("429"));

        let current = StateRecord::new(ResourceId::new("vpc"), "aws:ec2/vpc", ProviderId::new("aws"), "h");
        let err = provider
            .update(&ctx(), "aws:ec2/vpc", &inputs(), &current)
            .await
            .expect_err("unavailable");
        assert!(err.transient);
        assert!(err.indeterminate);
    }

    #[tokio::test]
    async fn test_server_error_on_diff_has_no_side_effect() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/diff"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/delete"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let provider = provider(&server);
        let current = StateRecord::new(ResourceId::new("vpc"), "aws:ec2/vpc", ProviderId::new("aws"), "h");
        let err = provider
            .diff(&ctx(), "aws:ec2/vpc", &inputs(), &current)
            .await
            .expect_err("bad gateway");
        assert!(err.transient);
        assert!(!err.indeterminate);

        let err = provider
            .delete(&ctx(), "aws:ec2/vpc", &current)
            .await
            .expect_err("server error");
        assert!(err.indeterminate);
    }

    #[tokio::test]
    async fn test_client_errors_are_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/create"))
            .respond_with(
                ResponseTemplate::new(400).set_body_json(json!({ "message": "cidr overlaps" })),
            )
            .mount(&server)
            .await;

        let err = provider(&server)
            .create(&ctx(), "aws:ec2/vpc", &inputs())
            .await
            .expect_err("bad request");

        assert!(!err.transient);
        assert!(err.message.contains("cidr overlaps"));
    }

    #[tokio::test]
    async fn test_timeouts_are_flagged() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/delete"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let provider = HttpProvider::new(&server.uri(), Duration::from_millis(50)).expect("client");
        let current = StateRecord::new(ResourceId::new("vpc"), "aws:ec2/vpc", ProviderId::new("aws"), "h");
        let err = provider
            .delete(&ctx(), "aws:ec2/vpc", &current)
            .await
            .expect_err("timeout");

        assert!(err.indeterminate);
        assert!(err.transient);
    }
}
