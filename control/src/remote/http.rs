//! HTTP client for the remote controller
//!
//! Plain HTTP/1.1 through hyper-util's pooled legacy client. TLS termination
//! in front of the controller is expected to be handled by the deployment.

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use super::{RemoteClient, RemoteError, RestMethod, RestOp};
use crate::config::ControllerEndpointConfig;

pub struct HttpRemoteClient {
    client: Client<HttpConnector, Full<Bytes>>,
    base_url: String,
    auth_token: Option<String>,
    tenant: String,
    timeout: Duration,
}

impl HttpRemoteClient {
    pub fn new(base_url: impl Into<String>, tenant: impl Into<String>, config: &ControllerEndpointConfig) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth_token: config.auth_token.clone(),
            tenant: tenant.into(),
            timeout: Duration::from_secs(config.request_timeout_secs),
        }
    }

    async fn send(&self, method: Method, path: &str, tenant: &str, body: Option<&Value>) -> Result<Value, RemoteError> {
        let uri = format!("{}{}", self.base_url, path);
        let payload = match body {
            Some(v) => Bytes::from(
                serde_json::to_vec(v).map_err(|e| RemoteError::Malformed(format!("request body: {}", e)))?,
            ),
            None => Bytes::new(),
        };

        let mut builder = Request::builder()
            .method(method.clone())
            .uri(&uri)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .header("X-Tenant", tenant);
        if let Some(token) = &self.auth_token {
            builder = builder.header("Authorization", format!("Bearer {}", token));
        }
        let request = builder
            .body(Full::new(payload))
            .map_err(|e| RemoteError::Transport(format!("failed to build request for {}: {}", uri, e)))?;

        let response = tokio::time::timeout(self.timeout, self.client.request(request))
            .await
            .map_err(|_| RemoteError::Transport(format!("{} {} timed out after {:?}", method, uri, self.timeout)))?
            .map_err(|e| RemoteError::Transport(format!("{} {}: {}", method, uri, e)))?;

        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| RemoteError::Transport(format!("reading response of {} {}: {}", method, uri, e)))?
            .to_bytes();
        debug!(
            http.request.method = %method,
            url.full = %uri,
            http.response.status_code = status.as_u16(),
            "Remote call completed"
        );

        if !status.is_success() {
            return Err(RemoteError::status(
                status.as_u16(),
                String::from_utf8_lossy(&body).into_owned(),
            ));
        }
        if body.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&body).map_err(|e| RemoteError::Malformed(format!("{} {}: {}", method, uri, e)))
    }
}

#[async_trait]
impl RemoteClient for HttpRemoteClient {
    async fn execute(&self, op: &RestOp) -> Result<Value, RemoteError> {
        let method = match op.method {
            RestMethod::Post => Method::POST,
            RestMethod::Put => Method::PUT,
            RestMethod::Delete => Method::DELETE,
        };
        self.send(method, &op.path, &op.tenant, op.body.as_ref()).await
    }

    async fn get(&self, path: &str) -> Result<Value, RemoteError> {
        self.send(Method::GET, path, &self.tenant, None).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_controller_is_transport_error() {
        let config = ControllerEndpointConfig {
            request_timeout_secs: 1,
            ..Default::default()
        };
        // port 9 (discard) on loopback is closed in test environments
        let client = HttpRemoteClient::new("http://127.0.0.1:9/", "admin", &config);
        let err = client.get("/api/pool").await.unwrap_err();
        assert!(matches!(err, RemoteError::Transport(_)), "got {:?}", err);
    }

    #[test]
    fn test_base_url_is_normalized() {
        let client = HttpRemoteClient::new("http://ctrl:8080//", "admin", &ControllerEndpointConfig::default());
        assert_eq!(client.base_url, "http://ctrl:8080");
    }
}
