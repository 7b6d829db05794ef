// # HTTP Controller Client
//
// This crate provides the controller client the agent uses in production.
//
// ## Purpose
//
// Every upstream call the agent makes goes through here: heartbeats,
// liveness transitions, WAN and HA reports, and the configuration pull.
//
// ## Transport
//
// - Controllers run with self-signed certificates, so verification is off
// - Every request carries `X-Request-Source: admin-api`
// - One request per call with a 20 second timeout; no retries (each loop
//   keeps its own dirty flags and tries again on its next tick)
//
// ## Success Rule
//
// HTTP 200 and an envelope with `success == true` and `ret == 0`. The
// envelope's `data` member is handed back to the caller.

use async_trait::async_trait;
use cpe_core::config::ControllerEndpoint;
use cpe_core::traits::{ControllerClient, ControllerClientFactory, ControllerReply};
use cpe_core::{Error, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use serde_json::Value;
use std::time::Duration;

/// Default HTTP timeout for controller requests (20 seconds)
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(20);

/// Header the controller uses to tell agent traffic from UI traffic
const REQUEST_SOURCE_HEADER: &str = "x-request-source";
const REQUEST_SOURCE: &str = "admin-api";

/// Controller client over HTTP(S)
#[derive(Debug, Clone)]
pub struct HttpControllerClient {
    endpoint: ControllerEndpoint,
    client: reqwest::Client,
}

impl HttpControllerClient {
    /// Create a client for an endpoint with the standard transport settings
    pub fn new(endpoint: ControllerEndpoint) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static(REQUEST_SOURCE_HEADER),
            HeaderValue::from_static(REQUEST_SOURCE),
        );

        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(DEFAULT_HTTP_TIMEOUT)
            .default_headers(headers)
            .build()
            .map_err(|e| Error::config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self::with_client(client, endpoint))
    }

    /// Use a pre-built reqwest client
    pub fn with_client(client: reqwest::Client, endpoint: ControllerEndpoint) -> Self {
        Self { endpoint, client }
    }

    pub fn endpoint(&self) -> &ControllerEndpoint {
        &self.endpoint
    }

    async fn call(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Value> {
        let url = self.endpoint.url(path);
        tracing::debug!(%method, %url, "controller request");

        let mut request = self
            .client
            .request(method.clone(), &url)
            .header("Content-Type", "application/json");
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::controller(format!("{} {} failed: {}", method, path, e)))?;

        let status = response.status();
        if status != StatusCode::OK {
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error response".to_string());
            tracing::warn!(%method, path, %status, "controller returned non-200");
            return Err(Error::controller(format!(
                "{} {} returned {}: {}",
                method, path, status, text
            )));
        }

        let reply: ControllerReply = response
            .json()
            .await
            .map_err(|e| Error::controller(format!("{} {}: invalid envelope: {}", method, path, e)))?;

        reply.into_data()
    }
}

#[async_trait]
impl ControllerClient for HttpControllerClient {
    async fn put(&self, path: &str, body: &Value) -> Result<Value> {
        self.call(Method::PUT, path, Some(body)).await
    }

    async fn get(&self, path: &str) -> Result<Value> {
        self.call(Method::GET, path, None).await
    }
}

/// Factory for HTTP controller clients
///
/// Accepts a serialized [`ControllerEndpoint`]:
/// `{"address": "10.0.0.1", "port": 0, "proto": "https"}`.
pub struct HttpControllerClientFactory;

impl ControllerClientFactory for HttpControllerClientFactory {
    fn create(&self, config: &Value) -> Result<Box<dyn ControllerClient>> {
        let endpoint: ControllerEndpoint = serde_json::from_value(config.clone())
            .map_err(|e| Error::config(format!("Invalid controller endpoint: {}", e)))?;
        if endpoint.address.is_empty() {
            return Err(Error::config("Controller address is required"));
        }
        endpoint.validate()?;
        Ok(Box::new(HttpControllerClient::new(endpoint)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_factory_creation() {
        let factory = HttpControllerClientFactory;

        assert!(factory
            .create(&json!({"address": "10.0.0.1", "port": 0, "proto": "https"}))
            .is_ok());
        assert!(factory.create(&json!({"address": ""})).is_err());
        assert!(factory.create(&json!({"address": "10.0.0.1/api"})).is_err());
        assert!(factory.create(&json!({"port": "x"})).is_err());
    }
}
