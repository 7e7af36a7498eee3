//! HTTP client for a backend's local control surface.
//!
//! Backends expose `{protocol}://{host}:{port}/api/v1/` for status,
//! capabilities and policy management. Every call carries its own timeout.

use std::time::Duration;

use reqwest::{Client, Method, StatusCode};
use thiserror::Error;
use tracing::{debug, error};

pub const VERSION_TIMEOUT: Duration = Duration::from_secs(2);
pub const CAPABILITIES_TIMEOUT: Duration = Duration::from_secs(5);
pub const APPLY_POLICY_TIMEOUT: Duration = Duration::from_secs(10);
pub const REMOVE_POLICY_TIMEOUT: Duration = Duration::from_secs(20);

/// Errors from the control surface.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{status} empty body")]
    EmptyBody { status: u16 },

    #[error("{status} {message}")]
    Api { status: u16, message: String },

    #[error("non 2xx HTTP status {status}: {body}")]
    Status { status: u16, body: String },
}

impl ApiError {
    /// HTTP status carried by the error, if the server answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::EmptyBody { status }
            | ApiError::Api { status, .. }
            | ApiError::Status { status, .. } => Some(*status),
            ApiError::Http(e) => e.status().map(|s| s.as_u16()),
            ApiError::Json(_) => None,
        }
    }
}

/// Stateless client; safe to call from many tasks at once.
#[derive(Debug, Clone)]
pub struct ControlSurfaceClient {
    client: Client,
    base_url: String,
}

impl ControlSurfaceClient {
    pub fn new(protocol: &str, host: &str, port: u16) -> Result<Self, ApiError> {
        Self::with_base_url(format!("{protocol}://{host}:{port}/api/v1/"))
    }

    /// Client rooted at an explicit base URL. A trailing slash is added if
    /// missing.
    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self, ApiError> {
        let mut base_url = base_url.into();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        let client = Client::builder().build()?;
        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn get_json(&self, path: &str, timeout: Duration) -> Result<serde_json::Value, ApiError> {
        self.request(Method::GET, path, None, timeout).await
    }

    /// POSTs a YAML document.
    pub async fn post_yaml(
        &self,
        path: &str,
        body: String,
        timeout: Duration,
    ) -> Result<serde_json::Value, ApiError> {
        self.request(Method::POST, path, Some(("application/x-yaml", body)), timeout)
            .await
    }

    pub async fn delete(&self, path: &str, timeout: Duration) -> Result<serde_json::Value, ApiError> {
        self.request(Method::DELETE, path, None, timeout).await
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<(&'static str, String)>,
        timeout: Duration,
    ) -> Result<serde_json::Value, ApiError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(method = %method, url = %url, "control surface request");

        let mut request = self.client.request(method, &url).timeout(timeout);
        request = match body {
            Some((content_type, body)) => request.header("Content-Type", content_type).body(body),
            None => request.header("Content-Type", "application/json"),
        };

        let response = request.send().await?;
        let status = response.status();
        let bytes = response.bytes().await?;

        if !status.is_success() {
            let err = error_from_body(status, &bytes);
            error!(url = %url, error = %err, "control surface error");
            return Err(err);
        }

        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(serde_json::Value::Null);
        }
        Ok(serde_json::from_slice(&bytes)?)
    }
}

fn error_from_body(status: StatusCode, body: &[u8]) -> ApiError {
    let status = status.as_u16();
    if body.is_empty() {
        return ApiError::EmptyBody { status };
    }
    if body.first() == Some(&b'{') {
        if let Ok(serde_json::Value::Object(map)) = serde_json::from_slice(body) {
            if let Some(message) = map.get("error") {
                let message = match message {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                return ApiError::Api { status, message };
            }
        }
    }
    ApiError::Status {
        status,
        body: String::from_utf8_lossy(body).into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client_for(server: &MockServer) -> ControlSurfaceClient {
        ControlSurfaceClient::with_base_url(format!("{}/api/v1", server.uri())).unwrap()
    }

    #[test]
    fn test_base_url_layout() {
        let client = ControlSurfaceClient::new("http", "localhost", 10853).unwrap();
        assert_eq!(client.base_url(), "http://localhost:10853/api/v1/");
    }

    #[tokio::test]
    async fn test_get_json() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"version": "1.2.3"})))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let body = client.get_json("status", VERSION_TIMEOUT).await.unwrap();
        assert_eq!(body["version"], "1.2.3");
    }

    #[tokio::test]
    async fn test_empty_success_body_is_null() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/api/v1/policies/p1"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let body = client.delete("policies/p1", REMOVE_POLICY_TIMEOUT).await.unwrap();
        assert!(body.is_null());
    }

    #[tokio::test]
    async fn test_post_yaml_sets_content_type() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/policies"))
            .and(header("Content-Type", "application/x-yaml"))
            .and(body_string_contains("policies:"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        client
            .post_yaml("policies", "policies:\n  p1: {}\n".to_string(), APPLY_POLICY_TIMEOUT)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_error_empty_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let err = client.get_json("status", VERSION_TIMEOUT).await.unwrap_err();
        assert!(matches!(err, ApiError::EmptyBody { status: 503 }));
        assert_eq!(err.to_string(), "503 empty body");
    }

    #[tokio::test]
    async fn test_error_json_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(422).set_body_json(serde_json::json!({"error": "bad tap"})),
            )
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let err = client
            .post_yaml("policies", String::new(), APPLY_POLICY_TIMEOUT)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "422 bad tap");
        assert_eq!(err.status(), Some(422));
    }

    #[tokio::test]
    async fn test_error_plain_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let err = client.get_json("status", VERSION_TIMEOUT).await.unwrap_err();
        assert!(matches!(err, ApiError::Status { status: 500, ref body } if body == "boom"));
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let client = ControlSurfaceClient::new("http", "127.0.0.1", 1).unwrap();
        let err = client.get_json("status", VERSION_TIMEOUT).await.unwrap_err();
        assert!(matches!(err, ApiError::Http(_)));
        assert_eq!(err.status(), None);
    }
}
