//! API client for the back-office REST backend.
//!
//! Screens issue generic JSON requests through `ApiClient`; the client only
//! knows the two auth endpoints the session manager needs itself.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::{header, Client, Method, RequestBuilder};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, warn};

use super::ApiError;
use crate::models::Profile;

// ============================================================================
// Constants
// ============================================================================

/// HTTP request timeout in seconds
const REQUEST_TIMEOUT_SECS: u64 = 20;

const LOGOUT_PATH: &str = "/api/auth/logout";

const PROFILE_PATH: &str = "/api/users/profile";

/// Supplies the bearer credential for outgoing requests.
pub trait BearerSource: Send + Sync {
    /// Token to attach, or `None` to send the request unmodified
    fn bearer_token(&self) -> Option<String>;

    /// Called when the backend rejects a request with 401.
    /// The request itself is not retried.
    fn unauthorized(&self) {}
}

/// Backend envelope: `{ "data": ... }`
#[derive(Debug, Deserialize)]
struct DataEnvelope<T> {
    data: T,
}

/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    bearer: Option<Arc<dyn BearerSource>>,
}

impl ApiClient {
    /// Create a client for the backend at `base_url`
    pub fn new(base_url: &str) -> Result<Self> {
        let mut default_headers = header::HeaderMap::new();
        default_headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .default_headers(default_headers)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            bearer: None,
        })
    }

    /// Install the bearer hook, sharing the connection pool
    pub fn with_bearer(&self, source: Arc<dyn BearerSource>) -> Self {
        Self {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            bearer: Some(source),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// The request interceptor: attach the active bearer token, if any
    fn auth_headers(&self) -> Result<header::HeaderMap> {
        let mut headers = header::HeaderMap::new();
        if let Some(token) = self.bearer.as_ref().and_then(|b| b.bearer_token()) {
            headers.insert(
                header::AUTHORIZATION,
                header::HeaderValue::from_str(&format!("Bearer {}", token))?,
            );
        }
        Ok(headers)
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(&self, response: reqwest::Response) -> Result<reqwest::Response> {
        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            if let Some(ref bearer) = self.bearer {
                bearer.unauthorized();
            }
        }
        let body = response.text().await.unwrap_or_default();
        Err(ApiError::from_status(status, &body).into())
    }

    async fn send(&self, request: RequestBuilder, url: &str) -> Result<reqwest::Response> {
        let response = request
            .headers(self.auth_headers()?)
            .send()
            .await
            .map_err(ApiError::from)
            .with_context(|| format!("Failed to send request to {}", url))?;
        self.check_response(response).await
    }

    async fn json<T: DeserializeOwned>(response: reqwest::Response, url: &str) -> Result<T> {
        response
            .json()
            .await
            .with_context(|| format!("Failed to parse JSON response from {}", url))
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.url(path);
        debug!(url = %url, "GET");
        let response = self.send(self.client.get(&url), &url).await?;
        Self::json(response, &url).await
    }

    pub async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let url = self.url(path);
        debug!(url = %url, "POST");
        let response = self.send(self.client.post(&url).json(body), &url).await?;
        Self::json(response, &url).await
    }

    pub async fn put<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let url = self.url(path);
        debug!(url = %url, "PUT");
        let response = self.send(self.client.put(&url).json(body), &url).await?;
        Self::json(response, &url).await
    }

    pub async fn delete(&self, path: &str) -> Result<()> {
        let url = self.url(path);
        debug!(url = %url, "DELETE");
        self.send(self.client.delete(&url), &url).await?;
        Ok(())
    }

    /// Arbitrary request with an optional JSON body. An empty response
    /// body comes back as `Value::Null`.
    pub async fn request_json(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let url = self.url(path);
        debug!(method = %method, url = %url, "Request");
        let mut request = self.client.request(method, &url);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = self.send(request, &url).await?;
        let text = response
            .text()
            .await
            .with_context(|| format!("Failed to read response from {}", url))?;
        if text.trim().is_empty() {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse JSON response from {}", url))
    }

    // ===== Auth endpoints =====

    /// Invalidate a backend-issued token on the server
    pub async fn logout(&self, access_token: &str) -> Result<()> {
        let url = self.url(LOGOUT_PATH);
        let request = self.client.post(&url).query(&[("token", access_token)]);
        self.send(request, &url).await?;
        debug!("Server logout accepted");
        Ok(())
    }

    pub async fn fetch_profile(&self) -> Result<Profile> {
        let envelope: DataEnvelope<Profile> = self.get(PROFILE_PATH).await?;
        if envelope.data.is_empty() {
            warn!("Backend returned an empty profile");
        }
        Ok(envelope.data)
    }
}
