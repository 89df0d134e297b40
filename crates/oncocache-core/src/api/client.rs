//! API client for the oncology services REST backend.
//!
//! Every collection lives at `<base>/<path>`: listings take `page`, `limit`,
//! `order`, `orderBy`, `search` and `searchType` query parameters, single
//! records live at `<base>/<path>/<id>`.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{header, Client, Method};
use serde_json::Value;
use tracing::{debug, warn};

use crate::cache::entry::CachePayload;
use crate::cache::{QueryParams, RecordSource};
use crate::models::{Collection, DropdownKind, DropdownOption, Page};

use super::ApiError;

// ============================================================================
// Constants
// ============================================================================

/// HTTP request timeout in seconds.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// API client for the services backend.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
        })
    }

    /// Set the bearer token for authenticated requests
    pub fn set_token(&mut self, token: String) {
        self.token = Some(token);
    }

    /// Create a new ApiClient with the given token, sharing the connection pool.
    pub fn with_token(&self, token: String) -> Self {
        Self {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            token: Some(token),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn collection_url(&self, collection: Collection) -> String {
        format!("{}/{}", self.base_url, collection.path())
    }

    fn record_url(&self, collection: Collection, id: &Value) -> String {
        let id = match id {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        format!("{}/{}", self.collection_url(collection), id)
    }

    fn auth_headers(&self) -> Result<header::HeaderMap> {
        let mut headers = header::HeaderMap::new();
        headers.insert(header::ACCEPT, header::HeaderValue::from_static("application/json"));
        if let Some(ref token) = self.token {
            headers.insert(
                header::AUTHORIZATION,
                header::HeaderValue::from_str(&format!("Bearer {}", token))?,
            );
        }
        Ok(headers)
    }

    /// Check if response is successful, returning an error with body if not.
    /// Returns Ok(Some(response)) for success, Ok(None) for rate limit (should retry),
    /// or Err for other errors.
    async fn check_response_for_retry(response: reqwest::Response) -> Result<Option<reqwest::Response>> {
        if response.status().is_success() {
            Ok(Some(response))
        } else if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            Ok(None)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body).into())
        }
    }

    /// Send a request, backing off and retrying while the server answers 429.
    async fn send(
        &self,
        method: Method,
        url: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<reqwest::Response> {
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let mut request = self
                .client
                .request(method.clone(), url)
                .headers(self.auth_headers()?)
                .query(query);
            if let Some(body) = body {
                request = request.json(body);
            }

            let response = request
                .send()
                .await
                .map_err(ApiError::from)
                .with_context(|| format!("Failed to send {} request to {}", method, url))?;

            match Self::check_response_for_retry(response).await? {
                Some(response) => return Ok(response),
                None => {
                    retries += 1;
                    if retries > MAX_RATE_LIMIT_RETRIES {
                        return Err(ApiError::RateLimited.into());
                    }
                    warn!(url = url, retry = retries, backoff_ms = backoff_ms, "Rate limited, backing off");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms *= 2; // Exponential backoff
                }
            }
        }
    }

    /// Parse a JSON body, treating an empty body as `null`.
    async fn read_json(response: reqwest::Response, url: &str) -> Result<Value> {
        let text = response
            .text()
            .await
            .with_context(|| format!("Failed to read response body from {}", url))?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text)
            .map_err(|e| ApiError::InvalidResponse(e.to_string()))
            .with_context(|| format!("Failed to parse JSON response from {}", url))
    }

    // ===== Data Fetching Methods =====

    /// Fetch one page of a collection listing
    pub async fn list_page(&self, collection: Collection, params: &QueryParams) -> Result<Page> {
        let url = self.collection_url(collection);
        debug!(url = %url, page = params.page, "Fetching page");

        let response = self.send(Method::GET, &url, &params.to_query_pairs(), None).await?;
        let body = Self::read_json(response, &url).await?;
        Page::from_value(body).ok_or_else(|| {
            ApiError::InvalidResponse(format!("{} listing is not a collection", collection)).into()
        })
    }

    /// Fetch a dropdown reference list
    pub async fn list_options(&self, kind: DropdownKind) -> Result<Vec<DropdownOption>> {
        let url = self.collection_url(Collection::Dropdown(kind));
        let response = self.send(Method::GET, &url, &[], None).await?;
        let body = Self::read_json(response, &url).await?;

        let CachePayload::Collection { items, .. } = CachePayload::from_value(body) else {
            return Err(ApiError::InvalidResponse(format!("{} list is not a collection", kind.title())).into());
        };
        items
            .into_iter()
            .map(|item| serde_json::from_value(item).context("Failed to parse dropdown option"))
            .collect()
    }

    pub async fn create(&self, collection: Collection, record: &Value) -> Result<Value> {
        let url = self.collection_url(collection);
        let response = self.send(Method::POST, &url, &[], Some(record)).await?;
        Self::read_json(response, &url).await
    }

    pub async fn update(&self, collection: Collection, id: &Value, record: &Value) -> Result<Value> {
        let url = self.record_url(collection, id);
        let response = self.send(Method::PUT, &url, &[], Some(record)).await?;
        Self::read_json(response, &url).await
    }

    pub async fn delete(&self, collection: Collection, id: &Value) -> Result<()> {
        let url = self.record_url(collection, id);
        self.send(Method::DELETE, &url, &[], None).await?;
        Ok(())
    }
}

#[async_trait]
impl RecordSource for ApiClient {
    async fn fetch_page(&self, collection: Collection, params: &QueryParams) -> Result<Page> {
        self.list_page(collection, params).await
    }

    async fn fetch_options(&self, kind: DropdownKind) -> Result<Vec<DropdownOption>> {
        self.list_options(kind).await
    }

    async fn create_record(&self, collection: Collection, record: &Value) -> Result<Value> {
        self.create(collection, record).await
    }

    async fn update_record(&self, collection: Collection, id: &Value, record: &Value) -> Result<Value> {
        self.update(collection, id, record).await
    }

    async fn delete_record(&self, collection: Collection, id: &Value) -> Result<()> {
        self.delete(collection, id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_urls() {
        let client = ApiClient::new("https://api.example.test/v1/").unwrap();
        assert_eq!(client.base_url(), "https://api.example.test/v1");
        assert_eq!(
            client.collection_url(Collection::Services),
            "https://api.example.test/v1/services"
        );
        assert_eq!(
            client.record_url(Collection::Patients, &json!(42)),
            "https://api.example.test/v1/patients/42"
        );
        assert_eq!(
            client.record_url(Collection::Protocols, &json!("P-7")),
            "https://api.example.test/v1/protocols/P-7"
        );
    }

    #[test]
    fn test_token_header() {
        let client = ApiClient::new("http://localhost").unwrap().with_token("abc".into());
        let headers = client.auth_headers().unwrap();
        assert_eq!(headers.get(header::AUTHORIZATION).unwrap(), "Bearer abc");
    }
}
