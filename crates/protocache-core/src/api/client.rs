//! API client for the rental back office REST API.
//!
//! This module provides the `ApiClient` struct for making authenticated
//! requests for protocol status, protocol documents and protocol mutations.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{header, Client, RequestBuilder, Url};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::models::{
    BulkStatusPayload, MutationResponse, ProtocolKind, ProtocolRecord, RentalProtocols,
};

use super::{ApiError, ProtocolSource};

// ============================================================================
// Constants
// ============================================================================

/// HTTP request timeout in seconds.
/// Also bounds how long a protocol load can stay in flight.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// API client for the back office.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl ApiClient {
    /// Create a new API client with the default request timeout
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Self::with_timeout(base_url, DEFAULT_REQUEST_TIMEOUT_SECS)
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

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

    /// Build an endpoint URL below the base URL.
    /// Each segment is percent-encoded, so ids cannot add path or query parts.
    fn endpoint(&self, segments: &[&str]) -> Result<String> {
        let mut url = Url::parse(&self.base_url)
            .with_context(|| format!("Invalid API base URL: {}", self.base_url))?;
        url.path_segments_mut()
            .map_err(|_| anyhow!("API base URL cannot have a path: {}", self.base_url))?
            .pop_if_empty()
            .extend(segments);
        Ok(url.to_string())
    }

    fn auth_headers(&self) -> Result<header::HeaderMap> {
        let mut headers = header::HeaderMap::new();
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

    /// Send a request built by `build`, retrying with exponential backoff
    /// while the server answers 429, and decode the JSON body.
    async fn execute<T, F>(&self, method: &str, url: &str, build: F) -> Result<T>
    where
        T: DeserializeOwned,
        F: Fn() -> RequestBuilder,
    {
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let response = build()
                .headers(self.auth_headers()?)
                .send()
                .await
                .map_err(ApiError::from)
                .with_context(|| format!("Failed to send {} request to {}", method, url))?;

            match Self::check_response_for_retry(response).await? {
                Some(response) => {
                    return response
                        .json()
                        .await
                        .with_context(|| format!("Failed to parse JSON response from {}", url));
                }
                None => {
                    retries += 1;
                    if retries > MAX_RATE_LIMIT_RETRIES {
                        return Err(ApiError::RateLimited.into());
                    }
                    warn!(url = url, retry = retries, backoff_ms = backoff_ms, "Rate limited, backing off");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms *= 2;
                }
            }
        }
    }

    async fn get<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        self.execute("GET", url, || self.client.get(url)).await
    }

    async fn post<T: DeserializeOwned>(&self, url: &str, body: &Value) -> Result<T> {
        self.execute("POST", url, || self.client.post(url).json(body)).await
    }

    async fn put<T: DeserializeOwned>(&self, url: &str, body: &Value) -> Result<T> {
        self.execute("PUT", url, || self.client.put(url).json(body)).await
    }
}

#[async_trait]
impl ProtocolSource for ApiClient {
    /// Fetch presence flags for every rental in one call
    async fn fetch_bulk_status(&self) -> Result<BulkStatusPayload> {
        let url = self.endpoint(&["protocols", "bulk-status"])?;
        let payload: BulkStatusPayload = self
            .get(&url)
            .await
            .context("Failed to fetch bulk protocol status")?;
        debug!(rentals = payload.len(), "Bulk protocol status response received");
        Ok(payload)
    }

    /// Fetch all handover and return protocols of one rental
    async fn fetch_rental_protocols(&self, rental_id: &str) -> Result<RentalProtocols> {
        let url = self.endpoint(&["protocols", "rental", rental_id])?;
        let raw: RentalProtocols = self
            .get(&url)
            .await
            .with_context(|| format!("Failed to fetch protocols for rental {}", rental_id))?;
        debug!(
            rental_id,
            handover_count = raw.handover_protocols.len(),
            return_count = raw.return_protocols.len(),
            "Rental protocols response received"
        );
        Ok(raw)
    }

    async fn create_protocol(&self, kind: ProtocolKind, body: &Value) -> Result<ProtocolRecord> {
        let url = self.endpoint(&["protocols", kind.as_str()])?;
        let response: MutationResponse = self
            .post(&url, body)
            .await
            .with_context(|| format!("Failed to create {} protocol", kind))?;
        Ok(response.into_record())
    }

    async fn update_protocol(
        &self,
        kind: ProtocolKind,
        protocol_id: &str,
        body: &Value,
    ) -> Result<ProtocolRecord> {
        let url = self.endpoint(&["protocols", kind.as_str(), protocol_id])?;
        let response: MutationResponse = self
            .put(&url, body)
            .await
            .with_context(|| format!("Failed to update {} protocol {}", kind, protocol_id))?;
        Ok(response.into_record())
    }
}
