//! # HTTP Retrieval Utilities
//!
//! An asynchronous API client wrapper around `reqwest` with middleware
//! support for exponential backoff retries and standardized JSON response
//! handling.
//!
//! Signed posts send the body bytes exactly as they were signed. Nothing on
//! this path re-serializes the payload after the digest is computed.

use anyhow::Context;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Method, Url};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::{de::DeserializeOwned, Serialize};

use crate::security::{sign_hex, SIGNATURE_HEADER, SIGNATURE_TS_HEADER};

/// Header carrying the relay's static API token.
pub const API_TOKEN_HEADER: &str = "X-Api-Token";

/// A standardized container for API responses.
///
/// Wraps the deserialized data along with the status code and headers.
#[derive(Debug)]
pub struct ApiResponse<T> {
    /// The successfully deserialized response body, if any.
    pub data: Option<T>,
    /// The raw error body returned by the server if the request failed.
    pub error_body: Option<String>,
    /// The numeric HTTP status code.
    pub status: u16,
    /// Indicates if the status code was in the 2xx range.
    pub success: bool,
    /// The headers returned by the server.
    pub headers: HeaderMap,
}

/// A flexible asynchronous HTTP client.
///
/// Handles the base URL, the relay API token and automatic retries.
#[derive(Debug, Clone)]
pub struct ApiClient {
    inner: ClientWithMiddleware,
    base_url: Url,
    api_token: Option<String>,
}

impl ApiClient {
    /// Creates a client that retries transient failures up to three times.
    ///
    /// # Arguments
    /// * `base_url` - The absolute base URL of the relay (e.g. "http://127.0.0.1:8000/").
    /// * `api_token` - Sent as `X-Api-Token` on every request when present.
    ///
    /// # Errors
    /// Fails if `base_url` is not a valid absolute URL.
    pub fn new(base_url: &str, api_token: Option<String>) -> anyhow::Result<Self> {
        Self::with_max_retries(base_url, api_token, 3)
    }

    /// Creates a client with an explicit retry budget. Zero disables retries.
    ///
    /// A signed request that reached the relay but lost its response will be
    /// refused as a replay when retried, so load generators usually pass 0.
    pub fn with_max_retries(base_url: &str, api_token: Option<String>, max_retries: u32) -> anyhow::Result<Self> {
        let url = Url::parse(base_url).with_context(|| format!("invalid base URL `{base_url}`"))?;

        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(max_retries);
        let client = ClientBuilder::new(reqwest::Client::new())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(Self {
            inner: client,
            base_url: url,
            api_token,
        })
    }

    /// The base URL all paths are joined onto.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Performs a JSON request and collects the response.
    ///
    /// # Arguments
    /// * `method` - The HTTP verb (GET, POST, etc.).
    /// * `path` - The relative path to append to the base URL.
    /// * `headers` - Optional additional headers for this specific request.
    /// * `body` - Optional serializable object to send as the JSON body.
    ///
    /// # Errors
    /// Returns an `anyhow::Error` if URL joining, serialization or network
    /// execution fails. Non-2xx statuses are not errors.
    pub async fn request<T, B>(
        &self,
        method: Method,
        path: &str,
        headers: Option<HeaderMap>,
        body: Option<B>,
    ) -> anyhow::Result<ApiResponse<T>>
    where
        T: DeserializeOwned,
        B: Serialize,
    {
        let bytes = body.map(|b| serde_json::to_vec(&b)).transpose()?;
        self.send(method, path, headers.unwrap_or_default(), bytes).await
    }

    /// Posts `body` signed with `secret` at unix time `timestamp`.
    ///
    /// Adds `X-Signature-Ts` and `X-Signature` next to the API token.
    pub async fn post_signed<T>(
        &self,
        path: &str,
        secret: &[u8],
        timestamp: i64,
        body: Vec<u8>,
    ) -> anyhow::Result<ApiResponse<T>>
    where
        T: DeserializeOwned,
    {
        let ts = timestamp.to_string();
        let signature = sign_hex(secret, &ts, &body);

        let mut headers = HeaderMap::new();
        headers.insert(header_name(SIGNATURE_TS_HEADER)?, HeaderValue::from_str(&ts)?);
        headers.insert(header_name(SIGNATURE_HEADER)?, HeaderValue::from_str(&signature)?);

        self.send(Method::POST, path, headers, Some(body)).await
    }

    async fn send<T>(
        &self,
        method: Method,
        path: &str,
        mut headers: HeaderMap,
        body: Option<Vec<u8>>,
    ) -> anyhow::Result<ApiResponse<T>>
    where
        T: DeserializeOwned,
    {
        let full_url = self.base_url.join(path)?;

        if let Some(token) = &self.api_token {
            headers.insert(header_name(API_TOKEN_HEADER)?, HeaderValue::from_str(token)?);
        }

        let mut req = self.inner.request(method, full_url).headers(headers);
        if let Some(bytes) = body {
            req = req.header(CONTENT_TYPE, "application/json").body(bytes);
        }

        let response: reqwest::Response = req.send().await?;
        let status = response.status();
        let resp_headers = response.headers().clone();

        if status.is_success() {
            let data = response.json::<T>().await?;
            Ok(ApiResponse {
                data: Some(data),
                error_body: None,
                status: status.as_u16(),
                success: true,
                headers: resp_headers,
            })
        } else {
            let error_text = response.text().await.ok();
            Ok(ApiResponse {
                data: None,
                error_body: error_text,
                status: status.as_u16(),
                success: false,
                headers: resp_headers,
            })
        }
    }
}

fn header_name(name: &str) -> anyhow::Result<HeaderName> {
    Ok(HeaderName::from_bytes(name.as_bytes())?)
}
