use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::transport::{Method, OutgoingRequest, RawResponse, Transport, TransportError};

const REQUEST_ID_OVERRIDE_ENV: &str = "URBANVITAL_REQUEST_ID_OVERRIDE";

fn request_id() -> String {
    std::env::var(REQUEST_ID_OVERRIDE_ENV).unwrap_or_else(|_| Uuid::new_v4().to_string())
}

fn build_headers(bearer: Option<&str>) -> Result<HeaderMap, TransportError> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

    let rid = request_id();
    headers.insert(
        "X-Request-Id",
        HeaderValue::from_str(&rid).map_err(|e| TransportError::InvalidRequest(e.to_string()))?,
    );

    if let Some(token) = bearer {
        let value = format!("Bearer {}", token);
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&value)
                .map_err(|e| TransportError::InvalidRequest(e.to_string()))?,
        );
    }

    Ok(headers)
}

fn map_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_builder() {
        TransportError::InvalidRequest(err.to_string())
    } else {
        TransportError::Network(err.to_string())
    }
}

/// JSON-over-HTTP transport bound to a single API base URL.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    base_url: String,
    http_client: Client,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .context("creating HTTP client")?;

        let base_url = base_url.into().trim_end_matches('/').to_string();
        debug!(base_url = %base_url, timeout_secs = timeout.as_secs(), "http transport initialized");

        Ok(Self {
            base_url,
            http_client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &OutgoingRequest) -> Result<RawResponse, TransportError> {
        let url = self.url(&request.path);
        let headers = build_headers(request.bearer.as_deref())?;

        trace!(
            method = %request.method,
            url = %url,
            authenticated = request.bearer.is_some(),
            "sending request"
        );

        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        };

        let mut builder = self.http_client.request(method, &url).headers(headers);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let resp = builder.send().await.map_err(map_reqwest_error)?;
        let status = resp.status().as_u16();
        let body = resp.text().await.map_err(map_reqwest_error)?;

        debug!(
            method = %request.method,
            url = %url,
            status_code = status,
            "received response"
        );

        Ok(RawResponse { status, body })
    }
}
