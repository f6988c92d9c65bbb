//! HTTP exchange with the LRS.
//!
//! A [`Transport`] performs one attempt of a [`RequestDescriptor`] and
//! classifies the result as success, retryable failure or fatal failure.
//! Retrying is left to the delivery queue.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tracing::debug;

use crate::error::{DeliveryFailure, XapiError};
use crate::request::RequestDescriptor;

/// Header carrying the LRS consistency watermark on statement reads
const CONSISTENT_THROUGH_HEADER: &str = "x-experience-api-consistent-through";

/// A successful LRS response.
#[derive(Debug, Clone, PartialEq)]
pub struct LrsResponse {
    pub status: u16,

    /// Parsed JSON body; `Null` for an empty body and a JSON string for a
    /// body that is not JSON
    pub body: Value,

    pub consistent_through: Option<String>,
}

/// Classified result of one attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(LrsResponse),

    /// Network error, timeout, HTTP 5xx or HTTP 429
    Retryable {
        failure: DeliveryFailure,
        /// Server-requested minimum wait, from `Retry-After`
        retry_after: Option<Duration>,
    },

    /// Any other non-success status, or a request that could not be built
    Fatal(DeliveryFailure),
}

impl Outcome {
    pub fn retryable(failure: DeliveryFailure) -> Self {
        Outcome::Retryable {
            failure,
            retry_after: None,
        }
    }
}

/// Performs a single HTTP exchange for a request.
///
/// Implementations hold no per-request state; the queue may call `execute`
/// many times for the same descriptor.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: &RequestDescriptor) -> Outcome;
}

/// Map a non-success HTTP status to an outcome.
pub fn classify_status(status: StatusCode, body: String, retry_after: Option<Duration>) -> Outcome {
    let failure = DeliveryFailure::Status {
        status: status.as_u16(),
        body,
    };

    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Outcome::Retryable { failure, retry_after }
    } else {
        Outcome::Fatal(failure)
    }
}

/// Map a reqwest error to an outcome.
pub fn classify_error(err: &reqwest::Error) -> Outcome {
    if err.is_builder() || err.is_redirect() {
        Outcome::Fatal(DeliveryFailure::Request(err.to_string()))
    } else if err.is_timeout() {
        Outcome::retryable(DeliveryFailure::Timeout)
    } else {
        Outcome::retryable(DeliveryFailure::Network(err.to_string()))
    }
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn parse_body(text: String) -> Value {
    if text.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(&text).unwrap_or(Value::String(text))
}

/// [`Transport`] backed by a pooled reqwest client.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    /// The underlying HTTP client (reused for connection pooling)
    client: Client,
}

impl HttpTransport {
    /// Create a transport with connection pooling.
    ///
    /// # Errors
    ///
    /// Returns `XapiError::Runtime` if the HTTP client cannot be built.
    pub fn new() -> Result<Self, XapiError> {
        let client = Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| XapiError::Runtime(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self { client })
    }

    /// Wrap an existing reqwest client.
    ///
    /// Requests still take their timeout from each descriptor.
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new().unwrap_or_else(|_| Self::with_client(Client::new()))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(&self, request: &RequestDescriptor) -> Outcome {
        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone())
            .timeout(request.timeout);
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => {
                debug!(operation = request.operation, error = %e, "LRS request failed");
                return classify_error(&e);
            }
        };

        let status = response.status();
        let retry_after = parse_retry_after(response.headers());
        let consistent_through = response
            .headers()
            .get(CONSISTENT_THROUGH_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let text = match response.text().await {
            Ok(text) => text,
            Err(e) => return classify_error(&e),
        };

        debug!(
            operation = request.operation,
            status = status.as_u16(),
            "LRS responded"
        );

        if status.is_success() {
            Outcome::Success(LrsResponse {
                status: status.as_u16(),
                body: parse_body(text),
                consistent_through,
            })
        } else {
            classify_status(status, text, retry_after)
        }
    }
}
