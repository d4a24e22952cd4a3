//! # TraceKit Net
//!
//! HTTP request/response model and deadline-bounded fetching for the TraceKit
//! service worker.
//!
//! ## Design Goals
//!
//! 1. **Async HTTP**: Non-blocking network requests
//! 2. **Deadline race**: A fetch bounded by a timer, resolving to whichever
//!    settles first
//! 3. **Cache-mode aware requests**: reload / revalidate-only semantics for
//!    versioned assets
//! 4. **Subresource integrity**: `sha256-` hash verification of fetched bodies

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use reqwest::Client;
use thiserror::Error;
use tracing::{debug, trace, warn};
use url::Url;

pub mod form;
pub mod integrity;

pub use form::{parse_multipart, FormEntry, FormValue};
pub use integrity::verify_integrity;

/// Errors that can occur in networking.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Fetch failed with status {status}: {status_text}")]
    Status { status: u16, status_text: String },

    #[error("Integrity mismatch for {url}: expected {expected}")]
    IntegrityMismatch { url: String, expected: String },

    #[error("Invalid form data: {0}")]
    InvalidForm(String),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

/// Unique identifier for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

/// Cache directive carried by a request.
///
/// Mirrors the fetch API cache modes the worker cares about: `Reload`
/// bypasses any intermediary cache, `NoCache` allows a revalidation of an
/// existing copy (used for immutable versioned paths), `OnlyIfCached` never
/// touches the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    #[default]
    Default,
    Reload,
    NoCache,
    OnlyIfCached,
}

/// Request mode relative to the serving origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    #[default]
    SameOrigin,
    Cors,
    NoCors,
    Navigate,
}

/// HTTP request.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub cache_mode: CacheMode,
    pub request_mode: RequestMode,
    /// Expected `sha256-<base64>` digest of the response body, if any.
    pub integrity: Option<String>,
}

impl Request {
    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self {
            id: RequestId::new(),
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
            body: None,
            cache_mode: CacheMode::Default,
            request_mode: RequestMode::SameOrigin,
            integrity: None,
        }
    }

    /// Create a POST request.
    pub fn post(url: Url, body: Bytes) -> Self {
        Self {
            id: RequestId::new(),
            url,
            method: Method::POST,
            headers: HeaderMap::new(),
            body: Some(body),
            cache_mode: CacheMode::Default,
            request_mode: RequestMode::SameOrigin,
            integrity: None,
        }
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the cache mode.
    pub fn cache_mode(mut self, mode: CacheMode) -> Self {
        self.cache_mode = mode;
        self
    }

    /// Set the request mode.
    pub fn request_mode(mut self, mode: RequestMode) -> Self {
        self.request_mode = mode;
        self
    }

    /// Set the expected integrity digest.
    pub fn integrity(mut self, integrity: impl Into<String>) -> Self {
        self.integrity = Some(integrity.into());
        self
    }

    /// Path component of the request URL.
    pub fn path(&self) -> &str {
        self.url.path()
    }
}

/// HTTP response.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Response {
    /// Create a response with the given status and an empty body.
    pub fn with_status(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the body.
    pub fn body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }

    /// Check if the response was successful (2xx).
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    /// Parse the body as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    /// Parse the body as UTF-8 text.
    pub fn text(&self) -> Result<String, NetError> {
        String::from_utf8(self.body.to_vec()).map_err(|e| NetError::RequestFailed(e.to_string()))
    }
}

/// Fetch client configuration.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// User agent string.
    pub user_agent: String,
    /// Hard upper bound applied to every request, regardless of any
    /// caller-supplied deadline.
    pub request_timeout: Duration,
    /// Maximum redirects followed by the underlying client.
    pub max_redirects: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: "TraceKit/0.1".to_string(),
            request_timeout: Duration::from_secs(120),
            max_redirects: 10,
        }
    }
}

/// Network fetch client wrapping a shared HTTP connection pool.
#[derive(Debug, Clone)]
pub struct FetchClient {
    client: Client,
}

impl FetchClient {
    /// Create a new fetch client.
    pub fn new(config: FetchConfig) -> Result<Self, NetError> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.request_timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;

        Ok(Self { client })
    }

    /// Fetch a request from the network.
    ///
    /// Non-2xx responses are returned as responses, not errors; callers that
    /// need success-only semantics go through [`fetch_with_deadline`].
    pub async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        debug!(url = %request.url, method = %request.method, "fetching");

        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone());

        for (name, value) in request.headers.iter() {
            builder = builder.header(name, value);
        }

        // Cache directives travel as request headers: a reload must never be
        // answered from an intermediary cache, a revalidate-only request may.
        match request.cache_mode {
            CacheMode::Reload => {
                builder = builder
                    .header("cache-control", "no-cache")
                    .header("pragma", "no-cache");
            }
            CacheMode::NoCache => {
                builder = builder.header("cache-control", "max-age=0");
            }
            CacheMode::OnlyIfCached => {
                builder = builder.header("cache-control", "only-if-cached");
            }
            CacheMode::Default => {}
        }

        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;

        trace!(url = %request.url, status = %status, body_len = body.len(), "response received");

        if let Some(expected) = &request.integrity {
            if !verify_integrity(expected, &body) {
                warn!(url = %request.url, expected = %expected, "integrity check failed");
                return Err(NetError::IntegrityMismatch {
                    url: request.url.to_string(),
                    expected: expected.clone(),
                });
            }
        }

        Ok(Response {
            status,
            headers,
            body,
        })
    }
}

/// Fetch a request with a deadline.
///
/// Races the network fetch against a timer and resolves to whichever settles
/// first. The timer winning yields [`NetError::Timeout`]; the caller simply
/// stops waiting, no abort is forced on the in-flight fetch. A fetch that
/// settles first with a non-2xx status is a failure too, so callers can fall
/// back to an offline copy. No retry logic lives here.
pub async fn fetch_with_deadline(
    client: &FetchClient,
    request: &Request,
    deadline: Duration,
) -> Result<Response, NetError> {
    tokio::select! {
        result = client.fetch(request) => {
            let response = result?;
            if response.ok() {
                Ok(response)
            } else {
                Err(NetError::Status {
                    status: response.status.as_u16(),
                    status_text: response
                        .status
                        .canonical_reason()
                        .unwrap_or("unknown")
                        .to_string(),
                })
            }
        }
        _ = tokio::time::sleep(deadline) => {
            warn!(url = %request.url, ?deadline, "fetch deadline elapsed");
            Err(NetError::Timeout(deadline))
        }
    }
}
