//! Per-request classification and handling.
//!
//! Every intercepted request passes an admission filter first; admitted
//! requests are classified by path and dispatched to one of four policies:
//! network-first root document, cache-only offline escape hatch, file-open
//! staging hand-off, or cache-first static asset.

use std::sync::Arc;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, LOCATION};
use http::{HeaderValue, Method, StatusCode};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use url::Position;

use tracekit_net::{
    fetch_with_deadline, parse_multipart, CacheMode, FetchClient, FormValue, NetError, Request,
    RequestMode, Response,
};
use tracekit_store::BucketStore;

use crate::staging::StagingMap;
use crate::{response_from_entry, SwConfig, SwError};

/// Path of the navigation root.
const ROOT_PATH: &str = "/";
/// Escape hatch forcing the offline copy without attempting the network.
const OFFLINE_PATH: &str = "/offline";

/// Path-based classification of an admitted request.
#[derive(Debug, Clone, PartialEq, Eq)]
enum RouteClass {
    RootDocument,
    OfflineFallback,
    FileOpen { key: String },
    StaticAsset,
}

/// Tagged outcome of routing one request.
#[derive(Debug)]
pub enum InterceptDecision {
    /// Served live with no cache involvement (cache miss on a static asset;
    /// the result is deliberately not cached, so bucket contents stay equal
    /// to one manifest-declared version).
    PassThroughNetwork(Response),
    /// Served from the active bucket.
    ServeFromCache(Response),
    /// Root document served live; the cache was standing by as fallback.
    ServeLiveWithCacheFallback(Response),
    /// A staged file claimed by its follow-up request.
    ServeStagedFile(Response),
    /// A file was staged; the client is redirected to the application route
    /// that will claim it.
    RedirectAfterStaging(Response),
    /// A generic error response (e.g. a claim for an absent key).
    Error(Response),
}

impl InterceptDecision {
    /// The response produced by this decision.
    pub fn response(&self) -> &Response {
        match self {
            Self::PassThroughNetwork(r)
            | Self::ServeFromCache(r)
            | Self::ServeLiveWithCacheFallback(r)
            | Self::ServeStagedFile(r)
            | Self::RedirectAfterStaging(r)
            | Self::Error(r) => r,
        }
    }

    /// Consume the decision, yielding the response.
    pub fn into_response(self) -> Response {
        match self {
            Self::PassThroughNetwork(r)
            | Self::ServeFromCache(r)
            | Self::ServeLiveWithCacheFallback(r)
            | Self::ServeStagedFile(r)
            | Self::RedirectAfterStaging(r)
            | Self::Error(r) => r,
        }
    }
}

/// Request router.
pub struct Router {
    config: Arc<SwConfig>,
    store: Arc<RwLock<BucketStore>>,
    staging: Arc<StagingMap>,
    client: FetchClient,
}

impl Router {
    pub(crate) fn new(
        config: Arc<SwConfig>,
        store: Arc<RwLock<BucketStore>>,
        staging: Arc<StagingMap>,
        client: FetchClient,
    ) -> Self {
        Self {
            config,
            store,
            staging,
            client,
        }
    }

    /// Admission filter: whether this request is intercepted at all.
    ///
    /// Rejected requests fall through to ordinary network handling with no
    /// further involvement of the worker.
    pub fn should_handle(&self, request: &Request) -> bool {
        // 'only-if-cached' combined with a cross-origin mode is an
        // environment quirk to tolerate, not an error.
        if request.cache_mode == CacheMode::OnlyIfCached
            && request.request_mode != RequestMode::SameOrigin
        {
            return false;
        }

        let path = request.url.path();
        if path == self.config.dev_signal_path {
            return false;
        }
        // The file-open endpoint is always intercepted, whatever the method
        // or origin.
        if self.open_key(path).is_some() {
            return true;
        }
        if request.method != Method::GET {
            return false;
        }
        request.url.origin() == self.config.origin.origin()
    }

    /// Handle one admitted request.
    ///
    /// Calling this for a request the admission filter rejects is a
    /// programming-invariant violation ([`SwError::RoutingMisuse`]).
    pub async fn handle(&self, request: &Request) -> Result<InterceptDecision, SwError> {
        if !self.should_handle(request) {
            return Err(SwError::RoutingMisuse(request.url.to_string()));
        }

        match self.classify(request) {
            RouteClass::RootDocument => self.serve_root(request).await,
            RouteClass::OfflineFallback => self.serve_offline(request).await,
            RouteClass::FileOpen { key } => self.serve_file_open(request, key).await,
            RouteClass::StaticAsset => self.serve_static(request).await,
        }
    }

    fn classify(&self, request: &Request) -> RouteClass {
        let path = request.url.path();
        if path == ROOT_PATH {
            RouteClass::RootDocument
        } else if path == OFFLINE_PATH {
            RouteClass::OfflineFallback
        } else if let Some(key) = self.open_key(path) {
            RouteClass::FileOpen {
                key: key.to_string(),
            }
        } else {
            RouteClass::StaticAsset
        }
    }

    /// The opaque file key, when the path targets the file-open endpoint.
    fn open_key<'p>(&self, path: &'p str) -> Option<&'p str> {
        path.strip_prefix(&self.config.open_endpoint)
            .and_then(|rest| rest.strip_prefix('/'))
    }

    /// Root document: network-first for freshness, cached copy as fallback.
    async fn serve_root(&self, request: &Request) -> Result<InterceptDecision, SwError> {
        match fetch_with_deadline(&self.client, request, self.config.index_timeout).await {
            Ok(response) => {
                debug!(url = %request.url, "serving live root");
                Ok(InterceptDecision::ServeLiveWithCacheFallback(response))
            }
            Err(err) => {
                warn!(url = %request.url, %err, "live root fetch failed, trying cache");
                let root_url = self.config.root_url();
                let store = self.store.read().await;
                match store.match_in(&self.config.cache_name, root_url.as_str()) {
                    Some(entry) => Ok(InterceptDecision::ServeFromCache(response_from_entry(
                        entry,
                    ))),
                    None => Err(err.into()),
                }
            }
        }
    }

    /// Offline escape hatch: the cached root, ignoring the network entirely.
    async fn serve_offline(&self, request: &Request) -> Result<InterceptDecision, SwError> {
        let root_url = self.config.root_url();
        {
            let store = self.store.read().await;
            if let Some(entry) = store.match_in(&self.config.cache_name, root_url.as_str()) {
                debug!("serving cached root for offline route");
                return Ok(InterceptDecision::ServeFromCache(response_from_entry(
                    entry,
                )));
            }
        }
        self.serve_static(request).await
    }

    /// File-open endpoint: POST stages the file and redirects; any other
    /// method claims it exactly once.
    async fn serve_file_open(
        &self,
        request: &Request,
        key: String,
    ) -> Result<InterceptDecision, SwError> {
        if request.method == Method::POST {
            return self.stage_and_redirect(request, key).await;
        }

        match self.staging.take_once(&key).await {
            Some(payload) => {
                debug!(key = %key, len = payload.len(), "serving staged file");
                let response = Response::with_status(StatusCode::OK)
                    .header(CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"))
                    .body(payload);
                Ok(InterceptDecision::ServeStagedFile(response))
            }
            None => {
                // The claim either succeeds once or the caller must resubmit
                // via POST; a miss is a client-visible error, not a crash.
                let err = SwError::StagingMiss(key);
                warn!(%err, "staging claim missed");
                let response = Response::with_status(StatusCode::NOT_FOUND)
                    .body(Bytes::from(err.to_string()));
                Ok(InterceptDecision::Error(response))
            }
        }
    }

    async fn stage_and_redirect(
        &self,
        request: &Request,
        key: String,
    ) -> Result<InterceptDecision, SwError> {
        let content_type = request
            .headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| NetError::InvalidForm("missing content type".to_string()))?;
        let body = request.body.as_deref().unwrap_or(&[]);
        let entries = parse_multipart(content_type, body)?;

        let mut query = Vec::with_capacity(entries.len() + 1);
        for entry in entries {
            match entry.value {
                FormValue::File { content, .. } if entry.name == self.config.file_field => {
                    self.staging.put(key.clone(), content).await;
                }
                FormValue::Text(text) => {
                    query.push(format!(
                        "{}={}",
                        urlencoding::encode(&entry.name),
                        urlencoding::encode(&text)
                    ));
                }
                FormValue::File { .. } => {
                    warn!(field = %entry.name, "ignoring unexpected file field");
                }
            }
        }
        // The follow-up GET references this same request's URL as its source.
        query.push(format!("url={}", urlencoding::encode(request.url.as_str())));

        // Target derived from the original request's scheme and host.
        let authority = &request.url[..Position::BeforePath];
        let target = format!("{}/#!/?{}", authority, query.join("&"));
        debug!(key = %key, target = %target, "file staged, redirecting");

        let location = HeaderValue::from_str(&target)
            .map_err(|e| NetError::InvalidUrl(format!("{target}: {e}")))?;
        let response = Response::with_status(StatusCode::FOUND).header(LOCATION, location);
        Ok(InterceptDecision::RedirectAfterStaging(response))
    }

    /// Generic static asset: cache lookup, then live network with no timeout
    /// guard. Cache population only ever happens during installation.
    async fn serve_static(&self, request: &Request) -> Result<InterceptDecision, SwError> {
        {
            let store = self.store.read().await;
            if let Some(entry) = store.match_in(&self.config.cache_name, request.url.as_str()) {
                debug!(url = %request.url, "serving from cache");
                return Ok(InterceptDecision::ServeFromCache(response_from_entry(
                    entry,
                )));
            }
        }

        warn!(url = %request.url, "cache miss, using live network");
        let response = self.client.fetch(request).await?;
        Ok(InterceptDecision::PassThroughNetwork(response))
    }
}
