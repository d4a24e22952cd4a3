//! # TraceKit Service Worker
//!
//! Offline-capable asset proxy for the TraceKit trace viewer UI.
//!
//! ## Features
//!
//! - **Lifecycle**: install → activate → serve state machine with immediate
//!   take-over of new generations
//! - **Versioned install**: one named bucket, atomically replaced per version
//!   from `{version}/manifest.json`
//! - **Fetch routing**: network-first root with cached fallback, cache-first
//!   static assets, `/offline` escape hatch
//! - **File staging**: a POST parks a user-supplied file that the follow-up
//!   GET claims exactly once
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorker (lifecycle controller)
//!     │
//!     ├── Installer ──── BucketStore (one active bucket per version)
//!     │
//!     └── Router
//!             ├── FetchClient (deadline-bounded live fetches)
//!             ├── BucketStore (cache lookups)
//!             └── StagingMap (file-open hand-off)
//! ```

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderName, HeaderValue, StatusCode};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};
use url::Url;

use tracekit_net::{FetchClient, FetchConfig, NetError, Request, Response};
use tracekit_store::{BucketStore, CacheEntry, StoreError};

pub mod install;
pub mod router;
pub mod staging;

pub use install::VersionManifest;
pub use router::{InterceptDecision, Router};
pub use staging::StagingMap;

/// Errors that can occur in the service worker.
#[derive(Error, Debug)]
pub enum SwError {
    #[error(transparent)]
    Net(#[from] NetError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Invalid manifest {url}: {reason}")]
    ManifestInvalid { url: String, reason: String },

    #[error("Installation aborted: {0}")]
    InstallAborted(String),

    #[error("No staged file for key '{0}'")]
    StagingMiss(String),

    #[error("Request should not have been intercepted: {0}")]
    RoutingMisuse(String),
}

/// Service worker configuration.
///
/// Timeout tiers and endpoint names are configuration, not structure; the
/// defaults mirror the deployed trace viewer.
#[derive(Debug, Clone)]
pub struct SwConfig {
    /// Serving origin all same-origin checks compare against.
    pub origin: Url,
    /// The single active bucket name, shared across versions.
    pub cache_name: String,
    /// Sentinel bucket name: its presence aborts installation (operator kill
    /// switch for offline caching).
    pub bypass_bucket: String,
    /// Buckets with this name prefix belong to a prior naming scheme and are
    /// deleted on install.
    pub legacy_bucket_prefix: String,
    /// Interactive deadline for live root-document fetches.
    pub index_timeout: Duration,
    /// Relaxed deadline for background installation fetches.
    pub install_timeout: Duration,
    /// Path prefix of the file-open endpoint.
    pub open_endpoint: String,
    /// Form field carrying the binary file payload.
    pub file_field: String,
    /// Dev-server signal endpoint, never intercepted.
    pub dev_signal_path: String,
    /// Maximum unclaimed staged files retained.
    pub staging_capacity: usize,
}

impl SwConfig {
    /// Configuration with deployed defaults for a serving origin.
    pub fn new(origin: Url) -> Self {
        Self {
            origin,
            cache_name: "ui-tracekit".to_string(),
            bypass_bucket: "BYPASS_SERVICE_WORKER".to_string(),
            legacy_bucket_prefix: "dist-".to_string(),
            index_timeout: Duration::from_millis(3000),
            install_timeout: Duration::from_millis(30000),
            open_endpoint: "/_open_trace".to_string(),
            file_field: "trace".to_string(),
            dev_signal_path: "/live_reload".to_string(),
            staging_capacity: 8,
        }
    }

    /// URL of the root document on the serving origin.
    pub(crate) fn root_url(&self) -> Url {
        self.origin
            .join("/")
            .unwrap_or_else(|_| self.origin.clone())
    }
}

/// Worker lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerState {
    Uninstalled,
    Installing,
    Installed(String),
    Activating,
    Active,
}

/// Events reported to the host environment.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// The lifecycle state changed.
    StateChanged(WorkerState),
    /// The freshly installed generation should take over immediately instead
    /// of waiting for consumers of the previous one to finish. Safe because
    /// subresource URLs are versioned: old and new generations never collide
    /// even if both are briefly active.
    TakeOver,
    /// An install attempt failed; the previous generation (if any) stays
    /// active.
    InstallFailed(String),
}

/// The service worker: drives install/activate transitions and routes
/// intercepted traffic.
pub struct ServiceWorker {
    config: Arc<SwConfig>,
    client: FetchClient,
    store: Arc<RwLock<BucketStore>>,
    staging: Arc<StagingMap>,
    router: Router,
    state: RwLock<WorkerState>,
    event_tx: mpsc::UnboundedSender<WorkerEvent>,
}

impl ServiceWorker {
    /// Create a worker over a bucket store (persistent or in-memory; tests
    /// construct isolated in-memory instances).
    pub fn new(
        config: SwConfig,
        store: BucketStore,
    ) -> Result<(Self, mpsc::UnboundedReceiver<WorkerEvent>), SwError> {
        let client = FetchClient::new(FetchConfig::default())?;
        Ok(Self::with_client(config, store, client))
    }

    /// Create a worker sharing an existing fetch client.
    pub fn with_client(
        config: SwConfig,
        store: BucketStore,
        client: FetchClient,
    ) -> (Self, mpsc::UnboundedReceiver<WorkerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let config = Arc::new(config);
        let store = Arc::new(RwLock::new(store));
        let staging = Arc::new(StagingMap::new(config.staging_capacity));
        let router = Router::new(
            Arc::clone(&config),
            Arc::clone(&store),
            Arc::clone(&staging),
            client.clone(),
        );

        (
            Self {
                config,
                client,
                store,
                staging,
                router,
                state: RwLock::new(WorkerState::Uninstalled),
                event_tx,
            },
            event_rx,
        )
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> WorkerState {
        self.state.read().await.clone()
    }

    /// Install a version, replacing the active bucket.
    ///
    /// The version identifier is an explicit parameter supplied by the host
    /// environment. On failure the previous generation stays active and the
    /// worker returns to `Uninstalled`, eligible for a later attempt; there
    /// is no built-in retry.
    pub async fn install(&self, version: &str) -> Result<(), SwError> {
        self.set_state(WorkerState::Installing).await;

        match install::install_version(&self.client, &self.store, &self.config, version).await {
            Ok(()) => {
                self.set_state(WorkerState::Installed(version.to_string()))
                    .await;
                let _ = self.event_tx.send(WorkerEvent::TakeOver);
                Ok(())
            }
            Err(err) => {
                warn!(version, %err, "install failed");
                let _ = self
                    .event_tx
                    .send(WorkerEvent::InstallFailed(err.to_string()));
                self.set_state(WorkerState::Uninstalled).await;
                Err(err)
            }
        }
    }

    /// Activate: the terminal steady state in which the router operates.
    pub async fn activate(&self) {
        self.set_state(WorkerState::Activating).await;
        self.set_state(WorkerState::Active).await;
        info!("activated");
    }

    /// Admission filter, exposed to the host environment. Requests this
    /// rejects must be handled by the ordinary network path.
    pub fn should_intercept(&self, request: &Request) -> bool {
        self.router.should_handle(request)
    }

    /// Route one intercepted request.
    pub async fn handle_fetch(&self, request: &Request) -> Result<InterceptDecision, SwError> {
        self.router.handle(request).await
    }

    /// The staging map owned by this worker.
    pub fn staging(&self) -> &StagingMap {
        &self.staging
    }

    async fn set_state(&self, next: WorkerState) {
        let mut state = self.state.write().await;
        *state = next.clone();
        let _ = self.event_tx.send(WorkerEvent::StateChanged(next));
    }
}

/// Build a cache entry from a fetched response.
pub(crate) fn entry_from_response(request: &Request, response: &Response) -> CacheEntry {
    let mut entry = CacheEntry::new(
        request.url.as_str(),
        response.status.as_u16(),
        response.body.to_vec(),
    );
    entry.method = request.method.to_string();
    for (name, value) in response.headers.iter() {
        if let Ok(value) = value.to_str() {
            entry.headers.insert(name.to_string(), value.to_string());
        }
    }
    entry
}

/// Rebuild a response from a cache entry.
pub(crate) fn response_from_entry(entry: &CacheEntry) -> Response {
    let mut response = Response::with_status(
        StatusCode::from_u16(entry.status).unwrap_or(StatusCode::OK),
    )
    .body(Bytes::from(entry.body.clone()));
    for (name, value) in entry.headers.iter() {
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            response.headers.insert(name, value);
        }
    }
    response
}

pub(crate) fn join_url(base: &Url, path: &str) -> Result<Url, SwError> {
    base.join(path)
        .map_err(|err| NetError::InvalidUrl(format!("{base}{path}: {err}")).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn drain(rx: &mut mpsc::UnboundedReceiver<WorkerEvent>) -> Vec<WorkerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_install_success_transitions_and_takes_over() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/manifest.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "resources": {} })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"<index>".to_vec()))
            .mount(&server)
            .await;

        let config = SwConfig::new(Url::parse(&server.uri()).unwrap());
        let (worker, mut rx) = ServiceWorker::new(config, BucketStore::new()).unwrap();

        worker.install("v1").await.unwrap();
        assert_eq!(worker.state().await, WorkerState::Installed("v1".to_string()));

        let events = drain(&mut rx);
        assert!(matches!(
            events[0],
            WorkerEvent::StateChanged(WorkerState::Installing)
        ));
        assert!(matches!(
            events[1],
            WorkerEvent::StateChanged(WorkerState::Installed(_))
        ));
        assert!(matches!(events[2], WorkerEvent::TakeOver));

        worker.activate().await;
        assert_eq!(worker.state().await, WorkerState::Active);
    }

    #[tokio::test]
    async fn test_install_failure_reports_and_stays_eligible() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/manifest.json"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let config = SwConfig::new(Url::parse(&server.uri()).unwrap());
        let (worker, mut rx) = ServiceWorker::new(config, BucketStore::new()).unwrap();

        assert!(worker.install("v1").await.is_err());
        assert_eq!(worker.state().await, WorkerState::Uninstalled);

        let events = drain(&mut rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, WorkerEvent::InstallFailed(_))));
        assert!(!events.iter().any(|e| matches!(e, WorkerEvent::TakeOver)));
    }

    #[test]
    fn test_entry_response_round_trip() {
        let request = Request::get(Url::parse("http://origin.test/v1/app.js").unwrap());
        let response = Response::with_status(StatusCode::OK)
            .header(
                HeaderName::from_static("content-type"),
                HeaderValue::from_static("text/javascript"),
            )
            .body(Bytes::from_static(b"js"));

        let entry = entry_from_response(&request, &response);
        assert_eq!(entry.url, "http://origin.test/v1/app.js");
        assert_eq!(entry.status, 200);

        let rebuilt = response_from_entry(&entry);
        assert_eq!(rebuilt.status, StatusCode::OK);
        assert_eq!(rebuilt.body.as_ref(), b"js");
        assert_eq!(rebuilt.headers.get("content-type").unwrap(), "text/javascript");
    }
}
