//! End-to-end flow: install a version, lose the network, keep serving.

use std::sync::Once;
use std::time::Duration;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, LOCATION};
use http::HeaderValue;
use serde_json::json;
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use tracekit_net::{integrity, Request};
use tracekit_store::BucketStore;
use tracekit_sw::{InterceptDecision, ServiceWorker, SwConfig, WorkerState};

static INIT: Once = Once::new();

fn init_logging() {
    INIT.call_once(|| {
        tracekit_common::init_logging(tracekit_common::LogConfig::default());
    });
}

async fn mock_app(server: &MockServer, version: &str, resource: &str, body: &[u8]) {
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"<index>".to_vec()))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/{version}/manifest.json")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "resources": { resource: integrity::digest(body) }
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/{version}/{resource}")))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.to_vec()))
        .mount(server)
        .await;
}

fn worker_for(server: &MockServer) -> ServiceWorker {
    let mut config = SwConfig::new(Url::parse(&server.uri()).expect("origin"));
    config.index_timeout = Duration::from_millis(200);
    config.install_timeout = Duration::from_millis(2000);
    let (worker, _rx) = ServiceWorker::new(config, BucketStore::new()).expect("worker");
    worker
}

#[tokio::test]
async fn install_survives_network_loss() {
    init_logging();

    // An exclusive (non-pooled) server: dropping it must actually close the
    // listener so the network truly goes away mid-test.
    let server = MockServer::builder().start().await;
    mock_app(&server, "v1", "frontend_bundle.js", b"bundle bytes").await;

    let origin = server.uri();
    let worker = worker_for(&server);

    worker.install("v1").await.expect("install");
    assert_eq!(worker.state().await, WorkerState::Installed("v1".to_string()));
    worker.activate().await;
    assert_eq!(worker.state().await, WorkerState::Active);

    // Versioned asset served from the bucket.
    let asset = Request::get(Url::parse(&format!("{origin}/v1/frontend_bundle.js")).unwrap());
    assert!(worker.should_intercept(&asset));
    match worker.handle_fetch(&asset).await.unwrap() {
        InterceptDecision::ServeFromCache(response) => {
            assert_eq!(response.body.as_ref(), b"bundle bytes");
        }
        other => panic!("expected cache hit, got {other:?}"),
    }

    // Take the origin away entirely.
    drop(server);

    // The root document now falls back to its cached copy.
    let root = Request::get(Url::parse(&format!("{origin}/")).unwrap());
    match worker.handle_fetch(&root).await.unwrap() {
        InterceptDecision::ServeFromCache(response) => {
            assert_eq!(response.body.as_ref(), b"<index>");
        }
        other => panic!("expected cached root, got {other:?}"),
    }

    // So does the explicit offline route.
    let offline = Request::get(Url::parse(&format!("{origin}/offline")).unwrap());
    match worker.handle_fetch(&offline).await.unwrap() {
        InterceptDecision::ServeFromCache(response) => {
            assert_eq!(response.body.as_ref(), b"<index>");
        }
        other => panic!("expected cached root, got {other:?}"),
    }
}

#[tokio::test]
async fn staged_file_round_trip_through_worker() {
    init_logging();

    let server = MockServer::start().await;
    let origin = server.uri();
    let worker = worker_for(&server);

    const BOUNDARY: &str = "----TraceKitFormBoundary";
    let mut body = Vec::new();
    body.extend_from_slice(
        format!("--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"localOnly\"\r\n\r\ntrue\r\n")
            .as_bytes(),
    );
    body.extend_from_slice(
        format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"trace\"; filename=\"run.json\"\r\n\
             Content-Type: application/octet-stream\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(b"\x00raw trace bytes\xff");
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

    let post_url = Url::parse(&format!("{origin}/_open_trace/abc")).unwrap();
    let post = Request::post(post_url.clone(), Bytes::from(body)).header(
        CONTENT_TYPE,
        HeaderValue::from_str(&format!("multipart/form-data; boundary={BOUNDARY}")).unwrap(),
    );
    assert!(worker.should_intercept(&post));

    let redirect = match worker.handle_fetch(&post).await.unwrap() {
        InterceptDecision::RedirectAfterStaging(response) => response,
        other => panic!("expected redirect, got {other:?}"),
    };
    let location = redirect.headers.get(LOCATION).unwrap().to_str().unwrap();
    assert!(location.contains("localOnly=true"));
    assert!(location.contains(&format!("url={}", urlencoding::encode(post_url.as_str()))));

    // The application follows the redirect and claims the bytes once.
    let claim = Request::get(post_url.clone());
    match worker.handle_fetch(&claim).await.unwrap() {
        InterceptDecision::ServeStagedFile(response) => {
            assert_eq!(response.body.as_ref(), b"\x00raw trace bytes\xff");
        }
        other => panic!("expected staged file, got {other:?}"),
    }

    // The claim was destructive.
    match worker.handle_fetch(&Request::get(post_url)).await.unwrap() {
        InterceptDecision::Error(response) => {
            assert_eq!(response.status.as_u16(), 404);
        }
        other => panic!("expected error response, got {other:?}"),
    }
    assert!(worker.staging().is_empty().await);
}
