//! HTTP executor behavior against in-process servers: body capture, the
//! retriable-5xx retry loop, and non-retriable client errors.


use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;

use cronfleet::worker::http_exec::HttpExecutor;
use cronfleet::worker::TaskExecutor;
use test_harness::http_job;

async fn serve(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn counting_route(
    hits: Arc<AtomicUsize>,
    respond: impl Fn(usize) -> (StatusCode, String) + Clone + Send + Sync + 'static,
) -> Router {
    Router::new().route(
        "/",
        get(move || {
            let hits = hits.clone();
            let respond = respond.clone();
            async move {
                let n = hits.fetch_add(1, Ordering::SeqCst);
                respond(n).into_response()
            }
        }),
    )
}

#[tokio::test]
async fn success_captures_response_body() {
    let hits = Arc::new(AtomicUsize::new(0));
    let addr = serve(counting_route(hits.clone(), |_| {
        (StatusCode::OK, "pong".to_string())
    }))
    .await;

    let executor = HttpExecutor::new().unwrap();
    let outcome = executor
        .execute(&http_job("ping", &format!("http://{addr}/"), None))
        .await;

    assert!(outcome.error.is_none(), "got error: {:?}", outcome.error);
    assert_eq!(outcome.output, "pong");
    assert_eq!(outcome.retries_attempted, 0);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn retries_5xx_until_success() {
    let hits = Arc::new(AtomicUsize::new(0));
    let addr = serve(counting_route(hits.clone(), |n| {
        if n < 2 {
            (StatusCode::INTERNAL_SERVER_ERROR, "boom".to_string())
        } else {
            (StatusCode::OK, "recovered".to_string())
        }
    }))
    .await;

    let executor = HttpExecutor::new().unwrap();
    let outcome = executor
        .execute(&http_job(
            "flaky",
            &format!("http://{addr}/"),
            Some((2, Duration::from_millis(50))),
        ))
        .await;

    assert!(outcome.error.is_none(), "got error: {:?}", outcome.error);
    assert_eq!(outcome.output, "recovered");
    assert_eq!(outcome.retries_attempted, 2);
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn client_error_is_not_retried() {
    let hits = Arc::new(AtomicUsize::new(0));
    let addr = serve(counting_route(hits.clone(), |_| {
        (StatusCode::NOT_FOUND, "nope".to_string())
    }))
    .await;

    let executor = HttpExecutor::new().unwrap();
    let outcome = executor
        .execute(&http_job(
            "missing",
            &format!("http://{addr}/"),
            Some((3, Duration::from_millis(10))),
        ))
        .await;

    let error = outcome.error.expect("4xx must fail");
    assert!(error.contains("4xx"), "got: {error}");
    assert!(error.contains("non-retriable"), "got: {error}");
    assert_eq!(outcome.output, "nope");
    assert_eq!(
        hits.load(Ordering::SeqCst),
        1,
        "a non-retriable error stops immediately"
    );
}

#[tokio::test]
async fn exhausted_retries_return_last_error() {
    let hits = Arc::new(AtomicUsize::new(0));
    let addr = serve(counting_route(hits.clone(), |_| {
        (StatusCode::INTERNAL_SERVER_ERROR, "still down".to_string())
    }))
    .await;

    let executor = HttpExecutor::new().unwrap();
    let outcome = executor
        .execute(&http_job(
            "down",
            &format!("http://{addr}/"),
            Some((1, Duration::from_millis(10))),
        ))
        .await;

    let error = outcome.error.expect("exhaustion must fail");
    assert!(error.contains("after 1 retries"), "got: {error}");
    assert!(error.contains("5xx"), "got: {error}");
    assert_eq!(outcome.output, "still down");
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn server_error_without_retry_policy_fails_once() {
    let hits = Arc::new(AtomicUsize::new(0));
    let addr = serve(counting_route(hits.clone(), |_| {
        (StatusCode::INTERNAL_SERVER_ERROR, "boom".to_string())
    }))
    .await;

    let executor = HttpExecutor::new().unwrap();
    let outcome = executor
        .execute(&http_job("noretry", &format!("http://{addr}/"), None))
        .await;

    let error = outcome.error.expect("5xx must fail");
    assert!(error.contains("5xx"), "got: {error}");
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn response_body_is_capped_at_1_kib() {
    let hits = Arc::new(AtomicUsize::new(0));
    let addr = serve(counting_route(hits, |_| {
        (StatusCode::OK, "x".repeat(4096))
    }))
    .await;

    let executor = HttpExecutor::new().unwrap();
    let outcome = executor
        .execute(&http_job("big", &format!("http://{addr}/"), None))
        .await;

    assert!(outcome.error.is_none());
    assert_eq!(outcome.output.len(), 1024);
}

#[tokio::test]
async fn connection_refused_is_not_retried() {
    // Nothing listens on port 1. Unlike timeouts, a refused connection is
    // a non-retriable failure even with retries configured.
    let executor = HttpExecutor::new().unwrap();
    let outcome = executor
        .execute(&http_job(
            "unreachable",
            "http://127.0.0.1:1/",
            Some((3, Duration::from_millis(10))),
        ))
        .await;

    let error = outcome.error.expect("connect failure must fail");
    assert!(error.contains("non-retriable error on attempt 1"), "got: {error}");
    assert_eq!(outcome.retries_attempted, 0);
}
