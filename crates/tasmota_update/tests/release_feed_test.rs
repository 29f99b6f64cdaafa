use std::net::SocketAddr;
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::http::HeaderMap;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use tasmota_update::FeedError;
use tasmota_update::ReleaseFeed;
use tasmota_update::ReleaseFeedClient;
use tasmota_update::config::FeedConfig;
use tokio::net::TcpListener;

/// Serve a fake GitHub API on an ephemeral port
async fn spawn_feed() -> SocketAddr {
    let app = Router::new()
        .route("/latest", get(latest))
        .route("/unavailable", get(|| async { StatusCode::SERVICE_UNAVAILABLE }))
        .route("/html", get(|| async { "<html>rate limited</html>" }))
        .route(
            "/no-tag",
            get(|| async { Json(serde_json::json!({ "name": "Tasmota v13.2.0" })) }),
        )
        .route(
            "/empty-tag",
            get(|| async { Json(serde_json::json!({ "tag_name": "v" })) }),
        )
        .route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Json(serde_json::json!({ "tag_name": "v13.2.0" }))
            }),
        );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// GitHub refuses requests without a User-Agent
async fn latest(headers: HeaderMap) -> impl IntoResponse {
    if !headers.contains_key("user-agent") {
        return (StatusCode::FORBIDDEN, Json(serde_json::json!({}))).into_response();
    }
    Json(serde_json::json!({
        "tag_name": "v13.2.0",
        "name": "Tasmota v13.2.0 Quinlan",
        "html_url": "https://github.com/arendst/Tasmota/releases/tag/v13.2.0",
    }))
    .into_response()
}

fn client(addr: SocketAddr, path: &str) -> ReleaseFeedClient {
    let config = FeedConfig {
        url: format!("http://{}{}", addr, path),
        timeout_secs: 1,
        ..FeedConfig::default()
    };
    ReleaseFeedClient::new(&config).unwrap()
}

#[tokio::test]
async fn test_fetch_latest_version() {
    let addr = spawn_feed().await;
    let feed = client(addr, "/latest");

    assert_eq!(feed.try_fetch_latest_version().await.unwrap(), "13.2.0");
    assert_eq!(feed.fetch_latest_version().await.as_deref(), Some("13.2.0"));
}

#[tokio::test]
async fn test_service_unavailable() {
    let addr = spawn_feed().await;
    let feed = client(addr, "/unavailable");

    assert!(matches!(
        feed.try_fetch_latest_version().await,
        Err(FeedError::Status(503))
    ));
    assert_eq!(feed.fetch_latest_version().await, None);
}

#[tokio::test]
async fn test_not_found() {
    let addr = spawn_feed().await;
    let feed = client(addr, "/missing");

    assert!(matches!(
        feed.try_fetch_latest_version().await,
        Err(FeedError::Status(404))
    ));
}

#[tokio::test]
async fn test_non_json_body() {
    let addr = spawn_feed().await;
    let feed = client(addr, "/html");

    assert!(matches!(
        feed.try_fetch_latest_version().await,
        Err(FeedError::Decode(_))
    ));
}

#[tokio::test]
async fn test_missing_tag() {
    let addr = spawn_feed().await;
    let feed = client(addr, "/no-tag");

    assert!(matches!(
        feed.try_fetch_latest_version().await,
        Err(FeedError::Decode(_))
    ));
    assert_eq!(feed.fetch_latest_version().await, None);
}

#[tokio::test]
async fn test_empty_tag() {
    let addr = spawn_feed().await;
    let feed = client(addr, "/empty-tag");

    assert!(matches!(
        feed.try_fetch_latest_version().await,
        Err(FeedError::EmptyTag)
    ));
}

#[tokio::test]
async fn test_timeout() {
    let addr = spawn_feed().await;
    let feed = client(addr, "/slow");

    match feed.try_fetch_latest_version().await {
        Err(FeedError::Request(e)) => assert!(e.is_timeout()),
        other => panic!("expected timeout, got {other:?}"),
    }
}

#[tokio::test]
async fn test_connection_refused() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let feed = client(addr, "/latest");
    assert!(matches!(
        feed.try_fetch_latest_version().await,
        Err(FeedError::Request(_))
    ));
}
