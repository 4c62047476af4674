// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! HTTP surface tests: the reqwest upstream client against a local mock
//! upstream, and the proxy router end to end.

mod harness;

use axum::{
    body::{to_bytes, Body, Bytes},
    extract::{Path, RawQuery, State},
    http::{header, HeaderMap, Request, StatusCode},
    routing::post,
    Json, Router,
};
use harness::{set_budget, ScriptedUpstream};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tower::ServiceExt;
use std::time::Duration;
use webhook_rate_proxy::{
    ban::BanRegistry,
    config::{Config, ProxyConfig, UpstreamConfig},
    handlers::{router, AppState},
    limiter::{Admission, Proxy},
    metrics::ProxyMetrics,
    store::{unix_now, Delivery, WebhookId},
    upstream::{ForwardOutcome, HttpUpstream, Upstream},
};

#[derive(Debug, Clone)]
struct Received {
    id: String,
    token: String,
    query: Option<String>,
    content_type: Option<String>,
    body: Bytes,
}

type Log = Arc<Mutex<Vec<Received>>>;

async fn mock_post(
    State(log): State<Log>,
    Path((id, token)): Path<(String, String)>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, HeaderMap) {
    log.lock().await.push(Received {
        id: id.clone(),
        token,
        query,
        content_type: headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        body,
    });

    let mut out = HeaderMap::new();
    match id.as_str() {
        "throttled" => {
            out.insert("retry-after", "2".parse().unwrap());
            out.insert("x-ratelimit-remaining", "0".parse().unwrap());
            (StatusCode::TOO_MANY_REQUESTS, out)
        }
        "gone" => (StatusCode::NOT_FOUND, out),
        _ => {
            out.insert("x-ratelimit-limit", "5".parse().unwrap());
            out.insert("x-ratelimit-remaining", "4".parse().unwrap());
            out.insert("x-ratelimit-reset", "1700000000.25".parse().unwrap());
            (StatusCode::NO_CONTENT, out)
        }
    }
}

async fn mock_get(Path((id, _token)): Path<(String, String)>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "id": id, "name": "Captain Hook" }))
}

async fn spawn_mock_upstream() -> (SocketAddr, Log) {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let app = Router::new()
        .route("/hooks/:id/:token", post(mock_post).get(mock_get))
        .with_state(log.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, log)
}

fn http_upstream(addr: SocketAddr) -> HttpUpstream {
    HttpUpstream::new(&UpstreamConfig {
        base_url: format!("http://{addr}/hooks"),
        ..Default::default()
    })
    .unwrap()
}

#[tokio::test]
async fn test_http_upstream_forwards_and_reads_signals() {
    let (addr, log) = spawn_mock_upstream().await;
    let upstream = http_upstream(addr);

    let delivery = Delivery::new("secret", r#"{"content":"hi"}"#)
        .with_query(Some("wait=true".to_string()));
    let response = upstream.forward(&WebhookId::from("123"), &delivery).await;

    assert_eq!(response.outcome, ForwardOutcome::Delivered);
    assert_eq!(response.signals.limit, Some(5));
    assert_eq!(response.signals.remaining, Some(4));
    assert_eq!(response.signals.reset_at, Some(1_700_000_001));

    let received = log.lock().await;
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].id, "123");
    assert_eq!(received[0].token, "secret");
    assert_eq!(received[0].query.as_deref(), Some("wait=true"));
    assert_eq!(received[0].content_type.as_deref(), Some("application/json"));
    assert_eq!(&received[0].body[..], br#"{"content":"hi"}"#);
}

#[tokio::test]
async fn test_http_upstream_classifies_failures() {
    let (addr, _log) = spawn_mock_upstream().await;
    let upstream = http_upstream(addr);

    let throttled = upstream
        .forward(&WebhookId::from("throttled"), &Delivery::new("t", "{}"))
        .await;
    assert_eq!(throttled.outcome, ForwardOutcome::ThrottledByUpstream);
    assert_eq!(throttled.signals.remaining, Some(0));
    assert_eq!(throttled.signals.retry_after_secs, Some(2));

    let gone = upstream
        .forward(&WebhookId::from("gone"), &Delivery::new("t", "{}"))
        .await;
    assert_eq!(gone.outcome, ForwardOutcome::Rejected { status: 404 });
}

#[tokio::test]
async fn test_http_upstream_unreachable_is_transport_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let response = http_upstream(addr)
        .forward(&WebhookId::from("1"), &Delivery::new("t", "{}"))
        .await;
    assert_eq!(response.outcome, ForwardOutcome::TransportError);
    assert_eq!(response.signals, Default::default());
}

#[tokio::test]
async fn test_http_upstream_fetches_display_name() {
    let (addr, _log) = spawn_mock_upstream().await;
    let name = http_upstream(addr)
        .fetch_name(&WebhookId::from("1"), "t")
        .await;
    assert_eq!(name.as_deref(), Some("Captain Hook"));
}

#[tokio::test]
async fn test_forward_timeout_bounds_a_hanging_upstream() {
    // accepts connections and never answers
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });

    let config = ProxyConfig {
        forward_timeout_ms: 200,
        ..Default::default()
    };
    let proxy = Proxy::new(
        config,
        Arc::new(http_upstream(addr)),
        BanRegistry::in_memory(),
        Arc::new(ProxyMetrics::new().unwrap()),
    );
    let id = WebhookId::from("1");

    let admission = tokio::time::timeout(
        Duration::from_secs(5),
        proxy.submit(&id, Delivery::new("t", "{}")),
    )
    .await
    .unwrap();
    assert_eq!(admission, Admission::Queued);
    assert_eq!(proxy.status().await.endpoints[&id].queue_depth, 1);
}

fn app(config: Config, upstream: Arc<ScriptedUpstream>) -> (Router, Arc<Proxy>) {
    let proxy = Arc::new(Proxy::new(
        config.proxy.clone(),
        upstream,
        BanRegistry::in_memory(),
        Arc::new(ProxyMetrics::new().unwrap()),
    ));
    let state = Arc::new(AppState {
        proxy: proxy.clone(),
        config,
    });
    (router(state), proxy)
}

fn post_delivery(path: &str, body: &'static str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header(header::USER_AGENT, "test-sender/1.0")
        .body(Body::from(body))
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_router_delivery_statuses() {
    let upstream = ScriptedUpstream::delivering();
    let config = Config {
        proxy: ProxyConfig {
            max_queue_size: 1,
            ban_threshold: 2,
            ..Default::default()
        },
        ..Default::default()
    };
    let (app, _proxy) = app(config, upstream.clone());

    // forwarded, queued, overflow, overflow + ban, banned
    let expected = [
        StatusCode::OK,
        StatusCode::OK,
        StatusCode::TOO_MANY_REQUESTS,
        StatusCode::TOO_MANY_REQUESTS,
        StatusCode::FORBIDDEN,
    ];
    for status in expected {
        let response = app
            .clone()
            .oneshot(post_delivery("/api/webhooks/9/tok?wait=true", "{}"))
            .await
            .unwrap();
        assert_eq!(response.status(), status);
    }

    let calls = upstream.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].token, "tok");
}

#[tokio::test]
async fn test_router_error_body() {
    let upstream = ScriptedUpstream::delivering();
    let config = Config {
        proxy: ProxyConfig {
            max_queue_size: 0,
            ..Default::default()
        },
        ..Default::default()
    };
    let (app, proxy) = app(config, upstream);
    set_budget(&proxy, &WebhookId::from("9"), 5, 0, Some(unix_now() + 60)).await;

    let response = app
        .oneshot(post_delivery("/api/webhooks/9/tok", "{}"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let body = json_body(response).await;
    assert_eq!(body["code"], "QUEUE_FULL");
}

#[tokio::test]
async fn test_router_status_page() {
    let upstream = ScriptedUpstream::delivering();
    let (app, _proxy) = app(Config::default(), upstream);

    for _ in 0..2 {
        app.clone()
            .oneshot(post_delivery("/api/webhooks/77/tok", "{}"))
            .await
            .unwrap();
    }

    let response = app
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    let endpoint = &body["endpoints"]["77"];
    assert_eq!(endpoint["display_name"], "hook-77");
    assert_eq!(endpoint["source_tag"], "test-sender/1.0");
    assert_eq!(endpoint["queue_depth"], 1);
    assert_eq!(endpoint["banned"], false);
    assert_eq!(body["recent"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_router_health_and_metrics() {
    let (app, _proxy) = app(Config::default(), ScriptedUpstream::delivering());

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["status"], "healthy");

    app.clone()
        .oneshot(post_delivery("/api/webhooks/1/tok", "{}"))
        .await
        .unwrap();

    let response = app
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains(r#"webhook_proxy_admissions_total{result="forwarded"} 1"#));
    assert!(text.contains("webhook_proxy_endpoints 1"));
}

#[tokio::test]
async fn test_router_rejects_oversized_payload() {
    let config = Config {
        max_payload_bytes: 8,
        ..Default::default()
    };
    let upstream = ScriptedUpstream::delivering();
    let (app, _proxy) = app(config, upstream.clone());

    let response = app
        .oneshot(post_delivery("/api/webhooks/1/tok", "this body is too long"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(upstream.call_count(), 0);
}
