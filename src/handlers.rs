// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! HTTP handlers for the webhook rate proxy.
//!
//! Senders post to `/api/webhooks/{id}/{token}` exactly as they would to
//! the upstream; the proxy answers as soon as the delivery is forwarded
//! or queued.

use crate::config::Config;
use crate::limiter::{Admission, Proxy, ProxyStatus, RejectReason};
use crate::store::{Delivery, WebhookId};
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, RawQuery, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

/// Shared application state.
pub struct AppState {
    pub proxy: Arc<Proxy>,
    pub config: Config,
}

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
}

/// Build the service router.
pub fn router(state: Arc<AppState>) -> Router {
    let mut router = Router::new()
        .route("/", get(status))
        .route("/health", get(health))
        .route("/healthz", get(health))
        .route("/api/webhooks/:id/:token", post(deliver));

    if state.config.metrics.enabled {
        router = router.route(&state.config.metrics.path, get(metrics));
    }

    router
        .layer(DefaultBodyLimit::max(state.config.max_payload_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        service: "webhook-rate-proxy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Accept one webhook delivery.
pub async fn deliver(
    State(state): State<Arc<AppState>>,
    Path((id, token)): Path<(String, String)>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let id = WebhookId::new(id);
    let source_tag = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string);

    debug!(webhook_id = %id, bytes = body.len(), source = ?source_tag, "Incoming delivery");

    let delivery = Delivery::new(token, body)
        .with_query(query)
        .with_source_tag(source_tag);

    match state.proxy.submit(&id, delivery).await {
        Admission::Forwarded | Admission::Queued => StatusCode::OK.into_response(),
        Admission::Rejected(reason) => {
            let (status, code) = match reason {
                RejectReason::Overflow => (StatusCode::TOO_MANY_REQUESTS, "QUEUE_FULL"),
                RejectReason::Banned => (StatusCode::FORBIDDEN, "BANNED"),
            };
            (
                status,
                Json(ErrorResponse {
                    error: reason.to_string(),
                    code,
                }),
            )
                .into_response()
        }
    }
}

/// Status of every known webhook.
pub async fn status(State(state): State<Arc<AppState>>) -> Json<ProxyStatus> {
    state.proxy.resolve_display_names().await;
    Json(state.proxy.status().await)
}

/// Prometheus metrics endpoint.
pub async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    match state.proxy.render_metrics().await {
        Ok(text) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to render metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
