// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! Upstream webhook client.
//!
//! Forwards a delivery to `{base_url}/{id}/{token}` and reports both the
//! outcome and whatever rate-limit signals the response carried. The
//! client keeps no per-endpoint state; writing the signals back is the
//! caller's job.

use crate::config::UpstreamConfig;
use crate::error::UpstreamError;
use crate::store::{unix_now, Delivery, WebhookId};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, CONTENT_TYPE, RETRY_AFTER};
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, instrument};
use url::Url;

/// Window size header.
pub const LIMIT_HEADER: &str = "x-ratelimit-limit";
/// Remaining budget header.
pub const REMAINING_HEADER: &str = "x-ratelimit-remaining";
/// Window reset header, epoch seconds.
pub const RESET_HEADER: &str = "x-ratelimit-reset";

/// Result of one forwarding call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardOutcome {
    /// Upstream accepted the delivery
    Delivered,
    /// Upstream signalled the endpoint is over budget (429)
    ThrottledByUpstream,
    /// Upstream refused the delivery; retrying will not help
    Rejected { status: u16 },
    /// The call never produced a usable response (network, timeout, 5xx)
    TransportError,
}

impl ForwardOutcome {
    /// Classify an upstream status code.
    pub fn from_status(status: StatusCode) -> Self {
        if status.is_success() {
            Self::Delivered
        } else if status == StatusCode::TOO_MANY_REQUESTS {
            Self::ThrottledByUpstream
        } else if status.is_server_error() {
            Self::TransportError
        } else {
            Self::Rejected {
                status: status.as_u16(),
            }
        }
    }

    /// Whether the delivery should go back on the queue.
    pub fn should_requeue(&self) -> bool {
        matches!(self, Self::ThrottledByUpstream | Self::TransportError)
    }
}

/// Rate-limit signals read from an upstream response.
///
/// Each field is independent; a missing or unparseable header is `None`,
/// never zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimitSignals {
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    /// Absolute reset time in epoch seconds
    pub reset_at: Option<i64>,
    /// Seconds to wait, from `retry-after`
    pub retry_after_secs: Option<i64>,
}

impl RateLimitSignals {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        Self {
            limit: header_number(headers, LIMIT_HEADER).map(to_count),
            remaining: header_number(headers, REMAINING_HEADER).map(to_count),
            reset_at: header_number(headers, RESET_HEADER).map(|v| v.ceil() as i64),
            retry_after_secs: header_number(headers, RETRY_AFTER.as_str())
                .map(|v| v.ceil() as i64),
        }
    }
}

fn header_number(headers: &HeaderMap, name: &str) -> Option<f64> {
    headers
        .get(name)?
        .to_str()
        .ok()?
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v >= 0.0)
}

fn to_count(value: f64) -> u32 {
    value.min(u32::MAX as f64) as u32
}

/// Outcome plus signals of one forwarding call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardResponse {
    pub outcome: ForwardOutcome,
    pub signals: RateLimitSignals,
}

impl ForwardResponse {
    pub fn new(outcome: ForwardOutcome, signals: RateLimitSignals) -> Self {
        Self { outcome, signals }
    }

    /// A call that failed before any response arrived.
    pub fn transport_error() -> Self {
        Self::new(ForwardOutcome::TransportError, RateLimitSignals::default())
    }
}

/// Upstream API seam; the HTTP implementation is [`HttpUpstream`].
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Forward one delivery for the given webhook.
    async fn forward(&self, id: &WebhookId, delivery: &Delivery) -> ForwardResponse;

    /// Look up the webhook's display name, if upstream exposes one.
    async fn fetch_name(&self, _id: &WebhookId, _token: &str) -> Option<String> {
        None
    }
}

#[derive(Debug, Deserialize)]
struct WebhookMetadata {
    name: Option<String>,
}

/// Upstream client for Discord-style webhook APIs.
#[derive(Debug, Clone)]
pub struct HttpUpstream {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpUpstream {
    pub fn new(config: &UpstreamConfig) -> Result<Self, UpstreamError> {
        let base_url = Url::parse(&config.base_url).map_err(|source| UpstreamError::InvalidUrl {
            url: config.base_url.clone(),
            source,
        })?;
        if base_url.cannot_be_a_base() {
            return Err(UpstreamError::CannotBeABase(config.base_url.clone()));
        }

        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.as_str())
            .build()?;

        Ok(Self { client, base_url })
    }

    /// URL of one webhook, with id and token escaped as path segments.
    pub fn endpoint_url(&self, id: &WebhookId, token: &str, query: Option<&str>) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(id.as_str()).push(token);
        }
        url.set_query(query);
        url
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    #[instrument(skip(self, id, delivery), fields(webhook_id = %id, bytes = delivery.body.len()))]
    async fn forward(&self, id: &WebhookId, delivery: &Delivery) -> ForwardResponse {
        let url = self.endpoint_url(id, &delivery.token, delivery.query.as_deref());

        let result = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .body(delivery.body.clone())
            .send()
            .await;

        match result {
            Ok(response) => {
                let status = response.status();
                let signals = RateLimitSignals::from_headers(response.headers());
                debug!(status = status.as_u16(), ?signals, "Upstream responded");
                ForwardResponse::new(ForwardOutcome::from_status(status), signals)
            }
            Err(err) => {
                // the URL carries the webhook token
                debug!(error = %err.without_url(), "Upstream request failed");
                ForwardResponse::transport_error()
            }
        }
    }

    async fn fetch_name(&self, id: &WebhookId, token: &str) -> Option<String> {
        let url = self.endpoint_url(id, token, None);
        let response = match self.client.get(url).send().await {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                debug!(webhook_id = %id, status = response.status().as_u16(), "Webhook metadata unavailable");
                return None;
            }
            Err(err) => {
                debug!(webhook_id = %id, error = %err.without_url(), "Webhook metadata request failed");
                return None;
            }
        };

        match response.json::<WebhookMetadata>().await {
            Ok(metadata) => metadata.name,
            Err(err) => {
                debug!(webhook_id = %id, error = %err.without_url(), "Webhook metadata not understood");
                None
            }
        }
    }
}

/// Final notice body in the upstream's message format.
pub fn notice_body(message: &str) -> String {
    serde_json::json!({ "content": message }).to_string()
}

/// Seconds until `reset_at`, for logging.
pub fn secs_until(reset_at: i64) -> i64 {
    (reset_at - unix_now()).max(0)
}
