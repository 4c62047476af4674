// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! Admission control for inbound webhook deliveries.
//!
//! Every delivery is either forwarded immediately (budget available),
//! queued (budget spent, queue below capacity) or rejected (queue full or
//! webhook banned). Budgets come from the upstream's `x-ratelimit-*`
//! headers; a new webhook starts with a single optimistic probe request.
//!
//! All work on one webhook happens while holding that webhook's lock,
//! including the upstream call itself, so a budget decrement and the
//! response overwrite that follows can never interleave with a drain or a
//! second admission for the same webhook.

use crate::analytics::{Analytics, AnalyticsEvent, LogAnalytics};
use crate::ban::BanRegistry;
use crate::config::ProxyConfig;
use crate::history::{RequestHistory, RequestHistoryEntry};
use crate::metrics::ProxyMetrics;
use crate::store::{unix_now, Delivery, EndpointState, EndpointStatus, EndpointStore, WebhookId};
use crate::upstream::{notice_body, secs_until, ForwardOutcome, ForwardResponse, Upstream};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Display name lookups attempted per webhook before giving up.
const MAX_NAME_LOOKUPS: u32 = 3;

/// Result of submitting a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Sent to upstream now
    Forwarded,
    /// Held until the webhook's budget returns
    Queued,
    /// Refused; the sender should back off
    Rejected(RejectReason),
}

/// Reason a delivery was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The webhook's queue is full
    Overflow,
    /// The webhook is permanently banned
    Banned,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Overflow => write!(f, "Too many queued deliveries for this webhook"),
            Self::Banned => write!(f, "Webhook is banned"),
        }
    }
}

/// Status page snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ProxyStatus {
    pub endpoints: BTreeMap<WebhookId, EndpointStatus>,
    pub banned: Vec<WebhookId>,
    pub recent: Vec<RequestHistoryEntry>,
}

/// The queueing proxy: endpoint store, ban registry and upstream client.
pub struct Proxy {
    pub(crate) config: ProxyConfig,
    pub(crate) store: EndpointStore,
    bans: BanRegistry,
    upstream: Arc<dyn Upstream>,
    analytics: Arc<dyn Analytics>,
    metrics: Arc<ProxyMetrics>,
    history: RequestHistory,
}

impl Proxy {
    pub fn new(
        config: ProxyConfig,
        upstream: Arc<dyn Upstream>,
        bans: BanRegistry,
        metrics: Arc<ProxyMetrics>,
    ) -> Self {
        let history = RequestHistory::new(config.history_capacity);
        Self {
            config,
            store: EndpointStore::new(),
            bans,
            upstream,
            analytics: Arc::new(LogAnalytics),
            metrics,
            history,
        }
    }

    /// Replace the analytics sink.
    pub fn with_analytics(mut self, analytics: Arc<dyn Analytics>) -> Self {
        self.analytics = analytics;
        self
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn store(&self) -> &EndpointStore {
        &self.store
    }

    pub fn bans(&self) -> &BanRegistry {
        &self.bans
    }

    pub fn metrics(&self) -> &ProxyMetrics {
        &self.metrics
    }

    /// Admit one delivery for a webhook.
    pub async fn submit(&self, id: &WebhookId, delivery: Delivery) -> Admission {
        let admission = self.admit(id, delivery).await;
        self.metrics.record_admission(admission);
        admission
    }

    async fn admit(&self, id: &WebhookId, delivery: Delivery) -> Admission {
        if self.bans.contains(id).await {
            debug!(webhook_id = %id, "Rejecting delivery for banned webhook");
            return Admission::Rejected(RejectReason::Banned);
        }

        self.history.record(id, &delivery).await;

        let handle = self.store.get_or_create(id, &delivery.token).await;
        let mut state = handle.lock().await;
        if state.banned {
            return Admission::Rejected(RejectReason::Banned);
        }
        if delivery.source_tag.is_some() {
            state.source_tag.clone_from(&delivery.source_tag);
        }

        let admission = if state.remaining > 0 {
            match self.forward_locked(&mut state, delivery, unix_now()).await {
                outcome if outcome.should_requeue() => Admission::Queued,
                _ => Admission::Forwarded,
            }
        } else if state.queue.len() >= self.config.max_queue_size {
            state.error_count = state.error_count.saturating_add(1);
            warn!(
                webhook_id = %id,
                queue_depth = state.queue.len(),
                error_count = state.error_count,
                "Queue full, rejecting delivery"
            );
            self.analytics.track(id, AnalyticsEvent::DeliveryFailed);
            Admission::Rejected(RejectReason::Overflow)
        } else {
            state.queue.push_back(delivery);
            debug!(
                webhook_id = %id,
                queue_depth = state.queue.len(),
                reset_at = ?state.reset_at,
                "Budget spent, delivery queued"
            );
            Admission::Queued
        };

        if !state.banned && self.config.should_ban(state.error_count) {
            self.ban_locked(&mut state).await;
        }

        admission
    }

    /// Spend one unit of budget on `delivery` and record the response.
    ///
    /// The caller holds the webhook's lock and has checked
    /// `remaining > 0`. Throttled and failed calls put the delivery back
    /// at the tail of the queue; hard rejections drop it.
    pub(crate) async fn forward_locked(
        &self,
        state: &mut EndpointState,
        delivery: Delivery,
        now: i64,
    ) -> ForwardOutcome {
        state.remaining = state.remaining.saturating_sub(1);

        let response = match timeout(
            self.config.forward_timeout(),
            self.upstream.forward(state.id(), &delivery),
        )
        .await
        {
            Ok(response) => response,
            Err(_) => {
                warn!(webhook_id = %state.id(), "Upstream call timed out");
                ForwardResponse::transport_error()
            }
        };

        state.apply_signals(&response.signals, now);
        self.metrics.record_forward(response.outcome);

        match response.outcome {
            ForwardOutcome::Delivered => {
                debug!(webhook_id = %state.id(), remaining = state.remaining, "Delivered");
                self.analytics.track(state.id(), AnalyticsEvent::DeliverySucceeded);
            }
            ForwardOutcome::ThrottledByUpstream => {
                if response.signals.remaining.is_none() {
                    state.remaining = 0;
                }
                warn!(
                    webhook_id = %state.id(),
                    retry_in_secs = state.reset_at.map(secs_until),
                    "Upstream throttled delivery, requeueing"
                );
                state.queue.push_back(delivery);
            }
            ForwardOutcome::TransportError => {
                // upstream never counted this call
                if response.signals.remaining.is_none() {
                    state.remaining = state.remaining.saturating_add(1);
                }
                warn!(webhook_id = %state.id(), "Upstream unreachable, requeueing");
                state.queue.push_back(delivery);
            }
            ForwardOutcome::Rejected { status } => {
                warn!(webhook_id = %state.id(), status, "Upstream rejected delivery, dropping");
                self.analytics.track(state.id(), AnalyticsEvent::DeliveryFailed);
            }
        }

        state.ensure_window(now, self.config.fallback_window_secs);
        response.outcome
    }

    /// Ban the webhook whose lock the caller holds.
    ///
    /// Drops the queue, sends one final notice outside the budget and
    /// records the ban in the registry.
    async fn ban_locked(&self, state: &mut EndpointState) {
        state.banned = true;
        let dropped = state.queue.len();
        state.queue.clear();
        warn!(
            webhook_id = %state.id(),
            error_count = state.error_count,
            dropped,
            "Banning webhook"
        );

        let notice = Delivery::new(state.token(), notice_body(&self.config.ban_notice));
        match timeout(
            self.config.forward_timeout(),
            self.upstream.forward(state.id(), &notice),
        )
        .await
        {
            Ok(response) => {
                debug!(webhook_id = %state.id(), outcome = ?response.outcome, "Ban notice sent")
            }
            Err(_) => warn!(webhook_id = %state.id(), "Ban notice timed out"),
        }

        self.analytics.track(state.id(), AnalyticsEvent::EndpointBanned);
        self.bans.insert(state.id()).await;
    }

    /// Fetch display names for webhooks that do not have one yet.
    pub async fn resolve_display_names(&self) {
        let mut pending = Vec::new();
        for handle in self.store.handles().await {
            let mut state = handle.lock().await;
            if state.display_name.is_none()
                && state.name_lookups < MAX_NAME_LOOKUPS
                && !state.banned
            {
                state.name_lookups += 1;
                pending.push((handle.clone(), state.id().clone(), state.token().to_string()));
            }
        }
        if pending.is_empty() {
            return;
        }

        let mut lookups = JoinSet::new();
        for (handle, id, token) in pending {
            let upstream = Arc::clone(&self.upstream);
            let limit = self.config.forward_timeout();
            lookups.spawn(async move {
                let name = timeout(limit, upstream.fetch_name(&id, &token))
                    .await
                    .ok()
                    .flatten();
                if let Some(name) = name {
                    debug!(webhook_id = %id, %name, "Resolved webhook name");
                    handle.lock().await.display_name = Some(name);
                }
            });
        }
        while lookups.join_next().await.is_some() {}
    }

    /// Read-only snapshot of every known webhook.
    pub async fn status(&self) -> ProxyStatus {
        let mut endpoints = BTreeMap::new();
        for handle in self.store.handles().await {
            let state = handle.lock().await;
            endpoints.insert(state.id().clone(), state.status());
        }

        ProxyStatus {
            endpoints,
            banned: self.bans.list().await,
            recent: self.history.recent().await,
        }
    }

    /// Prometheus text exposition, with gauges refreshed.
    pub async fn render_metrics(&self) -> prometheus::Result<String> {
        let handles = self.store.handles().await;
        let mut queued = 0;
        for handle in &handles {
            queued += handle.lock().await.queue.len();
        }
        self.metrics.set_endpoints(handles.len(), queued);
        self.metrics.render()
    }

    /// Log the loaded configuration.
    pub fn log_startup(&self) {
        info!(
            max_queue_size = self.config.max_queue_size,
            ban_threshold = self.config.ban_threshold,
            drain_order = ?self.config.drain_order,
            "Proxy ready"
        );
    }
}
