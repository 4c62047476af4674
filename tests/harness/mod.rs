// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! Shared test harness: a scripted in-memory upstream and proxy builders.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use webhook_rate_proxy::{
    ban::{BanRegistry, BanStore, MemoryBanStore},
    config::ProxyConfig,
    limiter::Proxy,
    metrics::ProxyMetrics,
    store::{Delivery, WebhookId},
    upstream::{ForwardOutcome, ForwardResponse, RateLimitSignals, Upstream},
};

/// One forwarding call seen by the upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub id: WebhookId,
    pub token: String,
    pub body: String,
}

/// Upstream that replays scripted responses, then a fallback.
pub struct ScriptedUpstream {
    script: Mutex<VecDeque<ForwardResponse>>,
    fallback: ForwardResponse,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedUpstream {
    pub fn with_fallback(fallback: ForwardResponse) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Accepts everything and reports no rate-limit headers.
    pub fn delivering() -> Arc<Self> {
        Self::with_fallback(ForwardResponse::new(
            ForwardOutcome::Delivered,
            RateLimitSignals::default(),
        ))
    }

    pub fn push(&self, response: ForwardResponse) {
        self.script.lock().unwrap().push_back(response);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn bodies(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.body).collect()
    }
}

#[async_trait]
impl Upstream for ScriptedUpstream {
    async fn forward(&self, id: &WebhookId, delivery: &Delivery) -> ForwardResponse {
        self.calls.lock().unwrap().push(Call {
            id: id.clone(),
            token: delivery.token.clone(),
            body: String::from_utf8_lossy(&delivery.body).into_owned(),
        });
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.fallback)
    }

    async fn fetch_name(&self, id: &WebhookId, _token: &str) -> Option<String> {
        Some(format!("hook-{id}"))
    }
}

/// Upstream that accepts everything, holding calls for some webhooks first.
pub struct DelayedUpstream {
    delays: HashMap<WebhookId, Duration>,
    started: Mutex<Vec<WebhookId>>,
    finished: Mutex<Vec<WebhookId>>,
}

impl DelayedUpstream {
    pub fn new(delays: &[(&str, Duration)]) -> Arc<Self> {
        Arc::new(Self {
            delays: delays
                .iter()
                .map(|(id, delay)| (WebhookId::from(*id), *delay))
                .collect(),
            started: Mutex::new(Vec::new()),
            finished: Mutex::new(Vec::new()),
        })
    }

    /// Calls for `id` that have reached upstream.
    pub fn started(&self, id: &WebhookId) -> usize {
        self.started.lock().unwrap().iter().filter(|seen| *seen == id).count()
    }

    /// Calls for `id` that upstream has answered.
    pub fn finished(&self, id: &WebhookId) -> usize {
        self.finished.lock().unwrap().iter().filter(|seen| *seen == id).count()
    }
}

#[async_trait]
impl Upstream for DelayedUpstream {
    async fn forward(&self, id: &WebhookId, _delivery: &Delivery) -> ForwardResponse {
        self.started.lock().unwrap().push(id.clone());
        if let Some(delay) = self.delays.get(id) {
            tokio::time::sleep(*delay).await;
        }
        self.finished.lock().unwrap().push(id.clone());
        delivered()
    }
}

pub fn throttled(reset_at: i64) -> ForwardResponse {
    ForwardResponse::new(
        ForwardOutcome::ThrottledByUpstream,
        RateLimitSignals {
            remaining: Some(0),
            reset_at: Some(reset_at),
            ..Default::default()
        },
    )
}

pub fn delivered() -> ForwardResponse {
    ForwardResponse::new(ForwardOutcome::Delivered, RateLimitSignals::default())
}

pub fn delivery(body: &str) -> Delivery {
    Delivery::new("token", body.to_string())
}

pub fn proxy(config: ProxyConfig, upstream: Arc<dyn Upstream>) -> Arc<Proxy> {
    Arc::new(Proxy::new(
        config,
        upstream,
        BanRegistry::in_memory(),
        Arc::new(ProxyMetrics::new().unwrap()),
    ))
}

pub async fn proxy_with_store(
    config: ProxyConfig,
    upstream: Arc<dyn Upstream>,
    store: Arc<MemoryBanStore>,
) -> Arc<Proxy> {
    let store: Arc<dyn BanStore> = store;
    let bans = BanRegistry::load(store).await.unwrap();
    Arc::new(Proxy::new(
        config,
        upstream,
        bans,
        Arc::new(ProxyMetrics::new().unwrap()),
    ))
}

/// Put an endpoint into a known budget state.
pub async fn set_budget(proxy: &Proxy, id: &WebhookId, limit: u32, remaining: u32, reset_at: Option<i64>) {
    let handle = proxy.store().get_or_create(id, "token").await;
    let mut state = handle.lock().await;
    state.limit = limit;
    state.remaining = remaining;
    state.reset_at = reset_at;
}
