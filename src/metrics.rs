// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! Prometheus metrics for the proxy.

use crate::analytics::AnalyticsEvent;
use crate::limiter::{Admission, RejectReason};
use crate::upstream::ForwardOutcome;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Counters and gauges exported at the metrics endpoint.
#[derive(Clone)]
pub struct ProxyMetrics {
    registry: Registry,
    admissions: IntCounterVec,
    forwards: IntCounterVec,
    events: IntCounterVec,
    bans: IntCounter,
    endpoints: IntGauge,
    queued: IntGauge,
}

impl ProxyMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let admissions = IntCounterVec::new(
            Opts::new("webhook_proxy_admissions_total", "Inbound deliveries by admission result"),
            &["result"],
        )?;
        let forwards = IntCounterVec::new(
            Opts::new("webhook_proxy_forwards_total", "Upstream forwarding calls by outcome"),
            &["outcome"],
        )?;
        let events = IntCounterVec::new(
            Opts::new("webhook_proxy_events_total", "Analytics events by category and action"),
            &["category", "action"],
        )?;
        let bans = IntCounter::new("webhook_proxy_bans_total", "Webhooks banned since start")?;
        let endpoints = IntGauge::new("webhook_proxy_endpoints", "Webhooks currently tracked")?;
        let queued = IntGauge::new("webhook_proxy_queued_deliveries", "Deliveries waiting in queues")?;

        registry.register(Box::new(admissions.clone()))?;
        registry.register(Box::new(forwards.clone()))?;
        registry.register(Box::new(events.clone()))?;
        registry.register(Box::new(bans.clone()))?;
        registry.register(Box::new(endpoints.clone()))?;
        registry.register(Box::new(queued.clone()))?;

        Ok(Self {
            registry,
            admissions,
            forwards,
            events,
            bans,
            endpoints,
            queued,
        })
    }

    pub fn record_admission(&self, admission: Admission) {
        let result = match admission {
            Admission::Forwarded => "forwarded",
            Admission::Queued => "queued",
            Admission::Rejected(RejectReason::Overflow) => "overflow",
            Admission::Rejected(RejectReason::Banned) => "banned",
        };
        self.admissions.with_label_values(&[result]).inc();
    }

    pub fn record_forward(&self, outcome: ForwardOutcome) {
        let label = match outcome {
            ForwardOutcome::Delivered => "delivered",
            ForwardOutcome::ThrottledByUpstream => "throttled",
            ForwardOutcome::Rejected { .. } => "rejected",
            ForwardOutcome::TransportError => "transport_error",
        };
        self.forwards.with_label_values(&[label]).inc();
    }

    pub fn record_event(&self, event: AnalyticsEvent) {
        self.events
            .with_label_values(&[event.category(), event.action()])
            .inc();
        if event == AnalyticsEvent::EndpointBanned {
            self.bans.inc();
        }
    }

    pub fn set_endpoints(&self, count: usize, queued: usize) {
        self.endpoints.set(count as i64);
        self.queued.set(queued as i64);
    }

    /// Render the registry in the Prometheus text format.
    pub fn render(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
