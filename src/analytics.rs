// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! Analytics collaborator.
//!
//! The proxy reports discrete per-webhook events through [`Analytics`].
//! Implementations must return immediately and never fail the caller.

use crate::metrics::ProxyMetrics;
use crate::store::WebhookId;
use std::fmt;
use std::sync::Arc;
use tracing::info;

/// Event reported to the analytics sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AnalyticsEvent {
    /// Upstream accepted a delivery
    DeliverySucceeded,
    /// A delivery was refused locally (overflow) or by upstream
    DeliveryFailed,
    /// The webhook was banned
    EndpointBanned,
}

impl AnalyticsEvent {
    pub fn category(&self) -> &'static str {
        match self {
            Self::DeliverySucceeded | Self::DeliveryFailed => "request",
            Self::EndpointBanned => "user",
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            Self::DeliverySucceeded => "success",
            Self::DeliveryFailed => "failed",
            Self::EndpointBanned => "banned",
        }
    }
}

impl fmt::Display for AnalyticsEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.category(), self.action())
    }
}

/// Fire-and-forget event sink.
pub trait Analytics: Send + Sync {
    fn track(&self, id: &WebhookId, event: AnalyticsEvent);
}

/// Emits each event as a structured log line.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAnalytics;

impl Analytics for LogAnalytics {
    fn track(&self, id: &WebhookId, event: AnalyticsEvent) {
        info!(
            webhook_id = %id,
            category = event.category(),
            action = event.action(),
            "Analytics event"
        );
    }
}

impl Analytics for ProxyMetrics {
    fn track(&self, _id: &WebhookId, event: AnalyticsEvent) {
        self.record_event(event);
    }
}

/// Sends every event to each of the wrapped sinks.
#[derive(Clone, Default)]
pub struct Fanout {
    sinks: Vec<Arc<dyn Analytics>>,
}

impl Fanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn Analytics>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl Analytics for Fanout {
    fn track(&self, id: &WebhookId, event: AnalyticsEvent) {
        for sink in &self.sinks {
            sink.track(id, event);
        }
    }
}
