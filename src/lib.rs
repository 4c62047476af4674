// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! Webhook Rate Proxy
//!
//! This crate accepts webhook deliveries on behalf of many downstream
//! endpoints and forwards them to a single rate-limited upstream API:
//!
//! - Per-endpoint budgets learned from upstream `x-ratelimit-*` headers
//! - Bounded per-endpoint queues instead of dropping throttled deliveries
//! - Periodic drain of backlogs once a rate-limit window expires
//! - Overflow accounting with a permanent ban for abusive senders
//! - Persisted ban list, request history and Prometheus metrics

pub mod analytics;
pub mod ban;
pub mod config;
pub mod drain;
pub mod error;
pub mod handlers;
pub mod history;
pub mod limiter;
pub mod metrics;
pub mod store;
pub mod upstream;

pub use ban::{BanRegistry, BanStore, JsonFileBanStore, MemoryBanStore};
pub use config::Config;
pub use drain::DrainScheduler;
pub use limiter::{Admission, Proxy, RejectReason};
pub use store::{Delivery, EndpointState, EndpointStore, WebhookId};
pub use upstream::{ForwardOutcome, ForwardResponse, HttpUpstream, RateLimitSignals, Upstream};
