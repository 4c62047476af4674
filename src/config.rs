// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! Configuration for the webhook rate proxy.
//!
//! Every option has a default; `main` overlays environment variables on
//! top of [`Config::default`].

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Configuration for the webhook rate proxy service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server bind address (default: 0.0.0.0:8080)
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Largest accepted delivery body in bytes (default: 8 MiB)
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,

    /// Admission, queueing and ban policy
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Upstream API configuration
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Ban list persistence
    #[serde(default)]
    pub bans: BanConfig,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Order in which a backlog is drained once budget returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DrainOrder {
    /// Oldest queued delivery first; preserves arrival order downstream.
    #[default]
    Fifo,
    /// Newest queued delivery first.
    Lifo,
}

impl FromStr for DrainOrder {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fifo" => Ok(Self::Fifo),
            "lifo" => Ok(Self::Lifo),
            other => Err(ConfigError::UnknownDrainOrder(other.to_string())),
        }
    }
}

/// Per-endpoint admission policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Maximum queued deliveries per endpoint (default: 100)
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// Overflow errors before an endpoint is banned; 0 disables banning (default: 50)
    #[serde(default = "default_ban_threshold")]
    pub ban_threshold: u32,

    /// Drain tick interval in milliseconds (default: 1000)
    #[serde(default = "default_drain_interval_ms")]
    pub drain_interval_ms: u64,

    /// Backlog drain order (default: fifo)
    #[serde(default)]
    pub drain_order: DrainOrder,

    /// Clear the overflow error count once a drain empties the queue (default: false)
    #[serde(default)]
    pub reset_errors_on_drain: bool,

    /// Upper bound on any single upstream call in milliseconds (default: 10000)
    #[serde(default = "default_forward_timeout_ms")]
    pub forward_timeout_ms: u64,

    /// Window opened when upstream leaves the budget empty without a reset time (default: 1)
    #[serde(default = "default_fallback_window_secs")]
    pub fallback_window_secs: i64,

    /// Number of recent deliveries kept for the status page (default: 100)
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    /// Message sent to an endpoint once when it is banned
    #[serde(default = "default_ban_notice")]
    pub ban_notice: String,
}

/// Upstream webhook API configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL; `/{id}/{token}` is appended (default: https://discord.com/api/webhooks)
    #[serde(default = "default_upstream_url")]
    pub base_url: String,

    /// User-Agent sent upstream
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

/// Ban list persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanConfig {
    /// JSON file holding banned ids; `None` keeps bans in memory only (default: bans.json)
    #[serde(default = "default_ban_path")]
    pub path: Option<PathBuf>,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable Prometheus metrics endpoint (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics endpoint path (default: /metrics)
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

// Default value functions
fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_max_payload_bytes() -> usize {
    8 * 1024 * 1024
}

fn default_max_queue_size() -> usize {
    100
}

fn default_ban_threshold() -> u32 {
    50
}

fn default_drain_interval_ms() -> u64 {
    1000
}

fn default_forward_timeout_ms() -> u64 {
    10_000
}

fn default_fallback_window_secs() -> i64 {
    1
}

fn default_history_capacity() -> usize {
    100
}

fn default_ban_notice() -> String {
    "This webhook has been banned from the proxy after repeatedly overflowing its queue. \
     Further deliveries will be rejected."
        .to_string()
}

fn default_upstream_url() -> String {
    "https://discord.com/api/webhooks".to_string()
}

fn default_user_agent() -> String {
    format!("webhook-rate-proxy/{}", env!("CARGO_PKG_VERSION"))
}

fn default_ban_path() -> Option<PathBuf> {
    Some(PathBuf::from("bans.json"))
}

fn default_true() -> bool {
    true
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            max_payload_bytes: default_max_payload_bytes(),
            proxy: ProxyConfig::default(),
            upstream: UpstreamConfig::default(),
            bans: BanConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            max_queue_size: default_max_queue_size(),
            ban_threshold: default_ban_threshold(),
            drain_interval_ms: default_drain_interval_ms(),
            drain_order: DrainOrder::default(),
            reset_errors_on_drain: false,
            forward_timeout_ms: default_forward_timeout_ms(),
            fallback_window_secs: default_fallback_window_secs(),
            history_capacity: default_history_capacity(),
            ban_notice: default_ban_notice(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_upstream_url(),
            user_agent: default_user_agent(),
        }
    }
}

impl Default for BanConfig {
    fn default() -> Self {
        Self {
            path: default_ban_path(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            path: default_metrics_path(),
        }
    }
}

impl ProxyConfig {
    /// Get the drain tick interval, never shorter than one millisecond
    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms.max(1))
    }

    /// Get the forwarding call timeout
    pub fn forward_timeout(&self) -> Duration {
        Duration::from_millis(self.forward_timeout_ms)
    }

    /// Whether the overflow count has reached the ban threshold.
    pub fn should_ban(&self, error_count: u32) -> bool {
        self.ban_threshold > 0 && error_count >= self.ban_threshold
    }
}
