// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! Per-endpoint rate-limit state.
//!
//! Each webhook id owns one [`EndpointState`] behind its own async mutex.
//! The store only hands out handles; callers hold the handle's lock for
//! the whole admission, response-handling or drain step so those never
//! interleave for the same endpoint.

use crate::upstream::RateLimitSignals;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// Current wall-clock time in epoch seconds.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Upstream webhook id, the key every piece of state is tracked under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WebhookId(String);

impl WebhookId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WebhookId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WebhookId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// A single inbound delivery, forwarded as-is.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Token the delivery was addressed with
    pub token: String,
    /// Opaque request body
    pub body: Bytes,
    /// Raw query string passed through to upstream (e.g. `wait=true`)
    pub query: Option<String>,
    /// Best-effort provenance, taken from the sender's User-Agent
    pub source_tag: Option<String>,
}

impl Delivery {
    pub fn new(token: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            token: token.into(),
            body: body.into(),
            query: None,
            source_tag: None,
        }
    }

    pub fn with_query(mut self, query: Option<String>) -> Self {
        self.query = query.filter(|q| !q.is_empty());
        self
    }

    pub fn with_source_tag(mut self, source_tag: Option<String>) -> Self {
        self.source_tag = source_tag;
        self
    }
}

/// Rate-limit, queue and error state for one endpoint.
#[derive(Debug)]
pub struct EndpointState {
    id: WebhookId,
    token: String,
    /// Upstream-declared window size; 0 until a response reports it
    pub limit: u32,
    /// Budget left in the current window
    pub remaining: u32,
    /// Epoch seconds at which the window expires; `None` when no window is active
    pub reset_at: Option<i64>,
    /// Deliveries waiting for budget
    pub queue: VecDeque<Delivery>,
    /// Overflow events counted towards a ban
    pub error_count: u32,
    /// Terminal ban flag
    pub banned: bool,
    /// Name reported by upstream webhook metadata
    pub display_name: Option<String>,
    /// Display name lookups attempted so far
    pub name_lookups: u32,
    /// Provenance of the most recent delivery
    pub source_tag: Option<String>,
}

impl EndpointState {
    /// Fresh state with one optimistic probe request of budget.
    pub fn new(id: WebhookId, token: impl Into<String>) -> Self {
        Self {
            id,
            token: token.into(),
            limit: 0,
            remaining: 1,
            reset_at: None,
            queue: VecDeque::new(),
            error_count: 0,
            banned: false,
            display_name: None,
            name_lookups: 0,
            source_tag: None,
        }
    }

    pub fn id(&self) -> &WebhookId {
        &self.id
    }

    /// Token recorded when the endpoint was first seen.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Overwrite budget fields from whatever the response reported.
    ///
    /// Absent signals leave the field untouched. A `retry-after` only opens
    /// a window when no explicit reset time was given.
    pub fn apply_signals(&mut self, signals: &RateLimitSignals, now: i64) {
        if let Some(limit) = signals.limit {
            self.limit = limit;
        }
        if let Some(remaining) = signals.remaining {
            self.remaining = remaining;
        }
        if let Some(reset_at) = signals.reset_at {
            self.reset_at = Some(reset_at);
        } else if let Some(retry_after) = signals.retry_after_secs {
            self.reset_at = Some(now + retry_after);
        }
    }

    /// Open a fallback window if the budget is spent but no reset is pending.
    pub fn ensure_window(&mut self, now: i64, fallback_secs: i64) {
        if self.remaining == 0 && self.reset_at.is_none() {
            self.reset_at = Some(now + fallback_secs.max(1));
        }
    }

    /// Whether the active window has expired at `now`.
    pub fn window_elapsed(&self, now: i64) -> bool {
        matches!(self.reset_at, Some(at) if now >= at)
    }

    /// Whether a drain at `now` has work: the window has expired, or a
    /// backlog is waiting on budget that no window is holding back.
    pub fn needs_drain(&self, now: i64) -> bool {
        if self.banned {
            return false;
        }
        self.window_elapsed(now)
            || (self.reset_at.is_none() && self.remaining > 0 && !self.queue.is_empty())
    }

    /// Start a new window with the full upstream budget.
    ///
    /// Before upstream has declared a limit the endpoint gets its single
    /// probe request back.
    pub fn reset_window(&mut self) {
        self.remaining = if self.limit == 0 { 1 } else { self.limit };
        self.reset_at = None;
    }

    /// Read-only view for the status page.
    pub fn status(&self) -> EndpointStatus {
        EndpointStatus {
            display_name: self.display_name.clone(),
            source_tag: self.source_tag.clone(),
            queue_depth: self.queue.len(),
            error_count: self.error_count,
            limit: self.limit,
            remaining: self.remaining,
            reset_at: self.reset_at,
            banned: self.banned,
        }
    }
}

/// Snapshot of one endpoint, as served by the status query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointStatus {
    pub display_name: Option<String>,
    pub source_tag: Option<String>,
    pub queue_depth: usize,
    pub error_count: u32,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: Option<i64>,
    pub banned: bool,
}

/// Shared handle to one endpoint's state.
pub type EndpointHandle = Arc<Mutex<EndpointState>>;

/// Keyed store of endpoint states, owned by a [`crate::Proxy`].
#[derive(Debug, Default)]
pub struct EndpointStore {
    endpoints: RwLock<HashMap<WebhookId, EndpointHandle>>,
}

impl EndpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the endpoint's handle, creating fresh state on first sight.
    ///
    /// The token of an existing entry is never replaced.
    pub async fn get_or_create(&self, id: &WebhookId, token: &str) -> EndpointHandle {
        if let Some(handle) = self.endpoints.read().await.get(id) {
            return Arc::clone(handle);
        }

        let mut endpoints = self.endpoints.write().await;
        let handle = endpoints
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(EndpointState::new(id.clone(), token))));
        Arc::clone(handle)
    }

    pub async fn get(&self, id: &WebhookId) -> Option<EndpointHandle> {
        self.endpoints.read().await.get(id).cloned()
    }

    /// Handles for every known endpoint.
    pub async fn handles(&self) -> Vec<EndpointHandle> {
        self.endpoints.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.endpoints.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.endpoints.read().await.is_empty()
    }
}
