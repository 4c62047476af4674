// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! Ring buffer of recent deliveries for the status page.

use crate::store::{Delivery, WebhookId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestHistoryEntry {
    pub at: DateTime<Utc>,
    pub webhook_id: WebhookId,
    pub source_tag: Option<String>,
    pub payload_bytes: usize,
}

/// Fixed-capacity history; the oldest entry is evicted first.
#[derive(Debug)]
pub struct RequestHistory {
    capacity: usize,
    entries: Mutex<VecDeque<RequestHistoryEntry>>,
}

impl RequestHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub async fn record(&self, id: &WebhookId, delivery: &Delivery) {
        if self.capacity == 0 {
            return;
        }
        let mut entries = self.entries.lock().await;
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(RequestHistoryEntry {
            at: Utc::now(),
            webhook_id: id.clone(),
            source_tag: delivery.source_tag.clone(),
            payload_bytes: delivery.body.len(),
        });
    }

    /// Entries oldest first.
    pub async fn recent(&self) -> Vec<RequestHistoryEntry> {
        self.entries.lock().await.iter().cloned().collect()
    }
}
