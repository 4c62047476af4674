// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! Periodic backlog drain.
//!
//! On every tick each webhook whose rate-limit window has expired gets its
//! full budget back, and its queue is pushed through the same forwarding
//! path live deliveries use until the budget or the queue runs out.
//! Webhooks with budget but no active window (a transport failure left
//! the delivery queued) are re-driven on the next tick as well.
//!
//! Every webhook drains in its own task. A tick never waits for earlier
//! drains; a webhook whose lock is held (drain or admission in flight) is
//! skipped until a later tick.

use crate::config::DrainOrder;
use crate::limiter::Proxy;
use crate::store::{unix_now, EndpointState};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Totals for one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainSummary {
    /// Webhooks whose window was reset or backlog re-driven
    pub endpoints: usize,
    /// Deliveries taken off a queue and sent
    pub sent: usize,
}

impl Proxy {
    /// Start a drain task in `tasks` for every idle webhook that is due at
    /// `now`, returning how many were started.
    pub async fn spawn_drains(self: &Arc<Self>, now: i64, tasks: &mut JoinSet<usize>) -> usize {
        let mut started = 0;
        for handle in self.store.handles().await {
            let Ok(mut state) = handle.try_lock_owned() else {
                continue;
            };
            if !state.needs_drain(now) {
                continue;
            }

            let proxy = Arc::clone(self);
            tasks.spawn(async move { proxy.drain_endpoint(&mut state, now).await });
            started += 1;
        }
        started
    }

    /// Run one drain pass at `now` (epoch seconds) and wait for it.
    pub async fn drain_due(self: &Arc<Self>, now: i64) -> DrainSummary {
        let mut tasks = JoinSet::new();
        let mut summary = DrainSummary {
            endpoints: self.spawn_drains(now, &mut tasks).await,
            sent: 0,
        };

        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(sent) => summary.sent += sent,
                Err(e) => warn!(error = %e, "Drain task failed"),
            }
        }
        summary
    }

    /// Drain one webhook the caller has checked is due.
    async fn drain_endpoint(&self, state: &mut EndpointState, now: i64) -> usize {
        if state.window_elapsed(now) {
            state.reset_window();
            debug!(
                webhook_id = %state.id(),
                remaining = state.remaining,
                queue_depth = state.queue.len(),
                "Rate-limit window reset"
            );
        }

        // requeued deliveries land at the tail; never send more than were waiting
        let mut attempts = state.queue.len();
        let mut sent = 0;
        while state.remaining > 0 && attempts > 0 {
            let next = match self.config.drain_order {
                DrainOrder::Fifo => state.queue.pop_front(),
                DrainOrder::Lifo => state.queue.pop_back(),
            };
            let Some(delivery) = next else { break };
            attempts -= 1;
            sent += 1;

            // upstream is throttling or unreachable; wait for a later tick
            if self.forward_locked(state, delivery, now).await.should_requeue() {
                break;
            }
        }

        if sent > 0 {
            debug!(
                webhook_id = %state.id(),
                sent,
                queue_depth = state.queue.len(),
                remaining = state.remaining,
                "Drained backlog"
            );
        }
        if state.queue.is_empty() && self.config.reset_errors_on_drain {
            state.error_count = 0;
        }
        sent
    }
}

/// Starts per-webhook drains on a fixed interval.
pub struct DrainScheduler {
    proxy: Arc<Proxy>,
    interval: Duration,
}

impl DrainScheduler {
    pub fn new(proxy: Arc<Proxy>) -> Self {
        let interval = proxy.config().drain_interval();
        Self { proxy, interval }
    }

    /// Tick forever; abort the task to stop.
    pub async fn run(self) {
        info!(interval_ms = self.interval.as_millis() as u64, "Drain scheduler started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut tasks = JoinSet::new();
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let started = self.proxy.spawn_drains(unix_now(), &mut tasks).await;
                    if started > 0 {
                        debug!(endpoints = started, in_flight = tasks.len(), "Drain tick");
                    }
                }
                Some(result) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = result {
                        warn!(error = %e, "Drain task failed");
                    }
                }
            }
        }
    }
}
