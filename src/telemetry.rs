// SPDX-License-Identifier: MIT
//! Logging init and in-process counters.
//!
//! Counters are plain `AtomicU64` incremented inline — no external metrics
//! library. `render_prometheus` exposes them in Prometheus text format for
//! whatever scrapes the host process.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Install the global tracing subscriber (compact fmt, env-filter syntax).
///
/// `level` accepts anything `EnvFilter` does (`"info"`,
/// `"shieldops=debug,warn"`, …). Safe to call more than once — later calls
/// are no-ops, which keeps tests that each set up logging from panicking.
pub fn init_logging(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .compact()
        .try_init();
}

/// In-process counters shared across all components.
#[derive(Debug)]
pub struct OpsCounters {
    pub tasks_enqueued: AtomicU64,
    pub tasks_completed: AtomicU64,
    pub tasks_failed: AtomicU64,
    pub tasks_cancelled: AtomicU64,
    pub webhooks_delivered: AtomicU64,
    pub webhooks_dead_lettered: AtomicU64,
    /// Process start — used for the uptime gauge.
    pub started_at: Instant,
}

impl OpsCounters {
    pub fn new() -> Self {
        Self {
            tasks_enqueued: AtomicU64::new(0),
            tasks_completed: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            tasks_cancelled: AtomicU64::new(0),
            webhooks_delivered: AtomicU64::new(0),
            webhooks_dead_lettered: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    pub fn shared() -> SharedCounters {
        Arc::new(Self::new())
    }

    pub fn inc_tasks_enqueued(&self) {
        self.tasks_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_tasks_completed(&self) {
        self.tasks_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_tasks_failed(&self) {
        self.tasks_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_tasks_cancelled(&self) {
        self.tasks_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_webhooks_delivered(&self) {
        self.webhooks_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_webhooks_dead_lettered(&self) {
        self.webhooks_dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    /// Render counters in Prometheus text format.
    pub fn render_prometheus(&self) -> String {
        let uptime = self.started_at.elapsed().as_secs();
        let tasks_enqueued = self.tasks_enqueued.load(Ordering::Relaxed);
        let tasks_completed = self.tasks_completed.load(Ordering::Relaxed);
        let tasks_failed = self.tasks_failed.load(Ordering::Relaxed);
        let tasks_cancelled = self.tasks_cancelled.load(Ordering::Relaxed);
        let webhooks_delivered = self.webhooks_delivered.load(Ordering::Relaxed);
        let webhooks_dead_lettered = self.webhooks_dead_lettered.load(Ordering::Relaxed);

        format!(
            "# HELP shieldops_uptime_seconds Process uptime in seconds.\n\
             # TYPE shieldops_uptime_seconds gauge\n\
             shieldops_uptime_seconds {uptime}\n\
             # HELP shieldops_tasks_enqueued_total Tasks enqueued since start.\n\
             # TYPE shieldops_tasks_enqueued_total counter\n\
             shieldops_tasks_enqueued_total {tasks_enqueued}\n\
             # HELP shieldops_tasks_completed_total Tasks completed since start.\n\
             # TYPE shieldops_tasks_completed_total counter\n\
             shieldops_tasks_completed_total {tasks_completed}\n\
             # HELP shieldops_tasks_failed_total Tasks failed after retry exhaustion since start.\n\
             # TYPE shieldops_tasks_failed_total counter\n\
             shieldops_tasks_failed_total {tasks_failed}\n\
             # HELP shieldops_tasks_cancelled_total Tasks cancelled while pending since start.\n\
             # TYPE shieldops_tasks_cancelled_total counter\n\
             shieldops_tasks_cancelled_total {tasks_cancelled}\n\
             # HELP shieldops_webhooks_delivered_total Webhook deliveries acknowledged since start.\n\
             # TYPE shieldops_webhooks_delivered_total counter\n\
             shieldops_webhooks_delivered_total {webhooks_delivered}\n\
             # HELP shieldops_webhooks_dead_lettered_total Webhook events routed to the dead-letter list since start.\n\
             # TYPE shieldops_webhooks_dead_lettered_total counter\n\
             shieldops_webhooks_dead_lettered_total {webhooks_dead_lettered}\n"
        )
    }
}

impl Default for OpsCounters {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared handle — cheaply clonable.
pub type SharedCounters = Arc<OpsCounters>;
