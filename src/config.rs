//! ShieldOps configuration (`shieldops.toml`).
//!
//! Every section is optional — missing sections and fields fall back to the
//! compiled-in defaults, so an empty (or absent) config file yields a fully
//! working setup. Thresholds live here so they can be tuned per deployment
//! without code changes.

use std::path::Path;

use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

const DEFAULT_MAX_RECORDS: usize = 1000;
const DEFAULT_QUEUE_CONCURRENCY: usize = 4;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_TASK_TTL_SECS: u64 = 3600;

// ─── QueueConfig ─────────────────────────────────────────────────────────────

/// Task queue tuning (`[queue]`).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum tasks executing at once (counting-semaphore size).
    pub concurrency: usize,
    /// Additional attempts after the first failure.
    pub max_retries: u32,
    /// Backoff before retry `n` is `backoff_base_ms * 2^n`, capped below.
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Terminal tasks older than this are purged by the cleanup loop.
    pub task_ttl_secs: u64,
    /// How often the cleanup loop wakes up.
    pub cleanup_interval_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_QUEUE_CONCURRENCY,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base_ms: 1000,
            backoff_max_ms: 60_000,
            task_ttl_secs: DEFAULT_TASK_TTL_SECS,
            cleanup_interval_secs: 60,
        }
    }
}

// ─── WebhookConfig ───────────────────────────────────────────────────────────

/// Webhook delivery tuning (`[webhook]`).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// Total delivery attempts per event (first try included).
    pub max_attempts: u32,
    /// Fixed delay between attempts — deliveries are sequential, never
    /// concurrent.
    pub retry_delay_ms: u64,
    /// Per-request HTTP timeout.
    pub request_timeout_secs: u64,
    /// Dead-letter list capacity (oldest evicted first).
    pub dead_letter_max: usize,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay_ms: 1000,
            request_timeout_secs: 10,
            dead_letter_max: DEFAULT_MAX_RECORDS,
        }
    }
}

// ─── CanaryConfig ────────────────────────────────────────────────────────────

/// Canary decision thresholds (`[canary]`).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CanaryConfig {
    /// Mean error rate (0.0–1.0) above which the canary is rolled back.
    pub max_error_rate: f64,
    /// Mean latency above which the canary is rolled back.
    pub max_latency_ms: f64,
    /// Samples required before `evaluate` stops answering `Hold`.
    pub min_samples: usize,
    /// Sample store capacity per canary.
    pub max_samples: usize,
}

impl Default for CanaryConfig {
    fn default() -> Self {
        Self {
            max_error_rate: 0.05,
            max_latency_ms: 500.0,
            min_samples: 20,
            max_samples: DEFAULT_MAX_RECORDS,
        }
    }
}

// ─── SlaConfig ───────────────────────────────────────────────────────────────

/// Dependency SLA tracking (`[sla]`).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SlaConfig {
    /// Probes required per dependency before aggregate breach detection.
    pub min_probes: u64,
    /// Consecutive non-compliant probes that escalate a dependency.
    pub escalation_threshold: u32,
    /// Probe store capacity (shared across dependencies).
    pub max_probes: usize,
}

impl Default for SlaConfig {
    fn default() -> Self {
        Self {
            min_probes: 10,
            escalation_threshold: 5,
            max_probes: 10_000,
        }
    }
}

// ─── CacheAnalyzerConfig ─────────────────────────────────────────────────────

/// Cache effectiveness thresholds (`[cache_effectiveness]`).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheAnalyzerConfig {
    /// Hit rate (0.0–1.0) below which a warning recommendation is emitted.
    pub warn_hit_rate: f64,
    /// Hit rate below which the recommendation is critical.
    pub critical_hit_rate: f64,
    pub max_records: usize,
}

impl Default for CacheAnalyzerConfig {
    fn default() -> Self {
        Self {
            warn_hit_rate: 0.8,
            critical_hit_rate: 0.5,
            max_records: 5000,
        }
    }
}

// ─── OpsConfig ───────────────────────────────────────────────────────────────

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct OpsConfig {
    pub queue: QueueConfig,
    pub webhook: WebhookConfig,
    pub canary: CanaryConfig,
    pub sla: SlaConfig,
    pub cache_effectiveness: CacheAnalyzerConfig,
}

impl OpsConfig {
    /// Load from a TOML file. A missing file is not an error — defaults are
    /// used and a warning is logged. A file that exists but fails to parse
    /// *is* an error: silently ignoring a typo'd config hides misconfigured
    /// thresholds.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!(path = %path.display(), "config file not found — using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Self = toml::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        info!(path = %path.display(), "config loaded");
        Ok(config)
    }
}
