// SPDX-License-Identifier: MIT
//! ShieldOps core — in-memory recorders, analyzers, and delivery plumbing
//! for an SRE/security-operations platform.
//!
//! Everything lives in process memory: bounded record stores with FIFO
//! eviction, a bounded-concurrency task queue, a signing webhook delivery
//! engine, and threshold-driven trackers for canary deployments and
//! dependency SLAs.

pub mod analyzers;
pub mod canary;
pub mod config;
pub mod report;
pub mod sla;
pub mod store;
pub mod task_queue;
pub mod telemetry;
pub mod webhook;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::RwLock;

use analyzers::cache_effectiveness::CacheEffectivenessAnalyzer;
use canary::CanaryDeploymentTracker;
use config::OpsConfig;
use sla::DependencySlaTracker;
use task_queue::TaskQueue;
use telemetry::{OpsCounters, SharedCounters};
use webhook::WebhookDeliveryEngine;

/// Shared application state handed to whatever hosts the platform.
///
/// Cheap to clone — everything inside is behind an `Arc`.
#[derive(Clone)]
pub struct OpsContext {
    pub config: Arc<OpsConfig>,
    /// Background task execution with bounded concurrency and retries.
    pub task_queue: Arc<TaskQueue>,
    /// Signed webhook delivery with a dead-letter list.
    pub webhooks: Arc<WebhookDeliveryEngine>,
    /// Upstream dependency SLA tracking.
    pub sla: Arc<RwLock<DependencySlaTracker>>,
    /// Representative recorder/analyzer module.
    pub cache_effectiveness: Arc<RwLock<CacheEffectivenessAnalyzer>>,
    /// Active canary observations, keyed by service name.
    pub canaries: Arc<RwLock<HashMap<String, CanaryDeploymentTracker>>>,
    /// In-process counters (Prometheus text via `render_prometheus`).
    pub counters: SharedCounters,
}

impl OpsContext {
    /// Wire up all components from one config.
    ///
    /// Must be called from within a Tokio runtime — the task queue starts
    /// its dispatcher and cleanup loops immediately.
    pub fn new(config: OpsConfig) -> Result<Self> {
        let counters = OpsCounters::shared();
        let task_queue = TaskQueue::new(&config.queue, Arc::clone(&counters));
        let webhooks = Arc::new(WebhookDeliveryEngine::new(
            config.webhook.clone(),
            Arc::clone(&counters),
        )?);
        let sla = Arc::new(RwLock::new(DependencySlaTracker::new(config.sla.clone())));
        let cache_effectiveness = Arc::new(RwLock::new(CacheEffectivenessAnalyzer::new(
            config.cache_effectiveness.clone(),
        )));

        Ok(Self {
            config: Arc::new(config),
            task_queue,
            webhooks,
            sla,
            cache_effectiveness,
            canaries: Arc::new(RwLock::new(HashMap::new())),
            counters,
        })
    }

    /// Begin observing a canary for `service`. Replaces any previous canary
    /// for the same service — a new rollout supersedes the old observation.
    pub async fn start_canary(&self, service: &str, version: &str) {
        let tracker =
            CanaryDeploymentTracker::new(service, version, self.config.canary.clone());
        self.canaries
            .write()
            .await
            .insert(service.to_string(), tracker);
    }
}
