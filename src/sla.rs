//! Dependency SLA tracker.
//!
//! Upstream dependencies register an SLA target (uptime percentage + latency
//! bound). Probe results are recorded against the shared bounded store and a
//! rolling per-dependency profile; aggregate breaches are detected once a
//! dependency has enough probes, and a run of consecutive non-compliant
//! probes escalates it until a compliant probe clears the run.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::SlaConfig;
use crate::report::{HealthGrade, Recommendation, Report};
use crate::store::{BoundedStore, Record};

// ── Model ────────────────────────────────────────────────────────────────────

/// What a dependency promised.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SlaTarget {
    /// Minimum acceptable uptime, e.g. `99.9`.
    pub uptime_pct: f64,
    /// Maximum acceptable average latency.
    pub latency_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProbeRecord {
    pub id: String,
    pub dependency: String,
    pub ok: bool,
    pub latency_ms: f64,
    pub recorded_at: DateTime<Utc>,
}

impl Record for ProbeRecord {
    fn id(&self) -> &str {
        &self.id
    }
    fn recorded_at(&self) -> DateTime<Utc> {
        self.recorded_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyStatus {
    Compliant,
    Breached,
    Escalated,
}

impl fmt::Display for DependencyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Compliant => "compliant",
            Self::Breached => "breached",
            Self::Escalated => "escalated",
        };
        f.write_str(s)
    }
}

/// Rolling counters per dependency. Probe-level detail lives in the store;
/// these survive store eviction.
#[derive(Debug, Clone)]
struct DependencyProfile {
    target: SlaTarget,
    probes_total: u64,
    probes_ok: u64,
    probes_compliant: u64,
    latency_sum: f64,
    consecutive_breaches: u32,
    status: DependencyStatus,
}

impl DependencyProfile {
    fn new(target: SlaTarget) -> Self {
        Self {
            target,
            probes_total: 0,
            probes_ok: 0,
            probes_compliant: 0,
            latency_sum: 0.0,
            consecutive_breaches: 0,
            status: DependencyStatus::Compliant,
        }
    }

    fn observed_uptime_pct(&self) -> f64 {
        if self.probes_total == 0 {
            return 100.0;
        }
        self.probes_ok as f64 / self.probes_total as f64 * 100.0
    }

    fn average_latency_ms(&self) -> f64 {
        if self.probes_total == 0 {
            return 0.0;
        }
        self.latency_sum / self.probes_total as f64
    }

    /// Share of compliant probes, 0–100. No probes = no evidence of breach.
    fn compliance_score(&self) -> f64 {
        if self.probes_total == 0 {
            return 100.0;
        }
        self.probes_compliant as f64 / self.probes_total as f64 * 100.0
    }
}

#[derive(Debug, Error)]
pub enum SlaError {
    #[error("dependency {0:?} is not registered")]
    UnknownDependency(String),
    #[error("dependency {0:?} is already registered")]
    DuplicateDependency(String),
    #[error("invalid target: {0}")]
    InvalidTarget(String),
    #[error("invalid probe: {0}")]
    InvalidProbe(String),
}

// ── Tracker ──────────────────────────────────────────────────────────────────

pub struct DependencySlaTracker {
    probes: BoundedStore<ProbeRecord>,
    deps: BTreeMap<String, DependencyProfile>,
    config: SlaConfig,
}

impl DependencySlaTracker {
    pub fn new(config: SlaConfig) -> Self {
        Self {
            probes: BoundedStore::new(config.max_probes.max(1)),
            deps: BTreeMap::new(),
            config,
        }
    }

    pub fn register_dependency(
        &mut self,
        name: &str,
        target: SlaTarget,
    ) -> Result<(), SlaError> {
        if !(0.0..=100.0).contains(&target.uptime_pct) {
            return Err(SlaError::InvalidTarget(format!(
                "uptime_pct {} outside 0–100",
                target.uptime_pct
            )));
        }
        if !target.latency_ms.is_finite() || target.latency_ms <= 0.0 {
            return Err(SlaError::InvalidTarget(format!(
                "latency_ms {} must be a positive number",
                target.latency_ms
            )));
        }
        if self.deps.contains_key(name) {
            return Err(SlaError::DuplicateDependency(name.to_string()));
        }
        self.deps
            .insert(name.to_string(), DependencyProfile::new(target));
        debug!(dependency = name, uptime_pct = target.uptime_pct, latency_ms = target.latency_ms, "SLA target registered");
        Ok(())
    }

    pub fn dependencies(&self) -> Vec<String> {
        self.deps.keys().cloned().collect()
    }

    /// Record one probe result and return the dependency's status after it.
    pub fn record_probe(
        &mut self,
        name: &str,
        ok: bool,
        latency_ms: f64,
    ) -> Result<DependencyStatus, SlaError> {
        // A single NaN latency would poison `latency_sum` for good and make
        // every aggregate latency comparison false.
        if !latency_ms.is_finite() || latency_ms < 0.0 {
            return Err(SlaError::InvalidProbe(format!(
                "latency_ms {latency_ms} is not a non-negative number"
            )));
        }
        let min_probes = self.config.min_probes;
        let escalation_threshold = self.config.escalation_threshold;
        let profile = self
            .deps
            .get_mut(name)
            .ok_or_else(|| SlaError::UnknownDependency(name.to_string()))?;

        let record = ProbeRecord {
            id: Uuid::new_v4().to_string(),
            dependency: name.to_string(),
            ok,
            latency_ms,
            recorded_at: Utc::now(),
        };
        // Fresh UUID per probe; duplicate means an RNG failure.
        let _ = self.probes.insert(record);

        profile.probes_total += 1;
        profile.latency_sum += latency_ms;
        if ok {
            profile.probes_ok += 1;
        }

        // Probe-level compliance drives the escalation run.
        let compliant = ok && latency_ms <= profile.target.latency_ms;
        if compliant {
            profile.probes_compliant += 1;
            profile.consecutive_breaches = 0;
        } else {
            profile.consecutive_breaches += 1;
        }

        // Aggregate breach detection only once there is enough evidence.
        let aggregate_breach = profile.probes_total >= min_probes
            && (profile.observed_uptime_pct() < profile.target.uptime_pct
                || profile.average_latency_ms() > profile.target.latency_ms);

        let was = profile.status;
        profile.status = if profile.consecutive_breaches >= escalation_threshold {
            DependencyStatus::Escalated
        } else if aggregate_breach {
            DependencyStatus::Breached
        } else {
            DependencyStatus::Compliant
        };

        if profile.status != was {
            match profile.status {
                DependencyStatus::Compliant => {
                    debug!(dependency = name, "dependency back in SLA compliance");
                }
                DependencyStatus::Breached => {
                    warn!(
                        dependency = name,
                        uptime_pct = profile.observed_uptime_pct(),
                        avg_latency_ms = profile.average_latency_ms(),
                        "dependency SLA breached"
                    );
                }
                DependencyStatus::Escalated => {
                    warn!(
                        dependency = name,
                        consecutive = profile.consecutive_breaches,
                        "dependency escalated after consecutive SLA breaches"
                    );
                }
            }
        }
        Ok(profile.status)
    }

    pub fn status(&self, name: &str) -> Result<DependencyStatus, SlaError> {
        self.deps
            .get(name)
            .map(|p| p.status)
            .ok_or_else(|| SlaError::UnknownDependency(name.to_string()))
    }

    /// Compliance score 0–100 (share of compliant probes; 100 with no probes).
    pub fn compliance(&self, name: &str) -> Result<f64, SlaError> {
        self.deps
            .get(name)
            .map(|p| p.compliance_score())
            .ok_or_else(|| SlaError::UnknownDependency(name.to_string()))
    }

    pub fn probe_count(&self) -> usize {
        self.probes.len()
    }

    /// Recent probes for one dependency, newest first.
    pub fn recent_probes(&self, name: &str, n: usize) -> Vec<&ProbeRecord> {
        let name = name.to_string();
        let mut probes = self.probes.filter(move |p| p.dependency == name);
        probes.reverse();
        probes.truncate(n);
        probes
    }

    /// Empty the probe store and reset every rolling profile. Registered
    /// targets are kept.
    pub fn clear_data(&mut self) {
        self.probes.clear();
        for profile in self.deps.values_mut() {
            let target = profile.target;
            *profile = DependencyProfile::new(target);
        }
    }

    pub fn report(&self) -> Report {
        let mut report = Report::new("dependency_sla");
        report.record_count = self.probes.len();

        let mut score_sum = 0.0;
        let mut graded = 0usize;
        for (name, profile) in &self.deps {
            *report
                .buckets
                .entry(profile.status.to_string())
                .or_insert(0) += 1;

            if profile.probes_total < self.config.min_probes {
                report.recommend(Recommendation::info(format!(
                    "Dependency {name} has only {}/{} probes — not yet graded",
                    profile.probes_total, self.config.min_probes
                )));
                continue;
            }
            let score = profile.compliance_score();
            score_sum += score;
            graded += 1;
            report.aggregate(format!("{name}_compliance_pct"), score);

            match profile.status {
                DependencyStatus::Escalated => {
                    report.recommend(Recommendation::critical(format!(
                        "Dependency {name} escalated after {} consecutive breached probes — engage the owning team",
                        profile.consecutive_breaches
                    )));
                }
                DependencyStatus::Breached => {
                    report.recommend(Recommendation::warning(format!(
                        "Dependency {name} out of SLA (uptime {:.2}% vs {:.2}% target, avg latency {:.1}ms vs {:.1}ms)",
                        profile.observed_uptime_pct(),
                        profile.target.uptime_pct,
                        profile.average_latency_ms(),
                        profile.target.latency_ms
                    )));
                }
                DependencyStatus::Compliant => {}
            }
        }

        if graded > 0 {
            let avg = score_sum / graded as f64;
            report.aggregate("avg_compliance_pct", avg);
            report.grade = Some(HealthGrade::from_score(avg));
        }
        report
    }
}
