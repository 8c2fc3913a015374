//! Canary deployment tracker.
//!
//! A small state machine: while `Observing`, error-rate/latency samples are
//! appended to a bounded store; `evaluate` compares the sample means against
//! the configured thresholds and answers promote / hold / roll back. The
//! terminal transitions (`promote`, `roll_back`) are explicit — evaluation
//! never flips state by itself.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::config::CanaryConfig;
use crate::report::{HealthGrade, Recommendation, Report};
use crate::store::{BoundedStore, Record};

// ── Model ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanaryState {
    Observing,
    Promoted,
    RolledBack,
}

impl CanaryState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Observing)
    }
}

impl fmt::Display for CanaryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Observing => "observing",
            Self::Promoted => "promoted",
            Self::RolledBack => "rolled_back",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanaryDecision {
    Promote,
    Hold,
    RollBack,
}

#[derive(Debug, Clone, Serialize)]
pub struct CanarySample {
    pub id: String,
    /// Fraction of failed requests in the sampling window, 0.0–1.0.
    pub error_rate: f64,
    pub latency_ms: f64,
    pub recorded_at: DateTime<Utc>,
}

impl Record for CanarySample {
    fn id(&self) -> &str {
        &self.id
    }
    fn recorded_at(&self) -> DateTime<Utc> {
        self.recorded_at
    }
}

#[derive(Debug, Error)]
pub enum CanaryError {
    #[error("canary is {0} — no further samples or transitions accepted")]
    TerminalState(CanaryState),
    #[error("invalid sample: {0}")]
    InvalidSample(String),
}

// ── Tracker ──────────────────────────────────────────────────────────────────

pub struct CanaryDeploymentTracker {
    service: String,
    version: String,
    state: CanaryState,
    samples: BoundedStore<CanarySample>,
    config: CanaryConfig,
}

impl CanaryDeploymentTracker {
    pub fn new(service: &str, version: &str, config: CanaryConfig) -> Self {
        info!(service, version, "canary observation started");
        Self {
            service: service.to_string(),
            version: version.to_string(),
            samples: BoundedStore::new(config.max_samples.max(1)),
            state: CanaryState::Observing,
            config,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn state(&self) -> CanaryState {
        self.state
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Record one sampling window. Rejected once the canary is terminal.
    pub fn record_sample(&mut self, error_rate: f64, latency_ms: f64) -> Result<(), CanaryError> {
        if self.state.is_terminal() {
            return Err(CanaryError::TerminalState(self.state));
        }
        if !(0.0..=1.0).contains(&error_rate) || !error_rate.is_finite() {
            return Err(CanaryError::InvalidSample(format!(
                "error_rate {error_rate} outside 0.0–1.0"
            )));
        }
        if !latency_ms.is_finite() || latency_ms < 0.0 {
            return Err(CanaryError::InvalidSample(format!(
                "latency_ms {latency_ms} is not a non-negative number"
            )));
        }
        let sample = CanarySample {
            id: Uuid::new_v4().to_string(),
            error_rate,
            latency_ms,
            recorded_at: Utc::now(),
        };
        // Ids are fresh UUIDs; a collision would be an RNG failure.
        self.samples
            .insert(sample)
            .map_err(|e| CanaryError::InvalidSample(e.to_string()))
    }

    pub fn mean_error_rate(&self) -> Option<f64> {
        self.samples.average_by(|s| s.error_rate)
    }

    pub fn mean_latency_ms(&self) -> Option<f64> {
        self.samples.average_by(|s| s.latency_ms)
    }

    /// Threshold decision over the recorded samples. `Hold` until
    /// `min_samples` have been observed; afterwards any breached threshold
    /// means `RollBack`, otherwise `Promote`.
    pub fn evaluate(&self) -> CanaryDecision {
        if self.samples.len() < self.config.min_samples {
            return CanaryDecision::Hold;
        }
        let error_rate = self.mean_error_rate().unwrap_or(0.0);
        let latency = self.mean_latency_ms().unwrap_or(0.0);
        if error_rate > self.config.max_error_rate || latency > self.config.max_latency_ms {
            CanaryDecision::RollBack
        } else {
            CanaryDecision::Promote
        }
    }

    pub fn promote(&mut self) -> Result<CanaryState, CanaryError> {
        self.transition(CanaryState::Promoted)
    }

    pub fn roll_back(&mut self) -> Result<CanaryState, CanaryError> {
        self.transition(CanaryState::RolledBack)
    }

    fn transition(&mut self, to: CanaryState) -> Result<CanaryState, CanaryError> {
        if self.state.is_terminal() {
            return Err(CanaryError::TerminalState(self.state));
        }
        info!(service = %self.service, version = %self.version, from = %self.state, to = %to, "canary transition");
        self.state = to;
        Ok(self.state)
    }

    /// Drop all recorded samples. The state machine is untouched.
    pub fn clear_data(&mut self) {
        self.samples.clear();
    }

    pub fn report(&self) -> Report {
        let mut report = Report::new("canary_deployment");
        report.record_count = self.samples.len();
        report
            .buckets
            .insert(format!("state:{}", self.state), 1);

        if let (Some(error_rate), Some(latency)) = (self.mean_error_rate(), self.mean_latency_ms())
        {
            report.aggregate("mean_error_rate", error_rate);
            report.aggregate("mean_latency_ms", latency);
            // Score the canary by how far inside its error budget it sits.
            let budget_used = (error_rate / self.config.max_error_rate).min(1.0);
            report.grade = Some(HealthGrade::from_score((1.0 - budget_used) * 100.0));
        }

        match self.evaluate() {
            CanaryDecision::Hold => {
                report.recommend(Recommendation::info(format!(
                    "Canary {} {} needs {} more samples before a decision",
                    self.service,
                    self.version,
                    self.config.min_samples.saturating_sub(self.samples.len())
                )));
            }
            CanaryDecision::Promote => {
                report.recommend(Recommendation::info(format!(
                    "Canary {} {} is within thresholds — safe to promote",
                    self.service, self.version
                )));
            }
            CanaryDecision::RollBack => {
                report.recommend(Recommendation::critical(format!(
                    "Canary {} {} breaches thresholds (error rate {:.4}, latency {:.1}ms) — roll back",
                    self.service,
                    self.version,
                    self.mean_error_rate().unwrap_or(0.0),
                    self.mean_latency_ms().unwrap_or(0.0)
                )));
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::Severity;

    fn config(min_samples: usize) -> CanaryConfig {
        CanaryConfig {
            max_error_rate: 0.05,
            max_latency_ms: 500.0,
            min_samples,
            max_samples: 100,
        }
    }

    #[test]
    fn holds_until_min_samples() {
        let mut canary = CanaryDeploymentTracker::new("api", "v2.1.0", config(3));
        assert_eq!(canary.evaluate(), CanaryDecision::Hold);
        canary.record_sample(0.01, 100.0).unwrap();
        canary.record_sample(0.01, 110.0).unwrap();
        assert_eq!(canary.evaluate(), CanaryDecision::Hold);
        canary.record_sample(0.02, 90.0).unwrap();
        assert_eq!(canary.evaluate(), CanaryDecision::Promote);
    }

    #[test]
    fn high_error_rate_means_roll_back() {
        let mut canary = CanaryDeploymentTracker::new("api", "v2.1.0", config(2));
        canary.record_sample(0.20, 100.0).unwrap();
        canary.record_sample(0.30, 100.0).unwrap();
        assert_eq!(canary.evaluate(), CanaryDecision::RollBack);
    }

    #[test]
    fn high_latency_alone_means_roll_back() {
        let mut canary = CanaryDeploymentTracker::new("api", "v2.1.0", config(2));
        canary.record_sample(0.00, 900.0).unwrap();
        canary.record_sample(0.00, 800.0).unwrap();
        assert_eq!(canary.evaluate(), CanaryDecision::RollBack);
    }

    #[test]
    fn terminal_state_rejects_samples_and_transitions() {
        let mut canary = CanaryDeploymentTracker::new("api", "v2.1.0", config(1));
        canary.record_sample(0.01, 50.0).unwrap();
        assert_eq!(canary.promote().unwrap(), CanaryState::Promoted);

        assert!(matches!(
            canary.record_sample(0.01, 50.0),
            Err(CanaryError::TerminalState(CanaryState::Promoted))
        ));
        assert!(matches!(
            canary.roll_back(),
            Err(CanaryError::TerminalState(_))
        ));
        // Evaluation never flips a terminal state.
        let _ = canary.evaluate();
        assert_eq!(canary.state(), CanaryState::Promoted);
    }

    #[test]
    fn invalid_samples_rejected() {
        let mut canary = CanaryDeploymentTracker::new("api", "v1", config(1));
        assert!(matches!(
            canary.record_sample(1.5, 100.0),
            Err(CanaryError::InvalidSample(_))
        ));
        assert!(matches!(
            canary.record_sample(0.1, f64::NAN),
            Err(CanaryError::InvalidSample(_))
        ));
        assert!(matches!(
            canary.record_sample(0.1, -5.0),
            Err(CanaryError::InvalidSample(_))
        ));
        assert_eq!(canary.sample_count(), 0);
    }

    #[test]
    fn sample_store_is_bounded() {
        let mut canary = CanaryDeploymentTracker::new("api", "v1", config(1));
        for _ in 0..150 {
            canary.record_sample(0.0, 10.0).unwrap();
        }
        assert_eq!(canary.sample_count(), 100);
    }

    #[test]
    fn clear_data_keeps_state() {
        let mut canary = CanaryDeploymentTracker::new("api", "v1", config(1));
        canary.record_sample(0.0, 10.0).unwrap();
        canary.clear_data();
        assert_eq!(canary.sample_count(), 0);
        assert_eq!(canary.state(), CanaryState::Observing);
    }

    #[test]
    fn report_recommends_rollback_on_breach() {
        let mut canary = CanaryDeploymentTracker::new("checkout", "v3.0.0", config(2));
        canary.record_sample(0.40, 100.0).unwrap();
        canary.record_sample(0.40, 100.0).unwrap();

        let report = canary.report();
        assert_eq!(report.record_count, 2);
        assert_eq!(report.worst_severity(), Some(Severity::Critical));
        assert_eq!(report.grade, Some(HealthGrade::Critical));
        let text = report.render();
        assert!(text.contains("roll back"));
        assert!(text.contains("checkout"));
    }
}
