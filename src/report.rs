//! Report primitives shared by every recorder module.
//!
//! A report is an aggregate summary (counts, averages, enum-tag buckets)
//! plus human-readable recommendations derived from threshold comparisons.
//! The numeric-score → grade bucketing lives here so every module displays
//! the same closed set of labels.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Grades & severities ──────────────────────────────────────────────────────

/// Closed set of health labels used to bucket a 0–100 score for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthGrade {
    Excellent,
    Good,
    Fair,
    Poor,
    Critical,
}

impl HealthGrade {
    /// Bucket a 0–100 score: ≥90 excellent, ≥75 good, ≥60 fair, ≥40 poor,
    /// otherwise critical.
    pub fn from_score(score: f64) -> Self {
        if score >= 90.0 {
            Self::Excellent
        } else if score >= 75.0 {
            Self::Good
        } else if score >= 60.0 {
            Self::Fair
        } else if score >= 40.0 {
            Self::Poor
        } else {
            Self::Critical
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Excellent => "excellent",
            Self::Good => "good",
            Self::Fair => "fair",
            Self::Poor => "poor",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for HealthGrade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

// ── Recommendations ──────────────────────────────────────────────────────────

/// One human-readable action item produced by a threshold comparison.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    pub severity: Severity,
    pub message: String,
}

impl Recommendation {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Info,
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            message: message.into(),
        }
    }

    pub fn critical(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Critical,
            message: message.into(),
        }
    }
}

// ── Report ───────────────────────────────────────────────────────────────────

/// Aggregate summary for one module at one point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    /// Which module produced this report (e.g. `"cache_effectiveness"`).
    pub module: String,
    pub generated_at: DateTime<Utc>,
    pub record_count: usize,
    /// Named numeric aggregates (averages, rates), deterministically ordered.
    pub aggregates: BTreeMap<String, f64>,
    /// Enum-tag bucket counts.
    pub buckets: BTreeMap<String, usize>,
    /// Overall grade, when the module had enough data to grade itself.
    pub grade: Option<HealthGrade>,
    pub recommendations: Vec<Recommendation>,
}

impl Report {
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            generated_at: Utc::now(),
            record_count: 0,
            aggregates: BTreeMap::new(),
            buckets: BTreeMap::new(),
            grade: None,
            recommendations: Vec::new(),
        }
    }

    pub fn aggregate(&mut self, name: impl Into<String>, value: f64) -> &mut Self {
        self.aggregates.insert(name.into(), value);
        self
    }

    pub fn recommend(&mut self, rec: Recommendation) -> &mut Self {
        self.recommendations.push(rec);
        self
    }

    /// Highest severity among the recommendations, if any.
    pub fn worst_severity(&self) -> Option<Severity> {
        self.recommendations.iter().map(|r| r.severity).max()
    }

    /// Render the report as a human-readable text block.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("=== {} report ===\n", self.module));
        out.push_str(&format!("generated: {}\n", self.generated_at.to_rfc3339()));
        out.push_str(&format!("records:   {}\n", self.record_count));
        if let Some(grade) = self.grade {
            out.push_str(&format!("grade:     {grade}\n"));
        }
        if !self.aggregates.is_empty() {
            out.push_str("aggregates:\n");
            for (name, value) in &self.aggregates {
                out.push_str(&format!("  {name}: {value:.2}\n"));
            }
        }
        if !self.buckets.is_empty() {
            out.push_str("buckets:\n");
            for (label, count) in &self.buckets {
                out.push_str(&format!("  {label}: {count}\n"));
            }
        }
        if self.recommendations.is_empty() {
            out.push_str("recommendations: none\n");
        } else {
            out.push_str("recommendations:\n");
            for rec in &self.recommendations {
                out.push_str(&format!("  [{}] {}\n", rec.severity.as_str(), rec.message));
            }
        }
        out
    }
}
