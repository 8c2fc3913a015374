//! Cache effectiveness analyzer.
//!
//! Records per-lookup cache outcomes and reports hit rates per cache with
//! threshold-driven recommendations.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::CacheAnalyzerConfig;
use crate::report::{HealthGrade, Recommendation, Report};
use crate::store::{BoundedStore, Record, StoreError};

// ── Model ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheOutcome {
    Hit,
    Miss,
    /// Entry was present but past its freshness window.
    Stale,
    /// Lookup skipped the cache entirely.
    Bypass,
}

impl fmt::Display for CacheOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Hit => "hit",
            Self::Miss => "miss",
            Self::Stale => "stale",
            Self::Bypass => "bypass",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheLookupRecord {
    pub id: String,
    pub cache_name: String,
    pub outcome: CacheOutcome,
    pub latency_us: f64,
    pub recorded_at: DateTime<Utc>,
}

impl Record for CacheLookupRecord {
    fn id(&self) -> &str {
        &self.id
    }
    fn recorded_at(&self) -> DateTime<Utc> {
        self.recorded_at
    }
}

// ── Analyzer ─────────────────────────────────────────────────────────────────

pub struct CacheEffectivenessAnalyzer {
    store: BoundedStore<CacheLookupRecord>,
    config: CacheAnalyzerConfig,
}

impl CacheEffectivenessAnalyzer {
    pub fn new(config: CacheAnalyzerConfig) -> Self {
        Self {
            store: BoundedStore::new(config.max_records.max(1)),
            config,
        }
    }

    pub fn record_lookup(
        &mut self,
        cache_name: &str,
        outcome: CacheOutcome,
        latency_us: f64,
    ) -> Result<(), StoreError> {
        self.store.insert(CacheLookupRecord {
            id: Uuid::new_v4().to_string(),
            cache_name: cache_name.to_string(),
            outcome,
            latency_us,
            recorded_at: Utc::now(),
        })
    }

    pub fn record_count(&self) -> usize {
        self.store.len()
    }

    /// Hit rate for one cache: hits over cacheable lookups (bypasses don't
    /// count against the cache). `None` when the cache has no cacheable
    /// lookups recorded.
    pub fn hit_rate(&self, cache_name: &str) -> Option<f64> {
        let lookups = self
            .store
            .filter(|r| r.cache_name == cache_name && r.outcome != CacheOutcome::Bypass);
        if lookups.is_empty() {
            return None;
        }
        let hits = lookups
            .iter()
            .filter(|r| r.outcome == CacheOutcome::Hit)
            .count();
        Some(hits as f64 / lookups.len() as f64)
    }

    pub fn outcome_counts(&self) -> BTreeMap<String, usize> {
        self.store.count_by(|r| r.outcome.to_string())
    }

    pub fn cache_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .store
            .count_by(|r| r.cache_name.clone())
            .into_keys()
            .collect();
        names.sort();
        names
    }

    pub fn average_latency_us(&self) -> Option<f64> {
        self.store.average_by(|r| r.latency_us)
    }

    pub fn clear_data(&mut self) {
        self.store.clear();
    }

    pub fn generate_report(&self) -> Report {
        let mut report = Report::new("cache_effectiveness");
        report.record_count = self.store.len();
        report.buckets = self.outcome_counts();
        if let Some(latency) = self.average_latency_us() {
            report.aggregate("avg_latency_us", latency);
        }

        let mut rate_sum = 0.0;
        let mut rated = 0usize;
        for name in self.cache_names() {
            let Some(rate) = self.hit_rate(&name) else {
                continue;
            };
            report.aggregate(format!("{name}_hit_rate"), rate);
            rate_sum += rate;
            rated += 1;

            if rate < self.config.critical_hit_rate {
                report.recommend(Recommendation::critical(format!(
                    "Cache {name} hit rate {:.0}% is critically low — review key design and eviction policy",
                    rate * 100.0
                )));
            } else if rate < self.config.warn_hit_rate {
                report.recommend(Recommendation::warning(format!(
                    "Cache {name} hit rate {:.0}% is below the {:.0}% target — consider a longer TTL or larger capacity",
                    rate * 100.0,
                    self.config.warn_hit_rate * 100.0
                )));
            }
        }

        if rated > 0 {
            let overall = rate_sum / rated as f64;
            report.aggregate("overall_hit_rate", overall);
            report.grade = Some(HealthGrade::from_score(overall * 100.0));
        }
        report
    }
}
