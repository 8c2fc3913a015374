// SPDX-License-Identifier: MIT
//! Capacity-bounded in-memory record store.
//!
//! Every recorder module in ShieldOps keeps observations in the same shape:
//! an ordered list capped at a configured maximum, oldest entries evicted
//! first, aggregated by linear scan. [`BoundedStore`] implements that shape
//! once so the recorder modules only define their record types.
//!
//! The store is a plain synchronous type. Callers that share one across
//! tasks wrap it in `Arc<RwLock<…>>`; the analytics path itself has no
//! internal locking.

use std::collections::{BTreeMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use thiserror::Error;

/// A record that can live in a [`BoundedStore`].
pub trait Record {
    /// Unique identifier within one store.
    fn id(&self) -> &str;
    /// When the observation was recorded.
    fn recorded_at(&self) -> DateTime<Utc>;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Insert with an id already present. Ids are unique per store; a
    /// duplicate is an error, never a silent replace.
    #[error("record id {0:?} already present in store")]
    DuplicateId(String),
}

/// Fixed-capacity FIFO store: inserting into a full store evicts the oldest
/// record first.
#[derive(Debug)]
pub struct BoundedStore<T: Record> {
    records: VecDeque<T>,
    ids: HashSet<String>,
    capacity: usize,
    evicted: u64,
}

impl<T: Record> BoundedStore<T> {
    /// Create a store holding at most `capacity` records.
    ///
    /// # Panics
    /// Panics if `capacity` is 0 (a store that can hold nothing).
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "BoundedStore capacity must be at least 1");
        Self {
            records: VecDeque::with_capacity(capacity.min(1024)),
            ids: HashSet::new(),
            capacity,
            evicted: 0,
        }
    }

    /// Append a record, evicting the oldest one if the store is full.
    pub fn insert(&mut self, record: T) -> Result<(), StoreError> {
        let id = record.id().to_string();
        if self.ids.contains(&id) {
            return Err(StoreError::DuplicateId(id));
        }
        if self.records.len() == self.capacity {
            if let Some(oldest) = self.records.pop_front() {
                self.ids.remove(oldest.id());
                self.evicted += 1;
            }
        }
        self.ids.insert(id);
        self.records.push_back(record);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&T> {
        self.records.iter().find(|r| r.id() == id)
    }

    /// Oldest-to-newest iteration.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.records.iter()
    }

    /// Records matching `pred`, oldest first.
    pub fn filter<'a>(&'a self, pred: impl Fn(&T) -> bool + 'a) -> Vec<&'a T> {
        self.records.iter().filter(|r| pred(r)).collect()
    }

    /// The `n` most recent records, newest first.
    pub fn latest(&self, n: usize) -> Vec<&T> {
        self.records.iter().rev().take(n).collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total records dropped by FIFO eviction since creation.
    pub fn evicted_total(&self) -> u64 {
        self.evicted
    }

    /// Drop every record. Eviction stats are kept.
    pub fn clear(&mut self) {
        self.records.clear();
        self.ids.clear();
    }

    // ── Linear-scan aggregation ──────────────────────────────────────────────

    /// Mean of `f` over all records, or `None` when empty.
    pub fn average_by(&self, f: impl Fn(&T) -> f64) -> Option<f64> {
        if self.records.is_empty() {
            return None;
        }
        let sum: f64 = self.records.iter().map(&f).sum();
        Some(sum / self.records.len() as f64)
    }

    /// Sum of `f` over all records.
    pub fn sum_by(&self, f: impl Fn(&T) -> f64) -> f64 {
        self.records.iter().map(f).sum()
    }

    /// Bucket counts keyed by the label `f` extracts (enum-tag bucketing).
    /// BTreeMap so report output is deterministically ordered.
    pub fn count_by(&self, f: impl Fn(&T) -> String) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for record in &self.records {
            *counts.entry(f(record)).or_insert(0) += 1;
        }
        counts
    }

    /// The `n` records with the highest `key`, descending. NaN keys sort last.
    pub fn top_n_by(&self, n: usize, key: impl Fn(&T) -> f64) -> Vec<&T> {
        let mut ranked: Vec<&T> = self.records.iter().collect();
        ranked.sort_by(|a, b| {
            key(b)
                .partial_cmp(&key(a))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        ranked.truncate(n);
        ranked
    }
}
