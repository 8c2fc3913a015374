//! Recorder/analyzer/reporter modules.
//!
//! Each analyzer is an instance of the same template: an enum-typed record
//! model, a [`BoundedStore`](crate::store::BoundedStore) of observations, a
//! handful of aggregation and threshold-detection methods, and a
//! [`Report`](crate::report::Report) generator.

pub mod cache_effectiveness;
