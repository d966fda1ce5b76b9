//! Behavioral analytics core for a student population: feature extraction
//! from five raw event streams, cohort-relative anomaly detection with a
//! deterministic fallback, rule-based risk / ideology / economic-distress
//! classification, and a batched daily-aggregation engine.
//!
//! The crate is storage-agnostic below `db`: the analytic modules consume
//! already-typed event records and return immutable result structs.

pub mod aggregate;
pub mod anomaly;
pub mod baseline;
pub mod config;
pub mod db;
pub mod error;
pub mod features;
pub mod ideology;
pub mod models;
pub mod poverty;
pub mod report;
pub mod risk;
pub mod stats;

pub use config::AnalysisConfig;
pub use error::CoreError;
