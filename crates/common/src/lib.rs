//! Shared configuration, error types, memory accounting and observability
//! primitives for spillway crates.
//!
//! Architecture role:
//! - defines the spill configuration handed to spiller factories
//! - provides common [`SpillwayError`] / [`Result`] contracts
//! - hosts the hierarchical memory-accounting tree
//! - hosts spill metrics, process-wide spiller stats and the optional exporter
//!
//! Key modules:
//! - [`config`]
//! - [`error`]
//! - [`ids`]
//! - [`memory`]
//! - [`metrics`]
//! - `metrics_exporter` (feature-gated)
//!
//! Feature flags:
//! - `profiling`: enables the metrics HTTP exporter helpers.

pub mod config;
pub mod error;
pub mod ids;
pub mod memory;
pub mod metrics;
#[cfg(feature = "profiling")]
pub mod metrics_exporter;

pub use config::{CompressionCodec, SpillConfig};
pub use error::{Result, SpillwayError};
pub use ids::*;
pub use memory::{AggregatedMemoryContext, LocalMemoryContext};
pub use metrics::{
    global_metrics, global_spiller_stats, MetricsRegistry, SpillerStats, SpillerStatsSnapshot,
};
#[cfg(feature = "profiling")]
pub use metrics_exporter::run_metrics_exporter;
