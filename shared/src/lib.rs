//! Shared records and utilities used across the agent's scheduling fabric.
//!
//! This crate holds the data that has to be agreed on by more than one
//! component: the task family records committed by `ConfigSource` and read
//! by `TaskRegistry`, the metric/value types produced by schedulers and
//! consumed by `ChannelManager`, and small helpers (checksums, timestamps)
//! that don't belong to any one component.

pub mod config;
pub mod defaults;
pub mod error;
pub mod metrics;
pub mod utils;

pub use config::{ModuleTask, ProbeKind, ProbeTask, ScrapeTask, ScriptTask, TasksSnapshot};
pub use error::MonitoringError;
pub use metrics::{LabelMap, Metric, MetricValue};

/// Crate-wide result alias, matching the rest of the agent codebase.
pub type Result<T> = anyhow::Result<T>;

#[cfg(test)]
mod tests {
    #[test]
    fn test_basic_imports() {
        // Smoke test: the crate's modules compose without cyclic re-export issues.
    }
}
