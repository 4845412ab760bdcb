//! Observability helpers.

pub mod metrics;

pub use metrics::{BridgeMetrics, CounterVec, GaugeVec};
