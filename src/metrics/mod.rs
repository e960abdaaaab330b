//! Phase-organized metrics for the ingestion pipeline
//!
//! Each phase owns a submodule with its metric names, recording helpers and
//! documentation. Recording is a no-op until [`init_metrics`] installs a recorder.

pub mod ingest;
pub mod sources;

pub use ingest::IngestMetrics;
pub use sources::SourcesMetrics;

use std::collections::HashMap;
use std::sync::{Once, OnceLock};
use tracing::{info, warn};

static INIT: Once = Once::new();
static HANDLE: OnceLock<metrics_exporter_prometheus::PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder and register every phase's metrics.
///
/// Idempotent. Exposition happens in-process through [`render`], which the HTTP
/// server mounts at `/metrics`.
pub fn init_metrics() {
    INIT.call_once(|| {
        match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                let _ = HANDLE.set(handle);
                register_all_metrics();
                info!("Prometheus recorder installed");
            }
            Err(e) => warn!("Failed to install Prometheus recorder: {}", e),
        }
    });
}

/// Render the current metrics in Prometheus text format, if a recorder is installed
pub fn render() -> Option<String> {
    HANDLE.get().map(|h| h.render())
}

/// Trait for phase-specific metrics collections
pub trait PhaseMetrics {
    /// Pre-register metrics so they show up before first use
    fn register_metrics();

    fn phase_name() -> &'static str;

    fn metrics_documentation() -> Vec<MetricDoc>;
}

/// Documentation for a single metric
#[derive(Debug, Clone)]
pub struct MetricDoc {
    pub name: &'static str,
    pub metric_type: MetricType,
    pub help: &'static str,
    pub labels: Vec<&'static str>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MetricType {
    Counter,
    Histogram,
}

/// Consistent metric naming: `watch_{phase}_{name}[_total]`
macro_rules! phase_metric {
    (counter, $phase:literal, $name:literal) => {
        concat!("watch_", $phase, "_", $name, "_total")
    };
    (histogram, $phase:literal, $name:literal) => {
        concat!("watch_", $phase, "_", $name)
    };
}

pub(crate) use phase_metric;

fn register_all_metrics() {
    let mut all = HashMap::new();
    register_phase::<SourcesMetrics>(&mut all);
    register_phase::<IngestMetrics>(&mut all);
    info!("Registered {} metrics across all phases", all.len());
}

fn register_phase<T: PhaseMetrics>(all: &mut HashMap<&'static str, MetricDoc>) {
    T::register_metrics();
    for doc in T::metrics_documentation() {
        if all.contains_key(doc.name) {
            warn!(
                "Metric name conflict: '{}' registered twice (phase '{}')",
                doc.name,
                T::phase_name()
            );
        } else {
            all.insert(doc.name, doc);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_names_are_unique_across_phases() {
        let mut names: Vec<&str> = SourcesMetrics::metrics_documentation()
            .into_iter()
            .chain(IngestMetrics::metrics_documentation())
            .map(|d| d.name)
            .collect();
        let total = names.len();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), total);
        assert!(names.iter().all(|n| n.starts_with("watch_")));
    }
}
