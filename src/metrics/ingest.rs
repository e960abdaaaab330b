//! Change detection, entity upsert and run lifecycle metrics.

use crate::metrics::{phase_metric, MetricDoc, MetricType, PhaseMetrics};
use crate::types::RunStatus;

pub struct IngestMetrics;

impl IngestMetrics {
    pub fn record_snapshot_written(source_id: &str) {
        ::metrics::counter!(phase_metric!(counter, "ingest", "snapshots_written"), "source" => source_id.to_string())
            .increment(1);
    }

    pub fn record_unchanged(source_id: &str) {
        ::metrics::counter!(phase_metric!(counter, "ingest", "unchanged_payloads"), "source" => source_id.to_string())
            .increment(1);
    }

    pub fn record_entities(source_id: &str, upserted: usize, skipped: usize) {
        let source = source_id.to_string();
        ::metrics::counter!(phase_metric!(counter, "ingest", "entities_upserted"), "source" => source.clone())
            .increment(upserted as u64);
        ::metrics::counter!(phase_metric!(counter, "ingest", "rows_skipped"), "source" => source)
            .increment(skipped as u64);
    }

    pub fn record_run_finished(source_id: &str, status: RunStatus, duration_secs: f64) {
        let source = source_id.to_string();
        ::metrics::counter!(
            phase_metric!(counter, "ingest", "runs_finished"),
            "source" => source.clone(),
            "status" => status.as_str()
        )
        .increment(1);
        ::metrics::histogram!(phase_metric!(histogram, "ingest", "run_duration_seconds"), "source" => source)
            .record(duration_secs);
    }
}

impl PhaseMetrics for IngestMetrics {
    fn register_metrics() {
        use ::metrics::{counter, histogram};

        let _ = counter!(phase_metric!(counter, "ingest", "snapshots_written"));
        let _ = counter!(phase_metric!(counter, "ingest", "unchanged_payloads"));
        let _ = counter!(phase_metric!(counter, "ingest", "entities_upserted"));
        let _ = counter!(phase_metric!(counter, "ingest", "rows_skipped"));
        let _ = counter!(phase_metric!(counter, "ingest", "runs_finished"));
        let _ = histogram!(phase_metric!(histogram, "ingest", "run_duration_seconds"));
    }

    fn phase_name() -> &'static str {
        "ingest"
    }

    fn metrics_documentation() -> Vec<MetricDoc> {
        vec![
            MetricDoc {
                name: phase_metric!(counter, "ingest", "snapshots_written"),
                metric_type: MetricType::Counter,
                help: "Snapshots appended because the payload checksum changed",
                labels: vec!["source"],
            },
            MetricDoc {
                name: phase_metric!(counter, "ingest", "unchanged_payloads"),
                metric_type: MetricType::Counter,
                help: "Fetches whose checksum matched the latest snapshot",
                labels: vec!["source"],
            },
            MetricDoc {
                name: phase_metric!(counter, "ingest", "entities_upserted"),
                metric_type: MetricType::Counter,
                help: "Entities inserted or refreshed",
                labels: vec!["source"],
            },
            MetricDoc {
                name: phase_metric!(counter, "ingest", "rows_skipped"),
                metric_type: MetricType::Counter,
                help: "Malformed or nameless rows dropped by parsers",
                labels: vec!["source"],
            },
            MetricDoc {
                name: phase_metric!(counter, "ingest", "runs_finished"),
                metric_type: MetricType::Counter,
                help: "Ingestion runs reaching a terminal state",
                labels: vec!["source", "status"],
            },
            MetricDoc {
                name: phase_metric!(histogram, "ingest", "run_duration_seconds"),
                metric_type: MetricType::Histogram,
                help: "Wall-clock duration of ingestion runs",
                labels: vec!["source"],
            },
        ]
    }
}
