//! Fetch-phase metrics: outbound requests to publishers.

use crate::metrics::{phase_metric, MetricDoc, MetricType, PhaseMetrics};

pub struct SourcesMetrics;

impl SourcesMetrics {
    pub fn record_fetch_success(source_id: &str, duration_secs: f64, payload_bytes: usize) {
        let source = source_id.to_string();
        ::metrics::counter!(phase_metric!(counter, "sources", "fetch_success"), "source" => source.clone())
            .increment(1);
        ::metrics::histogram!(phase_metric!(histogram, "sources", "fetch_duration_seconds"), "source" => source.clone())
            .record(duration_secs);
        ::metrics::histogram!(phase_metric!(histogram, "sources", "payload_bytes"), "source" => source)
            .record(payload_bytes as f64);
    }

    pub fn record_fetch_error(source_id: &str, error_type: &'static str) {
        ::metrics::counter!(
            phase_metric!(counter, "sources", "fetch_error"),
            "source" => source_id.to_string(),
            "error_type" => error_type
        )
        .increment(1);
    }
}

impl PhaseMetrics for SourcesMetrics {
    fn register_metrics() {
        use ::metrics::{counter, histogram};

        let _ = counter!(phase_metric!(counter, "sources", "fetch_success"));
        let _ = counter!(phase_metric!(counter, "sources", "fetch_error"));
        let _ = histogram!(phase_metric!(histogram, "sources", "fetch_duration_seconds"));
        let _ = histogram!(phase_metric!(histogram, "sources", "payload_bytes"));
    }

    fn phase_name() -> &'static str {
        "sources"
    }

    fn metrics_documentation() -> Vec<MetricDoc> {
        vec![
            MetricDoc {
                name: phase_metric!(counter, "sources", "fetch_success"),
                metric_type: MetricType::Counter,
                help: "Successful publisher fetches",
                labels: vec!["source"],
            },
            MetricDoc {
                name: phase_metric!(counter, "sources", "fetch_error"),
                metric_type: MetricType::Counter,
                help: "Failed publisher fetches by failure class",
                labels: vec!["source", "error_type"],
            },
            MetricDoc {
                name: phase_metric!(histogram, "sources", "fetch_duration_seconds"),
                metric_type: MetricType::Histogram,
                help: "Duration of publisher fetches in seconds",
                labels: vec!["source"],
            },
            MetricDoc {
                name: phase_metric!(histogram, "sources", "payload_bytes"),
                metric_type: MetricType::Histogram,
                help: "Size of fetched payloads in bytes",
                labels: vec!["source"],
            },
        ]
    }
}
