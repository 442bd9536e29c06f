// Metrics facade. The core reports through an injectable sink so tests can
// record every emission; the production sink forwards to the `metrics`
// registry, which services typically wire to a Prometheus exporter.
use std::sync::Arc;

/// Sink for the core's counter/rate/histogram emissions.
pub trait MetricsSink: Send + Sync {
    /// Monotonic event count.
    fn rate(&self, name: &str, value: u64, tags: &[(String, String)]);

    /// Up/down movement of a level metric.
    fn gauge_delta(&self, name: &str, delta: i64);

    /// Single distribution observation.
    fn histogram(&self, name: &str, value: f64, tags: &[(String, String)]);
}

/// Production sink backed by the `metrics` crate macros.
#[derive(Debug, Default, Clone, Copy)]
pub struct RuntimeSink;

impl MetricsSink for RuntimeSink {
    fn rate(&self, name: &str, value: u64, tags: &[(String, String)]) {
        metrics::counter!(name.to_string(), to_labels(tags)).increment(value);
    }

    fn gauge_delta(&self, name: &str, delta: i64) {
        let gauge = metrics::gauge!(name.to_string());
        if delta >= 0 {
            gauge.increment(delta as f64);
        } else {
            gauge.decrement(-delta as f64);
        }
    }

    fn histogram(&self, name: &str, value: f64, tags: &[(String, String)]) {
        metrics::histogram!(name.to_string(), to_labels(tags)).record(value);
    }
}

fn to_labels(tags: &[(String, String)]) -> Vec<metrics::Label> {
    tags.iter()
        .map(|(key, value)| metrics::Label::new(key.clone(), value.clone()))
        .collect()
}

/// Internal facade with the service's metric names precomputed.
pub(crate) struct ServiceMetrics {
    sink: Arc<dyn MetricsSink>,
    per_request: bool,
    requests: String,
    latency: String,
    errors: String,
    concurrent: String,
    per_connection: String,
}

impl ServiceMetrics {
    pub(crate) fn new(name: &str, per_request: bool, sink: Arc<dyn MetricsSink>) -> Self {
        Self {
            requests: format!("{name}_requests"),
            latency: format!("{name}_latency_ms"),
            errors: format!("{name}_errors"),
            concurrent: format!("{name}_concurrent_requests"),
            per_connection: format!("{name}_requests_per_connection"),
            per_request,
            sink,
        }
    }

    /// Per-request emissions, recorded just before a response is pushed.
    pub(crate) fn response_pushed(&self, latency_ms: u64, tags: &[(String, String)]) {
        if !self.per_request {
            return;
        }
        self.sink.rate(&self.requests, 1, tags);
        self.sink.histogram(&self.latency, latency_ms as f64, tags);
    }

    pub(crate) fn request_failed(&self, class: &'static str) {
        self.sink
            .rate(&self.errors, 1, &[("class".to_string(), class.to_string())]);
    }

    pub(crate) fn concurrent_delta(&self, delta: i64) {
        if delta != 0 {
            self.sink.gauge_delta(&self.concurrent, delta);
        }
    }

    pub(crate) fn connection_closed(&self, num_requests: u64) {
        self.sink
            .histogram(&self.per_connection, num_requests as f64, &[]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MetricEvent, RecordingSink};

    #[test]
    fn names_are_prefixed_with_the_service_name() {
        let sink = Arc::new(RecordingSink::new());
        let metrics = ServiceMetrics::new("demo", true, sink.clone());
        metrics.response_pushed(12, &[]);
        metrics.request_failed("timeout");
        metrics.concurrent_delta(1);
        metrics.connection_closed(3);

        assert_eq!(sink.rate_total("demo_requests"), 1);
        assert_eq!(sink.rate_total_tagged("demo_errors", "class", "timeout"), 1);
        assert_eq!(sink.gauge_value("demo_concurrent_requests"), 1);
        assert_eq!(sink.histogram_values("demo_latency_ms"), vec![12.0]);
        assert_eq!(
            sink.histogram_values("demo_requests_per_connection"),
            vec![3.0]
        );
    }

    #[test]
    fn per_request_metrics_honor_the_gate() {
        let sink = Arc::new(RecordingSink::new());
        let metrics = ServiceMetrics::new("demo", false, sink.clone());
        metrics.response_pushed(12, &[]);
        metrics.request_failed("handler");

        // Errors still count; requests/latency are suppressed.
        assert_eq!(sink.rate_total("demo_requests"), 0);
        assert!(sink.histogram_values("demo_latency_ms").is_empty());
        assert_eq!(sink.rate_total("demo_errors"), 1);
    }

    #[test]
    fn zero_deltas_are_not_emitted() {
        let sink = Arc::new(RecordingSink::new());
        let metrics = ServiceMetrics::new("demo", true, sink.clone());
        metrics.concurrent_delta(0);
        assert!(
            !sink
                .events()
                .iter()
                .any(|event| matches!(event, MetricEvent::GaugeDelta { .. }))
        );
    }
}
