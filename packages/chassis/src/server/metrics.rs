//! Per-endpoint request metrics.

use std::sync::Arc;
use std::time::Instant;

use crate::metrics::MetricsRegistry;

/// Scores every handled request into the latency histogram and, for
/// failures, the error counter, both labelled `(service, endpoint)`.
#[derive(Clone)]
pub struct RequestMetrics {
    registry: Arc<MetricsRegistry>,
}

impl RequestMetrics {
    #[must_use]
    pub fn new(registry: Arc<MetricsRegistry>) -> Self {
        Self { registry }
    }

    /// Observe one handler invocation. Latency is recorded regardless of
    /// outcome; the error counter increments whenever the handler returned
    /// an error, whatever the status code.
    pub fn score(&self, service: &str, endpoint: &str, started: Instant, failed: bool) {
        let labels = [("service", service), ("endpoint", endpoint)];
        if failed {
            self.registry.counter("error_count", &labels).increment(1);
        }
        self.registry
            .histogram("request_latency", &labels)
            .record(started.elapsed().as_secs_f64());
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use crate::metrics::MetricsConfig;

    use super::*;

    fn metrics() -> (RequestMetrics, Arc<MetricsRegistry>) {
        let registry = Arc::new(
            MetricsRegistry::new(&MetricsConfig {
                namespace: "testns".to_string(),
                buckets: Vec::new(),
            })
            .unwrap(),
        );
        (RequestMetrics::new(registry.clone()), registry)
    }

    #[test]
    fn success_scores_latency_only() {
        let (metrics, registry) = metrics();
        metrics.score("svc", "ep", Instant::now(), false);

        let text = registry.render();
        assert!(text.contains(
            "testns_request_latency_count{service=\"svc\",endpoint=\"ep\"} 1"
        ) || text.contains(
            "testns_request_latency_count{endpoint=\"ep\",service=\"svc\"} 1"
        ), "{text}");
        assert!(!text.contains("testns_error_count"), "{text}");
    }

    #[test]
    fn failure_scores_latency_and_error() {
        let (metrics, registry) = metrics();
        metrics.score("svc", "ep", Instant::now(), true);
        metrics.score("svc", "ep", Instant::now(), true);

        let text = registry.render();
        assert!(text.contains("testns_error_count"), "{text}");
        assert!(text.contains("} 2"), "{text}");
    }
}
