//! Prometheus metrics registry.
//!
//! Wraps a locally-owned `PrometheusRecorder` so several registries can
//! coexist in one process (no global recorder). All metric names are
//! prefixed with the configured namespace; the `request_latency` histogram
//! gets explicit buckets, configurable with a sub-second default range.

use metrics::{Counter, Gauge, Histogram, Key, Label, Level, Metadata, Recorder};
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle, PrometheusRecorder};
use serde::{Deserialize, Serialize};

use crate::config::{Bindable, Entry, FieldKind, FieldSpec};

/// Default latency buckets, 2ms to 1.5s.
const DEFAULT_BUCKETS: &[f64] = &[
    0.002, 0.004, 0.006, 0.008, 0.010, 0.020, 0.050, 0.100, 0.200, 0.300, 0.500, 0.700, 0.900,
    1.100, 1.300, 1.500,
];

static METADATA: Metadata<'static> = Metadata::new(module_path!(), Level::INFO, None);

/// Descriptor table for [`MetricsConfig`]; referenced from the HTTP config
/// schema as the `metrics` sub-section.
pub const SCHEMA: &[Entry] = &[
    Entry::Field(FieldSpec::new("namespace", FieldKind::Str).required()),
    Entry::Field(FieldSpec::new("buckets", FieldKind::List)),
];

/// Metrics section of the HTTP server configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Namespace prefixed to every metric name.
    pub namespace: String,
    /// Buckets for the request latency histogram.
    pub buckets: Vec<f64>,
}

impl Bindable for MetricsConfig {
    fn schema() -> &'static [Entry] {
        SCHEMA
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("build metrics recorder: {0}")]
    Build(#[from] BuildError),
}

/// Registry handing out namespaced metric handles and rendering the text
/// exposition for `/metrics`.
pub struct MetricsRegistry {
    recorder: PrometheusRecorder,
    handle: PrometheusHandle,
    namespace: String,
}

impl MetricsRegistry {
    pub fn new(config: &MetricsConfig) -> Result<Self, MetricsError> {
        let buckets: &[f64] = if config.buckets.is_empty() {
            DEFAULT_BUCKETS
        } else {
            &config.buckets
        };
        let recorder = PrometheusBuilder::new()
            .set_buckets_for_metric(Matcher::Suffix("request_latency".to_string()), buckets)?
            .build_recorder();
        let handle = recorder.handle();
        Ok(Self {
            recorder,
            handle,
            namespace: config.namespace.clone(),
        })
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn counter(&self, name: &str, labels: &[(&'static str, &str)]) -> Counter {
        self.recorder.register_counter(&self.key(name, labels), &METADATA)
    }

    pub fn gauge(&self, name: &str, labels: &[(&'static str, &str)]) -> Gauge {
        self.recorder.register_gauge(&self.key(name, labels), &METADATA)
    }

    pub fn histogram(&self, name: &str, labels: &[(&'static str, &str)]) -> Histogram {
        self.recorder.register_histogram(&self.key(name, labels), &METADATA)
    }

    /// Prometheus text exposition (format 0.0.4) of everything recorded.
    #[must_use]
    pub fn render(&self) -> String {
        self.handle.run_upkeep();
        self.handle.render()
    }

    fn key(&self, name: &str, labels: &[(&'static str, &str)]) -> Key {
        let labels: Vec<Label> = labels
            .iter()
            .map(|(k, v)| Label::new(*k, (*v).to_string()))
            .collect();
        Key::from_parts(format!("{}_{name}", self.namespace), labels)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
