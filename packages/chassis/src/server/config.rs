//! API server configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{duration, Bindable, Entry, FieldKind, FieldSpec};
use crate::metrics::{MetricsConfig, SCHEMA as METRICS_SCHEMA};

/// Descriptor table for [`HttpConfig`]; referenced from the app config
/// schema as the `http` sub-section.
pub const SCHEMA: &[Entry] = &[
    Entry::Field(FieldSpec::new("port", FieldKind::UInt).with_default("8080")),
    Entry::Field(FieldSpec::new("ops_port", FieldKind::UInt).with_default("8081")),
    Entry::Field(FieldSpec::new("base_path", FieldKind::Str)),
    Entry::Field(FieldSpec::new("use_tls", FieldKind::Bool)),
    Entry::Field(FieldSpec::new("tls_cert", FieldKind::Str)),
    Entry::Field(FieldSpec::new("tls_key", FieldKind::Str)),
    Entry::Field(FieldSpec::new("tls_ca", FieldKind::Str)),
    Entry::Field(FieldSpec::new("tls_use_client_cert", FieldKind::Bool)),
    Entry::Field(FieldSpec::new("tls_client_ca", FieldKind::Str)),
    Entry::Field(FieldSpec::new("token", FieldKind::Str)),
    Entry::Field(FieldSpec::new("rate_limit", FieldKind::Float).with_default("10000")),
    Entry::Field(FieldSpec::new("open_conn_limit", FieldKind::Int).with_default("1000")),
    Entry::Field(FieldSpec::new("read_timeout", FieldKind::Duration).with_default("5m")),
    Entry::Field(FieldSpec::new("shutdown_timeout", FieldKind::Duration).with_default("2s")),
    Entry::Section {
        key: "metrics",
        entries: METRICS_SCHEMA,
    },
];

/// Server parameters: ports, TLS material, auth token, back-pressure
/// limits, and timeouts. Struct defaults mirror the descriptor table so a
/// hand-built config behaves like a bound one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Port the API listens on; 0 means OS-assigned.
    pub port: u16,
    /// Port the operations server listens on; 0 means OS-assigned.
    pub ops_port: u16,
    /// Prefix prepended to every registered route.
    pub base_path: String,
    pub use_tls: bool,
    pub tls_cert: PathBuf,
    pub tls_key: PathBuf,
    /// Optional CA certificate concatenated with the server certificate.
    pub tls_ca: PathBuf,
    /// Require and verify a client certificate.
    pub tls_use_client_cert: bool,
    /// CA pool used to verify client certificates.
    pub tls_client_ca: PathBuf,
    /// Secret auth token; empty disables authentication.
    pub token: String,
    /// Sustained request rate limit (RPS).
    pub rate_limit: f64,
    /// Open incoming connection limit.
    pub open_conn_limit: i64,
    /// Read timeout enforced on the listener (closes idle keep-alives).
    #[serde(with = "duration")]
    pub read_timeout: Duration,
    /// Bound on connection draining at shutdown.
    #[serde(with = "duration")]
    pub shutdown_timeout: Duration,
    pub metrics: MetricsConfig,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            ops_port: 8081,
            base_path: String::new(),
            use_tls: false,
            tls_cert: PathBuf::new(),
            tls_key: PathBuf::new(),
            tls_ca: PathBuf::new(),
            tls_use_client_cert: false,
            tls_client_ca: PathBuf::new(),
            token: String::new(),
            rate_limit: 10_000.0,
            open_conn_limit: 1000,
            read_timeout: Duration::from_secs(300),
            shutdown_timeout: Duration::from_secs(2),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Bindable for HttpConfig {
    fn schema() -> &'static [Entry] {
        SCHEMA
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
