//! Application-level configuration (the `app` section of the YAML file).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{duration, Bindable, Entry, FieldKind, FieldSpec};
use crate::report::ReporterConfig;
use crate::server::config::{HttpConfig, SCHEMA as HTTP_SCHEMA};

pub const SCHEMA: &[Entry] = &[
    Entry::Section {
        key: "http",
        entries: HTTP_SCHEMA,
    },
    Entry::Section {
        key: "reporter",
        entries: &[],
    },
    Entry::Field(FieldSpec::new("shutdown_delay", FieldKind::Duration).with_default("2s")),
    Entry::Field(
        FieldSpec::new("log_level", FieldKind::Str)
            .with_default("info")
            .with_choices(&["trace", "debug", "info", "warn", "error"]),
    ),
    Entry::Field(FieldSpec::new("production", FieldKind::Bool)),
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// HTTP endpoint configuration (API and operations servers).
    pub http: HttpConfig,
    /// Error reporter configuration.
    pub reporter: ReporterConfig,
    /// Pause between flipping not-ready and process exit, so external
    /// probes observe the transition.
    #[serde(with = "duration")]
    pub shutdown_delay: Duration,
    /// Log level in production mode.
    pub log_level: String,
    /// Production mode (JSON log output).
    pub production: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            http: HttpConfig::default(),
            reporter: ReporterConfig::default(),
            shutdown_delay: Duration::from_secs(2),
            log_level: "info".to_string(),
            production: false,
        }
    }
}

impl Bindable for AppConfig {
    fn schema() -> &'static [Entry] {
        SCHEMA
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
