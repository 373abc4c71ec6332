//! Error-reporter hook.
//!
//! The middleware chain hands captured panics to an [`ErrorReporter`].
//! The transport to an external service is out of scope; the bundled
//! implementation emits a structured log event so reports are never lost
//! silently. Constructed from the `reporter` section of the app config.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::config::Bindable;

/// Reporter section of the application configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReporterConfig {
    /// Reporting endpoint DSN. Empty disables forwarding.
    pub dsn: String,
    /// Environment tag attached to every report.
    pub environment: String,
}

impl Bindable for ReporterConfig {}

/// A captured panic, ready for forwarding.
#[derive(Debug)]
pub struct PanicReport<'a> {
    pub request_id: &'a str,
    pub message: &'a str,
    pub backtrace: &'a str,
}

pub trait ErrorReporter: Send + Sync {
    fn capture_panic(&self, report: &PanicReport<'_>);
}

/// Default reporter: forwards panic reports to the structured log.
pub struct LogReporter {
    environment: String,
    enabled: bool,
}

impl LogReporter {
    #[must_use]
    pub fn new(config: &ReporterConfig) -> Self {
        Self {
            environment: config.environment.clone(),
            enabled: !config.dsn.is_empty(),
        }
    }
}

impl ErrorReporter for LogReporter {
    fn capture_panic(&self, report: &PanicReport<'_>) {
        if !self.enabled {
            return;
        }
        error!(
            rid = report.request_id,
            environment = %self.environment,
            message = report.message,
            "panic reported"
        );
    }
}

/// Build the reporter configured for this process.
#[must_use]
pub fn from_config(config: &ReporterConfig) -> Arc<dyn ErrorReporter> {
    Arc::new(LogReporter::new(config))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reporter_disabled_without_dsn() {
        let reporter = LogReporter::new(&ReporterConfig::default());
        assert!(!reporter.enabled);
    }

    #[test]
    fn reporter_enabled_with_dsn() {
        let reporter = LogReporter::new(&ReporterConfig {
            dsn: "https://key@reports.example.com/42".to_string(),
            environment: "staging".to_string(),
        });
        assert!(reporter.enabled);
        // Capturing must not panic even with empty fields.
        reporter.capture_panic(&PanicReport {
            request_id: "",
            message: "boom",
            backtrace: "",
        });
    }
}
