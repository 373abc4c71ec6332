//! Sample chassis application: one service computing factorials.
//!
//! Demonstrates the full registration flow: a typed config section with
//! declarative defaults, a factory receiving the dependency bundle, an
//! instrumented endpoint with a path variable, and a worker that reports
//! readiness then parks on the shutdown token.

use async_trait::async_trait;
use http::Method;
use serde::{Deserialize, Serialize};
use tracing::info;

use chassis::service::EndpointDef;
use chassis::{
    handler, AppService, ApiRequest, Application, Bindable, Entry, FieldKind, FieldSpec,
    HandlerError, ServiceOptions, Shutdown,
};

const SERVICE_NAME: &str = "factorial";

/// Service config, bound from the `factorial` key of the YAML file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct FactorialConfig {
    api_root: String,
    count_bits: bool,
}

impl Bindable for FactorialConfig {
    fn schema() -> &'static [Entry] {
        const ENTRIES: &[Entry] = &[
            Entry::Field(FieldSpec::new("api_root", FieldKind::Str).with_default("/api")),
            Entry::Field(FieldSpec::new("count_bits", FieldKind::Bool)),
        ];
        ENTRIES
    }
}

struct FactorialService {
    config: FactorialConfig,
    reporter: chassis::ServiceReporter,
}

impl FactorialService {
    fn create(config: FactorialConfig, options: ServiceOptions) -> anyhow::Result<Self> {
        Ok(Self {
            config,
            reporter: options.reporter,
        })
    }
}

#[async_trait]
impl AppService for FactorialService {
    fn handlers(&self) -> Vec<EndpointDef> {
        let count_bits = self.config.count_bits;
        vec![EndpointDef {
            endpoint: "factorial".to_string(),
            method: Method::GET,
            path: format!(
                "{}/factorial/{{number:[0-9]+}}",
                self.config.api_root.trim_end_matches('/')
            ),
            handler: handler(move |req: ApiRequest| async move {
                factorial_handler(&req, count_bits)
            }),
        }]
    }

    async fn run(&self, shutdown: Shutdown) -> anyhow::Result<()> {
        self.reporter.ready();
        shutdown.cancelled().await;
        info!("service terminated");
        Ok(())
    }
}

fn factorial_handler(req: &ApiRequest, count_bits: bool) -> chassis::HandlerResult {
    let number: u32 = req
        .var("number")
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| HandlerError::bad_request("invalid number"))?;

    let result =
        factorial(number).ok_or_else(|| HandlerError::bad_request("number too large"))?;

    if count_bits {
        let bits = 128 - result.leading_zeros();
        return Ok(chassis::reply::object(&serde_json::json!({ "bits": bits })));
    }
    Ok(chassis::reply::object(&serde_json::json!({ "result": result })))
}

/// n! while it fits into u128 (n <= 34).
fn factorial(n: u32) -> Option<u128> {
    (1..=u128::from(n)).try_fold(1u128, u128::checked_mul)
}

#[tokio::main]
async fn main() {
    let mut app = Application::new(SERVICE_NAME, env!("CARGO_PKG_VERSION"));
    if let Err(err) = app.register(
        SERVICE_NAME,
        FactorialConfig::default(),
        FactorialService::create,
    ) {
        eprintln!("register service: {err}");
        std::process::exit(1);
    }
    if let Err(err) = app.run().await {
        eprintln!("fatal: {err:#}");
        std::process::exit(1);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factorial_values() {
        assert_eq!(factorial(0), Some(1));
        assert_eq!(factorial(1), Some(1));
        assert_eq!(factorial(5), Some(120));
        assert_eq!(factorial(34), Some(295_232_799_039_604_140_847_618_609_643_520_000_000));
        assert_eq!(factorial(35), None, "35! overflows u128");
    }

    #[test]
    fn config_defaults_bind() {
        let bound: FactorialConfig =
            chassis::config::bind_section("factorial", &FactorialConfig::default(), None)
                .unwrap();
        assert_eq!(bound.api_root, "/api");
        assert!(!bound.count_bits);
    }
}
