//! Service contract.
//!
//! A service is a user-defined module registered with the application: it
//! declares a finite set of HTTP endpoints and a long-running worker that
//! must return once the shutdown token fires.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use http::Method;

use crate::metrics::MetricsRegistry;
use crate::server::handler::ApiHandler;
use crate::shutdown::Shutdown;
use crate::status::ServiceReporter;

/// One `(method, path)` route owned by a service.
///
/// `endpoint` is the metric label for the route; the path may embed
/// variables (`/factorial/{n}`) resolvable by name at request time.
pub struct EndpointDef {
    pub endpoint: String,
    pub method: Method,
    pub path: String,
    pub handler: ApiHandler,
}

/// Dependencies handed to a service factory by the orchestrator.
pub struct ServiceOptions {
    /// Registry for service-owned metrics.
    pub metrics: Arc<MetricsRegistry>,
    /// Readiness reporter scoped to this service's name.
    pub reporter: ServiceReporter,
    /// Logging span carrying the service name; instrument `run` with it.
    pub span: tracing::Span,
    /// Directory of the configuration file (or the working directory when
    /// the config was injected).
    pub config_dir: PathBuf,
    /// Production flag from the app config.
    pub production: bool,
}

/// A live service instance produced by its factory.
#[async_trait]
pub trait AppService: Send + Sync + 'static {
    /// Endpoint declarations registered with the API server at startup.
    fn handlers(&self) -> Vec<EndpointDef>;

    /// Long-running worker. Must report readiness through the reporter it
    /// received at construction and return promptly when `shutdown` fires.
    async fn run(&self, shutdown: Shutdown) -> anyhow::Result<()>;
}
