//! `chassis` — application lifecycle kernel for backend services.
//!
//! Composes user-defined services into one process: declarative
//! registration with YAML config binding, a two-port HTTP plane (API +
//! operations) behind a production middleware stack, per-service readiness
//! reporting, and a cooperative shutdown protocol driven by one shared
//! cancellation scope.

pub mod app;
pub mod auth;
pub mod config;
pub mod metrics;
pub mod ops;
pub mod reply;
pub mod report;
pub mod server;
pub mod service;
pub mod shutdown;
pub mod status;

pub use app::{AppConfig, AppHandle, Application, BoundPorts, RegisterError};
pub use config::{Bindable, ConfigError, Entry, FieldKind, FieldSpec};
pub use metrics::{MetricsConfig, MetricsRegistry};
pub use server::config::HttpConfig;
pub use server::handler::{handler, ApiHandler, ApiRequest, HandlerError, HandlerResult};
pub use server::ApiServer;
pub use service::{AppService, EndpointDef, ServiceOptions};
pub use shutdown::{Shutdown, ShutdownController};
pub use status::{ServiceReporter, StatusRegister};
