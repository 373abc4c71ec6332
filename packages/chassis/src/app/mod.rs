//! Lifecycle orchestrator.
//!
//! Composes registered services into one process: binds configuration,
//! builds the collaborators (status register, metrics registry, error
//! reporter, both HTTP servers), invokes each service factory, fans the
//! returned handlers into the API server, and supervises every worker
//! under a single cancellation scope. The first termination event (signal,
//! worker error) cancels the scope; the orchestrator then drains, flips
//! readiness off, sleeps the shutdown delay, and returns.

pub mod config;

use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use serde::Serialize;
use serde_yaml::{Mapping, Value};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, info_span, Instrument};
use tracing_subscriber::EnvFilter;

use crate::config::{bind_section, Bindable, ConfigError};
use crate::metrics::MetricsRegistry;
use crate::ops::OpsServer;
use crate::report;
use crate::server::ApiServer;
use crate::service::{AppService, ServiceOptions};
use crate::shutdown::{Shutdown, ShutdownController};
use crate::status::StatusRegister;

pub use self::config::AppConfig;

#[derive(Debug, thiserror::Error)]
pub enum RegisterError {
    #[error("service name must start with a letter and contain only letters and underscores: {0:?}")]
    InvalidName(String),
    #[error("service already registered: {0}")]
    Duplicate(String),
}

/// Addresses actually bound by the two servers, published once startup
/// reaches the serving phase. Useful with OS-assigned ports.
#[derive(Debug, Clone, Copy)]
pub struct BoundPorts {
    pub api: std::net::SocketAddr,
    pub ops: std::net::SocketAddr,
}

/// Cheap handle onto a running application: observe the bound ports and
/// trigger shutdown without a signal.
#[derive(Clone)]
pub struct AppHandle {
    controller: ShutdownController,
    ports: watch::Receiver<Option<BoundPorts>>,
}

impl AppHandle {
    /// Cancel the application's scope, as a received signal would.
    pub fn shutdown(&self) {
        self.controller.trigger();
    }

    /// Wait for the servers to bind. `None` if the application stopped
    /// before reaching the serving phase.
    pub async fn bound(&self) -> Option<BoundPorts> {
        let mut rx = self.ports.clone();
        loop {
            if let Some(ports) = *rx.borrow() {
                return Some(ports);
            }
            if rx.changed().await.is_err() {
                return *rx.borrow();
            }
        }
    }
}

type BoundConfig = Box<dyn Any + Send>;
type BindFn = Box<dyn Fn(Option<&Value>) -> Result<(BoundConfig, Value), ConfigError> + Send>;
type BuildFn =
    Box<dyn FnOnce(BoundConfig, ServiceOptions) -> anyhow::Result<Arc<dyn AppService>> + Send>;

struct ServiceDef {
    name: String,
    bind: BindFn,
    build: BuildFn,
}

#[derive(Debug, Parser)]
struct CliArgs {
    /// Application YAML config file.
    #[arg(long = "config-file")]
    config_file: Option<PathBuf>,
    /// Print the merged configuration and exit.
    #[arg(long = "print-config", default_value_t = false)]
    print_config: bool,
}

/// The application kernel. Register services, then call [`Application::run`]
/// (config file) or [`Application::run_with`] (injected config).
pub struct Application {
    name: String,
    version: String,
    defs: Vec<ServiceDef>,
    controller: ShutdownController,
    ports_tx: watch::Sender<Option<BoundPorts>>,
    ports_rx: watch::Receiver<Option<BoundPorts>>,
}

impl Application {
    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        let (ports_tx, ports_rx) = watch::channel(None);
        Self {
            name: name.into(),
            version: version.into(),
            defs: Vec::new(),
            controller: ShutdownController::new(),
            ports_tx,
            ports_rx,
        }
    }

    #[must_use]
    pub fn handle(&self) -> AppHandle {
        AppHandle {
            controller: self.controller.clone(),
            ports: self.ports_rx.clone(),
        }
    }

    /// Register a service under `name`. `config` supplies the starting
    /// values for the service's YAML section; the bound section is handed
    /// to `factory` exactly once during [`Application::run`].
    pub fn register<C, S, F>(
        &mut self,
        name: &str,
        config: C,
        factory: F,
    ) -> Result<(), RegisterError>
    where
        C: Bindable + Send + 'static,
        S: AppService,
        F: FnOnce(C, ServiceOptions) -> anyhow::Result<S> + Send + 'static,
    {
        if !valid_service_name(name) {
            return Err(RegisterError::InvalidName(name.to_string()));
        }
        if self.defs.iter().any(|def| def.name == name) {
            return Err(RegisterError::Duplicate(name.to_string()));
        }

        let section_name = name.to_string();
        let bind: BindFn = Box::new(move |node| {
            let bound: C = bind_section(&section_name, &config, node)?;
            let dump = serde_yaml::to_value(&bound).map_err(|source| ConfigError::Encode {
                section: section_name.clone(),
                source,
            })?;
            Ok((Box::new(bound) as BoundConfig, dump))
        });

        let build: BuildFn = Box::new(move |bound, options| {
            let config = *bound
                .downcast::<C>()
                .expect("service config type preserved between bind and build");
            let service = factory(config, options)?;
            Ok(Arc::new(service) as Arc<dyn AppService>)
        });

        self.defs.push(ServiceDef {
            name: name.to_string(),
            bind,
            build,
        });
        Ok(())
    }

    /// Run with configuration from the command line (`--config-file=PATH`).
    pub async fn run(self) -> anyhow::Result<()> {
        let args = CliArgs::parse();
        let Some(path) = args.config_file else {
            anyhow::bail!(
                "usage: {} --config-file=/path/to/config.yaml",
                std::env::args().next().unwrap_or_default()
            );
        };
        let root = crate::config::load_file(&path)?;
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        self.run_root(root, dir, args.print_config).await
    }

    /// Run with an injected, already-populated configuration object. Its
    /// serialised form must be a mapping keyed like the YAML file: `app`
    /// plus one key per registered service.
    pub async fn run_with<T: Serialize>(self, config: T) -> anyhow::Result<()> {
        let value = serde_yaml::to_value(&config)
            .map_err(|err| anyhow::anyhow!("serialize injected config: {err}"))?;
        let Value::Mapping(root) = value else {
            anyhow::bail!("injected config must serialize to a mapping");
        };
        let dir = std::env::current_dir()?;
        self.run_root(root, dir, false).await
    }

    async fn run_root(
        mut self,
        root: Mapping,
        config_dir: PathBuf,
        print_config: bool,
    ) -> anyhow::Result<()> {
        let defs = std::mem::take(&mut self.defs);

        // Bind the app section first, then every registered service's
        // section, so all config errors surface before anything starts.
        let app_cfg: AppConfig = bind_section(
            "app",
            &AppConfig::default(),
            crate::config::section(&root, "app"),
        )?;
        let mut bound_configs = Vec::with_capacity(defs.len());
        for def in &defs {
            let node = crate::config::section(&root, &def.name);
            bound_configs.push((def.bind)(node)?);
        }

        if print_config {
            let dumps = defs
                .iter()
                .zip(&bound_configs)
                .map(|(def, (_, dump))| (def.name.clone(), dump.clone()))
                .collect::<Vec<_>>();
            print!("{}", merged_config_yaml(&app_cfg, &dumps)?);
            return Ok(());
        }

        init_tracing(&app_cfg);
        info!(
            name = %self.name,
            version = %self.version,
            workers = available_workers(),
            "starting application"
        );
        log_process_identity();

        // Collaborators, in dependency order.
        let status = StatusRegister::new();
        let app_reporter = status
            .register("app")
            .map_err(|err| anyhow::anyhow!("register app status: {err}"))?;
        let registry = Arc::new(MetricsRegistry::new(&app_cfg.http.metrics)?);
        let reporter = report::from_config(&app_cfg.reporter);

        let mut api = ApiServer::new(app_cfg.http.clone(), Arc::clone(&registry), reporter).await?;
        let ops = OpsServer::new(app_cfg.http.ops_port, status.clone(), Arc::clone(&registry))
            .await?;

        // Build each service and fan its handlers into the API server.
        let mut services: Vec<(String, Arc<dyn AppService>)> = Vec::with_capacity(defs.len());
        for (def, (bound, _)) in defs.into_iter().zip(bound_configs) {
            let service_reporter = status
                .register(&def.name)
                .map_err(|err| anyhow::anyhow!("create service reporter: {err}"))?;
            let span = info_span!("service", service = %def.name);
            let options = ServiceOptions {
                metrics: Arc::clone(&registry),
                reporter: service_reporter,
                span: span.clone(),
                config_dir: config_dir.clone(),
                production: app_cfg.production,
            };
            let service = (def.build)(bound, options)
                .map_err(|err| err.context(format!("create service {}", def.name)))?;
            for endpoint in service.handlers() {
                api.handle_func(
                    &def.name,
                    &endpoint.endpoint,
                    endpoint.method,
                    &endpoint.path,
                    endpoint.handler,
                );
            }
            services.push((def.name, service));
        }

        let _ = self.ports_tx.send(Some(BoundPorts {
            api: api.local_addr(),
            ops: ops.local_addr(),
        }));

        app_reporter.ready();

        // Launch every worker under the shared cancellation scope.
        let controller = self.controller.clone();
        let api = Arc::new(api);
        let ops = Arc::new(ops);
        let mut workers: JoinSet<anyhow::Result<()>> = JoinSet::new();
        {
            let api = Arc::clone(&api);
            let token = controller.token();
            workers.spawn(async move { api.run(token).await.map_err(|e| e.context("api server")) });
        }
        {
            let ops = Arc::clone(&ops);
            let token = controller.token();
            workers
                .spawn(async move { ops.run(token).await.map_err(|e| e.context("healthcheck server")) });
        }
        for (name, service) in &services {
            let service = Arc::clone(service);
            let token = controller.token();
            let span = info_span!("service", service = %name);
            workers.spawn(async move { service.run(token).await }.instrument(span));
        }
        {
            let controller = controller.clone();
            let token = controller.token();
            workers.spawn(signal_watcher(controller, token));
        }

        // Supervise: any worker error cancels the scope; normal returns
        // are expected once cancellation propagates.
        let mut failed = false;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    error!(error = %format!("{err:#}"), "worker terminated with error");
                    failed = true;
                    controller.trigger();
                }
                Err(join_err) => {
                    error!(error = %join_err, "worker panicked");
                    failed = true;
                    controller.trigger();
                }
            }
        }

        // Shutdown tail: flip readiness off, give external probes time to
        // observe it, then leave.
        app_reporter.not_ready();
        status.set_all_not_ready();
        info!(
            delay = %crate::config::format_duration(app_cfg.shutdown_delay),
            "shutting down"
        );
        tokio::time::sleep(app_cfg.shutdown_delay).await;

        if failed {
            error!("terminated with error");
        } else {
            info!("terminated successfully");
        }
        Ok(())
    }
}

/// Service names follow the unquoted-YAML-key grammar: a letter followed
/// by letters or underscores. Digits are not admitted anywhere.
fn valid_service_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphabetic() || c == '_')
}

fn available_workers() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1)
}

/// Who the process runs as, logged once at startup.
fn log_process_identity() {
    let username = std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());
    #[cfg(unix)]
    {
        // SAFETY: getuid/getgid take no arguments and cannot fail.
        let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
        info!(user = %username, uid, gid, "process identity");
    }
    #[cfg(not(unix))]
    info!(user = %username, "process identity");
}

fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = if config.production {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    // A subscriber may already be installed (embedding binary or tests).
    let _ = result;
}

/// One YAML document with the merged `app` section plus every service
/// section under its registration key.
fn merged_config_yaml(
    app_cfg: &AppConfig,
    services: &[(String, Value)],
) -> anyhow::Result<String> {
    let mut all = Mapping::new();
    all.insert(
        Value::String("app".to_string()),
        serde_yaml::to_value(app_cfg)?,
    );
    for (name, dump) in services {
        all.insert(Value::String(name.clone()), dump.clone());
    }
    Ok(serde_yaml::to_string(&Value::Mapping(all))?)
}

/// Observe INT, TERM, and QUIT; the first one cancels the scope.
async fn signal_watcher(controller: ShutdownController, token: Shutdown) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        let mut quit = signal(SignalKind::quit())?;

        let received = tokio::select! {
            () = token.cancelled() => None,
            _ = interrupt.recv() => Some("SIGINT"),
            _ = terminate.recv() => Some("SIGTERM"),
            _ = quit.recv() => Some("SIGQUIT"),
        };
        if let Some(name) = received {
            info!(signal = name, "signal received");
            controller.trigger();
        }
    }
    #[cfg(not(unix))]
    {
        tokio::select! {
            () = token.cancelled() => {}
            _ = tokio::signal::ctrl_c() => {
                info!(signal = "ctrl-c", "signal received");
                controller.trigger();
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
