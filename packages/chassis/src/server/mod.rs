//! API-facing HTTP server.
//!
//! The listener binds eagerly during construction so port and TLS failures
//! surface at startup. Routes are registered through [`ApiServer::handle_func`],
//! each wrapped in per-endpoint instrumentation; the safety middlewares
//! (connection cap, rate limit, auth, panic capture) are installed once
//! around the router. `run` accepts connections until the shutdown token
//! fires, then drains in-flight connections under `shutdown_timeout`.

pub mod config;
pub mod conn;
pub mod handler;
pub mod instrument;
pub mod limit;
pub mod metrics;
pub mod middleware;
pub mod tls;

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::response::Response;
use axum::Router;
use http::{Method, Request};
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tower::{Service, ServiceBuilder, ServiceExt};
use tracing::{debug, info, warn};

use crate::auth::{AuthProvider, TokenAuth};
use crate::metrics::MetricsRegistry;
use crate::report::ErrorReporter;
use crate::shutdown::Shutdown;

use self::config::HttpConfig;
use self::conn::{ConnGuard, ConnectionWatcher, PeerAddr};
use self::handler::ApiHandler;
use self::limit::RateLimiter;
use self::metrics::RequestMetrics;
use self::middleware::{AuthLayer, ConnLimitLayer, PanicCaptureLayer, RateLimitLayer};

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("init listener: {0}")]
    Bind(std::io::Error),
    #[error(transparent)]
    Tls(#[from] tls::TlsError),
}

pub struct ApiServer {
    config: HttpConfig,
    listener: TcpListener,
    local_addr: SocketAddr,
    router: Router,
    watcher: Arc<ConnectionWatcher>,
    limiter: Arc<RateLimiter>,
    auth: Option<Arc<dyn AuthProvider>>,
    reporter: Arc<dyn ErrorReporter>,
    metrics: RequestMetrics,
    tls_acceptor: Option<TlsAcceptor>,
}

impl std::fmt::Debug for ApiServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiServer")
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

impl ApiServer {
    /// Build the server: listener bound, TLS material loaded, limiters and
    /// watcher allocated. No traffic is served until [`ApiServer::run`].
    pub async fn new(
        config: HttpConfig,
        registry: Arc<MetricsRegistry>,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Result<Self, ServerError> {
        let watcher = Arc::new(ConnectionWatcher::new(&registry));
        let limiter = Arc::new(RateLimiter::new(config.rate_limit));
        let auth = (!config.token.is_empty())
            .then(|| Arc::new(TokenAuth::new(config.token.clone())) as Arc<dyn AuthProvider>);
        let tls_acceptor = if config.use_tls {
            Some(TlsAcceptor::from(Arc::new(tls::server_config(&config)?)))
        } else {
            None
        };

        let listener = TcpListener::bind(("0.0.0.0", config.port))
            .await
            .map_err(ServerError::Bind)?;
        let local_addr = listener.local_addr().map_err(ServerError::Bind)?;

        Ok(Self {
            config,
            listener,
            local_addr,
            router: Router::new(),
            watcher,
            limiter,
            auth,
            reporter,
            metrics: RequestMetrics::new(registry),
            tls_acceptor,
        })
    }

    /// Actual bound address; differs from the configured port when port 0
    /// requested an OS-assigned one.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[must_use]
    pub fn connection_watcher(&self) -> Arc<ConnectionWatcher> {
        Arc::clone(&self.watcher)
    }

    /// Register one endpoint. The path is normalised to a leading slash,
    /// prefixed with the configured base path, and the handler wrapped in
    /// instrumentation labelled `(service, endpoint)`.
    pub fn handle_func(
        &mut self,
        service: &str,
        endpoint: &str,
        method: Method,
        path: &str,
        handler: ApiHandler,
    ) {
        let path = instrument::normalize_path(&self.config.base_path, path);
        let method_router = instrument::route(
            service.to_string(),
            endpoint.to_string(),
            &method,
            handler,
            self.metrics.clone(),
        );
        let router = std::mem::take(&mut self.router);
        self.router = router.route(&path, method_router);
    }

    /// Serve until the shutdown token fires, then drain.
    pub async fn run(&self, shutdown: Shutdown) -> anyhow::Result<()> {
        let app = self.router.clone().layer(
            ServiceBuilder::new()
                .layer(ConnLimitLayer::new(
                    Arc::clone(&self.watcher),
                    self.config.open_conn_limit,
                ))
                .layer(RateLimitLayer::new(Arc::clone(&self.limiter)))
                .layer(AuthLayer::new(self.auth.clone()))
                .layer(PanicCaptureLayer::new(Arc::clone(&self.reporter))),
        );

        info!(
            name = "http",
            tls = self.config.use_tls,
            client_auth = self.config.tls_use_client_cert,
            port = self.local_addr.port(),
            "starting server"
        );

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(err) if is_transient(&err) => {
                            warn!(error = %err, "transient accept failure");
                            continue;
                        }
                        Err(err) => return Err(anyhow::Error::new(err).context("accept")),
                    };
                    let guard = self.watcher.guard(peer);
                    spawn_connection(
                        stream,
                        peer,
                        guard,
                        app.clone(),
                        self.tls_acceptor.clone(),
                        shutdown.clone(),
                        self.config.read_timeout,
                    );
                }
            }
        }

        info!(name = "http", "shutting down server");
        if wait_for_drain(&self.watcher, self.config.shutdown_timeout).await {
            info!(name = "http", "server drained");
        } else {
            warn!(
                name = "http",
                open = self.watcher.count(),
                "drain timeout expired with connections remaining"
            );
        }
        Ok(())
    }
}

/// Transient accept failures are logged and skipped; anything else tears
/// the worker down.
fn is_transient(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::WouldBlock
    )
}

/// Poll the open-connection count until it reaches zero or the timeout
/// expires. Returns whether the drain completed.
async fn wait_for_drain(watcher: &ConnectionWatcher, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if watcher.count() == 0 {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn spawn_connection<S>(
    stream: TcpStream,
    peer: SocketAddr,
    guard: ConnGuard,
    app: S,
    tls_acceptor: Option<TlsAcceptor>,
    shutdown: Shutdown,
    read_timeout: Duration,
) where
    S: Service<Request<Body>, Response = Response, Error = Infallible>
        + Clone
        + Send
        + 'static,
    S::Future: Send,
{
    tokio::spawn(async move {
        let _guard = guard;
        match tls_acceptor {
            Some(acceptor) => match acceptor.accept(stream).await {
                Ok(stream) => {
                    serve_io(TokioIo::new(stream), peer, app, shutdown, read_timeout).await;
                }
                Err(err) => debug!(%peer, error = %err, "tls handshake failed"),
            },
            None => serve_io(TokioIo::new(stream), peer, app, shutdown, read_timeout).await,
        }
    });
}

/// Serve one connection. The transport remote is attached to every request
/// as an extension; on shutdown the connection finishes its in-flight
/// requests and closes. Shared with the operations server.
pub(crate) async fn serve_io<I, S>(
    io: I,
    peer: SocketAddr,
    app: S,
    shutdown: Shutdown,
    read_timeout: Duration,
)
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
    S: Service<Request<Body>, Response = Response, Error = Infallible>
        + Clone
        + Send
        + 'static,
    S::Future: Send,
{
    let service = hyper::service::service_fn(move |req: Request<Incoming>| {
        let app = app.clone();
        let mut req = req.map(Body::new);
        req.extensions_mut().insert(PeerAddr(peer));
        app.oneshot(req)
    });

    let mut builder = auto::Builder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(read_timeout);

    let conn = builder.serve_connection(io, service);
    tokio::pin!(conn);
    tokio::select! {
        result = conn.as_mut() => {
            if let Err(err) = result {
                debug!(%peer, error = %err, "connection error");
            }
        }
        () = shutdown.cancelled() => {
            conn.as_mut().graceful_shutdown();
            if let Err(err) = conn.as_mut().await {
                debug!(%peer, error = %err, "connection error during drain");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
