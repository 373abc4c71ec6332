//! Operations server.
//!
//! Second HTTP server on its own port serving `GET /ready`, `GET /alive`,
//! and `GET /metrics` for orchestrator probes and scrapers. No TLS, no
//! authentication, no rate limiting, and none of these endpoints are
//! metered. Lifecycle mirrors the API server with a short bounded drain.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use http::{header, StatusCode};
use http_body_util::BodyExt;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use hyper_util::rt::TokioIo;
use tracing::info;

use crate::metrics::MetricsRegistry;
use crate::server::{serve_io, ServerError};
use crate::shutdown::Shutdown;
use crate::status::StatusRegister;

/// Probe requests are tiny; anything slower than this is a dead client.
const READ_HEADER_TIMEOUT: Duration = Duration::from_secs(1);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

const METRICS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

#[derive(Clone)]
struct OpsState {
    status: StatusRegister,
    registry: Arc<MetricsRegistry>,
}

pub struct OpsServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    router: Router,
}

impl OpsServer {
    /// Bind the operations listener and assemble the probe routes.
    pub async fn new(
        port: u16,
        status: StatusRegister,
        registry: Arc<MetricsRegistry>,
    ) -> Result<Self, ServerError> {
        let router = Router::new()
            .route("/ready", get(ready_handler))
            .route("/alive", get(alive_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(OpsState { status, registry });

        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(ServerError::Bind)?;
        let local_addr = listener.local_addr().map_err(ServerError::Bind)?;

        Ok(Self {
            listener,
            local_addr,
            router,
        })
    }

    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve probes until the shutdown token fires.
    pub async fn run(&self, shutdown: Shutdown) -> anyhow::Result<()> {
        info!(
            tls = false,
            port = self.local_addr.port(),
            "starting healthcheck server"
        );

        let mut connections: JoinSet<()> = JoinSet::new();
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(err) => {
                            return Err(anyhow::Error::new(err).context("healthcheck accept"));
                        }
                    };
                    let router = self.router.clone();
                    let token = shutdown.clone();
                    connections.spawn(async move {
                        serve_io(
                            TokioIo::new(stream),
                            peer,
                            router,
                            token,
                            READ_HEADER_TIMEOUT,
                        )
                        .await;
                    });
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        let drain = async {
            while connections.join_next().await.is_some() {}
        };
        if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
            connections.abort_all();
        }
        info!("healthcheck server closed");
        Ok(())
    }
}

/// Consume and discard whatever body the probe sent, so the connection is
/// left clean for keep-alive reuse before the reply goes out.
async fn drain_body(body: Body) {
    let _ = body.collect().await;
}

async fn ready_handler(State(state): State<OpsState>, request: Request) -> StatusCode {
    drain_body(request.into_body()).await;
    if state.status.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

async fn alive_handler(State(state): State<OpsState>, request: Request) -> StatusCode {
    drain_body(request.into_body()).await;
    if state.status.is_alive() {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

async fn metrics_handler(State(state): State<OpsState>, request: Request) -> impl IntoResponse {
    drain_body(request.into_body()).await;
    (
        [(header::CONTENT_TYPE, METRICS_CONTENT_TYPE)],
        state.registry.render(),
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use crate::metrics::MetricsConfig;
    use crate::shutdown::ShutdownController;

    use super::*;

    async fn start_ops() -> (SocketAddr, StatusRegister, Arc<MetricsRegistry>, ShutdownController)
    {
        let status = StatusRegister::new();
        let registry = Arc::new(
            MetricsRegistry::new(&MetricsConfig {
                namespace: "testns".to_string(),
                buckets: Vec::new(),
            })
            .unwrap(),
        );
        let server = OpsServer::new(0, status.clone(), Arc::clone(&registry))
            .await
            .expect("ops server");
        let addr = server.local_addr();

        let controller = ShutdownController::new();
        let token = controller.token();
        tokio::spawn(async move {
            server.run(token).await.expect("ops run");
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        (addr, status, registry, controller)
    }

    #[tokio::test]
    async fn ready_reflects_status_register() {
        let (addr, status, _registry, controller) = start_ops().await;
        let reporter = status.register("svc").unwrap();

        let resp = reqwest::get(format!("http://{addr}/ready")).await.unwrap();
        assert_eq!(resp.status(), 500, "registered service not yet ready");

        reporter.ready();
        let resp = reqwest::get(format!("http://{addr}/ready")).await.unwrap();
        assert_eq!(resp.status(), 200);

        controller.trigger();
    }

    #[tokio::test]
    async fn alive_follows_dead_transition() {
        let (addr, status, _registry, controller) = start_ops().await;
        let reporter = status.register("svc").unwrap();

        let resp = reqwest::get(format!("http://{addr}/alive")).await.unwrap();
        assert_eq!(resp.status(), 200);

        reporter.dead();
        let resp = reqwest::get(format!("http://{addr}/alive")).await.unwrap();
        assert_eq!(resp.status(), 500);

        controller.trigger();
    }

    #[tokio::test]
    async fn metrics_endpoint_serves_text_exposition() {
        let (addr, _status, registry, controller) = start_ops().await;
        registry
            .counter("error_count", &[("service", "svc"), ("endpoint", "ep")])
            .increment(1);

        let resp = reqwest::get(format!("http://{addr}/metrics")).await.unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(
            resp.headers().get("content-type").unwrap(),
            METRICS_CONTENT_TYPE
        );
        let body = resp.text().await.unwrap();
        assert!(body.contains("testns_error_count"), "{body}");

        controller.trigger();
    }

    #[tokio::test]
    async fn probe_with_body_is_drained_and_answered() {
        let (addr, status, _registry, controller) = start_ops().await;
        status.register("svc").unwrap().ready();

        let client = reqwest::Client::new();
        for _ in 0..3 {
            let resp = client
                .get(format!("http://{addr}/ready"))
                .body("ignored probe payload")
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), 200, "body must be drained, reply still served");
        }

        controller.trigger();
    }

    #[tokio::test]
    async fn run_returns_after_trigger() {
        let status = StatusRegister::new();
        let registry = Arc::new(
            MetricsRegistry::new(&MetricsConfig {
                namespace: "testns".to_string(),
                buckets: Vec::new(),
            })
            .unwrap(),
        );
        let server = OpsServer::new(0, status, registry).await.unwrap();
        let controller = ShutdownController::new();
        let token = controller.token();
        let task = tokio::spawn(async move { server.run(token).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        controller.trigger();
        tokio::time::timeout(Duration::from_secs(3), task)
            .await
            .expect("ops server must stop promptly")
            .unwrap()
            .unwrap();
    }
}
