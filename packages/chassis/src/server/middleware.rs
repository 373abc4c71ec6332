//! Safety middlewares installed once around the router.
//!
//! Execution order (outermost first): connection cap, rate limit,
//! authentication, panic capture. Each layer short-circuits with a JSON
//! error envelope; later layers may assume the earlier ones ran. The
//! per-endpoint instrumentation lives on the other side of the router, in
//! [`super::instrument`].

use std::cell::RefCell;
use std::convert::Infallible;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Once, OnceLock};
use std::task::{Context, Poll};

use axum::body::Body;
use axum::response::Response;
use futures::FutureExt;
use http::{HeaderValue, Request, StatusCode};
use tower::{Layer, Service};
use tracing::error;

use crate::auth::AuthProvider;
use crate::reply;
use crate::report::{ErrorReporter, PanicReport};

use super::conn::ConnectionWatcher;
use super::limit::RateLimiter;

type BoxResponseFuture = Pin<Box<dyn Future<Output = Result<Response, Infallible>> + Send>>;

/// Slot shared between the panic-capture layer (which plants it) and the
/// instrumentation (which fills in the generated request identifier), so a
/// panic log can still name the request it belongs to.
#[derive(Debug, Clone, Default)]
pub struct RequestIdCell(Arc<OnceLock<String>>);

impl RequestIdCell {
    pub fn set(&self, rid: String) {
        let _ = self.0.set(rid);
    }

    #[must_use]
    pub fn get(&self) -> Option<&str> {
        self.0.get().map(String::as_str)
    }
}

// ---------------------------------------------------------------------------
// Connection cap
// ---------------------------------------------------------------------------

/// Rejects requests with 429 once the live connection count exceeds the cap.
#[derive(Clone)]
pub struct ConnLimitLayer {
    watcher: Arc<ConnectionWatcher>,
    limit: i64,
}

impl ConnLimitLayer {
    #[must_use]
    pub fn new(watcher: Arc<ConnectionWatcher>, limit: i64) -> Self {
        Self { watcher, limit }
    }
}

impl<S> Layer<S> for ConnLimitLayer {
    type Service = ConnLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ConnLimitService {
            inner,
            watcher: Arc::clone(&self.watcher),
            limit: self.limit,
        }
    }
}

#[derive(Clone)]
pub struct ConnLimitService<S> {
    inner: S,
    watcher: Arc<ConnectionWatcher>,
    limit: i64,
}

impl<S> Service<Request<Body>> for ConnLimitService<S>
where
    S: Service<Request<Body>, Response = Response, Error = Infallible> + Send,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = Infallible;
    type Future = BoxResponseFuture;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        // The counter includes the connection carrying this request, so
        // requests on the first `limit` connections pass.
        if self.watcher.count() > self.limit {
            let resp = reply::error(StatusCode::TOO_MANY_REQUESTS, "too many open connections");
            return Box::pin(async move { Ok(resp) });
        }
        Box::pin(self.inner.call(req))
    }
}

// ---------------------------------------------------------------------------
// Rate limit
// ---------------------------------------------------------------------------

/// Token-bucket admission; refusals respond 429 without consuming a token.
#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: Arc<RateLimiter>,
}

impl RateLimitLayer {
    #[must_use]
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self { limiter }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            limiter: Arc::clone(&self.limiter),
        }
    }
}

#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    limiter: Arc<RateLimiter>,
}

impl<S> Service<Request<Body>> for RateLimitService<S>
where
    S: Service<Request<Body>, Response = Response, Error = Infallible> + Send,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = Infallible;
    type Future = BoxResponseFuture;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        if !self.limiter.allow() {
            let resp = reply::error(StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded");
            return Box::pin(async move { Ok(resp) });
        }
        Box::pin(self.inner.call(req))
    }
}

// ---------------------------------------------------------------------------
// Authentication
// ---------------------------------------------------------------------------

/// Calls the configured provider; a failure terminates the pipeline with
/// 401. Without a provider every request passes.
#[derive(Clone)]
pub struct AuthLayer {
    provider: Option<Arc<dyn AuthProvider>>,
}

impl AuthLayer {
    #[must_use]
    pub fn new(provider: Option<Arc<dyn AuthProvider>>) -> Self {
        Self { provider }
    }
}

impl<S> Layer<S> for AuthLayer {
    type Service = AuthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthService {
            inner,
            provider: self.provider.clone(),
        }
    }
}

#[derive(Clone)]
pub struct AuthService<S> {
    inner: S,
    provider: Option<Arc<dyn AuthProvider>>,
}

impl<S> Service<Request<Body>> for AuthService<S>
where
    S: Service<Request<Body>, Response = Response, Error = Infallible> + Send,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = Infallible;
    type Future = BoxResponseFuture;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        if let Some(provider) = &self.provider {
            let (parts, body) = req.into_parts();
            if let Err(err) = provider.authorize(&parts) {
                let resp = reply::error(StatusCode::UNAUTHORIZED, &err.to_string());
                return Box::pin(async move { Ok(resp) });
            }
            return Box::pin(self.inner.call(Request::from_parts(parts, body)));
        }
        Box::pin(self.inner.call(req))
    }
}

// ---------------------------------------------------------------------------
// Panic capture
// ---------------------------------------------------------------------------

thread_local! {
    static PANIC_BACKTRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

static INSTALL_HOOK: Once = Once::new();

/// Chain a panic hook that records the backtrace at the panic site; the
/// unwinding has already happened by the time `catch_unwind` observes the
/// payload. The previous hook still runs.
fn install_panic_hook() {
    INSTALL_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            PANIC_BACKTRACE.with(|slot| {
                *slot.borrow_mut() =
                    Some(std::backtrace::Backtrace::force_capture().to_string());
            });
            previous(info);
        }));
    });
}

fn take_backtrace() -> String {
    PANIC_BACKTRACE.with(|slot| slot.borrow_mut().take()).unwrap_or_default()
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

/// Converts an unwinding handler into a 500 response: logs the request
/// identifier and backtrace, writes the JSON error body, and hands the
/// report to the error reporter. The process keeps serving.
#[derive(Clone)]
pub struct PanicCaptureLayer {
    reporter: Arc<dyn ErrorReporter>,
}

impl PanicCaptureLayer {
    #[must_use]
    pub fn new(reporter: Arc<dyn ErrorReporter>) -> Self {
        install_panic_hook();
        Self { reporter }
    }
}

impl<S> Layer<S> for PanicCaptureLayer {
    type Service = PanicCaptureService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        PanicCaptureService {
            inner,
            reporter: Arc::clone(&self.reporter),
        }
    }
}

#[derive(Clone)]
pub struct PanicCaptureService<S> {
    inner: S,
    reporter: Arc<dyn ErrorReporter>,
}

impl<S> Service<Request<Body>> for PanicCaptureService<S>
where
    S: Service<Request<Body>, Response = Response, Error = Infallible> + Send,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = Infallible;
    type Future = BoxResponseFuture;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let cell = RequestIdCell::default();
        req.extensions_mut().insert(cell.clone());
        let reporter = Arc::clone(&self.reporter);

        let fut = std::panic::catch_unwind(AssertUnwindSafe(|| self.inner.call(req)));
        Box::pin(async move {
            let outcome = match fut {
                Ok(fut) => AssertUnwindSafe(fut).catch_unwind().await,
                Err(payload) => Err(payload),
            };
            match outcome {
                Ok(result) => result,
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    let backtrace = take_backtrace();
                    let rid = cell.get().unwrap_or_default().to_string();
                    error!(rid = %rid, stack = %backtrace, "PANIC");
                    reporter.capture_panic(&PanicReport {
                        request_id: &rid,
                        message: &message,
                        backtrace: &backtrace,
                    });
                    let mut resp =
                        reply::error(StatusCode::INTERNAL_SERVER_ERROR, &message);
                    if let Ok(value) = HeaderValue::from_str(&rid) {
                        resp.headers_mut().insert("x-request-id", value);
                    }
                    Ok(resp)
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
