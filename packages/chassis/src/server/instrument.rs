//! Per-endpoint instrumentation.
//!
//! Innermost wrapper around every typed handler: resolves path variables
//! and query parameters, derives the real client address from the proxy
//! headers, assigns a request identifier, logs start/finish inside a
//! request-scoped span, scores the latency histogram and error counter,
//! and writes the JSON error body when the handler fails.

use std::collections::HashMap;
use std::time::Instant;

use axum::body::Body;
use axum::extract::RawPathParams;
use axum::response::Response;
use axum::routing::{on, MethodFilter, MethodRouter};
use http::{HeaderValue, Method, Request};
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

use crate::reply;

use super::conn::PeerAddr;
use super::handler::{ApiHandler, ApiRequest};
use super::metrics::RequestMetrics;
use super::middleware::RequestIdCell;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Normalise a registered path: leading slash, base prefix, and gorilla
/// style capture constraints (`{n:[0-9]+}`) reduced to plain captures.
#[must_use]
pub fn normalize_path(base: &str, path: &str) -> String {
    let path = format!("/{}", path.trim_start_matches('/'));
    let path = strip_capture_constraints(&path);
    let base = base.trim_matches('/');
    if base.is_empty() {
        path
    } else {
        format!("/{base}{path}")
    }
}

/// Reduce `{name:regex}` captures to `{name}`; the router matches by
/// segment and handlers validate formats themselves.
fn strip_capture_constraints(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut chars = path.char_indices();
    while let Some((start, c)) = chars.next() {
        if c != '{' {
            out.push(c);
            continue;
        }
        let mut depth = 1usize;
        let mut end = start;
        for (i, c) in chars.by_ref() {
            match c {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        end = i;
                        break;
                    }
                }
                _ => {}
            }
        }
        if depth != 0 {
            // Unbalanced braces: leave the rest untouched.
            out.push_str(&path[start..]);
            break;
        }
        let capture = &path[start + 1..end];
        let name = capture.split(':').next().unwrap_or(capture);
        out.push('{');
        out.push_str(name);
        out.push('}');
    }
    out
}

/// Build the method router for one endpoint, wrapping the typed handler in
/// the instrumentation pipeline bound to `(service, endpoint)`.
pub(crate) fn route(
    service: String,
    endpoint: String,
    method: &Method,
    handler: ApiHandler,
    metrics: RequestMetrics,
) -> MethodRouter {
    let filter = MethodFilter::try_from(method.clone())
        .expect("HTTP method not usable for routing");

    on(
        filter,
        move |params: RawPathParams, request: Request<Body>| {
            let service = service.clone();
            let endpoint = endpoint.clone();
            let handler = handler.clone();
            let metrics = metrics.clone();
            async move {
                handle_instrumented(service, endpoint, handler, metrics, params, request).await
            }
        },
    )
}

async fn handle_instrumented(
    service: String,
    endpoint: String,
    handler: ApiHandler,
    metrics: RequestMetrics,
    params: RawPathParams,
    request: Request<Body>,
) -> Response {
    let mut vars: HashMap<String, String> = HashMap::new();
    if let Some(query) = request.uri().query() {
        for pair in query.split('&') {
            let mut kv = pair.splitn(2, '=');
            let key = kv.next().unwrap_or_default();
            if key.is_empty() {
                continue;
            }
            vars.insert(
                url_decode(key),
                url_decode(kv.next().unwrap_or_default()),
            );
        }
    }
    // Path variables win over query parameters of the same name.
    for (key, value) in params.iter() {
        vars.insert(key.to_string(), value.to_string());
    }

    let remote = real_remote(&request);
    let rid = Uuid::new_v4().to_string();
    if let Some(cell) = request.extensions().get::<RequestIdCell>() {
        cell.set(rid.clone());
    }

    let span = info_span!(
        "request",
        method = %request.method(),
        uri = %request.uri(),
        remote = %remote,
        rid = %rid,
    );

    async move {
        info!("start");
        let api_request = ApiRequest::new(request, vars, remote, rid.clone());
        let started = Instant::now();
        let result = handler(api_request).await;
        info!("finish");
        metrics.score(&service, &endpoint, started, result.is_err());

        let mut response = match result {
            Ok(response) => response,
            Err(err) => {
                error!(rid = %rid, error = %err, "runtime");
                reply::error(err.status(), &err.to_string())
            }
        };
        if let Ok(value) = HeaderValue::from_str(&rid) {
            response.headers_mut().insert(REQUEST_ID_HEADER, value);
        }
        response
    }
    .instrument(span)
    .await
}

/// Client address from the first of `X-Forwarded-For`, `X-Real-Ip`
/// (header lookup is case-insensitive), falling back to the transport
/// remote; the port is stripped.
fn real_remote(request: &Request<Body>) -> String {
    for header in ["x-forwarded-for", "x-real-ip"] {
        if let Some(value) = request.headers().get(header).and_then(|v| v.to_str().ok()) {
            let first = value.split(',').next().unwrap_or_default().trim();
            if !first.is_empty() {
                return strip_port(first);
            }
        }
    }
    request
        .extensions()
        .get::<PeerAddr>()
        .map(|peer| peer.0.ip().to_string())
        .unwrap_or_default()
}

fn strip_port(addr: &str) -> String {
    addr.split(':').next().unwrap_or_default().to_string()
}

/// Minimal percent-decoding for query parameters.
fn url_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = bytes.get(i + 1..i + 3).and_then(|h| {
                    std::str::from_utf8(h)
                        .ok()
                        .and_then(|h| u8::from_str_radix(h, 16).ok())
                });
                match hex {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    None => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::Router;
    use http_body_util::BodyExt;
    use http::StatusCode;
    use tower::ServiceExt;

    use crate::metrics::{MetricsConfig, MetricsRegistry};
    use crate::server::handler::{handler, HandlerError};

    use super::*;

    #[test]
    fn normalize_adds_leading_slash_and_prefix() {
        assert_eq!(normalize_path("", "factorial/{n}"), "/factorial/{n}");
        assert_eq!(normalize_path("/api", "/factorial/{n}"), "/api/factorial/{n}");
        assert_eq!(normalize_path("api", "factorial/{n}"), "/api/factorial/{n}");
    }

    #[test]
    fn normalize_strips_capture_constraints() {
        assert_eq!(
            normalize_path("/api", "/factorial/{n:[0-9]+}"),
            "/api/factorial/{n}"
        );
        assert_eq!(
            normalize_path("", "/a/{x:[0-9]{2}}/b/{y}"),
            "/a/{x}/b/{y}"
        );
    }

    #[test]
    fn url_decode_handles_percent_and_plus() {
        assert_eq!(url_decode("a%20b+c"), "a b c");
        assert_eq!(url_decode("plain"), "plain");
        assert_eq!(url_decode("bad%2"), "bad%2");
    }

    fn test_metrics() -> (RequestMetrics, Arc<MetricsRegistry>) {
        let registry = Arc::new(
            MetricsRegistry::new(&MetricsConfig {
                namespace: "testns".to_string(),
                buckets: Vec::new(),
            })
            .unwrap(),
        );
        (RequestMetrics::new(registry.clone()), registry)
    }

    fn router_with(handler: ApiHandler) -> (Router, Arc<MetricsRegistry>) {
        let (metrics, registry) = test_metrics();
        let method_router = route(
            "svc".to_string(),
            "double".to_string(),
            &Method::GET,
            handler,
            metrics,
        );
        (
            Router::new().route("/double/{n}", method_router),
            registry,
        )
    }

    fn doubling_handler() -> ApiHandler {
        handler(|req: ApiRequest| async move {
            let n: u64 = req
                .var("n")
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| HandlerError::bad_request("invalid number"))?;
            Ok(reply::object(&serde_json::json!({ "result": n * 2 })))
        })
    }

    #[tokio::test]
    async fn success_path_scores_latency_and_sets_request_id() {
        let (router, registry) = router_with(doubling_handler());

        let resp = router
            .oneshot(
                Request::builder()
                    .uri("/double/21")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        let rid = resp
            .headers()
            .get(REQUEST_ID_HEADER)
            .expect("request id header")
            .to_str()
            .unwrap()
            .to_string();
        assert_eq!(rid.len(), 36, "UUID v4 expected: {rid}");

        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"{\"result\":42}");

        let text = registry.render();
        assert!(text.contains("testns_request_latency_count"), "{text}");
        assert!(!text.contains("testns_error_count"), "{text}");
    }

    #[tokio::test]
    async fn handler_error_writes_envelope_and_counts() {
        let (router, registry) = router_with(doubling_handler());

        let resp = router
            .oneshot(
                Request::builder()
                    .uri("/double/notanumber")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "invalid number");

        let text = registry.render();
        assert!(text.contains("testns_error_count"), "{text}");
        assert!(text.contains("testns_request_latency_count"), "{text}");
    }

    #[tokio::test]
    async fn query_parameters_are_available_as_vars() {
        let (metrics, _registry) = test_metrics();
        let echo = handler(|req: ApiRequest| async move {
            Ok(reply::text(req.var("who").unwrap_or("nobody")))
        });
        let router = Router::new().route(
            "/hello",
            route("svc".into(), "hello".into(), &Method::GET, echo, metrics),
        );

        let resp = router
            .oneshot(
                Request::builder()
                    .uri("/hello?who=world%21")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"world!");
    }

    #[tokio::test]
    async fn forwarded_header_wins_over_peer_address() {
        let (metrics, _registry) = test_metrics();
        let echo = handler(|req: ApiRequest| async move { Ok(reply::text(req.remote())) });
        let router = Router::new().route(
            "/whoami",
            route("svc".into(), "whoami".into(), &Method::GET, echo, metrics),
        );

        let mut request = Request::builder()
            .uri("/whoami")
            .header("X-Forwarded-For", "203.0.113.7:9999, 10.0.0.1")
            .body(Body::empty())
            .unwrap();
        request
            .extensions_mut()
            .insert(PeerAddr("127.0.0.1:5555".parse().unwrap()));

        let resp = router.oneshot(request).await.unwrap();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"203.0.113.7");
    }
}
