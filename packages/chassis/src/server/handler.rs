//! Typed handler contract.
//!
//! Endpoint handlers receive an [`ApiRequest`] and return either a complete
//! response or a [`HandlerError`] carrying the status code to report. The
//! instrumentation wrapper turns the error into the JSON error envelope and
//! scores the request metrics; handlers never write error bodies themselves.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use axum::body::Body;
use axum::response::Response;
use bytes::Bytes;
use http::{HeaderMap, Method, Request, StatusCode, Uri};
use http_body_util::BodyExt;
use serde::de::DeserializeOwned;

/// Error returned by a typed handler: the status code to respond with plus
/// the message placed into the `{"error": ...}` body.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    status: StatusCode,
    message: String,
}

impl HandlerError {
    #[must_use]
    pub fn new(status: StatusCode, message: impl ToString) -> Self {
        Self {
            status,
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn bad_request(message: impl ToString) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    #[must_use]
    pub fn not_found(message: impl ToString) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    #[must_use]
    pub fn internal(message: impl ToString) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(err)
    }
}

pub type HandlerResult = Result<Response, HandlerError>;
pub type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;

/// Type-erased endpoint handler, cheap to clone into the router.
pub type ApiHandler = Arc<dyn Fn(ApiRequest) -> HandlerFuture + Send + Sync>;

/// Wrap an async function into an [`ApiHandler`].
pub fn handler<F, Fut>(f: F) -> ApiHandler
where
    F: Fn(ApiRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |req| Box::pin(f(req)))
}

/// The request as seen by a typed handler: the HTTP request plus resolved
/// path variables and query parameters, the derived remote address, and
/// the request identifier assigned by instrumentation.
pub struct ApiRequest {
    request: Request<Body>,
    vars: HashMap<String, String>,
    remote: String,
    request_id: String,
}

impl ApiRequest {
    pub(crate) fn new(
        request: Request<Body>,
        vars: HashMap<String, String>,
        remote: String,
        request_id: String,
    ) -> Self {
        Self {
            request,
            vars,
            remote,
            request_id,
        }
    }

    #[must_use]
    pub fn method(&self) -> &Method {
        self.request.method()
    }

    #[must_use]
    pub fn uri(&self) -> &Uri {
        self.request.uri()
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        self.request.headers()
    }

    /// Path variable or query parameter by name; path variables win.
    #[must_use]
    pub fn var(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    /// Client address with the proxy headers already applied and the port
    /// stripped.
    #[must_use]
    pub fn remote(&self) -> &str {
        &self.remote
    }

    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Collect the request body. Consumes the body; a second call returns
    /// an empty buffer.
    pub async fn body_bytes(&mut self) -> Result<Bytes, HandlerError> {
        let body = std::mem::replace(self.request.body_mut(), Body::empty());
        let collected = body
            .collect()
            .await
            .map_err(|err| HandlerError::bad_request(format!("read request body: {err}")))?;
        Ok(collected.to_bytes())
    }

    /// Decode the request body as JSON.
    pub async fn json<T: DeserializeOwned>(&mut self) -> Result<T, HandlerError> {
        let bytes = self.body_bytes().await?;
        serde_json::from_slice(&bytes)
            .map_err(|err| HandlerError::bad_request(format!("decode request body: {err}")))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reply;

    fn api_request(body: &str) -> ApiRequest {
        let request = Request::builder()
            .method(Method::GET)
            .uri("/demo/5?verbose=1")
            .body(Body::from(body.to_string()))
            .unwrap();
        let mut vars = HashMap::new();
        vars.insert("n".to_string(), "5".to_string());
        vars.insert("verbose".to_string(), "1".to_string());
        ApiRequest::new(request, vars, "10.0.0.1".to_string(), "rid-1".to_string())
    }

    #[test]
    fn vars_resolve_by_name() {
        let req = api_request("");
        assert_eq!(req.var("n"), Some("5"));
        assert_eq!(req.var("verbose"), Some("1"));
        assert_eq!(req.var("missing"), None);
    }

    #[tokio::test]
    async fn json_decodes_body() {
        #[derive(serde::Deserialize)]
        struct In {
            n: u32,
        }
        let mut req = api_request("{\"n\": 7}");
        let decoded: In = req.json().await.unwrap();
        assert_eq!(decoded.n, 7);
    }

    #[tokio::test]
    async fn json_rejects_garbage_with_bad_request() {
        let mut req = api_request("not json");
        let err = req.json::<serde_json::Value>().await.unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn handler_wrapper_invokes_function() {
        let h = handler(|req: ApiRequest| async move {
            let n: u64 = req
                .var("n")
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| HandlerError::bad_request("missing n"))?;
            Ok(reply::object(&serde_json::json!({ "result": n * 2 })))
        });
        let resp = h(api_request("")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[test]
    fn handler_error_carries_status_and_message() {
        let err = HandlerError::bad_request("invalid number");
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.to_string(), "invalid number");

        let err: HandlerError = anyhow::anyhow!("db down").into();
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
