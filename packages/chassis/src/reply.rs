//! HTTP reply helpers.
//!
//! Every helper produces a complete response with `Content-Type` and
//! `Content-Length` set, so a handler using them writes exactly one body.
//! Framework middleware uses [`error`] for its JSON error envelopes.

use axum::body::Body;
use axum::response::Response;
use bytes::Bytes;
use http::{header, HeaderValue, StatusCode};
use serde::Serialize;

const APPLICATION_JSON: &str = "application/json";

/// Build a response with the given status, content type, and body.
#[must_use]
pub fn with(status: StatusCode, content_type: &str, content: Bytes) -> Response {
    let mut builder = Response::builder().status(status);
    if !content_type.is_empty() {
        builder = builder.header(header::CONTENT_TYPE, content_type);
    }
    if !content.is_empty() {
        builder = builder.header(header::CONTENT_LENGTH, content.len());
    }
    builder
        .body(Body::from(content))
        .unwrap_or_else(|_| fallback())
}

/// HTTP 200 with no body.
#[must_use]
pub fn ok() -> Response {
    with(StatusCode::OK, "", Bytes::new())
}

/// HTTP 201 with no body.
#[must_use]
pub fn created() -> Response {
    with(StatusCode::CREATED, "", Bytes::new())
}

/// HTTP 204.
#[must_use]
pub fn no_content() -> Response {
    with(StatusCode::NO_CONTENT, "", Bytes::new())
}

/// HTTP 200 with a pre-serialised JSON body.
#[must_use]
pub fn json(content: Bytes) -> Response {
    json_code(content, StatusCode::OK)
}

/// Arbitrary status with a pre-serialised JSON body.
#[must_use]
pub fn json_code(content: Bytes, status: StatusCode) -> Response {
    with(status, APPLICATION_JSON, content)
}

/// HTTP 200 with `data` serialised as JSON.
#[must_use]
pub fn object<T: Serialize>(data: &T) -> Response {
    object_code(data, StatusCode::OK)
}

/// Arbitrary status with `data` serialised as JSON.
#[must_use]
pub fn object_code<T: Serialize>(data: &T, status: StatusCode) -> Response {
    match serde_json::to_vec(data) {
        Ok(buf) => with(status, APPLICATION_JSON, Bytes::from(buf)),
        Err(err) => error(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("serialize response: {err}"),
        ),
    }
}

/// HTTP 200 plain text.
#[must_use]
pub fn text(content: &str) -> Response {
    with(
        StatusCode::OK,
        "text/plain",
        Bytes::from(content.to_string()),
    )
}

/// JSON error envelope `{"error": "<message>"}` with the given status.
#[must_use]
pub fn error(status: StatusCode, message: &str) -> Response {
    let body = serde_json::json!({ "error": message }).to_string();
    with(status, APPLICATION_JSON, Bytes::from(body))
}

fn fallback() -> Response {
    let mut resp = Response::new(Body::empty());
    *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    resp.headers_mut().insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_static("0"),
    );
    resp
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use http_body_util::BodyExt;

    use super::*;

    async fn body_string(resp: Response) -> String {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn error_envelope_has_json_body_and_length() {
        let resp = error(StatusCode::TOO_MANY_REQUESTS, "rate limited");
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
        let length: usize = resp
            .headers()
            .get(header::CONTENT_LENGTH)
            .unwrap()
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        let body = body_string(resp).await;
        assert_eq!(body, "{\"error\":\"rate limited\"}");
        assert_eq!(length, body.len());
    }

    #[tokio::test]
    async fn error_message_is_escaped() {
        let resp = error(StatusCode::BAD_REQUEST, "quote \" inside");
        let body = body_string(resp).await;
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&body).unwrap()["error"],
            "quote \" inside"
        );
    }

    #[tokio::test]
    async fn object_serialises_json() {
        #[derive(Serialize)]
        struct Out {
            result: u64,
        }
        let resp = object(&Out { result: 120 });
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_string(resp).await, "{\"result\":120}");
    }

    #[test]
    fn empty_replies_have_no_content_headers() {
        let resp = ok();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers().get(header::CONTENT_TYPE).is_none());
        assert!(resp.headers().get(header::CONTENT_LENGTH).is_none());

        assert_eq!(created().status(), StatusCode::CREATED);
        assert_eq!(no_content().status(), StatusCode::NO_CONTENT);
    }
}
