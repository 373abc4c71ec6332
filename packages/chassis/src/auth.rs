//! Request authentication.
//!
//! The API server consumes [`AuthProvider`] as an optional collaborator;
//! when configured, every request's head passes through `authorize` before
//! reaching the router. The bundled [`TokenAuth`] compares the `Api-Token`
//! header against a shared secret.

use http::request::Parts;

pub const TOKEN_HEADER: &str = "Api-Token";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("missing or invalid token")]
pub struct AuthError;

pub trait AuthProvider: Send + Sync {
    fn authorize(&self, parts: &Parts) -> Result<(), AuthError>;
}

/// Shared-secret bearer token read from the `Api-Token` header.
pub struct TokenAuth {
    secret: String,
}

impl TokenAuth {
    #[must_use]
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }
}

impl AuthProvider for TokenAuth {
    fn authorize(&self, parts: &Parts) -> Result<(), AuthError> {
        let token = parts
            .headers
            .get(TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if token == self.secret {
            Ok(())
        } else {
            Err(AuthError)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use http::Request;

    use super::*;

    fn parts(token: Option<&str>) -> Parts {
        let mut builder = Request::builder().uri("/anything");
        if let Some(token) = token {
            builder = builder.header(TOKEN_HEADER, token);
        }
        let (parts, ()) = builder.body(()).unwrap().into_parts();
        parts
    }

    #[test]
    fn matching_token_is_authorized() {
        let auth = TokenAuth::new("secret");
        assert!(auth.authorize(&parts(Some("secret"))).is_ok());
    }

    #[test]
    fn wrong_token_is_rejected() {
        let auth = TokenAuth::new("secret");
        assert_eq!(auth.authorize(&parts(Some("nope"))), Err(AuthError));
    }

    #[test]
    fn missing_header_is_rejected() {
        let auth = TokenAuth::new("secret");
        assert_eq!(auth.authorize(&parts(None)), Err(AuthError));
    }
}
