//! Request Authentication
//!
//! Bearer-token check with an anonymous fallback: requests without
//! credentials are admitted as anonymous (so health probes and local tooling
//! keep working), while requests presenting a wrong token are rejected
//! outright.

use axum::Extension;
use axum::extract::Request;
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::Response;
use std::sync::Arc;
use tracing::debug;

/// Who a request is acting as.
#[derive(Debug, Clone, PartialEq)]
pub enum Identity {
    /// Presented the configured bearer token.
    Service,
    /// No credentials presented; admitted with the fallback identity.
    Anonymous,
}

/// Primary token check with anonymous fallback.
pub struct Authenticator {
    token: Option<String>,
}

impl Authenticator {
    pub fn new(token: Option<String>) -> Arc<Self> {
        Arc::new(Self { token })
    }

    /// Resolves the identity for an `Authorization` header value.
    ///
    /// `None` means rejection: a token was presented and it does not match.
    /// An absent header, or a server with no token configured, falls back to
    /// anonymous instead of failing.
    pub fn authenticate(&self, authorization: Option<&str>) -> Option<Identity> {
        let presented = authorization.and_then(|v| v.strip_prefix("Bearer "));

        match (&self.token, presented) {
            (Some(expected), Some(presented)) => {
                if presented == expected {
                    Some(Identity::Service)
                } else {
                    None
                }
            }
            // A token presented to a server that expects none is not a match
            (None, Some(_)) => Some(Identity::Anonymous),
            (_, None) => Some(Identity::Anonymous),
        }
    }
}

/// Axum middleware enforcing the authenticator on every request, attaching
/// the resolved identity as a request extension.
pub async fn require_identity(
    Extension(auth): Extension<Arc<Authenticator>>,
    mut req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let header = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());

    match auth.authenticate(header.as_deref()) {
        Some(identity) => {
            debug!("request authenticated as {:?}", identity);
            req.extensions_mut().insert(identity);
            Ok(next.run(req).await)
        }
        None => Err(StatusCode::UNAUTHORIZED),
    }
}
