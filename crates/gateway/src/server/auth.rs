//! Optional HTTP Basic-Auth gate.
//!
//! [`gate`] is the single place access control is attached. It wraps a router
//! when credentials are configured and leaves it untouched otherwise. Login,
//! SPA and ACME challenge routes are never passed through it.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, HeaderValue},
    middleware::{self, Next},
    response::Response,
    Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use common::GatewayError;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use super::handlers::error_response;
use crate::config::BasicCredentials;

const CHALLENGE: &str = r#"Basic realm="Restricted""#;

/// Require `credentials` on every request to `router`, if configured.
pub fn gate<S>(router: Router<S>, credentials: Option<&BasicCredentials>) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    match credentials {
        Some(credentials) => router.layer(middleware::from_fn_with_state(
            Arc::new(Verifier::new(credentials)),
            require_basic_auth,
        )),
        None => router,
    }
}

/// Holds digests of the expected credentials so comparisons run over
/// fixed-length values.
struct Verifier {
    username: [u8; 32],
    password: [u8; 32],
}

impl Verifier {
    fn new(credentials: &BasicCredentials) -> Self {
        Self {
            username: Sha256::digest(credentials.username.as_bytes()).into(),
            password: Sha256::digest(credentials.password.as_bytes()).into(),
        }
    }

    fn verify(&self, headers: &HeaderMap) -> bool {
        let Some((username, password)) = basic_credentials(headers) else {
            return false;
        };
        let username: [u8; 32] = Sha256::digest(username.as_bytes()).into();
        let password: [u8; 32] = Sha256::digest(password.as_bytes()).into();
        // Both halves are always compared.
        (username[..].ct_eq(&self.username[..]) & password[..].ct_eq(&self.password[..])).into()
    }
}

/// Decode `Authorization: Basic <base64(user:pass)>`.
fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, encoded) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_owned(), password.to_owned()))
}

async fn require_basic_auth(
    State(verifier): State<Arc<Verifier>>,
    request: Request,
    next: Next,
) -> Response {
    if verifier.verify(request.headers()) {
        return next.run(request).await;
    }
    let mut response = error_response(&GatewayError::Unauthorized(format!(
        "basic auth rejected for {}",
        request.uri().path()
    )));
    response
        .headers_mut()
        .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static(CHALLENGE));
    response
}
