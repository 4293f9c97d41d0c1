//! Plaintext HTTP listener that sends every client to HTTPS.
//!
//! The one exception is a pending ACME HTTP-01 challenge: the CA fetches it
//! over plain HTTP, possibly before any certificate exists, so it is answered
//! directly. Unknown tokens redirect like any other path.

use std::time::Duration;

use axum::{
    extract::{Request, State},
    http::{header, HeaderValue, StatusCode, Uri},
    response::{IntoResponse, Response},
    Router,
};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::tls::ChallengeTokens;

#[derive(Clone, Debug)]
struct Redirector {
    domain: String,
    https_port: u16,
    challenges: ChallengeTokens,
}

/// Router for the plaintext listener.
///
/// `domain` is used only when a request carries no host at all.
pub fn router(
    domain: impl Into<String>,
    https_port: u16,
    challenges: ChallengeTokens,
    timeout: Duration,
) -> Router {
    Router::new()
        .fallback(redirect)
        .with_state(Redirector {
            domain: domain.into(),
            https_port,
            challenges,
        })
        .layer(TimeoutLayer::new(timeout))
        .layer(TraceLayer::new_for_http())
}

async fn redirect(State(redirector): State<Redirector>, request: Request) -> Response {
    if let Some(key_authorization) = redirector.challenges.respond_to_path(request.uri().path()) {
        return (
            StatusCode::OK,
            [(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"))],
            key_authorization,
        )
            .into_response();
    }

    let host = request
        .headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| request.uri().host())
        .unwrap_or(redirector.domain.as_str());
    let location = https_location(host, redirector.https_port, request.uri());

    match HeaderValue::try_from(location) {
        Ok(location) => (
            StatusCode::FOUND,
            [
                (header::LOCATION, location),
                (header::CONNECTION, HeaderValue::from_static("close")),
            ],
        )
            .into_response(),
        Err(_) => StatusCode::BAD_REQUEST.into_response(),
    }
}

/// `https://<host without port>:<https_port><path and query>`.
pub fn https_location(host: &str, https_port: u16, uri: &Uri) -> String {
    let path_and_query = uri.path_and_query().map_or("/", |pq| pq.as_str());
    format!("https://{}:{https_port}{path_and_query}", strip_port(host))
}

fn strip_port(host: &str) -> &str {
    // Bracketed IPv6 literal: keep through the closing bracket.
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    host.split(':').next().unwrap_or(host)
}
