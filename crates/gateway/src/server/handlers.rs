//! Axum request handlers for the gateway's own endpoints.

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use common::{protocol::ErrorResponse, GatewayError};
use tracing::{error, warn};

use super::state::AppState;

/// Render `err` as its status code and JSON [`ErrorResponse`].
///
/// The caller sees only the fixed public message; the detailed cause goes to
/// the log.
pub fn error_response(err: &GatewayError) -> Response {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        error!(code = err.code(), error = %err, "request failed");
    } else {
        warn!(code = err.code(), error = %err, "request rejected");
    }
    (status, Json(ErrorResponse::from(err))).into_response()
}

/// `GET /api/login`: issue a session token sealed to the caller's identity.
///
/// The identity is read from the configured header. Success is `200` with the
/// raw envelope bytes as `application/octet-stream`.
pub async fn login(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let claimed = match headers.get(&*state.identity_header) {
        Some(value) => match value.to_str() {
            Ok(s) => Some(s),
            Err(_) => {
                return error_response(&GatewayError::InvalidIdentity(format!(
                    "{} header is not visible ASCII",
                    state.identity_header
                )))
            }
        },
        None => None,
    };

    match state.login.login(claimed).await {
        Ok(sealed) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/octet-stream"),
            )],
            sealed,
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

/// `GET /.well-known/acme-challenge/{token}`: HTTP-01 key authorization.
pub async fn acme_challenge(State(state): State<AppState>, Path(token): Path<String>) -> Response {
    match state.challenges.get(&token) {
        Some(key_authorization) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"))],
            key_authorization,
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{body::Body, http::Request, routing::get, Router};
    use common::{envelope, IdentityKeypair};
    use tower::ServiceExt;

    use super::*;
    use crate::{
        crypto::SealedBoxCrypto,
        login::{LoginService, MemoryIdentityStore, OsRngTokens},
        tls::ChallengeTokens,
    };

    fn state(header: &str) -> AppState {
        let login = LoginService::new(
            Arc::new(SealedBoxCrypto),
            Arc::new(MemoryIdentityStore::new()),
            Arc::new(OsRngTokens),
            Arc::new(IdentityKeypair::generate().unwrap()),
        );
        AppState::new(Arc::new(login), header, ChallengeTokens::default())
    }

    fn router(state: AppState) -> Router {
        Router::new()
            .route("/api/login", get(login))
            .route("/.well-known/acme-challenge/:token", get(acme_challenge))
            .with_state(state)
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    #[tokio::test]
    async fn login_returns_octet_stream_envelope() {
        let client = IdentityKeypair::generate().unwrap();
        let req = Request::builder()
            .uri("/api/login")
            .header("X-Public-Identity", client.public().to_identity_string())
            .body(Body::empty())
            .unwrap();

        let response = router(state("X-Public-Identity")).oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/octet-stream"
        );
        let opened = envelope::open(&body_bytes(response).await, &client).unwrap();
        assert_eq!(opened.label, "type:authtoken");
    }

    #[tokio::test]
    async fn login_uses_configured_header_name() {
        let client = IdentityKeypair::generate().unwrap();
        let req = Request::builder()
            .uri("/api/login")
            .header("X-Client-Key", client.public().to_identity_string())
            .body(Body::empty())
            .unwrap();

        let response = router(state("X-Client-Key")).oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn login_without_identity_is_400_json() {
        let req = Request::builder()
            .uri("/api/login")
            .body(Body::empty())
            .unwrap();
        let response = router(state("X-Public-Identity")).oneshot(req).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: ErrorResponse = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(body.code, "invalid_identity");
        assert_eq!(body.message, "Error: invalid identity");
    }

    #[tokio::test]
    async fn login_with_non_ascii_header_is_400() {
        let req = Request::builder()
            .uri("/api/login")
            .header("X-Public-Identity", HeaderValue::from_bytes(b"\xffabc").unwrap())
            .body(Body::empty())
            .unwrap();
        let response = router(state("X-Public-Identity")).oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn acme_challenge_serves_pending_tokens_only() {
        let state = state("X-Public-Identity");
        state.challenges.insert("tok", "tok.thumbprint");
        let app = router(state);

        let hit = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/.well-known/acme-challenge/tok")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(hit.status(), StatusCode::OK);
        assert_eq!(body_bytes(hit).await, b"tok.thumbprint");

        let miss = app
            .oneshot(
                Request::builder()
                    .uri("/.well-known/acme-challenge/other")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(miss.status(), StatusCode::NOT_FOUND);
    }
}
