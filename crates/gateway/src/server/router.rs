//! Axum router construction.
//!
//! Routing priority, highest first:
//!
//! 1. `GET /api/login` and `GET /.well-known/acme-challenge/{token}`
//! 2. SPA prefixes: the cached index document
//! 3. the backend proxy prefix, stripped and forwarded
//! 4. static files under the asset directory
//!
//! Only 3 and 4 pass through the Basic-Auth gate. The security pipeline wraps
//! everything.

use std::{path::PathBuf, sync::Arc, time::Duration};

use axum::{
    extract::{Request, State},
    http::Uri,
    response::Response,
    routing::get,
    Router,
};
use tower::ServiceExt;
use tower_http::{services::ServeDir, timeout::TimeoutLayer, trace::TraceLayer};

use super::{
    auth::gate, handlers, middleware::Pipeline, proxy, proxy::ReverseProxy, spa::SpaIndex,
    state::AppState,
};
use crate::config::BasicCredentials;

/// Everything beyond [`AppState`] the router is assembled from.
#[derive(Clone, Debug)]
pub struct RouterSettings {
    pub spa: SpaIndex,
    pub proxy: ReverseProxy,
    /// Path prefix forwarded to the backend, e.g. `/postgrest`.
    pub proxy_prefix: String,
    pub asset_dir: PathBuf,
    pub credentials: Option<BasicCredentials>,
    pub pipeline: Pipeline,
    /// Upper bound on producing a response.
    pub request_timeout: Duration,
}

/// Routes that the explicit routes did not claim.
struct Fallback {
    spa: SpaIndex,
    proxy_prefix: String,
    proxy: Router,
    assets: Router,
}

/// Build the application [`Router`] with all routes and middleware attached.
pub fn build(state: AppState, settings: RouterSettings) -> Router {
    let credentials = settings.credentials.as_ref();
    let fallback = Fallback {
        spa: settings.spa,
        proxy_prefix: settings.proxy_prefix.trim_end_matches('/').to_owned(),
        proxy: gate(
            Router::new()
                .fallback(proxy::forward)
                .with_state(settings.proxy),
            credentials,
        ),
        assets: gate(
            Router::new().fallback_service(ServeDir::new(settings.asset_dir)),
            credentials,
        ),
    };

    let app = Router::new()
        .route("/api/login", get(handlers::login))
        .route(
            "/.well-known/acme-challenge/:token",
            get(handlers::acme_challenge),
        )
        .with_state(state)
        .fallback_service(
            Router::new()
                .fallback(dispatch)
                .with_state(Arc::new(fallback)),
        )
        .layer(TimeoutLayer::new(settings.request_timeout))
        .layer(TraceLayer::new_for_http());

    settings.pipeline.compose(app)
}

async fn dispatch(State(fallback): State<Arc<Fallback>>, mut request: Request) -> Response {
    let path_and_query = request
        .uri()
        .path_and_query()
        .map_or("/", |pq| pq.as_str())
        .to_owned();

    if fallback.spa.matches(request.uri().path()) {
        return fallback.spa.respond().await;
    }

    if let Some(stripped) = proxy::strip_prefix(&path_and_query, &fallback.proxy_prefix) {
        if let Ok(uri) = stripped.parse::<Uri>() {
            *request.uri_mut() = uri;
        }
        return call(fallback.proxy.clone(), request).await;
    }

    call(fallback.assets.clone(), request).await
}

async fn call(router: Router, request: Request) -> Response {
    match router.oneshot(request).await {
        Ok(response) => response,
        Err(never) => match never {},
    }
}

#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        http::{header, Method, StatusCode},
    };
    use axum_test::TestServer;
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use common::{envelope, IdentityKeypair};
    use serde_json::Value;

    use super::*;
    use crate::{
        crypto::SealedBoxCrypto,
        login::{LoginService, MemoryIdentityStore, OsRngTokens},
        server::{middleware::WarrantFlag, proxy::tests::spawn_echo_backend},
        tls::ChallengeTokens,
    };

    struct Fixture {
        _assets: tempfile::TempDir,
        app: Router,
        challenges: ChallengeTokens,
    }

    async fn fixture(credentials: Option<BasicCredentials>) -> Fixture {
        let assets = tempfile::tempdir().unwrap();
        std::fs::write(assets.path().join("index.html"), "<html>spa</html>").unwrap();
        std::fs::create_dir(assets.path().join("static")).unwrap();
        std::fs::write(assets.path().join("static/app.js"), "console.log(1)").unwrap();

        let backend = spawn_echo_backend().await;
        let challenges = ChallengeTokens::new();
        let login = LoginService::new(
            Arc::new(SealedBoxCrypto),
            Arc::new(MemoryIdentityStore::new()),
            Arc::new(OsRngTokens),
            Arc::new(IdentityKeypair::generate().unwrap()),
        );
        let state = AppState::new(Arc::new(login), "X-Public-Identity", challenges.clone());
        let settings = RouterSettings {
            spa: SpaIndex::new(
                assets.path().join("index.html"),
                vec!["/0".into(), "/dashboard".into(), "/pursuance".into()],
            ),
            proxy: ReverseProxy::new(&backend.parse().unwrap()).unwrap(),
            proxy_prefix: "/postgrest".into(),
            asset_dir: assets.path().to_path_buf(),
            credentials,
            pipeline: Pipeline::security("example.org", WarrantFlag::default()).unwrap(),
            request_timeout: Duration::from_secs(10),
        };

        Fixture {
            app: build(state, settings),
            _assets: assets,
            challenges,
        }
    }

    fn credentials() -> BasicCredentials {
        BasicCredentials {
            username: "admin".into(),
            password: "hunter2".into(),
        }
    }

    async fn send(app: &Router, request: axum::http::Request<Body>) -> Response {
        app.clone().oneshot(request).await.unwrap()
    }

    fn get_req(uri: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    #[tokio::test]
    async fn spa_paths_at_any_depth_serve_index() {
        let f = fixture(None).await;
        for path in ["/dashboard", "/dashboard/a/b/c", "/0", "/07/x", "/pursuance/9"] {
            let response = send(&f.app, get_req(path)).await;
            assert_eq!(response.status(), StatusCode::OK, "{path}");
            assert_eq!(
                response.headers()[header::CONTENT_TYPE],
                "text/html; charset=utf-8"
            );
            assert_eq!(body_bytes(response).await, b"<html>spa</html>");
        }
    }

    #[tokio::test]
    async fn proxy_strips_prefix_and_preserves_request() {
        let f = fixture(None).await;
        let request = axum::http::Request::builder()
            .method(Method::POST)
            .uri("/postgrest/items?x=1")
            .body(Body::from("payload"))
            .unwrap();

        let response = send(&f.app, request).await;
        assert_eq!(response.status(), StatusCode::OK);
        let seen: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(seen["method"], "POST");
        assert_eq!(seen["uri"], "/items?x=1");
        assert_eq!(seen["body"], "payload");
    }

    #[tokio::test]
    async fn static_files_and_missing_files() {
        let f = fixture(None).await;

        let found = send(&f.app, get_req("/static/app.js")).await;
        assert_eq!(found.status(), StatusCode::OK);
        assert_eq!(body_bytes(found).await, b"console.log(1)");

        let missing = send(&f.app, get_req("/static/missing.js")).await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn every_route_carries_security_headers() {
        let f = fixture(None).await;
        for path in ["/api/login", "/dashboard", "/postgrest/x", "/static/app.js", "/nope"] {
            let response = send(&f.app, get_req(path)).await;
            let h = response.headers();
            for name in [
                "x-warrant-canary",
                "content-security-policy",
                "strict-transport-security",
                "x-frame-options",
                "x-content-type-options",
                "x-xss-protection",
                "referrer-policy",
            ] {
                assert!(h.contains_key(name), "{path} missing {name}");
            }
        }
    }

    #[tokio::test]
    async fn gate_covers_proxy_and_static_but_not_login_or_spa() {
        let f = fixture(Some(credentials())).await;

        for path in ["/postgrest/items", "/static/app.js"] {
            let response = send(&f.app, get_req(path)).await;
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{path}");
            assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));
        }

        let authorized = format!("Basic {}", STANDARD.encode("admin:hunter2"));
        for path in ["/postgrest/items", "/static/app.js"] {
            let request = axum::http::Request::builder()
                .uri(path)
                .header(header::AUTHORIZATION, &authorized)
                .body(Body::empty())
                .unwrap();
            assert_eq!(send(&f.app, request).await.status(), StatusCode::OK, "{path}");
        }

        assert_eq!(send(&f.app, get_req("/dashboard")).await.status(), StatusCode::OK);
        assert_eq!(
            send(&f.app, get_req("/api/login")).await.status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[tokio::test]
    async fn acme_challenge_bypasses_gate() {
        let f = fixture(Some(credentials())).await;
        f.challenges.insert("tok", "tok.key");
        let response = send(&f.app, get_req("/.well-known/acme-challenge/tok")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, b"tok.key");
    }

    #[tokio::test]
    async fn login_end_to_end_over_test_server() {
        let f = fixture(None).await;
        let server = TestServer::new(f.app).unwrap();
        let client = IdentityKeypair::generate().unwrap();

        let response = server
            .get("/api/login")
            .add_header(
                header::HeaderName::from_static("x-public-identity"),
                header::HeaderValue::from_str(&client.public().to_identity_string()).unwrap(),
            )
            .await;

        response.assert_status_ok();
        assert_eq!(response.header("x-frame-options"), "DENY");
        let opened = envelope::open(response.as_bytes(), &client).unwrap();
        assert_eq!(opened.label, "type:authtoken");
        assert_eq!(String::from_utf8(opened.plaintext).unwrap().len(), 36);
    }

    #[tokio::test]
    async fn invalid_login_over_test_server_is_json_400() {
        let f = fixture(None).await;
        let server = TestServer::new(f.app).unwrap();

        let response = server
            .get("/api/login")
            .add_header(
                header::HeaderName::from_static("x-public-identity"),
                header::HeaderValue::from_static("garbage"),
            )
            .await;

        response.assert_status_bad_request();
        let body: Value = response.json();
        assert_eq!(body["message"], "Error: invalid identity");
    }
}
