//! Reverse proxy to the backend data API.
//!
//! Requests arrive with the proxy prefix already stripped. The remaining path
//! is joined onto the backend base URL with exactly one slash between them,
//! the query string is preserved, and method, body and end-to-end headers pass
//! through unchanged. Hop-by-hop headers are dropped in both directions.

use std::net::SocketAddr;

use anyhow::Context;
use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{
        header::{self, HeaderName},
        uri::{Authority, Scheme},
        HeaderMap, HeaderValue, Uri, Version,
    },
    response::Response,
};
use common::GatewayError;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use tracing::warn;

use super::handlers::error_response;

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Headers meaningful only for a single transport hop (RFC 9110 §7.6.1).
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Forwards requests to one backend origin.
#[derive(Clone)]
pub struct ReverseProxy {
    client: Client<HttpsConnector<HttpConnector>, Body>,
    scheme: Scheme,
    authority: Authority,
    base_path: String,
    base_query: Option<String>,
}

impl ReverseProxy {
    /// Proxy to the absolute `http`/`https` URL `base`.
    ///
    /// # Errors
    ///
    /// Fails if `base` is not absolute or the TLS client cannot be built.
    pub fn new(base: &Uri) -> anyhow::Result<Self> {
        let scheme = base.scheme().cloned().context("backend URL has no scheme")?;
        let authority = base
            .authority()
            .cloned()
            .context("backend URL has no authority")?;

        let connector = HttpsConnectorBuilder::new()
            .with_provider_and_webpki_roots(rustls::crypto::ring::default_provider())
            .context("failed to build backend TLS client")?
            .https_or_http()
            .enable_http1()
            .build();
        let client = Client::builder(TokioExecutor::new()).build(connector);

        Ok(Self {
            client,
            scheme,
            authority,
            base_path: base.path().to_owned(),
            base_query: base.query().map(str::to_owned),
        })
    }

    /// Backend URI for an already-stripped `path_and_query`.
    ///
    /// # Errors
    ///
    /// Fails if the joined path does not form a valid URI.
    pub fn target_uri(&self, path_and_query: &str) -> Result<Uri, GatewayError> {
        let (path, query) = match path_and_query.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (path_and_query, None),
        };

        let mut target = join_paths(&self.base_path, path);
        let query: Vec<&str> = [self.base_query.as_deref(), query]
            .into_iter()
            .flatten()
            .filter(|q| !q.is_empty())
            .collect();
        if !query.is_empty() {
            target.push('?');
            target.push_str(&query.join("&"));
        }

        Uri::builder()
            .scheme(self.scheme.clone())
            .authority(self.authority.clone())
            .path_and_query(target)
            .build()
            .map_err(|e| GatewayError::BadGateway(format!("invalid backend URI: {e}")))
    }

    /// Send `request` to the backend and relay its response.
    ///
    /// # Errors
    ///
    /// [`GatewayError::BadGateway`] if the backend cannot be reached.
    pub async fn forward(&self, mut request: Request) -> Result<Response, GatewayError> {
        let path_and_query = request
            .uri()
            .path_and_query()
            .map_or("/", |pq| pq.as_str())
            .to_owned();
        *request.uri_mut() = self.target_uri(&path_and_query)?;
        // The backend connection is HTTP/1.1 whatever the client spoke.
        *request.version_mut() = Version::HTTP_11;

        let peer = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());
        let headers = request.headers_mut();
        strip_hop_by_hop(headers);
        headers.remove(header::HOST);
        if let Some(ip) = peer {
            append_forwarded_for(headers, &ip.to_string());
        }

        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| GatewayError::BadGateway(e.to_string()))?;

        let mut response = response.map(Body::new);
        strip_hop_by_hop(response.headers_mut());
        Ok(response)
    }
}

impl std::fmt::Debug for ReverseProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReverseProxy")
            .field("scheme", &self.scheme)
            .field("authority", &self.authority)
            .field("base_path", &self.base_path)
            .finish_non_exhaustive()
    }
}

/// Handler forwarding every request it receives.
pub async fn forward(State(proxy): State<ReverseProxy>, request: Request) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    match proxy.forward(request).await {
        Ok(response) => response,
        Err(e) => {
            warn!(%method, path = %path, error = %e, "backend request failed");
            error_response(&e)
        }
    }
}

/// Remove `prefix` from the front of `path_and_query` on a segment boundary.
///
/// `/postgrest/items?x=1` → `/items?x=1`, `/postgrest` → `/`, and
/// `/postgrestx` does not match.
pub fn strip_prefix(path_and_query: &str, prefix: &str) -> Option<String> {
    let rest = path_and_query.strip_prefix(prefix)?;
    match rest.as_bytes().first() {
        None => Some("/".to_owned()),
        Some(b'/') => Some(rest.to_owned()),
        Some(b'?') => Some(format!("/{rest}")),
        Some(_) => None,
    }
}

/// Join two path pieces with exactly one slash between them.
fn join_paths(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{base}{}", &path[1..]),
        (false, false) => format!("{base}/{path}"),
        _ => format!("{base}{path}"),
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    // Headers named by `Connection` are hop-by-hop as well.
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in named.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, client_ip: &str) {
    let value = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(prior) => format!("{prior}, {client_ip}"),
        None => client_ip.to_owned(),
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}
