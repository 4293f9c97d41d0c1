//! Ordered request/response interceptor pipeline.
//!
//! [`Pipeline`] is an explicit list of [`Interceptor`]s. [`Pipeline::compose`]
//! wraps a router so the first listed interceptor is the outermost layer: it
//! sees the request first and the response last.
//!
//! Interceptors only fill response headers the inner layers left unset, so a
//! handler that sets its own policy header wins.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use axum::{
    extract::{Request, State},
    http::{
        header::{self, HeaderName, InvalidHeaderValue},
        HeaderMap, HeaderValue,
    },
    middleware::{self, Next},
    response::Response,
    Router,
};

/// One stage of the pipeline.
pub trait Interceptor: Send + Sync + 'static {
    /// Stable name, used in logs and tests.
    fn name(&self) -> &'static str;

    /// Inspect or annotate the request. Returning a response short-circuits:
    /// inner layers and the handler never run, but this interceptor's
    /// [`on_response`](Self::on_response) and every outer one still do.
    fn on_request(&self, _request: &mut Request) -> Option<Response> {
        None
    }

    /// Decorate the outgoing response headers.
    fn on_response(&self, headers: &mut HeaderMap);
}

/// Ordered interceptor list.
#[derive(Clone, Default)]
pub struct Pipeline {
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `interceptor` as the innermost stage so far.
    pub fn with(mut self, interceptor: impl Interceptor) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    /// The gateway's security pipeline, outermost first: canary, CSP, HSTS,
    /// frame, content-type, XSS protection, referrer.
    ///
    /// # Errors
    ///
    /// Fails if `domain` cannot appear in a header value.
    pub fn security(domain: &str, warrant: WarrantFlag) -> Result<Self, InvalidHeaderValue> {
        Ok(Self::new()
            .with(Canary::new(warrant))
            .with(ContentSecurityPolicy::for_domain(domain)?)
            .with(StaticHeader::new(
                "hsts",
                header::STRICT_TRANSPORT_SECURITY,
                "max-age=31536000; includeSubDomains; preload",
            ))
            .with(StaticHeader::new("frame", header::X_FRAME_OPTIONS, "DENY"))
            .with(StaticHeader::new(
                "content-type",
                header::X_CONTENT_TYPE_OPTIONS,
                "nosniff",
            ))
            .with(StaticHeader::new(
                "xss-protection",
                header::X_XSS_PROTECTION,
                "1; mode=block",
            ))
            .with(StaticHeader::new(
                "referrer",
                header::REFERRER_POLICY,
                "no-referrer",
            )))
    }

    /// Interceptor names, outermost first.
    pub fn names(&self) -> Vec<&'static str> {
        self.interceptors.iter().map(|i| i.name()).collect()
    }

    /// Wrap `router` in every interceptor. Layers added later wrap earlier
    /// ones, so the list is applied back to front.
    pub fn compose<S>(&self, router: Router<S>) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        self.interceptors.iter().rev().fold(router, |router, interceptor| {
            router.layer(middleware::from_fn_with_state(
                interceptor.clone(),
                intercept,
            ))
        })
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

async fn intercept(
    State(interceptor): State<Arc<dyn Interceptor>>,
    mut request: Request,
    next: Next,
) -> Response {
    let mut response = match interceptor.on_request(&mut request) {
        Some(early) => early,
        None => next.run(request).await,
    };
    interceptor.on_response(response.headers_mut());
    response
}

fn set_if_absent(headers: &mut HeaderMap, name: HeaderName, value: &HeaderValue) {
    headers.entry(name).or_insert_with(|| value.clone());
}

// ---------------------------------------------------------------------------
// Warrant canary
// ---------------------------------------------------------------------------

const CANARY_HEADER: HeaderName = HeaderName::from_static("x-warrant-canary");

/// Process-wide warrant canary.
///
/// Advisory only: relaxed ordering, so a request racing a raise may observe
/// either state. Once raised it is never lowered.
#[derive(Debug, Clone, Default)]
pub struct WarrantFlag(Arc<AtomicBool>);

impl WarrantFlag {
    pub fn new(received: bool) -> Self {
        Self(Arc::new(AtomicBool::new(received)))
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Snapshot of the canary taken as the request entered the pipeline,
/// available to handlers through request extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WarrantStatus {
    pub warrant_received: bool,
}

impl WarrantStatus {
    pub fn header_value(self) -> HeaderValue {
        if self.warrant_received {
            HeaderValue::from_static("withdrawn")
        } else {
            HeaderValue::from_static("intact")
        }
    }
}

/// Publishes the canary as `X-Warrant-Canary`.
#[derive(Debug, Clone)]
pub struct Canary {
    flag: WarrantFlag,
}

impl Canary {
    pub fn new(flag: WarrantFlag) -> Self {
        Self { flag }
    }

    fn status(&self) -> WarrantStatus {
        WarrantStatus {
            warrant_received: self.flag.is_raised(),
        }
    }
}

impl Interceptor for Canary {
    fn name(&self) -> &'static str {
        "canary"
    }

    fn on_request(&self, request: &mut Request) -> Option<Response> {
        request.extensions_mut().insert(self.status());
        None
    }

    fn on_response(&self, headers: &mut HeaderMap) {
        set_if_absent(headers, CANARY_HEADER, &self.status().header_value());
    }
}

// ---------------------------------------------------------------------------
// Policy headers
// ---------------------------------------------------------------------------

/// `Content-Security-Policy` restricting every fetch to this origin and the
/// configured domain. Inline styles are allowed; inline scripts are not.
#[derive(Debug, Clone)]
pub struct ContentSecurityPolicy {
    value: HeaderValue,
}

impl ContentSecurityPolicy {
    /// # Errors
    ///
    /// Fails if `domain` contains bytes not allowed in a header value.
    pub fn for_domain(domain: &str) -> Result<Self, InvalidHeaderValue> {
        let policy = format!(
            "default-src 'self' https://{domain}; \
             connect-src 'self' https://{domain} wss://{domain}; \
             style-src 'self' 'unsafe-inline' https://{domain}; \
             img-src 'self' data: https://{domain}"
        );
        Ok(Self {
            value: HeaderValue::from_str(&policy)?,
        })
    }
}

impl Interceptor for ContentSecurityPolicy {
    fn name(&self) -> &'static str {
        "csp"
    }

    fn on_response(&self, headers: &mut HeaderMap) {
        set_if_absent(headers, header::CONTENT_SECURITY_POLICY, &self.value);
    }
}

/// Sets one fixed header.
#[derive(Debug, Clone)]
pub struct StaticHeader {
    name: &'static str,
    header: HeaderName,
    value: HeaderValue,
}

impl StaticHeader {
    pub fn new(name: &'static str, header: HeaderName, value: &'static str) -> Self {
        Self {
            name,
            header,
            value: HeaderValue::from_static(value),
        }
    }
}

impl Interceptor for StaticHeader {
    fn name(&self) -> &'static str {
        self.name
    }

    fn on_response(&self, headers: &mut HeaderMap) {
        set_if_absent(headers, self.header.clone(), &self.value);
    }
}
