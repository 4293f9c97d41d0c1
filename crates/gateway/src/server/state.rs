//! Shared application state injected into the gateway's own handlers.

use std::sync::Arc;

use crate::{login::LoginService, tls::ChallengeTokens};

/// Application state shared across request handlers.
///
/// Every field is `Arc`-backed so Axum can clone the state per request.
#[derive(Clone, Debug)]
pub struct AppState {
    /// Runs the public-key login exchange.
    pub login: Arc<LoginService>,
    /// Name of the request header carrying the caller's identity.
    pub identity_header: Arc<str>,
    /// Pending ACME HTTP-01 challenges.
    pub challenges: ChallengeTokens,
}

impl AppState {
    pub fn new(
        login: Arc<LoginService>,
        identity_header: impl Into<Arc<str>>,
        challenges: ChallengeTokens,
    ) -> Self {
        Self {
            login,
            identity_header: identity_header.into(),
            challenges,
        }
    }
}
