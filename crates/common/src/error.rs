//! Common error types shared across crates.

use thiserror::Error;

/// Top-level gateway error type.
///
/// Every variant carries a detailed cause for the operational log. Callers
/// only ever see [`GatewayError::public_message`] and [`GatewayError::http_status`]:
/// - [`GatewayError::InvalidIdentity`] → 400
/// - [`GatewayError::Unauthorized`] → 401
/// - [`GatewayError::TokenGeneration`], [`GatewayError::Storage`],
///   [`GatewayError::Encryption`], [`GatewayError::IndexUnavailable`] → 500
/// - [`GatewayError::BadGateway`] → 502
/// - [`GatewayError::Certificate`] never reaches HTTP; it fails a handshake.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The claimed identity string does not decode to a valid public key.
    #[error("invalid identity: {0}")]
    InvalidIdentity(String),

    /// The entropy source failed while minting a session token.
    #[error("token generation failed: {0}")]
    TokenGeneration(String),

    /// The identity store rejected or failed to persist a record.
    #[error("identity store failure: {0}")]
    Storage(String),

    /// Sealing the session token to the recipient failed.
    #[error("encryption failure: {0}")]
    Encryption(String),

    /// The SPA index document could not be read.
    #[error("index document unavailable: {0}")]
    IndexUnavailable(String),

    /// No certificate can be supplied for the requested server name.
    #[error("certificate unavailable: {0}")]
    Certificate(String),

    /// Basic-Auth credentials were missing or wrong.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The backend API could not be reached.
    #[error("bad gateway: {0}")]
    BadGateway(String),
}

impl GatewayError {
    /// Returns the HTTP status code that should be sent for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            GatewayError::InvalidIdentity(_) => 400,
            GatewayError::Unauthorized(_) => 401,
            GatewayError::TokenGeneration(_)
            | GatewayError::Storage(_)
            | GatewayError::Encryption(_)
            | GatewayError::IndexUnavailable(_)
            | GatewayError::Certificate(_) => 500,
            GatewayError::BadGateway(_) => 502,
        }
    }

    /// Short machine-readable code used in JSON error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::InvalidIdentity(_) => "invalid_identity",
            GatewayError::TokenGeneration(_) => "token_generation",
            GatewayError::Storage(_) => "storage",
            GatewayError::Encryption(_) => "encryption",
            GatewayError::IndexUnavailable(_) => "index_unavailable",
            GatewayError::Certificate(_) => "certificate",
            GatewayError::Unauthorized(_) => "unauthorized",
            GatewayError::BadGateway(_) => "bad_gateway",
        }
    }

    /// Fixed, user-facing message. Never contains the internal cause.
    pub fn public_message(&self) -> &'static str {
        match self {
            GatewayError::InvalidIdentity(_) => "Error: invalid identity",
            GatewayError::TokenGeneration(_) => "Error generating new auth token; sorry!",
            GatewayError::Storage(_) => "Error saving new auth token; sorry!",
            GatewayError::Encryption(_) => "Error encrypting auth token to you; sorry!",
            GatewayError::IndexUnavailable(_) => "Error: couldn't serve you index.html!",
            GatewayError::Certificate(_) => "Error: certificate unavailable",
            GatewayError::Unauthorized(_) => "Unauthorized",
            GatewayError::BadGateway(_) => "Error: backend unavailable",
        }
    }
}
