//! Wire-level constants and bodies exchanged with gateway clients.

use serde::{Deserialize, Serialize};

/// Label bound into every sealed session-token envelope.
pub const AUTH_TOKEN_LABEL: &str = "type:authtoken";

/// Default request header carrying the caller's public identity.
pub const DEFAULT_IDENTITY_HEADER: &str = "X-Public-Identity";

/// Response header exposing the warrant canary state.
pub const WARRANT_CANARY_HEADER: &str = "X-Warrant-Canary";

/// Path prefix reserved for ACME HTTP-01 challenge responses.
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

// ---------------------------------------------------------------------------
// Error response
// ---------------------------------------------------------------------------

/// Standard error response body returned on any non-2xx status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Short machine-readable error code (e.g. `"invalid_identity"`).
    pub code: String,
    /// Human-readable description safe to expose to callers.
    pub message: String,
}

impl ErrorResponse {
    /// Construct an [`ErrorResponse`] from a code and message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl From<&crate::GatewayError> for ErrorResponse {
    fn from(err: &crate::GatewayError) -> Self {
        Self::new(err.code(), err.public_message())
    }
}
