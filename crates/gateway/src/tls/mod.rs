//! TLS termination and automatic certificate management.
//!
//! # Responsibilities
//! - Fix the negotiation policy: TLS 1.2 minimum, an enumerated cipher-suite
//!   list, P-256/X25519 key exchange, server cipher order.
//! - Provision one domain's certificate over ACME (HTTP-01), cache it on disk,
//!   renew it in the background.
//! - Resolve a certificate per handshake without blocking, rejecting any SNI
//!   name other than the configured domain.

pub mod acme;
pub mod cache;
pub mod challenge;
pub mod manager;
pub mod pem;
pub mod policy;

use thiserror::Error;

pub use acme::AcmeIssuer;
pub use cache::CertCache;
pub use challenge::ChallengeTokens;
pub use manager::CertificateManager;

/// Errors produced by certificate provisioning and resolution.
#[derive(Debug, Error)]
pub enum CertificateError {
    /// The client hello carried no SNI name.
    #[error("client did not send a server name")]
    MissingServerName,

    /// The client asked for a name other than the configured domain.
    #[error("server name {0:?} is not served here")]
    UnknownServerName(String),

    /// No certificate has been provisioned yet.
    #[error("no certificate provisioned for {0}")]
    NotProvisioned(String),

    /// PEM input could not be parsed into a chain and key.
    #[error("invalid PEM material: {0}")]
    Pem(String),

    /// The ACME exchange with the certificate authority failed.
    #[error("acme: {0}")]
    Acme(String),

    /// Building the certificate signing request failed.
    #[error("csr: {0}")]
    Csr(String),

    /// Reading or writing the on-disk cache failed.
    #[error("certificate cache: {0}")]
    Cache(String),
}

impl From<CertificateError> for common::GatewayError {
    fn from(err: CertificateError) -> Self {
        common::GatewayError::Certificate(err.to_string())
    }
}
