//! Negotiation policy and [`rustls::ServerConfig`] construction.

use std::sync::Arc;

use rustls::{
    crypto::{
        ring::{cipher_suite, default_provider, kx_group},
        CryptoProvider, SupportedKxGroup,
    },
    server::ResolvesServerCert,
    version, ServerConfig, SupportedCipherSuite, SupportedProtocolVersion,
};

/// Protocol versions offered. Nothing below TLS 1.2.
pub static PROTOCOL_VERSIONS: &[&SupportedProtocolVersion] = &[&version::TLS13, &version::TLS12];

/// Enumerated cipher suites in server preference order.
///
/// TLS 1.2 suites are restricted to ECDHE key exchange with AEAD ciphers.
pub fn cipher_suites() -> Vec<SupportedCipherSuite> {
    vec![
        cipher_suite::TLS13_AES_256_GCM_SHA384,
        cipher_suite::TLS13_CHACHA20_POLY1305_SHA256,
        cipher_suite::TLS13_AES_128_GCM_SHA256,
        cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
        cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
        cipher_suite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
        cipher_suite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
        cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
        cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
    ]
}

/// Key-exchange groups in preference order.
pub fn kx_groups() -> Vec<&'static dyn SupportedKxGroup> {
    vec![kx_group::SECP256R1, kx_group::X25519]
}

/// The ring provider narrowed to [`cipher_suites`] and [`kx_groups`].
pub fn crypto_provider() -> CryptoProvider {
    CryptoProvider {
        cipher_suites: cipher_suites(),
        kx_groups: kx_groups(),
        ..default_provider()
    }
}

/// Build the immutable server TLS configuration around `resolver`.
///
/// # Errors
///
/// Returns an error if rustls rejects the version/suite combination.
pub fn build_server_config(
    resolver: Arc<dyn ResolvesServerCert>,
) -> Result<Arc<ServerConfig>, rustls::Error> {
    let mut config = ServerConfig::builder_with_provider(Arc::new(crypto_provider()))
        .with_protocol_versions(PROTOCOL_VERSIONS)?
        .with_no_client_auth()
        .with_cert_resolver(resolver);

    config.ignore_client_order = true;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}
