//! PEM certificate chain + private key → [`CertifiedKey`], and the leaf's
//! expiry.

use std::{io::BufReader, sync::Arc};

use rustls::{crypto::ring::sign::any_supported_type, sign::CertifiedKey};

use super::CertificateError;

/// Parse a PEM-encoded certificate chain and private key into a key rustls can
/// serve.
///
/// # Errors
///
/// Returns [`CertificateError::Pem`] if either input is malformed, empty, or
/// the key type is not supported.
pub fn certified_key_from_pem(
    chain_pem: &[u8],
    key_pem: &[u8],
) -> Result<Arc<CertifiedKey>, CertificateError> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(chain_pem))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CertificateError::Pem(format!("failed to parse certificate chain: {e}")))?;
    if certs.is_empty() {
        return Err(CertificateError::Pem("no certificate found in PEM data".into()));
    }

    let key = rustls_pemfile::private_key(&mut BufReader::new(key_pem))
        .map_err(|e| CertificateError::Pem(format!("failed to read private key: {e}")))?
        .ok_or_else(|| CertificateError::Pem("no private key found in PEM data".into()))?;

    let signing_key = any_supported_type(&key)
        .map_err(|e| CertificateError::Pem(format!("unsupported private key: {e}")))?;

    Ok(Arc::new(CertifiedKey::new(certs, signing_key)))
}

/// `notAfter` of the leaf certificate, in Unix seconds.
///
/// # Errors
///
/// Returns [`CertificateError::Pem`] if the key carries no certificate or the
/// leaf is not valid X.509 DER.
pub fn leaf_not_after(key: &CertifiedKey) -> Result<u64, CertificateError> {
    let leaf = key
        .cert
        .first()
        .ok_or_else(|| CertificateError::Pem("certificate chain is empty".into()))?;
    let (_, cert) = x509_parser::parse_x509_certificate(leaf.as_ref())
        .map_err(|e| CertificateError::Pem(format!("failed to decode leaf certificate: {e}")))?;
    Ok(u64::try_from(cert.validity().not_after.timestamp()).unwrap_or_default())
}
