//! [`CertificateManager`]: the certificate for one domain, resolved per
//! handshake and renewed in the background.
//!
//! # Concurrency
//!
//! - Handshakes read the active certificate through an [`ArcSwapOption`]; they
//!   never block and never wait on the certificate authority.
//! - Renewals are serialized by an async mutex. A renewal that acquires the
//!   lock re-checks whether the certificate is still due, so two concurrent
//!   callers result in one CA order and one cache write.

use std::{
    fmt,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use rustls::{
    server::{ClientHello, ResolvesServerCert},
    sign::CertifiedKey,
};
use serde::{Deserialize, Serialize};
use tokio::{sync::Mutex, time};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    cache::CertCache,
    pem::{certified_key_from_pem, leaf_not_after},
    CertificateError,
};

/// A certificate chain and key as returned by the CA and stored in the cache.
#[derive(Clone, Serialize, Deserialize)]
pub struct IssuedCertificate {
    pub chain_pem: String,
    pub key_pem: String,
    /// Unix seconds at which the certificate was obtained.
    pub issued_at: u64,
}

impl fmt::Debug for IssuedCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedCertificate")
            .field("issued_at", &self.issued_at)
            .field("key_pem", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

/// Obtains a fresh certificate for a domain from a certificate authority.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CertificateIssuer: Send + Sync {
    async fn issue(&self, domain: &str) -> Result<IssuedCertificate, CertificateError>;
}

struct Active {
    key: Arc<CertifiedKey>,
    /// Leaf `notAfter`, Unix seconds.
    not_after: u64,
}

impl Active {
    fn from_pem(chain_pem: &[u8], key_pem: &[u8]) -> Result<Self, CertificateError> {
        let key = certified_key_from_pem(chain_pem, key_pem)?;
        let not_after = leaf_not_after(&key)?;
        Ok(Self { key, not_after })
    }
}

enum Renewal {
    Acme {
        issuer: Arc<dyn CertificateIssuer>,
        cache: CertCache,
        renew_before: Duration,
    },
    Static,
}

/// Supplies the certificate for exactly one configured domain.
pub struct CertificateManager {
    domain: String,
    active: ArcSwapOption<Active>,
    renewal: Renewal,
    lock: Mutex<()>,
}

impl CertificateManager {
    /// Manager that provisions and renews through `issuer`, caching in `cache`.
    pub fn with_acme(
        domain: impl Into<String>,
        issuer: Arc<dyn CertificateIssuer>,
        cache: CertCache,
        renew_before: Duration,
    ) -> Self {
        Self {
            domain: domain.into().to_ascii_lowercase(),
            active: ArcSwapOption::empty(),
            renewal: Renewal::Acme {
                issuer,
                cache,
                renew_before,
            },
            lock: Mutex::new(()),
        }
    }

    /// Manager seeded from an operator-supplied PEM chain and key. Never renews.
    ///
    /// # Errors
    ///
    /// Returns [`CertificateError::Pem`] if the PEM material is unusable.
    pub fn with_static_pem(
        domain: impl Into<String>,
        chain_pem: &[u8],
        key_pem: &[u8],
    ) -> Result<Self, CertificateError> {
        let active = Active::from_pem(chain_pem, key_pem)?;
        Ok(Self {
            domain: domain.into().to_ascii_lowercase(),
            active: ArcSwapOption::from_pointee(active),
            renewal: Renewal::Static,
            lock: Mutex::new(()),
        })
    }

    /// The certificate to present for `server_name`.
    ///
    /// # Errors
    ///
    /// Fails when the client sent no SNI name, asked for any name other than the
    /// configured domain, or no certificate has been provisioned yet.
    pub fn certificate_for(
        &self,
        server_name: Option<&str>,
    ) -> Result<Arc<CertifiedKey>, CertificateError> {
        let name = server_name.ok_or(CertificateError::MissingServerName)?;
        if !name.eq_ignore_ascii_case(&self.domain) {
            return Err(CertificateError::UnknownServerName(name.to_owned()));
        }
        self.active
            .load()
            .as_ref()
            .map(|a| Arc::clone(&a.key))
            .ok_or_else(|| CertificateError::NotProvisioned(self.domain.clone()))
    }

    /// Load a cached certificate if one exists, then provision if it is
    /// missing or due. Called once before the TLS listener starts.
    ///
    /// # Errors
    ///
    /// Returns an error if no certificate could be loaded or issued. A failed
    /// renewal of a loaded certificate is logged, not returned.
    pub async fn bootstrap(&self) -> Result<(), CertificateError> {
        if let Renewal::Acme { cache, .. } = &self.renewal {
            match cache.load_certificate(&self.domain).await {
                Ok(Some(cached)) => {
                    match Active::from_pem(cached.chain_pem.as_bytes(), cached.key_pem.as_bytes()) {
                        Ok(active) => {
                            info!(
                                domain = %self.domain,
                                issued_at = cached.issued_at,
                                not_after = active.not_after,
                                "loaded cached certificate"
                            );
                            self.active.store(Some(Arc::new(active)));
                        }
                        Err(e) => warn!(domain = %self.domain, error = %e, "ignoring unusable cached certificate"),
                    }
                }
                Ok(None) => debug!(domain = %self.domain, "no cached certificate"),
                Err(e) => warn!(domain = %self.domain, error = %e, "certificate cache unreadable"),
            }
        }
        match self.renew_if_due().await {
            Ok(_) => Ok(()),
            // A cached certificate inside its renewal window still serves.
            Err(e) if self.active.load().is_some() => {
                warn!(domain = %self.domain, error = %e, "renewal failed at startup; serving cached certificate");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Obtain a new certificate if the active one is missing or inside the
    /// renewal window. Returns `true` if a new certificate was installed.
    ///
    /// On failure the active certificate, if any, stays in place.
    ///
    /// # Errors
    ///
    /// Returns an error if the CA order, PEM parsing, or cache write fails.
    pub async fn renew_if_due(&self) -> Result<bool, CertificateError> {
        let Renewal::Acme {
            issuer,
            cache,
            renew_before,
        } = &self.renewal
        else {
            return Ok(false);
        };

        if !self.is_due(*renew_before) {
            return Ok(false);
        }
        let _serialized = self.lock.lock().await;
        if !self.is_due(*renew_before) {
            debug!(domain = %self.domain, "certificate renewed concurrently; skipping");
            return Ok(false);
        }

        info!(domain = %self.domain, "requesting certificate");
        let issued = issuer.issue(&self.domain).await?;
        let active = Active::from_pem(issued.chain_pem.as_bytes(), issued.key_pem.as_bytes())?;
        cache.store_certificate(&self.domain, &issued).await?;
        info!(domain = %self.domain, not_after = active.not_after, "certificate installed");
        self.active.store(Some(Arc::new(active)));
        Ok(true)
    }

    fn is_due(&self, renew_before: Duration) -> bool {
        match self.active.load().as_ref() {
            None => true,
            Some(active) => renewal_due(active.not_after, unix_now(), renew_before),
        }
    }

    /// Spawn a background task that checks for renewal every `check_every`
    /// until `shutdown` fires. Failures keep the current certificate and are
    /// logged.
    pub fn renewal_task(
        self: Arc<Self>,
        check_every: Duration,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval(check_every);
            // First tick fires immediately; bootstrap already ran.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match self.renew_if_due().await {
                    Ok(true) => info!(domain = %self.domain, "certificate renewed"),
                    Ok(false) => debug!(domain = %self.domain, "certificate not due"),
                    Err(e) => warn!(domain = %self.domain, error = %e, "certificate renewal failed; retaining current certificate"),
                }
            }
        })
    }
}

impl fmt::Debug for CertificateManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateManager")
            .field("domain", &self.domain)
            .field("provisioned", &self.active.load().is_some())
            .finish_non_exhaustive()
    }
}

impl ResolvesServerCert for CertificateManager {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        match self.certificate_for(client_hello.server_name()) {
            Ok(key) => Some(key),
            Err(e) => {
                warn!(error = %e, "rejecting TLS handshake");
                None
            }
        }
    }
}

/// Whether a certificate expiring at `not_after` must be renewed at `now`.
pub fn renewal_due(not_after: u64, now: u64, renew_before: Duration) -> bool {
    now.saturating_add(renew_before.as_secs()) >= not_after
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
