//! ACME (RFC 8555) certificate issuance with HTTP-01 challenges.
//!
//! # Order flow
//!
//! 1. Load the account from the cache, or register one (terms of service are
//!    accepted non-interactively) and cache its credentials.
//! 2. Create an order for the single domain.
//! 3. For each pending authorization, publish the HTTP-01 key authorization in
//!    [`ChallengeTokens`] and tell the CA the challenge is ready.
//! 4. Poll until the order is ready, finalize with a fresh CSR, and poll for
//!    the certificate chain.
//!
//! Challenge tokens are unpublished when the order settles, success or not.

use std::time::Duration;

use async_trait::async_trait;
use instant_acme::{
    Account, AuthorizationStatus, ChallengeType, Identifier, NewAccount, NewOrder, Order,
    OrderStatus,
};
use tracing::{debug, info};

use super::{
    cache::CertCache,
    challenge::ChallengeTokens,
    manager::{unix_now, CertificateIssuer, IssuedCertificate},
    CertificateError,
};

const POLL_ATTEMPTS: u32 = 10;
const POLL_INITIAL_DELAY: Duration = Duration::from_millis(500);

/// [`CertificateIssuer`] backed by an ACME certificate authority.
#[derive(Debug, Clone)]
pub struct AcmeIssuer {
    directory_url: String,
    contact_email: Option<String>,
    cache: CertCache,
    challenges: ChallengeTokens,
}

impl AcmeIssuer {
    pub fn new(
        directory_url: impl Into<String>,
        contact_email: Option<String>,
        cache: CertCache,
        challenges: ChallengeTokens,
    ) -> Self {
        Self {
            directory_url: directory_url.into(),
            contact_email,
            cache,
            challenges,
        }
    }

    async fn account(&self) -> Result<Account, CertificateError> {
        if let Some(credentials) = self.cache.load_account().await? {
            debug!("using cached ACME account");
            return Account::from_credentials(credentials).await.map_err(acme_err);
        }

        let contact: Vec<String> = self
            .contact_email
            .iter()
            .map(|email| format!("mailto:{email}"))
            .collect();
        let contact: Vec<&str> = contact.iter().map(String::as_str).collect();

        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &contact,
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            &self.directory_url,
            None,
        )
        .await
        .map_err(acme_err)?;

        self.cache.store_account(&credentials).await?;
        info!(directory = %self.directory_url, "registered ACME account");
        Ok(account)
    }
}

#[async_trait]
impl CertificateIssuer for AcmeIssuer {
    async fn issue(&self, domain: &str) -> Result<IssuedCertificate, CertificateError> {
        let account = self.account().await?;
        let identifiers = [Identifier::Dns(domain.to_owned())];
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await
            .map_err(acme_err)?;

        let mut scope = self.challenges.scoped();
        let authorizations = order.authorizations().await.map_err(acme_err)?;
        for authz in &authorizations {
            match authz.status {
                AuthorizationStatus::Pending => {}
                AuthorizationStatus::Valid => continue,
                ref other => {
                    return Err(CertificateError::Acme(format!(
                        "authorization is {other:?}"
                    )))
                }
            }

            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Http01)
                .ok_or_else(|| CertificateError::Acme("CA offered no http-01 challenge".into()))?;

            let key_authorization = order.key_authorization(challenge);
            scope.register(&challenge.token, key_authorization.as_str());
            order
                .set_challenge_ready(&challenge.url)
                .await
                .map_err(acme_err)?;
            debug!(domain, token = %challenge.token, "http-01 challenge published");
        }

        wait_for(&mut order, OrderStatus::Ready).await?;
        drop(scope);

        let key_pair = rcgen::KeyPair::generate().map_err(|e| CertificateError::Csr(e.to_string()))?;
        let mut params = rcgen::CertificateParams::new(vec![domain.to_owned()])
            .map_err(|e| CertificateError::Csr(e.to_string()))?;
        params.distinguished_name = rcgen::DistinguishedName::new();
        let csr = params
            .serialize_request(&key_pair)
            .map_err(|e| CertificateError::Csr(e.to_string()))?;

        order.finalize(csr.der()).await.map_err(acme_err)?;
        let chain_pem = poll_certificate(&mut order).await?;

        info!(domain, "certificate issued");
        Ok(IssuedCertificate {
            chain_pem,
            key_pem: key_pair.serialize_pem(),
            issued_at: unix_now(),
        })
    }
}

/// Poll the order with exponential backoff until it reaches `target`.
async fn wait_for(order: &mut Order, target: OrderStatus) -> Result<(), CertificateError> {
    let mut delay = POLL_INITIAL_DELAY;
    for _ in 0..POLL_ATTEMPTS {
        let state = order.refresh().await.map_err(acme_err)?;
        if state.status == target {
            return Ok(());
        }
        if state.status == OrderStatus::Invalid {
            return Err(CertificateError::Acme("order became invalid".into()));
        }
        tokio::time::sleep(delay).await;
        delay *= 2;
    }
    Err(CertificateError::Acme(format!(
        "order did not reach {target:?} after {POLL_ATTEMPTS} polls"
    )))
}

async fn poll_certificate(order: &mut Order) -> Result<String, CertificateError> {
    let mut delay = POLL_INITIAL_DELAY;
    for _ in 0..POLL_ATTEMPTS {
        if let Some(chain) = order.certificate().await.map_err(acme_err)? {
            return Ok(chain);
        }
        tokio::time::sleep(delay).await;
        delay *= 2;
    }
    Err(CertificateError::Acme("certificate was not issued in time".into()))
}

fn acme_err(err: instant_acme::Error) -> CertificateError {
    CertificateError::Acme(err.to_string())
}
