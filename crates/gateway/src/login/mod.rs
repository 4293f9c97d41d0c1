//! Passwordless public-key login.
//!
//! A client presents its public identity in a request header. The gateway
//! validates it, mints a random session token, records `(token, identity)`,
//! and returns the token sealed to that identity under [`AUTH_TOKEN_LABEL`].
//! Only the holder of the matching private key can open it, and the envelope
//! proves the server's key produced it. No secret is ever transmitted in the
//! clear and no password is stored.

pub mod store;

use std::{fmt, sync::Arc};

use common::{protocol::AUTH_TOKEN_LABEL, GatewayError, IdentityKey, IdentityKeypair};
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::crypto::IdentityCrypto;
pub use store::{FileIdentityStore, IdentityStore, MemoryIdentityStore};

/// Random bearer credential minted at login.
///
/// The value is a secret: it is sealed to the client and written to the
/// store, never logged.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SessionToken(String);

impl SessionToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for SessionToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionToken([REDACTED])")
    }
}

#[derive(Debug, Error)]
#[error("entropy source failed: {0}")]
pub struct TokenError(String);

/// Source of fresh session tokens.
#[cfg_attr(test, mockall::automock)]
pub trait TokenSource: Send + Sync {
    fn mint(&self) -> Result<SessionToken, TokenError>;
}

/// UUIDv4 tokens (122 random bits) drawn from the OS CSPRNG.
///
/// Entropy failure is reported, never papered over with a weaker source.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsRngTokens;

impl TokenSource for OsRngTokens {
    fn mint(&self) -> Result<SessionToken, TokenError> {
        let mut bytes = [0u8; 16];
        getrandom::getrandom(&mut bytes).map_err(|e| TokenError(e.to_string()))?;
        let uuid = uuid::Builder::from_random_bytes(bytes).into_uuid();
        Ok(SessionToken(uuid.hyphenated().to_string()))
    }
}

/// Performs the login exchange. Cheap to share behind an `Arc`.
pub struct LoginService {
    crypto: Arc<dyn IdentityCrypto>,
    store: Arc<dyn IdentityStore>,
    tokens: Arc<dyn TokenSource>,
    server_keys: Arc<IdentityKeypair>,
}

impl LoginService {
    pub fn new(
        crypto: Arc<dyn IdentityCrypto>,
        store: Arc<dyn IdentityStore>,
        tokens: Arc<dyn TokenSource>,
        server_keys: Arc<IdentityKeypair>,
    ) -> Self {
        Self {
            crypto,
            store,
            tokens,
            server_keys,
        }
    }

    /// Public key envelopes are sealed from.
    pub fn server_identity(&self) -> &IdentityKey {
        self.server_keys.public()
    }

    /// Run one login for the claimed identity (the raw header value).
    ///
    /// Steps run strictly in order and stop at the first failure: validate,
    /// mint, persist, seal. No record is written for a rejected identity, and
    /// a token that failed to persist is never sent.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::InvalidIdentity`]: header missing or not a valid identity.
    /// - [`GatewayError::TokenGeneration`]: entropy source failed.
    /// - [`GatewayError::Storage`]: the record could not be persisted.
    /// - [`GatewayError::Encryption`]: sealing failed. The record is already
    ///   stored by then and is left in place.
    #[instrument(skip_all)]
    pub async fn login(&self, claimed: Option<&str>) -> Result<Vec<u8>, GatewayError> {
        let claimed = claimed
            .ok_or_else(|| GatewayError::InvalidIdentity("identity header missing".into()))?;
        let recipient = self
            .crypto
            .validate(claimed)
            .map_err(|e| GatewayError::InvalidIdentity(e.to_string()))?;
        let identity = recipient.to_identity_string();

        let token = self
            .tokens
            .mint()
            .map_err(|e| GatewayError::TokenGeneration(e.to_string()))?;

        self.store
            .insert(&token, &identity)
            .await
            .map_err(|e| GatewayError::Storage(e.to_string()))?;

        let sealed = self
            .crypto
            .encrypt(
                AUTH_TOKEN_LABEL,
                token.as_str().as_bytes(),
                &self.server_keys,
                &recipient,
            )
            .map_err(|e| {
                warn!(identity = %identity, "token recorded but could not be sealed");
                GatewayError::Encryption(e.to_string())
            })?;

        info!(identity = %identity, "issued session token");
        Ok(sealed)
    }
}

impl fmt::Debug for LoginService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginService")
            .field("server_identity", self.server_keys.public())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use common::{
        envelope::{self, EnvelopeError},
        identity::IdentityError,
    };

    use super::{
        store::{MockIdentityStore, StoreError},
        *,
    };
    use crate::crypto::{MockIdentityCrypto, SealedBoxCrypto};

    fn real_service(store: Arc<dyn IdentityStore>) -> LoginService {
        LoginService::new(
            Arc::new(SealedBoxCrypto),
            store,
            Arc::new(OsRngTokens),
            Arc::new(IdentityKeypair::generate().unwrap()),
        )
    }

    #[test]
    fn os_tokens_are_uuid_v4() {
        let token = OsRngTokens.mint().unwrap();
        let parsed = uuid::Uuid::parse_str(token.as_str()).unwrap();
        assert_eq!(parsed.get_version_num(), 4);
        assert!(!format!("{token:?}").contains(token.as_str()));
    }

    #[tokio::test]
    async fn valid_identity_receives_sealed_token_it_can_open() {
        let store = Arc::new(MemoryIdentityStore::new());
        let service = real_service(store.clone());
        let client = IdentityKeypair::generate().unwrap();
        let identity = client.public().to_identity_string();

        let sealed = service.login(Some(&identity)).await.unwrap();
        let opened = envelope::open(&sealed, &client).unwrap();

        assert_eq!(opened.label, AUTH_TOKEN_LABEL);
        assert_eq!(&opened.sender, service.server_identity());
        let token = String::from_utf8(opened.plaintext).unwrap();
        assert_eq!(
            store.lookup(&token).await.unwrap().as_deref(),
            Some(identity.as_str())
        );
    }

    #[tokio::test]
    async fn other_keys_cannot_open_the_token() {
        let service = real_service(Arc::new(MemoryIdentityStore::new()));
        let client = IdentityKeypair::generate().unwrap();
        let eavesdropper = IdentityKeypair::generate().unwrap();

        let sealed = service
            .login(Some(&client.public().to_identity_string()))
            .await
            .unwrap();
        assert!(envelope::open(&sealed, &eavesdropper).is_err());
    }

    #[tokio::test]
    async fn missing_or_invalid_identity_writes_nothing() {
        let store = Arc::new(MemoryIdentityStore::new());
        let service = real_service(store.clone());

        for claimed in [None, Some(""), Some("not-an-identity"), Some("0OIl")] {
            let err = service.login(claimed).await.unwrap_err();
            assert!(matches!(err, GatewayError::InvalidIdentity(_)), "{claimed:?}");
        }
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn low_order_identity_is_rejected_before_minting() {
        let store = Arc::new(MemoryIdentityStore::new());
        let service = real_service(store.clone());
        let zero = IdentityKey::from_bytes([0u8; 32]).to_identity_string();

        let err = service.login(Some(&zero)).await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidIdentity(_)));
        assert_eq!(err.http_status(), 400);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn concurrent_logins_mint_distinct_tokens() {
        let store = Arc::new(MemoryIdentityStore::new());
        let service = Arc::new(real_service(store.clone()));
        let client = Arc::new(IdentityKeypair::generate().unwrap());
        let identity = client.public().to_identity_string();

        let handles: Vec<_> = (0..128)
            .map(|_| {
                let service = service.clone();
                let client = client.clone();
                let identity = identity.clone();
                tokio::spawn(async move {
                    let sealed = service.login(Some(&identity)).await.unwrap();
                    String::from_utf8(envelope::open(&sealed, &client).unwrap().plaintext).unwrap()
                })
            })
            .collect();

        let mut tokens = HashSet::new();
        for handle in handles {
            assert!(tokens.insert(handle.await.unwrap()));
        }
        assert_eq!(tokens.len(), 128);
        assert_eq!(store.len().await, 128);
    }

    #[tokio::test]
    async fn entropy_failure_is_token_generation_error() {
        let mut tokens = MockTokenSource::new();
        tokens
            .expect_mint()
            .returning(|| Err(TokenError("no entropy".into())));
        let mut store = MockIdentityStore::new();
        store.expect_insert().never();

        let service = LoginService::new(
            Arc::new(SealedBoxCrypto),
            Arc::new(store),
            Arc::new(tokens),
            Arc::new(IdentityKeypair::generate().unwrap()),
        );
        let identity = IdentityKeypair::generate()
            .unwrap()
            .public()
            .to_identity_string();

        let err = service.login(Some(&identity)).await.unwrap_err();
        assert!(matches!(err, GatewayError::TokenGeneration(_)));
        assert_eq!(err.public_message(), "Error generating new auth token; sorry!");
    }

    #[tokio::test]
    async fn storage_failure_never_seals_a_token() {
        let mut store = MockIdentityStore::new();
        store
            .expect_insert()
            .times(1)
            .returning(|_, _| Err(StoreError::Duplicate));

        let client = IdentityKeypair::generate().unwrap();
        let key = *client.public();
        let mut crypto = MockIdentityCrypto::new();
        crypto.expect_validate().returning(move |_| Ok(key));
        crypto.expect_encrypt().never();

        let service = LoginService::new(
            Arc::new(crypto),
            Arc::new(store),
            Arc::new(OsRngTokens),
            Arc::new(IdentityKeypair::generate().unwrap()),
        );

        let err = service.login(Some("whatever")).await.unwrap_err();
        assert!(matches!(err, GatewayError::Storage(_)));
        assert_eq!(err.http_status(), 500);
    }

    #[tokio::test]
    async fn encryption_failure_keeps_the_record() {
        let client = IdentityKeypair::generate().unwrap();
        let key = *client.public();
        let mut crypto = MockIdentityCrypto::new();
        crypto.expect_validate().returning(move |_| Ok(key));
        crypto
            .expect_encrypt()
            .withf(|label, _, _, _| label.to_string() == AUTH_TOKEN_LABEL)
            .returning(|_, _, _, _| Err(EnvelopeError::WeakKey));

        let store = Arc::new(MemoryIdentityStore::new());
        let service = LoginService::new(
            Arc::new(crypto),
            store.clone(),
            Arc::new(OsRngTokens),
            Arc::new(IdentityKeypair::generate().unwrap()),
        );

        let err = service.login(Some("whatever")).await.unwrap_err();
        assert!(matches!(err, GatewayError::Encryption(_)));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn validation_error_detail_stays_out_of_public_message() {
        let mut crypto = MockIdentityCrypto::new();
        crypto
            .expect_validate()
            .returning(|_| Err(IdentityError::Checksum));

        let service = LoginService::new(
            Arc::new(crypto),
            Arc::new(MemoryIdentityStore::new()),
            Arc::new(OsRngTokens),
            Arc::new(IdentityKeypair::generate().unwrap()),
        );

        let err = service.login(Some("abc")).await.unwrap_err();
        assert_eq!(err.public_message(), "Error: invalid identity");
        assert!(err.to_string().contains("checksum"));
    }
}
