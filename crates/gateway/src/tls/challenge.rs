//! Pending ACME HTTP-01 challenge tokens.
//!
//! The issuer registers `token → key authorization` while an order is being
//! validated; both listeners answer `/.well-known/acme-challenge/<token>` from
//! this map. Entries are removed as soon as the order settles.

use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};

/// Shared map of pending challenge tokens to their key authorizations.
#[derive(Clone, Debug, Default)]
pub struct ChallengeTokens {
    inner: Arc<RwLock<HashMap<String, String>>>,
}

impl ChallengeTokens {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending challenge.
    pub fn insert(&self, token: impl Into<String>, key_authorization: impl Into<String>) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(token.into(), key_authorization.into());
    }

    /// Forget a challenge once its order is settled.
    pub fn remove(&self, token: &str) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(token);
    }

    /// Key authorization for `token`, if it is pending.
    pub fn get(&self, token: &str) -> Option<String> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(token)
            .cloned()
    }

    /// Key authorization for a request path of the form
    /// `/.well-known/acme-challenge/<token>`.
    pub fn respond_to_path(&self, path: &str) -> Option<String> {
        let token = path.strip_prefix(common::protocol::ACME_CHALLENGE_PREFIX)?;
        if token.is_empty() || token.contains('/') {
            return None;
        }
        self.get(token)
    }

    /// Open a registration scope. Tokens registered through it are removed
    /// when it drops, whatever way the order ends.
    pub fn scoped(&self) -> ChallengeScope {
        ChallengeScope {
            tokens: self.clone(),
            registered: Vec::new(),
        }
    }
}

/// Removes every challenge it registered when dropped.
#[derive(Debug)]
pub struct ChallengeScope {
    tokens: ChallengeTokens,
    registered: Vec<String>,
}

impl ChallengeScope {
    pub fn register(&mut self, token: &str, key_authorization: &str) {
        self.tokens.insert(token, key_authorization);
        self.registered.push(token.to_owned());
    }
}

impl Drop for ChallengeScope {
    fn drop(&mut self) {
        for token in self.registered.drain(..) {
            self.tokens.remove(&token);
        }
    }
}
