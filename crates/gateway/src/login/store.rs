//! [`IdentityStore`]: persistence for `(session token, identity)` records.
//!
//! Records are insert-only. A token is bound to exactly one identity for the
//! lifetime of the store; inserting an existing token is refused rather than
//! rebinding it.

use std::{collections::HashMap, path::Path, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    fs::{File, OpenOptions},
    io::AsyncWriteExt,
    sync::{Mutex, RwLock},
};
use tracing::warn;

use super::SessionToken;
use crate::tls::manager::unix_now;

/// Errors produced by an [`IdentityStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// The token is already bound to an identity.
    #[error("session token already recorded")]
    Duplicate,

    /// The backing file could not be read or written.
    #[error("identity store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// A persisted record could not be decoded.
    #[error("identity store line {line} is corrupt: {reason}")]
    Corrupt { line: usize, reason: String },

    #[error("failed to encode identity record: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Where login records live.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Bind `token` to `identity`.
    ///
    /// # Errors
    ///
    /// [`StoreError::Duplicate`] if the token is already bound, or a backend
    /// failure.
    async fn insert(&self, token: &SessionToken, identity: &str) -> Result<(), StoreError>;

    /// The identity bound to `token`, if any.
    // Read by token consumers outside this binary; only tests call it here.
    #[allow(dead_code)]
    async fn lookup(&self, token: &str) -> Result<Option<String>, StoreError>;
}

/// Volatile store. Records are lost on restart.
///
/// Many concurrent readers may hold the lock at once; inserts take it
/// exclusively just long enough to check and write one entry.
#[derive(Clone, Debug, Default)]
pub struct MemoryIdentityStore {
    inner: Arc<RwLock<HashMap<String, String>>>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    #[cfg(test)]
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    async fn contains(&self, token: &str) -> bool {
        self.inner.read().await.contains_key(token)
    }
}

#[async_trait]
impl IdentityStore for MemoryIdentityStore {
    async fn insert(&self, token: &SessionToken, identity: &str) -> Result<(), StoreError> {
        let mut map = self.inner.write().await;
        if map.contains_key(token.as_str()) {
            return Err(StoreError::Duplicate);
        }
        map.insert(token.as_str().to_owned(), identity.to_owned());
        Ok(())
    }

    async fn lookup(&self, token: &str) -> Result<Option<String>, StoreError> {
        Ok(self.inner.read().await.get(token).cloned())
    }
}

/// One line of the file store.
#[derive(Debug, Serialize, Deserialize)]
struct IdentityRecord {
    token: String,
    identity: String,
    created_at: u64,
}

/// Durable store: an append-only JSON-lines file, indexed in memory.
///
/// The file is replayed on [`open`](Self::open). Each insert is written and
/// synced before it becomes visible to [`lookup`](IdentityStore::lookup).
#[derive(Debug)]
pub struct FileIdentityStore {
    index: MemoryIdentityStore,
    file: Mutex<File>,
}

impl FileIdentityStore {
    /// Open (creating if needed) the store at `path` and replay its records.
    ///
    /// A trailing line without its newline is a torn append whose insert
    /// already failed; it is dropped and the file truncated before it.
    ///
    /// # Errors
    ///
    /// I/O failures, or [`StoreError::Corrupt`] for an undecodable complete
    /// line.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let index = MemoryIdentityStore::new();
        let mut intact_len = None;
        if tokio::fs::try_exists(path).await? {
            let contents = tokio::fs::read(path).await?;
            let mut map = index.inner.write().await;
            let mut offset = 0;
            for (i, line) in contents.split_inclusive(|b| *b == b'\n').enumerate() {
                if !line.ends_with(b"\n") {
                    warn!(line = i + 1, bytes = line.len(), "dropping torn identity record");
                    intact_len = Some(offset as u64);
                    break;
                }
                offset += line.len();
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                let record: IdentityRecord =
                    serde_json::from_slice(line).map_err(|e| StoreError::Corrupt {
                        line: i + 1,
                        reason: e.to_string(),
                    })?;
                map.insert(record.token, record.identity);
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        if let Some(len) = intact_len {
            file.set_len(len).await?;
        }

        Ok(Self {
            index,
            file: Mutex::new(file),
        })
    }

    pub async fn len(&self) -> usize {
        self.index.len().await
    }
}

#[async_trait]
impl IdentityStore for FileIdentityStore {
    async fn insert(&self, token: &SessionToken, identity: &str) -> Result<(), StoreError> {
        // The file lock serializes appends, so the duplicate check below
        // cannot race with another insert of the same token.
        let mut file = self.file.lock().await;
        if self.index.contains(token.as_str()).await {
            return Err(StoreError::Duplicate);
        }

        let record = IdentityRecord {
            token: token.as_str().to_owned(),
            identity: identity.to_owned(),
            created_at: unix_now(),
        };
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        let before = file.metadata().await?.len();
        if let Err(e) = append(&mut file, &line).await {
            // Cut off whatever part of the line reached the file so the next
            // append starts on a fresh line.
            if let Err(rollback) = file.set_len(before).await {
                warn!(error = %rollback, "failed to roll back partial identity record");
            }
            return Err(e.into());
        }

        self.index.insert(token, identity).await
    }

    async fn lookup(&self, token: &str) -> Result<Option<String>, StoreError> {
        self.index.lookup(token).await
    }
}

async fn append(file: &mut File, line: &[u8]) -> std::io::Result<()> {
    file.write_all(line).await?;
    file.sync_data().await
}
