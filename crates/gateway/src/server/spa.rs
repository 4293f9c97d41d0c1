//! Single-page-application index document.
//!
//! Client-side routes (`/dashboard/...`, `/0...`, ...) all receive the same
//! `index.html`. The file is read on first use and served from memory after
//! that; a failed read is reported and retried on the next request.

use std::{path::PathBuf, sync::Arc};

use arc_swap::ArcSwapOption;
use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use common::GatewayError;

use super::handlers::error_response;

/// Cached SPA entry point plus the path prefixes it answers for.
#[derive(Clone, Debug)]
pub struct SpaIndex {
    path: Arc<PathBuf>,
    prefixes: Arc<[String]>,
    cached: Arc<ArcSwapOption<Bytes>>,
}

impl SpaIndex {
    pub fn new(path: impl Into<PathBuf>, prefixes: Vec<String>) -> Self {
        Self {
            path: Arc::new(path.into()),
            prefixes: prefixes.into(),
            cached: Arc::new(ArcSwapOption::empty()),
        }
    }

    /// Plain string-prefix match: `/0` covers `/0`, `/01` and `/0/a/b`.
    pub fn matches(&self, path: &str) -> bool {
        self.prefixes.iter().any(|prefix| path.starts_with(prefix.as_str()))
    }

    /// The document bytes, exactly as on disk.
    ///
    /// # Errors
    ///
    /// [`GatewayError::IndexUnavailable`] if the file cannot be read.
    pub async fn document(&self) -> Result<Bytes, GatewayError> {
        if let Some(bytes) = self.cached.load_full() {
            return Ok(Bytes::clone(&bytes));
        }
        let bytes = Bytes::from(tokio::fs::read(self.path.as_path()).await.map_err(|e| {
            GatewayError::IndexUnavailable(format!("{}: {e}", self.path.display()))
        })?);
        self.cached.store(Some(Arc::new(bytes.clone())));
        Ok(bytes)
    }

    /// `200 text/html` with the document, or the index error response.
    pub async fn respond(&self) -> Response {
        match self.document().await {
            Ok(bytes) => (
                StatusCode::OK,
                [(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("text/html; charset=utf-8"),
                )],
                bytes,
            )
                .into_response(),
            Err(e) => error_response(&e),
        }
    }
}
