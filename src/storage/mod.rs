//! Blob storage capability.
//!
//! Every backend exposes the same four operations the HTTP layer needs:
//! `store`, `list`, `delete` and `fetch`. Handlers only ever see
//! `Arc<dyn BlobStore>`, so the backend is chosen once at startup and can be
//! swapped for an in-memory fake in tests.

use crate::models::object::{FetchedBlob, StoredObject};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{
    StreamExt,
    stream::{self, BoxStream},
};
use std::io;
use thiserror::Error;

pub mod local;
#[cfg(test)]
pub mod memory;
pub mod vercel;

/// Request bodies are handed to backends as a stream of chunks so uploads
/// never have to be buffered in full.
pub type BodyStream = BoxStream<'static, io::Result<Bytes>>;

/// Largest page a single `list` call returns.
pub const MAX_LIST_LIMIT: usize = 1000;

#[derive(Clone, Debug, Default)]
pub struct ListParams {
    pub prefix: Option<String>,
    pub limit: Option<usize>,
    pub cursor: Option<String>,
}

impl ListParams {
    /// Effective page size, clamped to `1..=MAX_LIST_LIMIT`.
    pub fn page_size(&self) -> usize {
        self.limit.unwrap_or(MAX_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT)
    }
}

#[derive(Debug, Default)]
pub struct ListPage {
    pub objects: Vec<StoredObject>,
    /// Present when more objects follow this page.
    pub cursor: Option<String>,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object `{0}` not found")]
    NotFound(String),
    #[error("invalid object key `{0}`")]
    InvalidKey(String),
    #[error("locator `{0}` does not belong to this store")]
    ForeignLocator(String),
    #[error("upstream returned {status}: {message}")]
    Upstream { status: u16, message: String },
    #[error("storage backend misconfigured: {0}")]
    Misconfigured(String),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Write `body` under `key`, replacing whatever was stored there.
    async fn store(
        &self,
        key: &str,
        content_type: Option<String>,
        body: BodyStream,
    ) -> StorageResult<StoredObject>;

    async fn list(&self, params: ListParams) -> StorageResult<ListPage>;

    /// Remove the object behind `url`. Removing something that is already
    /// gone succeeds.
    async fn delete(&self, url: &str) -> StorageResult<()>;

    /// Read back the payload and content type behind `url`.
    async fn fetch(&self, url: &str) -> StorageResult<FetchedBlob>;

    /// Storage key named by `url`. Differently spelled locators for the same
    /// object resolve to the same key.
    fn key_of(&self, url: &str) -> StorageResult<String>;

    /// Readiness probe. Defaults to always ready.
    async fn check(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// Wrap an in-memory payload as a single-chunk body stream.
pub fn body_from_bytes(bytes: Bytes) -> BodyStream {
    stream::once(async move { Ok(bytes) }).boxed()
}
