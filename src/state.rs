//! Shared request state.

use crate::storage::{BlobStore, local::LocalBlobStore};
use std::sync::Arc;

/// Cloned into every handler. Holds the configured backend and, when that
/// backend is the local one, a typed handle so `/blobs/{*key}` can stream
/// payloads straight from disk.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn BlobStore>,
    pub local: Option<LocalBlobStore>,
}

impl AppState {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self { store, local: None }
    }

    pub fn with_local(local: LocalBlobStore) -> Self {
        Self {
            store: Arc::new(local.clone()),
            local: Some(local),
        }
    }
}
