//! Rename as fetch → store → delete.
//!
//! No backend offers a native rename, so the object is copied under the new
//! key and the old locator is deleted afterwards. The three calls run strictly
//! in order and nothing is rolled back:
//!
//! - fetch fails: nothing happened.
//! - store fails: the old object is untouched.
//! - delete fails: both the old and the new object exist.

use crate::{
    models::object::StoredObject,
    storage::{BlobStore, StorageError, body_from_bytes},
};
use std::fmt;
use thiserror::Error;
use tracing::{debug, info, warn};

/// The step of a rename that failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RenameStep {
    Fetch,
    Store,
    Delete,
}

impl fmt::Display for RenameStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RenameStep::Fetch => "fetch",
            RenameStep::Store => "store",
            RenameStep::Delete => "delete",
        })
    }
}

#[derive(Debug, Error)]
pub enum RenameError {
    #[error("could not retrieve the original blob: {0}")]
    Fetch(#[source] StorageError),
    #[error("could not store the blob under its new name: {0}")]
    Store(#[source] StorageError),
    /// The copy exists at `new_object.url`; the original was left in place.
    #[error("blob copied to {} but the original could not be deleted: {source}", .new_object.url)]
    Delete {
        new_object: Box<StoredObject>,
        #[source]
        source: StorageError,
    },
}

impl RenameError {
    pub fn step(&self) -> RenameStep {
        match self {
            RenameError::Fetch(_) => RenameStep::Fetch,
            RenameError::Store(_) => RenameStep::Store,
            RenameError::Delete { .. } => RenameStep::Delete,
        }
    }
}

/// Copy the blob at `url` to `new_filename`, keeping its content type, then
/// delete the original.
pub async fn rename(
    store: &dyn BlobStore,
    url: &str,
    new_filename: &str,
) -> Result<StoredObject, RenameError> {
    let old_key = store.key_of(url).map_err(RenameError::Fetch)?;
    let fetched = store.fetch(url).await.map_err(RenameError::Fetch)?;
    debug!(
        "fetched {} ({} bytes) for rename to {}",
        url,
        fetched.bytes.len(),
        new_filename
    );

    let new_object = store
        .store(
            new_filename,
            fetched.content_type,
            body_from_bytes(fetched.bytes),
        )
        .await
        .map_err(RenameError::Store)?;

    // Renaming onto the same key overwrote the original in place. Compare
    // keys, not locators: one key can be spelled as several URLs.
    if new_object.filename == old_key {
        debug!("rename of {} onto itself, nothing to delete", url);
        return Ok(new_object);
    }

    if let Err(source) = store.delete(url).await {
        warn!(
            old_url = %url,
            new_url = %new_object.url,
            "rename left a duplicate: original could not be deleted: {}",
            source
        );
        return Err(RenameError::Delete {
            new_object: Box::new(new_object),
            source,
        });
    }

    info!("renamed {} to {}", url, new_object.url);
    Ok(new_object)
}
