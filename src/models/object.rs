//! Represents a blob as reported by a storage backend.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single stored blob.
///
/// The server never persists these itself; they are owned by whichever
/// backend produced them and are rebuilt on every request.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoredObject {
    /// Opaque locator returned by the backend. Used as the handle for
    /// fetch, delete and rename.
    pub url: String,

    /// Storage key the object was written under.
    pub filename: String,

    /// MIME type, when the backend reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,

    /// Size in bytes.
    pub size: u64,

    /// When the object was written.
    pub uploaded_at: DateTime<Utc>,
}

/// Payload and content type read back from a locator.
#[derive(Clone, Debug)]
pub struct FetchedBlob {
    pub bytes: Bytes,
    pub content_type: Option<String>,
}
