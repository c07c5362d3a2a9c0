//! In-memory `BlobStore` for tests.
//!
//! Locators are `{base}/{key}`. Every operation is counted, and each one can
//! be made to fail so partial-failure paths can be exercised.

use super::{BlobStore, BodyStream, ListPage, ListParams, StorageError, StorageResult};
use crate::models::object::{FetchedBlob, StoredObject};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};
use tokio::sync::Mutex;

#[derive(Clone, Debug)]
struct Entry {
    bytes: Bytes,
    content_type: Option<String>,
    uploaded_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct Calls {
    pub store: AtomicUsize,
    pub list: AtomicUsize,
    pub delete: AtomicUsize,
    pub fetch: AtomicUsize,
}

impl Calls {
    pub fn total(&self) -> usize {
        self.store.load(Ordering::SeqCst)
            + self.list.load(Ordering::SeqCst)
            + self.delete.load(Ordering::SeqCst)
            + self.fetch.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct Failures {
    pub store: AtomicBool,
    pub list: AtomicBool,
    pub delete: AtomicBool,
    pub fetch: AtomicBool,
}

pub struct MemoryBlobStore {
    base: String,
    objects: Mutex<BTreeMap<String, Entry>>,
    pub calls: Calls,
    pub fail: Failures,
}

impl MemoryBlobStore {
    pub fn new(base: &str) -> Self {
        Self {
            base: base.trim_end_matches('/').to_string(),
            objects: Mutex::new(BTreeMap::new()),
            calls: Calls::default(),
            fail: Failures::default(),
        }
    }

    pub fn url_for(&self, key: &str) -> String {
        format!("{}/{}", self.base, key)
    }

    fn key_for(&self, url: &str) -> StorageResult<String> {
        url.strip_prefix(&self.base)
            .and_then(|rest| rest.strip_prefix('/'))
            .map(str::to_string)
            .ok_or_else(|| StorageError::ForeignLocator(url.to_string()))
    }

    /// Seed an object without counting a call.
    pub async fn insert(&self, key: &str, bytes: &'static [u8], content_type: &str) {
        self.objects.lock().await.insert(
            key.to_string(),
            Entry {
                bytes: Bytes::from_static(bytes),
                content_type: Some(content_type.to_string()),
                uploaded_at: Utc::now(),
            },
        );
    }

    pub async fn keys(&self) -> Vec<String> {
        self.objects.lock().await.keys().cloned().collect()
    }

    pub async fn get(&self, key: &str) -> Option<Bytes> {
        self.objects.lock().await.get(key).map(|e| e.bytes.clone())
    }

    fn injected(flag: &AtomicBool, op: &str) -> StorageResult<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(StorageError::Upstream {
                status: 503,
                message: format!("injected {} failure", op),
            });
        }
        Ok(())
    }

    fn to_stored(&self, key: &str, entry: &Entry) -> StoredObject {
        StoredObject {
            url: self.url_for(key),
            filename: key.to_string(),
            content_type: entry.content_type.clone(),
            size: entry.bytes.len() as u64,
            uploaded_at: entry.uploaded_at,
        }
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn key_of(&self, url: &str) -> StorageResult<String> {
        self.key_for(url)
    }

    async fn store(
        &self,
        key: &str,
        content_type: Option<String>,
        mut body: BodyStream,
    ) -> StorageResult<StoredObject> {
        self.calls.store.fetch_add(1, Ordering::SeqCst);
        Self::injected(&self.fail.store, "store")?;
        if key.is_empty() || key.split('/').any(|segment| segment == "..") {
            return Err(StorageError::InvalidKey(key.to_string()));
        }

        let mut buf = BytesMut::new();
        while let Some(chunk) = body.next().await {
            buf.extend_from_slice(&chunk?);
        }
        let entry = Entry {
            bytes: buf.freeze(),
            content_type,
            uploaded_at: Utc::now(),
        };
        let stored = self.to_stored(key, &entry);
        self.objects.lock().await.insert(key.to_string(), entry);
        Ok(stored)
    }

    async fn list(&self, params: ListParams) -> StorageResult<ListPage> {
        self.calls.list.fetch_add(1, Ordering::SeqCst);
        Self::injected(&self.fail.list, "list")?;

        let objects = self.objects.lock().await;
        let prefix = params.prefix.as_deref().unwrap_or("");
        let mut matching = objects
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .filter(|(key, _)| params.cursor.as_deref().is_none_or(|c| key.as_str() > c))
            .map(|(key, entry)| self.to_stored(key, entry))
            .collect::<Vec<_>>();

        let mut cursor = None;
        if matching.len() > params.page_size() {
            matching.truncate(params.page_size());
            cursor = matching.last().map(|o| o.filename.clone());
        }
        Ok(ListPage {
            objects: matching,
            cursor,
        })
    }

    async fn delete(&self, url: &str) -> StorageResult<()> {
        self.calls.delete.fetch_add(1, Ordering::SeqCst);
        Self::injected(&self.fail.delete, "delete")?;
        let key = self.key_for(url)?;
        self.objects.lock().await.remove(&key);
        Ok(())
    }

    async fn fetch(&self, url: &str) -> StorageResult<FetchedBlob> {
        self.calls.fetch.fetch_add(1, Ordering::SeqCst);
        Self::injected(&self.fail.fetch, "fetch")?;
        let key = self.key_for(url)?;
        let objects = self.objects.lock().await;
        let entry = objects
            .get(&key)
            .ok_or_else(|| StorageError::NotFound(url.to_string()))?;
        Ok(FetchedBlob {
            bytes: entry.bytes.clone(),
            content_type: entry.content_type.clone(),
        })
    }
}
