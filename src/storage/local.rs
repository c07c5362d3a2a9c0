//! src/storage/local.rs
//!
//! LocalBlobStore — a self-hosted backend: SQLite for metadata and local disk
//! for payloads, sharded beneath `base_path/{shard}/{shard}/{key}`. Locators
//! have the form `{public_base_url}/blobs/{key}` and are served back by the
//! `/blobs/{*key}` route.

use super::{BlobStore, BodyStream, ListPage, ListParams, StorageError, StorageResult};
use crate::models::object::{FetchedBlob, StoredObject};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use md5::Context;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use sqlx::{FromRow, QueryBuilder, SqlitePool, sqlite::Sqlite};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::{debug, info};
use uuid::Uuid;

const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");
const MAX_OBJECT_KEY_LEN: usize = 1024;
const BLOB_ROUTE: &str = "/blobs/";

/// Characters left unescaped inside a single key segment.
const KEY_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Metadata row for a stored payload.
#[derive(Clone, Debug, FromRow)]
pub struct ObjectRecord {
    pub key: String,
    pub content_type: Option<String>,
    pub size_bytes: i64,
    /// Hex MD5 of the payload.
    pub etag: String,
    pub uploaded_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct LocalBlobStore {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,

    /// Base directory on disk where payloads are stored.
    pub base_path: PathBuf,

    /// Externally reachable origin of this server, without trailing slash.
    public_base_url: String,
}

impl LocalBlobStore {
    pub fn new(
        db: Arc<SqlitePool>,
        base_path: impl Into<PathBuf>,
        public_base_url: impl Into<String>,
    ) -> Self {
        Self {
            db,
            base_path: base_path.into(),
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Apply the embedded schema. Safe to run repeatedly.
    pub async fn migrate(&self) -> StorageResult<()> {
        let statements = SCHEMA
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        debug!("Running {} migration statements", statements.len());
        for stmt in statements {
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(())
    }

    /// Rejects empty or oversized keys, absolute keys, `.`/`..` segments and
    /// control characters so a key can never escape `base_path`.
    fn ensure_key_safe(key: &str) -> StorageResult<()> {
        let invalid = key.is_empty()
            || key.len() > MAX_OBJECT_KEY_LEN
            || key.starts_with('/')
            || key.split('/').any(|segment| segment == ".." || segment == ".")
            || key
                .bytes()
                .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0');
        if invalid {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(())
    }

    /// Two-level shard identifiers: the first two bytes of MD5(key) as hex.
    fn object_shards(key: &str) -> (String, String) {
        let digest = md5::compute(key);
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn object_path(&self, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(key);
        let mut path = self.base_path.clone();
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    /// Public locator for `key`.
    pub fn url_for(&self, key: &str) -> String {
        let encoded = key
            .split('/')
            .map(|segment| utf8_percent_encode(segment, KEY_SEGMENT).to_string())
            .collect::<Vec<_>>()
            .join("/");
        format!("{}{}{}", self.public_base_url, BLOB_ROUTE, encoded)
    }

    /// Inverse of [`Self::url_for`]. Locators minted by anyone else are rejected.
    pub fn key_for(&self, url: &str) -> StorageResult<String> {
        let encoded = url
            .strip_prefix(&self.public_base_url)
            .and_then(|rest| rest.strip_prefix(BLOB_ROUTE))
            .ok_or_else(|| StorageError::ForeignLocator(url.to_string()))?;
        let key = percent_decode_str(encoded)
            .decode_utf8()
            .map_err(|_| StorageError::InvalidKey(encoded.to_string()))?
            .into_owned();
        Self::ensure_key_safe(&key)?;
        Ok(key)
    }

    fn to_stored(&self, record: ObjectRecord) -> StoredObject {
        StoredObject {
            url: self.url_for(&record.key),
            size: record.size_bytes.max(0) as u64,
            content_type: record.content_type,
            uploaded_at: record.uploaded_at,
            filename: record.key,
        }
    }

    async fn fetch_record(&self, key: &str) -> StorageResult<ObjectRecord> {
        sqlx::query_as::<_, ObjectRecord>(
            "SELECT key, content_type, size_bytes, etag, uploaded_at
             FROM objects WHERE key = ?",
        )
        .bind(key)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StorageError::NotFound(key.to_string()),
            other => StorageError::Sqlx(other),
        })
    }

    /// Metadata plus an open handle to the payload, for streaming out.
    pub async fn open(&self, key: &str) -> StorageResult<(ObjectRecord, File)> {
        Self::ensure_key_safe(key)?;
        let record = self.fetch_record(key).await?;
        let file = File::open(self.object_path(key))
            .await
            .map_err(|err| match err.kind() {
                ErrorKind::NotFound => StorageError::NotFound(key.to_string()),
                _ => StorageError::Io(err),
            })?;
        Ok((record, file))
    }

    /// Write the stream to a temp file next to its final location. Returns
    /// the temp path, size and etag; the temp file is removed on failure.
    async fn write_payload(
        &self,
        file_path: &Path,
        mut body: BodyStream,
    ) -> StorageResult<(PathBuf, i64, String)> {
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StorageError::Io(io::Error::new(
                ErrorKind::Other,
                "object path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));

        let result = async {
            let mut file = File::create(&tmp_path).await?;
            let mut size_bytes: i64 = 0;
            let mut digest = Context::new();
            while let Some(chunk) = body.next().await {
                let chunk = chunk?;
                size_bytes += chunk.len() as i64;
                digest.consume(&chunk);
                file.write_all(&chunk).await?;
            }
            file.flush().await?;
            file.sync_all().await?;
            Ok::<_, io::Error>((size_bytes, format!("{:x}", digest.compute())))
        }
        .await;

        match result {
            Ok((size_bytes, etag)) => Ok((tmp_path, size_bytes, etag)),
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                Err(StorageError::Io(err))
            }
        }
    }

    /// Remove empty shard directories between `start` and `base_path`.
    async fn prune_empty_dirs(&self, start: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(&self.base_path) && current != self.base_path {
            match fs::remove_dir(&current).await {
                Ok(_) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err)
                    if matches!(
                        err.kind(),
                        ErrorKind::NotFound | ErrorKind::DirectoryNotEmpty
                    ) =>
                {
                    break;
                }
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    fn name(&self) -> &'static str {
        "local"
    }

    fn key_of(&self, url: &str) -> StorageResult<String> {
        self.key_for(url)
    }

    async fn store(
        &self,
        key: &str,
        content_type: Option<String>,
        body: BodyStream,
    ) -> StorageResult<StoredObject> {
        Self::ensure_key_safe(key)?;
        let file_path = self.object_path(key);
        let (tmp_path, size_bytes, etag) = self.write_payload(&file_path, body).await?;

        // The row is only committed once the payload is in place, and the
        // payload is only moved in while the row update is pending. A failure
        // at either step keeps the previous row and payload together.
        let result = async {
            let mut tx = self.db.begin().await?;
            let record = sqlx::query_as::<_, ObjectRecord>(
                r#"
                INSERT INTO objects (id, key, content_type, size_bytes, etag, uploaded_at)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(key) DO UPDATE SET
                    content_type = excluded.content_type,
                    size_bytes = excluded.size_bytes,
                    etag = excluded.etag,
                    uploaded_at = excluded.uploaded_at
                RETURNING key, content_type, size_bytes, etag, uploaded_at
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(key)
            .bind(content_type)
            .bind(size_bytes)
            .bind(&etag)
            .bind(Utc::now())
            .fetch_one(&mut *tx)
            .await?;

            fs::rename(&tmp_path, &file_path).await?;
            tx.commit().await?;
            Ok::<_, StorageError>(record)
        }
        .await;

        match result {
            Ok(record) => {
                info!("stored {} ({} bytes)", key, size_bytes);
                Ok(self.to_stored(record))
            }
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                Err(err)
            }
        }
    }

    /// Lexicographic listing. The cursor is the base64-encoded last key of
    /// the previous page.
    async fn list(&self, params: ListParams) -> StorageResult<ListPage> {
        let page_size = params.page_size();
        let fetch_limit = page_size + 1;

        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT key, content_type, size_bytes, etag, uploaded_at FROM objects WHERE 1 = 1",
        );
        if let Some(prefix) = params.prefix.as_deref().filter(|p| !p.is_empty()) {
            builder.push(" AND substr(key, 1, length(");
            builder.push_bind(prefix.to_string());
            builder.push(")) = ");
            builder.push_bind(prefix.to_string());
        }
        if let Some(after) = params.cursor.as_deref().map(decode_cursor) {
            builder.push(" AND key > ");
            builder.push_bind(after);
        }
        builder.push(" ORDER BY key ASC LIMIT ");
        builder.push_bind(fetch_limit as i64);

        let mut rows: Vec<ObjectRecord> = builder.build_query_as().fetch_all(&*self.db).await?;

        let mut cursor = None;
        if rows.len() == fetch_limit {
            rows.pop();
            cursor = rows.last().map(|last| encode_cursor(&last.key));
        }

        Ok(ListPage {
            objects: rows.into_iter().map(|r| self.to_stored(r)).collect(),
            cursor,
        })
    }

    async fn delete(&self, url: &str) -> StorageResult<()> {
        let key = self.key_for(url)?;
        // The row removal is rolled back (by dropping `tx`) if the payload
        // cannot be removed, so the row never outlives its payload.
        let mut tx = self.db.begin().await?;
        let result = sqlx::query("DELETE FROM objects WHERE key = ?")
            .bind(&key)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            debug!("delete of {} is a no-op, no such object", key);
        }

        let file_path = self.object_path(&key);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed physical file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", file_path.display());
            }
            Err(err) => return Err(StorageError::Io(err)),
        }
        tx.commit().await?;

        if let Some(parent) = file_path.parent() {
            self.prune_empty_dirs(parent).await;
        }
        Ok(())
    }

    async fn fetch(&self, url: &str) -> StorageResult<FetchedBlob> {
        let key = self.key_for(url)?;
        let record = self.fetch_record(&key).await?;
        let bytes = fs::read(self.object_path(&key))
            .await
            .map_err(|err| match err.kind() {
                ErrorKind::NotFound => StorageError::NotFound(key.clone()),
                _ => StorageError::Io(err),
            })?;
        Ok(FetchedBlob {
            bytes: Bytes::from(bytes),
            content_type: record.content_type,
        })
    }

    /// Runs `SELECT 1` and a write/read/delete round trip under `base_path`.
    async fn check(&self) -> StorageResult<()> {
        let one: i64 = sqlx::query_scalar("SELECT 1").fetch_one(&*self.db).await?;
        if one != 1 {
            return Err(StorageError::Io(io::Error::new(
                ErrorKind::Other,
                format!("unexpected SELECT 1 result: {}", one),
            )));
        }

        fs::create_dir_all(&self.base_path).await?;
        let probe = self.base_path.join(format!(".readyz-{}", Uuid::new_v4()));
        fs::write(&probe, b"readyz").await?;
        let read_back = fs::read(&probe).await;
        let _ = fs::remove_file(&probe).await;
        if read_back? != b"readyz" {
            return Err(StorageError::Io(io::Error::new(
                ErrorKind::Other,
                "probe file content mismatch",
            )));
        }
        Ok(())
    }
}

fn encode_cursor(key: &str) -> String {
    general_purpose::STANDARD.encode(key)
}

fn decode_cursor(cursor: &str) -> String {
    general_purpose::STANDARD
        .decode(cursor)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or_else(|| cursor.to_string())
}
