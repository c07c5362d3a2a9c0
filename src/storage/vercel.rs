//! Vercel Blob backend.
//!
//! Talks to the Vercel Blob REST API directly with `reqwest`. Objects are
//! written with a fixed pathname (no random suffix) and overwrite allowed, so
//! the locator of a stored object is derived from its filename and storing
//! under an existing filename replaces it.

use super::{BlobStore, BodyStream, ListPage, ListParams, StorageError, StorageResult};
use crate::models::object::{FetchedBlob, StoredObject};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use percent_encoding::percent_decode_str;
use reqwest::{Client, RequestBuilder, Response, Url, header};
use serde::Deserialize;
use serde_json::json;
use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tracing::{debug, info, instrument};

pub const DEFAULT_API_URL: &str = "https://blob.vercel-storage.com";
const API_VERSION: &str = "7";

#[derive(Clone, Debug)]
pub struct VercelSettings {
    /// Read-write token (`BLOB_READ_WRITE_TOKEN`).
    pub token: String,
    pub api_url: String,
}

#[derive(Clone)]
pub struct VercelBlobStore {
    client: Client,
    token: String,
    api_url: Url,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PutBlobResponse {
    url: String,
    pathname: String,
    content_type: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListBlobResponse {
    blobs: Vec<ListBlobEntry>,
    cursor: Option<String>,
    #[serde(default)]
    has_more: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListBlobEntry {
    url: String,
    pathname: String,
    size: u64,
    uploaded_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    code: Option<String>,
    message: Option<String>,
}

impl From<ListBlobEntry> for StoredObject {
    fn from(entry: ListBlobEntry) -> Self {
        StoredObject {
            url: entry.url,
            filename: entry.pathname,
            content_type: None,
            size: entry.size,
            uploaded_at: entry.uploaded_at,
        }
    }
}

impl VercelBlobStore {
    pub fn new(settings: &VercelSettings) -> StorageResult<Self> {
        if settings.token.trim().is_empty() {
            return Err(StorageError::Misconfigured(
                "BLOB_READ_WRITE_TOKEN is empty".into(),
            ));
        }
        let api_url = Url::parse(&format!("{}/", settings.api_url.trim_end_matches('/')))
            .map_err(|err| {
                StorageError::Misconfigured(format!("invalid api url `{}`: {}", settings.api_url, err))
            })?;

        debug!("Creating Vercel Blob client for {}", api_url);

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(10)
            .user_agent(concat!("blob-gallery/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            token: settings.token.clone(),
            api_url,
        })
    }

    fn put_url(&self, key: &str) -> Url {
        let mut url = self.api_url.clone();
        url.query_pairs_mut().append_pair("pathname", key);
        url
    }

    fn list_url(&self, params: &ListParams) -> Url {
        let mut url = self.api_url.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("limit", &params.page_size().to_string());
            if let Some(prefix) = params.prefix.as_deref().filter(|p| !p.is_empty()) {
                query.append_pair("prefix", prefix);
            }
            if let Some(cursor) = params.cursor.as_deref() {
                query.append_pair("cursor", cursor);
            }
        }
        url
    }

    fn delete_url(&self) -> Url {
        let mut url = self.api_url.clone();
        url.set_path(&format!("{}delete", self.api_url.path()));
        url
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .bearer_auth(&self.token)
            .header("x-api-version", API_VERSION)
    }
}

/// Turn a non-success response into `StorageError::Upstream`, preferring the
/// message from a `{error: {code, message}}` body.
async fn ensure_success(response: Response) -> StorageResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(StorageError::Upstream {
        status: status.as_u16(),
        message: upstream_message(status.canonical_reason(), &body),
    })
}

fn upstream_message(reason: Option<&str>, body: &str) -> String {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(ErrorBody {
            error: ErrorDetail {
                message: Some(message),
                ..
            },
        }) => message,
        Ok(ErrorBody {
            error: ErrorDetail {
                code: Some(code), ..
            },
        }) => code,
        _ if !body.trim().is_empty() => body.trim().to_string(),
        _ => reason.unwrap_or("unknown error").to_string(),
    }
}

#[async_trait]
impl BlobStore for VercelBlobStore {
    fn name(&self) -> &'static str {
        "vercel"
    }

    /// The pathname of a blob locator: its decoded URL path without the
    /// leading `/`. Query strings such as `?download=1` are ignored.
    fn key_of(&self, url: &str) -> StorageResult<String> {
        let parsed = Url::parse(url).map_err(|_| StorageError::InvalidKey(url.to_string()))?;
        let path = parsed.path().trim_start_matches('/');
        percent_decode_str(path)
            .decode_utf8()
            .map(|key| key.into_owned())
            .map_err(|_| StorageError::InvalidKey(url.to_string()))
    }

    #[instrument(skip(self, body), fields(backend = "vercel"))]
    async fn store(
        &self,
        key: &str,
        content_type: Option<String>,
        body: BodyStream,
    ) -> StorageResult<StoredObject> {
        if key.is_empty() {
            return Err(StorageError::InvalidKey(key.to_string()));
        }

        let written = Arc::new(AtomicU64::new(0));
        let counted = {
            let written = Arc::clone(&written);
            body.inspect(move |chunk| {
                if let Ok(chunk) = chunk {
                    written.fetch_add(chunk.len() as u64, Ordering::Relaxed);
                }
            })
        };

        let mut request = self
            .authed(self.client.put(self.put_url(key)))
            .header("x-add-random-suffix", "0")
            .header("x-allow-overwrite", "1")
            .body(reqwest::Body::wrap_stream(counted));
        if let Some(content_type) = content_type.as_deref() {
            request = request.header("x-content-type", content_type);
        }

        let response = ensure_success(request.send().await?).await?;
        let put: PutBlobResponse = response.json().await?;
        let size = written.load(Ordering::Relaxed);

        info!("Uploaded to Vercel Blob: {} ({} bytes)", put.pathname, size);

        Ok(StoredObject {
            url: put.url,
            filename: put.pathname,
            content_type: put.content_type.or(content_type),
            size,
            uploaded_at: Utc::now(),
        })
    }

    #[instrument(skip(self), fields(backend = "vercel"))]
    async fn list(&self, params: ListParams) -> StorageResult<ListPage> {
        let request = self.authed(self.client.get(self.list_url(&params)));
        let response = ensure_success(request.send().await?).await?;
        let listed: ListBlobResponse = response.json().await?;

        debug!("Listed {} blobs (has_more = {})", listed.blobs.len(), listed.has_more);

        Ok(ListPage {
            objects: listed.blobs.into_iter().map(StoredObject::from).collect(),
            cursor: listed.cursor.filter(|_| listed.has_more),
        })
    }

    #[instrument(skip(self), fields(backend = "vercel"))]
    async fn delete(&self, url: &str) -> StorageResult<()> {
        let request = self
            .authed(self.client.post(self.delete_url()))
            .json(&json!({ "urls": [url] }));
        ensure_success(request.send().await?).await?;
        info!("Deleted from Vercel Blob: {}", url);
        Ok(())
    }

    /// Plain GET on the public locator; no credentials are sent.
    #[instrument(skip(self), fields(backend = "vercel"))]
    async fn fetch(&self, url: &str) -> StorageResult<FetchedBlob> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(StorageError::NotFound(url.to_string()));
        }
        if !status.is_success() {
            return Err(StorageError::Upstream {
                status: status.as_u16(),
                message: format!(
                    "failed to download blob: {}",
                    status.canonical_reason().unwrap_or("unknown status")
                ),
            });
        }

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = response.bytes().await?;
        Ok(FetchedBlob {
            bytes,
            content_type,
        })
    }

    async fn check(&self) -> StorageResult<()> {
        self.list(ListParams {
            limit: Some(1),
            ..ListParams::default()
        })
        .await
        .map(|_| ())
    }
}
