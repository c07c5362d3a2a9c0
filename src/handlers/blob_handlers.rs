//! HTTP handlers for the gallery API.
//! Upload bodies are streamed to the backend; everything else is a thin
//! JSON wrapper around one `BlobStore` call (or the rename sequence).

use crate::{
    errors::AppError,
    models::object::StoredObject,
    services::rename,
    state::AppState,
    storage::{BodyStream, ListParams},
};
use axum::{
    Json,
    body::Body,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::{StreamExt, TryStreamExt};
use percent_encoding::percent_decode;
use serde::{Deserialize, Serialize};
use std::io;
use tokio_util::io::ReaderStream;
use tracing::error;

/// Header carrying the target filename of an upload.
pub const FILENAME_HEADER: &str = "x-vercel-filename";
/// Response header carrying the cursor of the next page of `/api/files`.
pub const NEXT_CURSOR_HEADER: &str = "x-next-cursor";

#[derive(Debug, Deserialize)]
pub struct ListFilesQuery {
    pub prefix: Option<String>,
    pub limit: Option<usize>,
    pub cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DeleteRequest {
    pub url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenameRequest {
    pub url: Option<String>,
    pub new_filename: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub success: bool,
}

/// Treat absent, empty and whitespace-only fields alike.
fn required(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Unwrap a JSON body, turning extractor rejections into the API's JSON
/// error shape instead of axum's plain-text one.
fn json_body<T>(payload: Result<Json<T>, JsonRejection>, msg: &str) -> Result<T, AppError> {
    match payload {
        Ok(Json(body)) => Ok(body),
        Err(rejection) => Err(AppError {
            status: StatusCode::BAD_REQUEST,
            message: msg.to_string(),
            error: Some(rejection.body_text()),
        }),
    }
}

/// Read the upload filename. Non-ASCII names arrive percent-encoded.
fn upload_filename(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(FILENAME_HEADER)?;
    let decoded = percent_decode(raw.as_bytes()).decode_utf8().ok()?;
    let trimmed = decoded.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// `POST /api/upload` — store the raw request body under `x-vercel-filename`.
pub async fn upload_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Body,
) -> Result<Json<StoredObject>, AppError> {
    let filename = upload_filename(&headers).ok_or_else(|| {
        AppError::bad_request("Filename is required in the x-vercel-filename header.")
    })?;

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());

    let stream: BodyStream = body
        .into_data_stream()
        .map_err(io::Error::other)
        .boxed();

    let object = state
        .store
        .store(&filename, content_type, stream)
        .await
        .map_err(|err| {
            error!("upload of {} failed: {}", filename, err);
            AppError::storage("Failed to upload file.", &err)
        })?;

    Ok(Json(object))
}

/// `GET /api/files` — list stored blobs, optionally filtered by `prefix`.
pub async fn list_files(
    State(state): State<AppState>,
    Query(q): Query<ListFilesQuery>,
) -> Result<Response, AppError> {
    let params = ListParams {
        prefix: q.prefix,
        limit: q.limit,
        cursor: q.cursor,
    };

    let page = state.store.list(params).await.map_err(|err| {
        error!("listing files failed: {}", err);
        AppError::storage("Failed to fetch the file list.", &err)
    })?;

    let mut response = Json(page.objects).into_response();
    if let Some(cursor) = page.cursor.as_deref() {
        if let Ok(value) = HeaderValue::from_str(cursor) {
            response
                .headers_mut()
                .insert(HeaderName::from_static(NEXT_CURSOR_HEADER), value);
        }
    }
    Ok(response)
}

/// `DELETE /api/delete` — `{url}` → `{success: true}`.
pub async fn delete_file(
    State(state): State<AppState>,
    payload: Result<Json<DeleteRequest>, JsonRejection>,
) -> Result<Json<DeleteResponse>, AppError> {
    const MISSING: &str = "File URL is required.";
    let req = json_body(payload, MISSING)?;
    let url = required(req.url).ok_or_else(|| AppError::bad_request(MISSING))?;

    state.store.delete(&url).await.map_err(|err| {
        error!("delete of {} failed: {}", url, err);
        AppError::storage("Failed to delete file.", &err)
    })?;

    Ok(Json(DeleteResponse { success: true }))
}

/// `POST /api/rename` — `{url, newFilename}` → the new object.
pub async fn rename_file(
    State(state): State<AppState>,
    payload: Result<Json<RenameRequest>, JsonRejection>,
) -> Result<Json<StoredObject>, AppError> {
    const MISSING: &str = "URL and new filename are required.";
    let req = json_body(payload, MISSING)?;
    let (Some(url), Some(new_filename)) = (required(req.url), required(req.new_filename)) else {
        return Err(AppError::bad_request(MISSING));
    };

    let renamed = rename::rename(state.store.as_ref(), &url, &new_filename)
        .await
        .map_err(|err| {
            error!(step = %err.step(), "rename of {} failed: {}", url, err);
            // Any failed step is a server-side failure, bad target names included.
            let mut app_err =
                AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "Failed to rename file.");
            app_err.error = Some(err.to_string());
            app_err
        })?;

    Ok(Json(renamed))
}

/// `GET /blobs/{*key}` — stream a payload from the local backend.
pub async fn get_blob(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Response, AppError> {
    let local = state
        .local
        .as_ref()
        .ok_or_else(|| AppError::not_found("Blob serving is not enabled."))?;

    let (record, file) = local.open(&key).await.map_err(|err| {
        tracing::debug!("blob {} not served: {}", key, err);
        AppError::not_found("Blob not found.")
    })?;

    let mut response = Response::new(Body::from_stream(ReaderStream::new(file)));
    let headers = response.headers_mut();
    let content_type = record
        .content_type
        .as_deref()
        .unwrap_or("application/octet-stream");
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from(record.size_bytes.max(0) as u64),
    );
    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", record.etag)) {
        headers.insert(header::ETAG, value);
    }
    if let Ok(value) = HeaderValue::from_str(&record.uploaded_at.to_rfc2822()) {
        headers.insert(header::LAST_MODIFIED, value);
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use crate::{routes::routes::routes, state::AppState, storage::memory::MemoryBlobStore};
    use axum::{
        Router,
        body::{Body, to_bytes},
        http::{Method, Request, StatusCode},
        response::Response,
    };
    use serde_json::{Value, json};
    use std::sync::{Arc, atomic::Ordering};
    use tower::ServiceExt;

    fn app(store: &Arc<MemoryBlobStore>) -> Router {
        routes().with_state(AppState::new(store.clone()))
    }

    async fn seeded() -> Arc<MemoryBlobStore> {
        let store = Arc::new(MemoryBlobStore::new("https://store"));
        store.insert("old.png", b"b", "image/png").await;
        store
    }

    fn json_request(method: Method, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn rename_then_list_shows_only_new_name() {
        let store = seeded().await;
        let app = app(&store);

        let response = app
            .clone()
            .oneshot(json_request(
                Method::POST,
                "/api/rename",
                json!({ "url": "https://store/old.png", "newFilename": "new.png" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let renamed = body_json(response).await;
        assert_eq!(renamed["url"], "https://store/new.png");
        assert_eq!(renamed["contentType"], "image/png");

        let response = app
            .oneshot(Request::get("/api/files").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let files = body_json(response).await;
        let files = files.as_array().unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0]["filename"], "new.png");
        assert_eq!(files[0]["size"], 1);
    }

    #[tokio::test]
    async fn rename_without_fields_is_rejected_before_any_backend_call() {
        let store = seeded().await;

        for body in [
            json!({ "url": "https://store/old.png" }),
            json!({ "newFilename": "new.png" }),
            json!({ "url": "", "newFilename": "new.png" }),
        ] {
            let response = app(&store)
                .oneshot(json_request(Method::POST, "/api/rename", body))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            assert_eq!(
                body_json(response).await["message"],
                "URL and new filename are required."
            );
        }
        assert_eq!(store.calls.total(), 0);
    }

    #[tokio::test]
    async fn rename_with_failed_delete_reports_error_and_keeps_both() {
        let store = seeded().await;
        store.fail.delete.store(true, Ordering::SeqCst);

        let response = app(&store)
            .oneshot(json_request(
                Method::POST,
                "/api/rename",
                json!({ "url": "https://store/old.png", "newFilename": "new.png" }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["message"], "Failed to rename file.");
        assert!(body["error"].as_str().unwrap().contains("injected delete failure"));
        assert_eq!(store.keys().await, ["new.png", "old.png"]);
    }

    #[tokio::test]
    async fn rename_onto_invalid_key_is_a_server_error() {
        let store = seeded().await;

        let response = app(&store)
            .oneshot(json_request(
                Method::POST,
                "/api/rename",
                json!({ "url": "https://store/old.png", "newFilename": "../escape.png" }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["message"], "Failed to rename file.");
        assert!(body["error"].as_str().unwrap().contains("invalid object key"));
        assert_eq!(store.keys().await, ["old.png"]);
    }

    #[tokio::test]
    async fn upload_stores_body_under_header_filename() {
        let store = Arc::new(MemoryBlobStore::new("https://store"));

        let response = app(&store)
            .oneshot(
                Request::post("/api/upload")
                    .header("x-vercel-filename", "cat%20pic.png")
                    .header("content-type", "image/png")
                    .body(Body::from("meow"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let object = body_json(response).await;
        assert_eq!(object["url"], "https://store/cat pic.png");
        assert_eq!(object["size"], 4);
        assert_eq!(object["contentType"], "image/png");
        assert_eq!(&store.get("cat pic.png").await.unwrap()[..], b"meow");
    }

    #[tokio::test]
    async fn upload_without_filename_creates_nothing() {
        let store = Arc::new(MemoryBlobStore::new("https://store"));

        let response = app(&store)
            .oneshot(Request::post("/api/upload").body(Body::from("meow")).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(store.calls.store.load(Ordering::SeqCst), 0);
        assert!(store.keys().await.is_empty());
    }

    #[tokio::test]
    async fn delete_returns_success_payload() {
        let store = seeded().await;

        let response = app(&store)
            .oneshot(json_request(
                Method::DELETE,
                "/api/delete",
                json!({ "url": "https://store/old.png" }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({ "success": true }));
        assert!(store.keys().await.is_empty());
    }

    #[tokio::test]
    async fn delete_requires_url() {
        let store = seeded().await;

        let response = app(&store)
            .oneshot(
                Request::delete("/api/delete")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["message"], "File URL is required.");
        assert_eq!(store.calls.total(), 0);
    }

    #[tokio::test]
    async fn list_failure_is_reported_as_500() {
        let store = seeded().await;
        store.fail.list.store(true, Ordering::SeqCst);

        let response = app(&store)
            .oneshot(Request::get("/api/files").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["message"], "Failed to fetch the file list.");
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn list_sets_next_cursor_when_truncated() {
        let store = seeded().await;
        store.insert("zebra.png", b"z", "image/png").await;

        let response = app(&store)
            .oneshot(
                Request::get("/api/files?limit=1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-next-cursor"], "old.png");
        assert_eq!(body_json(response).await.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn blob_route_is_404_without_local_backend() {
        let store = seeded().await;

        let response = app(&store)
            .oneshot(Request::get("/blobs/old.png").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
