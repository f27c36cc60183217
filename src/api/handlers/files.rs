use axum::extract::{Multipart, Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::io::StreamReader;

use super::parse_digest;
use crate::api::response::{ApiError, AppQuery, JSend, JSendPaginated, Pagination};
use crate::content::Stored;
use crate::state_machine::ProcessingStatus;
use crate::storage::models::FileRecord;
use crate::storage::DatabaseError;
use crate::AppState;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct CreateFileResponse {
    pub digest: String,
    pub created: bool,
    /// Present when processing was requested with the upload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accepted: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct CreateFileParams {
    #[serde(default)]
    pub process: bool,
}

#[derive(Debug, Serialize)]
pub struct FileResponse {
    pub digest: String,
    pub name: Option<String>,
    pub size: u64,
    pub content_type: String,
    pub created_at: String,
    pub updated_at: String,
    pub status: ProcessingStatus,
    pub last_error: Option<String>,
    pub attempts: u32,
}

#[derive(Debug, Serialize)]
pub struct ExistsResponse {
    pub exists: bool,
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub deleted: bool,
}

#[derive(Debug, Deserialize)]
pub struct ListFilesParams {
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
    #[serde(default)]
    pub status: Option<String>,
}

fn default_limit() -> u32 {
    20
}

// ============================================================================
// Handlers
// ============================================================================

/// Route: POST /files (multipart, field `file`)
pub async fn create_file(
    State(state): State<Arc<AppState>>,
    AppQuery(params): AppQuery<CreateFileParams>,
    mut multipart: Multipart,
) -> Result<Json<JSend<CreateFileResponse>>, ApiError> {
    if params.process && state.scheduler.is_none() {
        return Err(ApiError::unavailable("Document processing is not configured"));
    }

    let mut stored: Option<Stored> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("Invalid multipart data: {e}")))?
    {
        if field.name() != Some("file") {
            // Ignore unknown fields
            continue;
        }
        if stored.is_some() {
            return Err(ApiError::bad_request("only one file field is allowed"));
        }

        // Determine MIME type: from multipart Content-Type, or guess from filename, or fallback
        let content_type = field
            .content_type()
            .map(|ct| ct.to_string())
            .filter(|ct| ct != "application/octet-stream")
            .or_else(|| {
                field
                    .file_name()
                    .and_then(|n| mime_guess::from_path(n).first())
                    .map(|m| m.to_string())
            })
            .unwrap_or_else(|| "application/octet-stream".to_string());
        let file_name = field.file_name().map(str::to_string);

        let reader = StreamReader::new(Box::pin(
            field.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)),
        ));
        stored = Some(
            state
                .content
                .store_named(reader, &content_type, file_name.as_deref())
                .await?,
        );
    }

    let stored = stored.ok_or_else(|| ApiError::bad_request("file field is required"))?;

    let accepted = match (&state.scheduler, params.process) {
        (Some(scheduler), true) => Some(scheduler.enqueue(&stored.digest).await?),
        _ => None,
    };

    Ok(JSend::success(CreateFileResponse {
        digest: stored.digest.to_hex(),
        created: stored.created,
        accepted,
    }))
}

/// Route: GET /files/:digest (raw bytes)
pub async fn get_file(
    State(state): State<Arc<AppState>>,
    Path(digest): Path<String>,
) -> Result<Response, ApiError> {
    let digest = parse_digest(&digest)?;
    let (record, data) = state.content.retrieve(&digest).await?;

    let mut response = (StatusCode::OK, data).into_response();
    let headers = response.headers_mut();

    headers.insert(
        header::CONTENT_TYPE,
        record
            .content_type
            .parse()
            .unwrap_or(header::HeaderValue::from_static("application/octet-stream")),
    );

    headers.insert(header::CONTENT_LENGTH, header::HeaderValue::from(record.size));

    if let Some(value) = record.name.as_deref().and_then(content_disposition) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }

    if let Ok(value) = format!("\"{}\"", digest.to_hex()).parse() {
        headers.insert(header::ETAG, value);
    }

    // Content never changes under a digest
    headers.insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("public, max-age=31536000, immutable"),
    );

    Ok(response)
}

/// Route: GET /files/:digest/exists
pub async fn file_exists(
    State(state): State<Arc<AppState>>,
    Path(digest): Path<String>,
) -> Result<Json<JSend<ExistsResponse>>, ApiError> {
    let digest = parse_digest(&digest)?;
    let exists = state.content.exists(&digest)?;
    Ok(JSend::success(ExistsResponse { exists }))
}

/// Route: GET /files/:digest/metadata
pub async fn file_metadata(
    State(state): State<Arc<AppState>>,
    Path(digest): Path<String>,
) -> Result<Json<JSend<FileResponse>>, ApiError> {
    let digest = parse_digest(&digest)?;
    let record = match &state.scheduler {
        Some(scheduler) => scheduler.record(&digest).await?,
        None => state
            .db
            .get_file(&digest)?
            .ok_or_else(|| ApiError::not_found("File not found"))?,
    };
    Ok(JSend::success(file_to_response(&record)))
}

/// Route: DELETE /files/:digest
pub async fn delete_file(
    State(state): State<Arc<AppState>>,
    Path(digest): Path<String>,
) -> Result<Json<JSend<DeleteResponse>>, ApiError> {
    let digest = parse_digest(&digest)?;
    let deleted = state.content.remove(&digest).await?;

    tracing::debug!(digest = %digest, deleted, "Delete requested");
    Ok(JSend::success(DeleteResponse { deleted }))
}

/// Route: GET /files
pub async fn list_files(
    State(state): State<Arc<AppState>>,
    AppQuery(params): AppQuery<ListFilesParams>,
) -> Result<Json<JSendPaginated<FileResponse>>, ApiError> {
    if params.limit == 0 {
        return Err(ApiError::bad_request("limit must be greater than 0"));
    }

    let status = match params.status.as_deref() {
        Some(raw) => Some(ProcessingStatus::parse(raw).ok_or_else(|| {
            ApiError::bad_request(format!(
                "status must be one of unprocessed, queued, running, succeeded, failed (got {raw})"
            ))
        })?),
        None => None,
    };

    let records: Box<dyn Iterator<Item = Result<FileRecord, DatabaseError>>> = match status {
        Some(status) => Box::new(state.db.list_files().with_status(status)),
        None => Box::new(state.db.list_files()),
    };

    let mut total = 0u64;
    let mut items = Vec::new();
    for record in records {
        let record = record?;
        if total >= params.offset as u64 && items.len() < params.limit as usize {
            items.push(file_to_response(&record));
        }
        total += 1;
    }

    Ok(JSendPaginated::success(
        items,
        Pagination {
            limit: params.limit,
            offset: params.offset,
            total,
        },
    ))
}

// ============================================================================
// Helpers
// ============================================================================

fn file_to_response(file: &FileRecord) -> FileResponse {
    FileResponse {
        digest: file.checksum.to_hex(),
        name: file.name.clone(),
        size: file.size,
        content_type: file.content_type.clone(),
        created_at: file.created_at.to_rfc3339(),
        updated_at: file.updated_at.to_rfc3339(),
        status: file.status,
        last_error: file.last_error.clone(),
        attempts: file.attempts,
    }
}

/// `inline; filename="…"` with characters that would break the quoted string replaced.
fn content_disposition(name: &str) -> Option<header::HeaderValue> {
    let safe: String = name
        .chars()
        .map(|c| match c {
            '"' | '\\' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    format!("inline; filename=\"{safe}\"").parse().ok()
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use crate::api::create_router;
    use crate::checksum::Digest;
    use crate::testutil::{body_json, multipart_body, test_state, BOUNDARY};

    fn upload(body: Vec<u8>) -> Request<Body> {
        Request::post("/files")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn upload_twice_deduplicates() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        let app = create_router(state.clone());

        let body = multipart_body("report.pdf", "application/pdf", b"%PDF-1.7 content");
        let first = app.clone().oneshot(upload(body.clone())).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        let first = body_json(first).await;
        assert_eq!(first["data"]["created"], true);

        let second = body_json(app.oneshot(upload(body)).await.unwrap()).await;
        assert_eq!(second["data"]["created"], false);
        assert_eq!(first["data"]["digest"], second["data"]["digest"]);
        assert_eq!(
            first["data"]["digest"].as_str().unwrap(),
            Digest::of(b"%PDF-1.7 content").to_hex()
        );
    }

    #[tokio::test]
    async fn download_returns_bytes_and_type() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        let app = create_router(state.clone());

        let body = multipart_body("note.txt", "text/plain", b"hello");
        let created = body_json(app.clone().oneshot(upload(body)).await.unwrap()).await;
        let digest = created["data"]["digest"].as_str().unwrap().to_string();

        let resp = app
            .oneshot(
                Request::get(format!("/files/{digest}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["content-type"], "text/plain");
        assert_eq!(
            resp.headers()["content-disposition"],
            "inline; filename=\"note.txt\""
        );
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"hello");
    }

    #[tokio::test]
    async fn content_type_guessed_from_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        let app = create_router(state.clone());

        let body = multipart_body("scan.pdf", "application/octet-stream", b"%PDF-1.4");
        let created = body_json(app.clone().oneshot(upload(body)).await.unwrap()).await;
        let digest = created["data"]["digest"].as_str().unwrap().to_string();

        let meta = app
            .oneshot(
                Request::get(format!("/files/{digest}/metadata"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let meta = body_json(meta).await;
        assert_eq!(meta["data"]["content_type"], "application/pdf");
        assert_eq!(meta["data"]["status"], "unprocessed");
        assert_eq!(meta["data"]["size"], 8);
        assert_eq!(meta["data"]["name"], "scan.pdf");
    }

    #[tokio::test]
    async fn first_upload_name_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let app = create_router(test_state(&dir));

        let first = multipart_body("original.pdf", "application/pdf", b"%PDF same bytes");
        let created = body_json(app.clone().oneshot(upload(first)).await.unwrap()).await;
        let digest = created["data"]["digest"].as_str().unwrap().to_string();

        let renamed = multipart_body("copy-2.pdf", "application/pdf", b"%PDF same bytes");
        app.clone().oneshot(upload(renamed)).await.unwrap();

        let list = app
            .clone()
            .oneshot(Request::get("/files").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let list = body_json(list).await;
        assert_eq!(list["data"]["items"][0]["name"], "original.pdf");

        let resp = app
            .oneshot(
                Request::get(format!("/files/{digest}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            resp.headers()["content-disposition"],
            "inline; filename=\"original.pdf\""
        );
    }

    #[test]
    fn content_disposition_escapes_quotes() {
        let value = super::content_disposition("a\"b\\c.pdf").unwrap();
        assert_eq!(value, "inline; filename=\"a_b_c.pdf\"");
    }

    #[tokio::test]
    async fn invalid_digest_is_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let app = create_router(test_state(&dir));

        let resp = app
            .oneshot(Request::get("/files/not-a-digest").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let json = body_json(resp).await;
        assert_eq!(json["status"], "fail");
    }

    #[tokio::test]
    async fn unknown_digest_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let app = create_router(test_state(&dir));
        let digest = Digest::of(b"never stored").to_hex();

        let resp = app
            .clone()
            .oneshot(
                Request::get(format!("/files/{digest}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let exists = app
            .oneshot(
                Request::get(format!("/files/{digest}/exists"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(body_json(exists).await["data"]["exists"], false);
    }

    #[tokio::test]
    async fn delete_then_get_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        let app = create_router(state.clone());

        let body = multipart_body("a.txt", "text/plain", b"short lived");
        let created = body_json(app.clone().oneshot(upload(body)).await.unwrap()).await;
        let digest = created["data"]["digest"].as_str().unwrap().to_string();

        let deleted = app
            .clone()
            .oneshot(
                Request::delete(format!("/files/{digest}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(body_json(deleted).await["data"]["deleted"], true);

        let resp = app
            .clone()
            .oneshot(
                Request::get(format!("/files/{digest}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let again = app
            .oneshot(
                Request::delete(format!("/files/{digest}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(body_json(again).await["data"]["deleted"], false);
    }

    #[tokio::test]
    async fn list_pages_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        let app = create_router(state.clone());

        for i in 0..3 {
            let content = format!("file number {i}");
            let body = multipart_body("f.txt", "text/plain", content.as_bytes());
            app.clone().oneshot(upload(body)).await.unwrap();
        }

        let page = app
            .clone()
            .oneshot(
                Request::get("/files?limit=2&offset=1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let page = body_json(page).await;
        assert_eq!(page["data"]["pagination"]["total"], 3);
        assert_eq!(page["data"]["items"].as_array().unwrap().len(), 2);

        let failed = app
            .clone()
            .oneshot(
                Request::get("/files?status=failed")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(body_json(failed).await["data"]["pagination"]["total"], 0);

        let bad = app
            .oneshot(Request::get("/files?status=bogus").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn process_without_extractors_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        let app = create_router(state.clone());

        let body = multipart_body("a.pdf", "application/pdf", b"%PDF");
        let created = body_json(app.clone().oneshot(upload(body)).await.unwrap()).await;
        let digest = created["data"]["digest"].as_str().unwrap().to_string();

        let resp = app
            .oneshot(
                Request::post(format!("/files/{digest}/process"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
