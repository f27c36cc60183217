use axum::extract::{Path, State};
use axum::Json;
use serde::Serialize;
use std::sync::Arc;

use super::parse_digest;
use crate::api::response::{ApiError, JSend};
use crate::scheduler::ProcessingScheduler;
use crate::state_machine::ProcessingStatus;
use crate::storage::models::OcrResult;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct ProcessResponse {
    pub accepted: bool,
    pub status: ProcessingStatus,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: ProcessingStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<OcrResult>,
}

fn scheduler(state: &AppState) -> Result<&Arc<ProcessingScheduler>, ApiError> {
    state
        .scheduler
        .as_ref()
        .ok_or_else(|| ApiError::unavailable("Document processing is not configured"))
}

/// Route: POST /files/:digest/process
pub async fn process_file(
    State(state): State<Arc<AppState>>,
    Path(digest): Path<String>,
) -> Result<Json<JSend<ProcessResponse>>, ApiError> {
    let digest = parse_digest(&digest)?;
    let scheduler = scheduler(&state)?;

    let accepted = scheduler.enqueue(&digest).await?;
    let status = scheduler.status(&digest).await?;

    Ok(JSend::success(ProcessResponse { accepted, status }))
}

/// Route: GET /files/:digest/status
pub async fn file_status(
    State(state): State<Arc<AppState>>,
    Path(digest): Path<String>,
) -> Result<Json<JSend<StatusResponse>>, ApiError> {
    let digest = parse_digest(&digest)?;

    let record = match &state.scheduler {
        Some(scheduler) => scheduler.record(&digest).await?,
        None => state
            .db
            .get_file(&digest)?
            .ok_or_else(|| ApiError::not_found("File not found"))?,
    };

    let result = match (&record.status, &record.result_ref) {
        (ProcessingStatus::Succeeded, Some(result_ref)) => state.db.get_result(result_ref)?,
        _ => None,
    };

    Ok(JSend::success(StatusResponse {
        status: record.status,
        error: record.last_error,
        result,
    }))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::Router;
    use tower::ServiceExt;

    use crate::api::create_router;
    use crate::testutil::{body_json, multipart_body, test_state_with_processing, BOUNDARY};

    async fn get_json(app: &Router, uri: String) -> serde_json::Value {
        let resp = app
            .clone()
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        body_json(resp).await
    }

    async fn wait_for_status(app: &Router, digest: &str, wanted: &str) -> serde_json::Value {
        for _ in 0..200 {
            let json = get_json(app, format!("/files/{digest}/status")).await;
            if json["data"]["status"] == wanted {
                return json;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{digest} never reached {wanted}");
    }

    #[tokio::test]
    async fn upload_and_process_produces_merged_result() {
        let dir = tempfile::tempdir().unwrap();
        let app = create_router(test_state_with_processing(&dir));

        let resp = app
            .clone()
            .oneshot(
                Request::post("/files?process=true")
                    .header(
                        "content-type",
                        format!("multipart/form-data; boundary={BOUNDARY}"),
                    )
                    .body(Body::from(multipart_body(
                        "doc.pdf",
                        "application/pdf",
                        b"%PDF-1.7 two pages",
                    )))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let created = body_json(resp).await;
        assert_eq!(created["data"]["accepted"], true);
        let digest = created["data"]["digest"].as_str().unwrap().to_string();

        let done = wait_for_status(&app, &digest, "succeeded").await;
        let result = &done["data"]["result"];
        assert_eq!(result["markdown_text"], "Title\n\nDiagram showing X\n\nEnd");
        assert_eq!(result["image_descriptions"][0]["position_anchor"], "IMG_1");

        // Already processed content is never re-run.
        let again = app
            .clone()
            .oneshot(
                Request::post(format!("/files/{digest}/process"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let again = body_json(again).await;
        assert_eq!(again["data"]["accepted"], false);
        assert_eq!(again["data"]["status"], "succeeded");
    }

    #[tokio::test]
    async fn process_unknown_digest_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let app = create_router(test_state_with_processing(&dir));
        let digest = crate::checksum::Digest::of(b"missing").to_hex();

        let resp = app
            .oneshot(
                Request::post(format!("/files/{digest}/process"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unsupported_type_fails_with_reason() {
        let dir = tempfile::tempdir().unwrap();
        let app = create_router(test_state_with_processing(&dir));

        let resp = app
            .clone()
            .oneshot(
                Request::post("/files?process=true")
                    .header(
                        "content-type",
                        format!("multipart/form-data; boundary={BOUNDARY}"),
                    )
                    .body(Body::from(multipart_body("a.txt", "text/plain", b"plain")))
                    .unwrap(),
            )
            .await
            .unwrap();
        let digest = body_json(resp).await["data"]["digest"]
            .as_str()
            .unwrap()
            .to_string();

        let failed = wait_for_status(&app, &digest, "failed").await;
        assert!(failed["data"]["error"]
            .as_str()
            .unwrap()
            .contains("unsupported content type"));
        assert!(failed["data"].get("result").is_none());
    }
}
