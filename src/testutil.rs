//! Shared test helpers for handler tests.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::backend::{LocalStore, StorageBackend};
use crate::config::Config;
use crate::content::ContentStore;
use crate::pipeline::{
    DetectedImage, DocumentPipeline, ExtractError, ImageDescriber, OcrExtractor, OcrOutput,
};
use crate::scheduler::ProcessingScheduler;
use crate::storage::Database;
use crate::AppState;

pub const BOUNDARY: &str = "docstore-test-boundary";

/// Create a test AppState with a temporary database and local backend. Processing
/// is not configured.
pub fn test_state(temp_dir: &tempfile::TempDir) -> Arc<AppState> {
    let data_dir = temp_dir.path().join("data");
    let files_dir = temp_dir.path().join("files");

    let mut config = Config {
        bind_address: "127.0.0.1:0".to_string(),
        data_dir: data_dir.to_string_lossy().to_string(),
        max_upload_size: 10 * 1024 * 1024, // 10MB for tests
        ..Config::default()
    };
    config.storage.local_storage_path = files_dir.to_string_lossy().to_string();

    let db = Database::open(&data_dir).expect("Failed to open test database");
    let store = LocalStore::new(&files_dir).expect("Failed to create test backend");
    let content = ContentStore::new(
        db.clone(),
        Arc::new(StorageBackend::LocalDisk(store)),
        config.max_upload_size,
    );

    Arc::new(AppState {
        config,
        db,
        content,
        scheduler: None,
    })
}

/// OCR fake: one page of text with a single `[IMG_1]` anchor.
pub struct StaticOcr;

#[async_trait]
impl OcrExtractor for StaticOcr {
    async fn extract(&self, _data: Bytes, _mime_type: &str) -> Result<OcrOutput, ExtractError> {
        Ok(OcrOutput {
            markdown: "Title\n\n[IMG_1]\n\nEnd".to_string(),
            images: vec![DetectedImage {
                anchor: "IMG_1".to_string(),
                data: Bytes::from_static(b"png"),
                mime_type: "image/png".to_string(),
            }],
        })
    }
}

pub struct StaticDescriber(pub &'static str);

#[async_trait]
impl ImageDescriber for StaticDescriber {
    async fn describe(&self, _data: Bytes, _mime_type: &str) -> Result<String, ExtractError> {
        Ok(self.0.to_string())
    }
}

/// Like [`test_state`], with a running scheduler backed by the static fakes.
pub fn test_state_with_processing(temp_dir: &tempfile::TempDir) -> Arc<AppState> {
    let base = test_state(temp_dir);
    let pipeline = DocumentPipeline::new(
        base.content.clone(),
        Arc::new(StaticOcr),
        Arc::new(StaticDescriber("Diagram showing X")),
        2,
    );
    let scheduler = Arc::new(ProcessingScheduler::new(base.db.clone(), Arc::new(pipeline)));
    scheduler.start(1);

    Arc::new(AppState {
        config: base.config.clone(),
        db: base.db.clone(),
        content: base.content.clone(),
        scheduler: Some(scheduler),
    })
}

/// A multipart/form-data body with a single `file` field.
pub fn multipart_body(file_name: &str, content_type: &str, data: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
    body.extend_from_slice(
        format!("Content-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\n")
            .as_bytes(),
    );
    body.extend_from_slice(format!("Content-Type: {content_type}\r\n\r\n").as_bytes());
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    body
}

pub async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("Failed to read response body");
    serde_json::from_slice(&bytes).expect("Response body is not JSON")
}
