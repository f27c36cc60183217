use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::checksum::Digest;
use crate::state_machine::ProcessingStatus;

/// A stored file, keyed by the digest of its content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub checksum: Digest,
    pub size: u64,
    pub content_type: String,
    /// File name supplied with the first upload of this content.
    #[serde(default)]
    pub name: Option<String>,
    /// Backend-internal reference. Never handed out to callers.
    pub backend_locator: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub status: ProcessingStatus,
    /// Key of the persisted OcrResult once a run has succeeded.
    #[serde(default)]
    pub result_ref: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Number of pipeline runs started for this record.
    #[serde(default)]
    pub attempts: u32,
}

impl FileRecord {
    /// Blank record used as the starting point of an upsert.
    pub fn new(checksum: Digest) -> Self {
        let now = Utc::now();
        Self {
            checksum,
            size: 0,
            content_type: "application/octet-stream".to_string(),
            name: None,
            backend_locator: String::new(),
            created_at: now,
            updated_at: now,
            status: ProcessingStatus::Unprocessed,
            result_ref: None,
            last_error: None,
            attempts: 0,
        }
    }
}

/// Description of one embedded image, anchored in the markdown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDescription {
    pub position_anchor: String,
    pub description_text: String,
}

/// Enriched text produced by a successful pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OcrResult {
    pub markdown_text: String,
    pub image_descriptions: Vec<ImageDescription>,
}
