use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::retry::Retryable;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unsupported content type: {0}")]
    UnsupportedFormat(String),
    #[error("extraction service unavailable: {0}")]
    Unavailable(String),
    #[error("extraction service rejected the request: {0}")]
    Rejected(String),
    #[error("malformed extraction response: {0}")]
    InvalidResponse(String),
}

impl Retryable for ExtractError {
    fn is_retryable(&self) -> bool {
        matches!(self, ExtractError::Unavailable(_))
    }
}

impl ExtractError {
    pub(crate) fn from_request(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            ExtractError::Unavailable(e.to_string())
        } else if e.is_decode() {
            ExtractError::InvalidResponse(e.to_string())
        } else {
            ExtractError::Rejected(e.to_string())
        }
    }

    pub(crate) fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let message = format!("{status}: {body}");
        if status.is_server_error()
            || status == reqwest::StatusCode::TOO_MANY_REQUESTS
            || status == reqwest::StatusCode::REQUEST_TIMEOUT
        {
            ExtractError::Unavailable(message)
        } else {
            ExtractError::Rejected(message)
        }
    }
}

/// An image found inside a document. `anchor` appears in the OCR markdown as
/// `[anchor]` wherever the image sat.
#[derive(Debug, Clone)]
pub struct DetectedImage {
    pub anchor: String,
    pub data: Bytes,
    pub mime_type: String,
}

#[derive(Debug, Clone, Default)]
pub struct OcrOutput {
    pub markdown: String,
    pub images: Vec<DetectedImage>,
}

/// Document OCR: raw bytes in, markdown plus embedded images out.
#[async_trait]
pub trait OcrExtractor: Send + Sync {
    async fn extract(&self, data: Bytes, mime_type: &str) -> Result<OcrOutput, ExtractError>;
}

/// Describes a single image in prose.
#[async_trait]
pub trait ImageDescriber: Send + Sync {
    async fn describe(&self, data: Bytes, mime_type: &str) -> Result<String, ExtractError>;
}
