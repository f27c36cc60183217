mod admin;
mod auth;
mod files;
mod processing;

use crate::api::response::ApiError;
use crate::backend::BackendError;
use crate::checksum::Digest;
use crate::content::ContentError;
use crate::scheduler::SchedulerError;

pub use admin::health;
pub use auth::{drive_callback, drive_consent};
pub use files::{
    create_file, delete_file, file_exists, file_metadata, get_file, list_files,
};
pub use processing::{file_status, process_file};

/// Parse the `{digest}` path segment.
fn parse_digest(raw: &str) -> Result<Digest, ApiError> {
    raw.parse()
        .map_err(|e| ApiError::bad_request(format!("Invalid digest: {e}")))
}

impl From<BackendError> for ApiError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::NotFound(_) => ApiError::not_found("File not found"),
            BackendError::AuthorizationRequired { consent_url } => {
                ApiError::AuthorizationRequired { consent_url }
            }
            BackendError::PermissionDenied(msg) => ApiError::forbidden(msg),
            BackendError::DiskFull(msg) => ApiError::insufficient_storage(msg),
            BackendError::Retriable(msg) => ApiError::bad_gateway(msg),
            BackendError::Io(_) | BackendError::Backend(_) => ApiError::internal(e.to_string()),
        }
    }
}

impl From<ContentError> for ApiError {
    fn from(e: ContentError) -> Self {
        match e {
            ContentError::NotFound(_) => ApiError::not_found("File not found"),
            ContentError::TooLarge { limit } => ApiError::payload_too_large(format!(
                "File exceeds maximum upload size of {limit} bytes"
            )),
            ContentError::Read(e) => ApiError::bad_request(format!("Failed to read file: {e}")),
            ContentError::Backend(e) => e.into(),
            ContentError::Database(e) => ApiError::internal(e.to_string()),
        }
    }
}

impl From<SchedulerError> for ApiError {
    fn from(e: SchedulerError) -> Self {
        match e {
            SchedulerError::NotFound(_) => ApiError::not_found("File not found"),
            SchedulerError::Closed => ApiError::unavailable(e.to_string()),
            SchedulerError::Database(e) => ApiError::internal(e.to_string()),
        }
    }
}

impl From<crate::storage::DatabaseError> for ApiError {
    fn from(e: crate::storage::DatabaseError) -> Self {
        ApiError::internal(e.to_string())
    }
}
