//! Storage backends: where the bytes actually live.
//!
//! Backends know nothing about digests or metadata. They accept bytes, hand back an
//! opaque [`Locator`], and resolve it again later. The set of variants is closed;
//! adding a backend means adding a variant to [`StorageBackend`].

mod drive;
mod local;
mod s3;

pub use drive::{DriveConfig, DriveStore};
pub use local::LocalStore;
pub use s3::{S3Config, S3Store};

use std::fmt;

use bytes::Bytes;
use reqwest::StatusCode;
use thiserror::Error;

use crate::retry::Retryable;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("IO error: {0}")]
    Io(std::io::Error),
    #[error("Object not found: {0}")]
    NotFound(String),
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Disk full: {0}")]
    DiskFull(String),
    #[error("Authorization required; complete consent at {consent_url}")]
    AuthorizationRequired { consent_url: String },
    #[error("Transient backend failure: {0}")]
    Retriable(String),
    #[error("Backend error: {0}")]
    Backend(String),
}

impl Retryable for BackendError {
    fn is_retryable(&self) -> bool {
        matches!(self, BackendError::Retriable(_))
    }
}

/// ENOSPC on Linux and macOS.
const ENOSPC: i32 = 28;

impl From<std::io::Error> for BackendError {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;

        if e.raw_os_error() == Some(ENOSPC) {
            return BackendError::DiskFull(e.to_string());
        }
        match e.kind() {
            ErrorKind::NotFound => BackendError::NotFound(e.to_string()),
            ErrorKind::PermissionDenied => BackendError::PermissionDenied(e.to_string()),
            ErrorKind::TimedOut | ErrorKind::Interrupted | ErrorKind::WouldBlock => {
                BackendError::Retriable(e.to_string())
            }
            _ => BackendError::Io(e),
        }
    }
}

/// Map a transport-level failure. Timeouts and connection failures are transient.
pub(crate) fn request_error(e: reqwest::Error) -> BackendError {
    if e.is_timeout() || e.is_connect() {
        BackendError::Retriable(e.to_string())
    } else {
        BackendError::Backend(e.to_string())
    }
}

/// Map a non-success HTTP status from a remote backend.
pub(crate) fn status_error(status: StatusCode, context: &str, body: &str) -> BackendError {
    let message = format!("{context} failed ({status}): {body}");
    match status {
        StatusCode::NOT_FOUND => BackendError::NotFound(message),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => BackendError::PermissionDenied(message),
        StatusCode::INSUFFICIENT_STORAGE => BackendError::DiskFull(message),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            BackendError::Retriable(message)
        }
        s if s.is_server_error() => BackendError::Retriable(message),
        _ => BackendError::Backend(message),
    }
}

/// Backend-specific reference to stored bytes (path, object key, or remote file id).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Locator(String);

impl Locator {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The active storage backend.
pub enum StorageBackend {
    LocalDisk(LocalStore),
    ObjectStore(S3Store),
    ConsumerDrive(DriveStore),
}

impl StorageBackend {
    pub fn kind(&self) -> &'static str {
        match self {
            StorageBackend::LocalDisk(_) => "local",
            StorageBackend::ObjectStore(_) => "s3",
            StorageBackend::ConsumerDrive(_) => "drive",
        }
    }

    /// Store bytes under a fresh locator.
    pub async fn put(&self, data: Bytes, content_type: &str) -> Result<Locator, BackendError> {
        match self {
            StorageBackend::LocalDisk(store) => store.put(data).await,
            StorageBackend::ObjectStore(store) => store.put(data, content_type).await,
            StorageBackend::ConsumerDrive(store) => store.put(data, content_type).await,
        }
    }

    pub async fn get(&self, locator: &Locator) -> Result<Bytes, BackendError> {
        match self {
            StorageBackend::LocalDisk(store) => store.get(locator).await,
            StorageBackend::ObjectStore(store) => store.get(locator).await,
            StorageBackend::ConsumerDrive(store) => store.get(locator).await,
        }
    }

    /// Returns `false` when nothing was stored under the locator.
    pub async fn delete(&self, locator: &Locator) -> Result<bool, BackendError> {
        match self {
            StorageBackend::LocalDisk(store) => store.delete(locator).await,
            StorageBackend::ObjectStore(store) => store.delete(locator).await,
            StorageBackend::ConsumerDrive(store) => store.delete(locator).await,
        }
    }

    pub async fn exists(&self, locator: &Locator) -> Result<bool, BackendError> {
        match self {
            StorageBackend::LocalDisk(store) => store.exists(locator).await,
            StorageBackend::ObjectStore(store) => store.exists(locator).await,
            StorageBackend::ConsumerDrive(store) => store.exists(locator).await,
        }
    }

    pub fn as_drive(&self) -> Option<&DriveStore> {
        match self {
            StorageBackend::ConsumerDrive(store) => Some(store),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_are_retryable() {
        let e = status_error(StatusCode::SERVICE_UNAVAILABLE, "PUT", "");
        assert!(e.is_retryable());
        let e = status_error(StatusCode::TOO_MANY_REQUESTS, "PUT", "");
        assert!(e.is_retryable());
    }

    #[test]
    fn auth_errors_surface_immediately() {
        let e = status_error(StatusCode::FORBIDDEN, "GET", "denied");
        assert!(matches!(e, BackendError::PermissionDenied(_)));
        assert!(!e.is_retryable());
    }

    #[test]
    fn io_errors_map_to_taxonomy() {
        let e: BackendError = std::io::Error::from_raw_os_error(ENOSPC).into();
        assert!(matches!(e, BackendError::DiskFull(_)));

        let e: BackendError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(e, BackendError::NotFound(_)));

        let e: BackendError =
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope").into();
        assert!(matches!(e, BackendError::PermissionDenied(_)));
    }
}
