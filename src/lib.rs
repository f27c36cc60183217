//! docstore - A content-addressable document store with an OCR pipeline
//!
//! This crate provides deduplicated file storage and asynchronous document processing:
//! - SHA3-256 content digests as the only file identity
//! - Interchangeable storage backends (local filesystem, S3, Google Drive)
//! - redb embedded database for metadata (ACID, MVCC, crash-safe)
//! - Background OCR and image description with single-flight scheduling
//! - REST API with multipart upload support

pub mod api;
pub mod backend;
pub mod checksum;
pub mod config;
pub mod content;
pub mod pipeline;
pub mod retry;
pub mod scheduler;
pub mod state_machine;
pub mod storage;
#[cfg(test)]
pub mod testutil;

use std::sync::Arc;

use config::Config;
use content::ContentStore;
use scheduler::ProcessingScheduler;
use storage::Database;

/// Shared application state
pub struct AppState {
    pub config: Config,
    pub db: Database,
    pub content: ContentStore,
    /// Absent when the extraction services are not configured.
    pub scheduler: Option<Arc<ProcessingScheduler>>,
}
