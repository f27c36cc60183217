//! Dedup-aware content store: the checksum engine, the metadata store and the active
//! backend composed behind one interface addressed only by digest.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use chrono::Utc;
use thiserror::Error;
use tokio::io::AsyncRead;

use crate::backend::{BackendError, Locator, StorageBackend};
use crate::checksum::{digest_stream, Digest};
use crate::storage::models::FileRecord;
use crate::storage::{Database, DatabaseError};

#[derive(Debug, Error)]
pub enum ContentError {
    #[error("File not found: {0}")]
    NotFound(Digest),
    #[error("Upload exceeds the {limit} byte limit")]
    TooLarge { limit: u64 },
    #[error("Failed to read upload: {0}")]
    Read(#[from] std::io::Error),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Outcome of [`ContentStore::store`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stored {
    pub digest: Digest,
    /// `false` when the content was already present and nothing was written.
    pub created: bool,
}

#[derive(Clone)]
pub struct ContentStore {
    db: Database,
    backend: Arc<StorageBackend>,
    max_size: u64,
}

impl ContentStore {
    pub fn new(db: Database, backend: Arc<StorageBackend>, max_size: u64) -> Self {
        Self {
            db,
            backend,
            max_size,
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn backend(&self) -> &StorageBackend {
        &self.backend
    }

    /// Hash the stream while buffering it, then write it to the backend unless a
    /// record for the digest already exists.
    ///
    /// The existence check, the backend put and the record insert all happen under
    /// the digest's exclusive section, so concurrent uploads of identical content
    /// produce exactly one backend object.
    pub async fn store<R>(&self, reader: R, content_type: &str) -> Result<Stored, ContentError>
    where
        R: AsyncRead + Unpin,
    {
        self.store_named(reader, content_type, None).await
    }

    /// [`ContentStore::store`] that also records the caller's file name. The name is
    /// kept only when this call creates the record.
    pub async fn store_named<R>(
        &self,
        reader: R,
        content_type: &str,
        name: Option<&str>,
    ) -> Result<Stored, ContentError>
    where
        R: AsyncRead + Unpin,
    {
        let max_size = self.max_size;
        let mut data = BytesMut::new();
        let digest = digest_stream(reader, |chunk| {
            if (data.len() + chunk.len()) as u64 > max_size {
                return Err(ContentError::TooLarge { limit: max_size });
            }
            data.extend_from_slice(chunk);
            Ok(())
        })
        .await?;

        self.store_digested(digest, data.freeze(), content_type, name).await
    }

    async fn store_digested(
        &self,
        digest: Digest,
        data: Bytes,
        content_type: &str,
        name: Option<&str>,
    ) -> Result<Stored, ContentError> {
        let _guard = self.db.lock(&digest).await;

        if self.db.get_file(&digest)?.is_some() {
            tracing::debug!(digest = %digest, "Content already stored");
            return Ok(Stored {
                digest,
                created: false,
            });
        }

        let size = data.len() as u64;
        let locator = self.backend.put(data, content_type).await?;

        let insert = self.db.upsert_file(&digest, |record| {
            *record = FileRecord::new(digest);
            record.size = size;
            record.content_type = content_type.to_string();
            record.name = name.map(str::to_string);
            record.backend_locator = locator.as_str().to_string();
            record.created_at = Utc::now();
        });
        if let Err(e) = insert {
            // No record points at the object, so it would be orphaned.
            if let Err(cleanup) = self.backend.delete(&locator).await {
                tracing::warn!(digest = %digest, error = %cleanup, "Failed to remove orphaned object");
            }
            return Err(e.into());
        }

        tracing::info!(
            digest = %digest,
            size,
            content_type,
            backend = self.backend.kind(),
            "Stored new content"
        );
        Ok(Stored {
            digest,
            created: true,
        })
    }

    pub async fn retrieve(&self, digest: &Digest) -> Result<(FileRecord, Bytes), ContentError> {
        let record = self
            .db
            .get_file(digest)?
            .ok_or(ContentError::NotFound(*digest))?;
        let locator = Locator::new(record.backend_locator.clone());

        match self.backend.get(&locator).await {
            Ok(data) => Ok((record, data)),
            Err(BackendError::NotFound(_)) => {
                tracing::warn!(digest = %digest, "Record exists but backend object is missing");
                Err(ContentError::NotFound(*digest))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Whether a record exists for the digest. Metadata only; the backend is not asked.
    pub fn exists(&self, digest: &Digest) -> Result<bool, ContentError> {
        Ok(self.db.get_file(digest)?.is_some())
    }

    /// Delete the backend object, then the record. If the backend refuses, the record
    /// stays so the stored bytes remain reachable.
    pub async fn remove(&self, digest: &Digest) -> Result<bool, ContentError> {
        let _guard = self.db.lock(digest).await;

        let record = match self.db.get_file(digest)? {
            Some(record) => record,
            None => return Ok(false),
        };
        let locator = Locator::new(record.backend_locator);

        match self.backend.delete(&locator).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(digest = %digest, "Backend object already absent, removing record");
            }
            Err(e) => {
                tracing::error!(digest = %digest, error = %e, "Backend delete failed, keeping record");
                return Err(e.into());
            }
        }

        let deleted = self.db.delete_file(digest)?;
        tracing::info!(digest = %digest, "Removed content");
        Ok(deleted)
    }
}
