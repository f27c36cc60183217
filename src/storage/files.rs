use std::collections::VecDeque;
use std::ops::Bound;

use chrono::Utc;
use redb::{ReadableTable, ReadableTableMetadata};

use super::db::{Database, DatabaseError};
use super::models::{FileRecord, OcrResult};
use super::tables::*;
use crate::checksum::Digest;
use crate::state_machine::{next_status, ProcessingStatus, StatusEvent};

/// Records fetched per read transaction while scanning.
const SCAN_BATCH: usize = 256;

impl Database {
    // ========================================================================
    // File records
    // ========================================================================

    /// Get a file record by digest
    pub fn get_file(&self, digest: &Digest) -> Result<Option<FileRecord>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(FILES)?;

        match table.get(digest.to_hex().as_str())? {
            Some(data) => {
                let file: FileRecord = rmp_serde::from_slice(data.value())?;
                Ok(Some(file))
            }
            None => Ok(None),
        }
    }

    /// Read the current record (or a blank one), apply `mutator`, and write it back
    /// in a single transaction.
    pub fn upsert_file<F>(&self, digest: &Digest, mutator: F) -> Result<FileRecord, DatabaseError>
    where
        F: FnOnce(&mut FileRecord),
    {
        let key = digest.to_hex();
        let write_txn = self.begin_write()?;

        let record = {
            let mut table = write_txn.open_table(FILES)?;
            let existing: Option<FileRecord> = {
                let result = match table.get(key.as_str())? {
                    Some(data) => Some(rmp_serde::from_slice(data.value())?),
                    None => None,
                };
                result
            };

            let mut record = existing.unwrap_or_else(|| FileRecord::new(*digest));
            mutator(&mut record);
            debug_assert_eq!(record.checksum, *digest, "mutator must not change identity");
            record.updated_at = Utc::now();

            let data = rmp_serde::to_vec_named(&record)?;
            table.insert(key.as_str(), data.as_slice())?;
            record
        };

        write_txn.commit()?;
        Ok(record)
    }

    /// Like [`Database::upsert_file`] but never creates a record. Returns `None` when
    /// the digest is unknown; otherwise the mutator's output. Nothing is written when
    /// the mutator returns an error.
    pub fn update_file<T, F>(&self, digest: &Digest, mutator: F) -> Result<Option<T>, DatabaseError>
    where
        F: FnOnce(&mut FileRecord) -> Result<T, DatabaseError>,
    {
        let key = digest.to_hex();
        let write_txn = self.begin_write()?;

        let output = {
            let mut table = write_txn.open_table(FILES)?;
            let existing: Option<FileRecord> = {
                let result = match table.get(key.as_str())? {
                    Some(data) => Some(rmp_serde::from_slice(data.value())?),
                    None => None,
                };
                result
            };

            match existing {
                Some(mut record) => {
                    let output = mutator(&mut record)?;
                    record.updated_at = Utc::now();
                    let data = rmp_serde::to_vec_named(&record)?;
                    table.insert(key.as_str(), data.as_slice())?;
                    Some(output)
                }
                None => None,
            }
        };

        write_txn.commit()?;
        Ok(output)
    }

    /// Apply a lifecycle event. Fails with `DatabaseError::Transition` when the event
    /// is not allowed from the current status.
    pub fn transition(
        &self,
        digest: &Digest,
        event: StatusEvent,
    ) -> Result<Option<FileRecord>, DatabaseError> {
        self.update_file(digest, move |record| {
            record.status = next_status(record.status, &event)?;
            match &event {
                StatusEvent::Enqueue => {
                    record.last_error = None;
                }
                StatusEvent::Start => {
                    record.attempts += 1;
                }
                StatusEvent::Fail(reason) => {
                    record.last_error = Some(reason.clone());
                }
                StatusEvent::Interrupt => {
                    record.last_error = Some("interrupted by restart".to_string());
                }
                StatusEvent::Succeed => {}
            }
            Ok(record.clone())
        })
    }

    /// Delete a record and its pipeline output
    pub fn delete_file(&self, digest: &Digest) -> Result<bool, DatabaseError> {
        let key = digest.to_hex();
        let write_txn = self.begin_write()?;

        let deleted = {
            let mut table = write_txn.open_table(FILES)?;
            let removed = table.remove(key.as_str())?.is_some();
            let mut results = write_txn.open_table(OCR_RESULTS)?;
            results.remove(key.as_str())?;
            removed
        };

        write_txn.commit()?;
        Ok(deleted)
    }

    pub fn count_files(&self) -> Result<u64, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(FILES)?;
        Ok(table.len()?)
    }

    /// Lazily iterate over every record in digest order. Each batch is read in its
    /// own transaction, so a long scan may observe concurrent writes.
    pub fn list_files(&self) -> RecordScan {
        RecordScan {
            db: self.clone(),
            cursor: None,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    // ========================================================================
    // Pipeline output
    // ========================================================================

    /// Persist the result and mark the record succeeded, atomically. Returns `false`
    /// if the record vanished (deleted mid-run); the result is then dropped.
    pub fn complete_processing(
        &self,
        digest: &Digest,
        result: &OcrResult,
    ) -> Result<bool, DatabaseError> {
        let key = digest.to_hex();
        let write_txn = self.begin_write()?;

        let completed = {
            let mut table = write_txn.open_table(FILES)?;
            let existing: Option<FileRecord> = {
                let result = match table.get(key.as_str())? {
                    Some(data) => Some(rmp_serde::from_slice(data.value())?),
                    None => None,
                };
                result
            };

            match existing {
                Some(mut record) => {
                    record.status = next_status(record.status, &StatusEvent::Succeed)?;
                    record.result_ref = Some(key.clone());
                    record.last_error = None;
                    record.updated_at = Utc::now();

                    let data = rmp_serde::to_vec_named(&record)?;
                    table.insert(key.as_str(), data.as_slice())?;

                    let mut results = write_txn.open_table(OCR_RESULTS)?;
                    let payload = rmp_serde::to_vec_named(result)?;
                    results.insert(key.as_str(), payload.as_slice())?;
                    true
                }
                None => false,
            }
        };

        if completed {
            write_txn.commit()?;
        } else {
            write_txn.abort()?;
        }
        Ok(completed)
    }

    pub fn get_result(&self, result_ref: &str) -> Result<Option<OcrResult>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(OCR_RESULTS)?;

        match table.get(result_ref)? {
            Some(data) => Ok(Some(rmp_serde::from_slice(data.value())?)),
            None => Ok(None),
        }
    }

    /// Records left `queued` or `running` by a previous process.
    pub fn find_active(&self) -> Result<Vec<FileRecord>, DatabaseError> {
        self.list_files()
            .filter(|r| !matches!(r, Ok(record) if !record.status.is_active()))
            .collect()
    }

    fn scan_batch(&self, after: Option<&str>) -> Result<Vec<(String, FileRecord)>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(FILES)?;

        let range = match after {
            Some(last) => table.range::<&str>((Bound::Excluded(last), Bound::Unbounded))?,
            None => table.range::<&str>(..)?,
        };

        let mut batch = Vec::with_capacity(SCAN_BATCH);
        for entry in range.take(SCAN_BATCH) {
            let (key, value) = entry?;
            let record: FileRecord = rmp_serde::from_slice(value.value())?;
            batch.push((key.value().to_string(), record));
        }
        Ok(batch)
    }
}

/// Lazy sequence of records returned by [`Database::list_files`].
pub struct RecordScan {
    db: Database,
    cursor: Option<String>,
    buffer: VecDeque<FileRecord>,
    exhausted: bool,
}

impl Iterator for RecordScan {
    type Item = Result<FileRecord, DatabaseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            match self.db.scan_batch(self.cursor.as_deref()) {
                Ok(batch) => {
                    if batch.len() < SCAN_BATCH {
                        self.exhausted = true;
                    }
                    for (key, record) in batch {
                        self.cursor = Some(key);
                        self.buffer.push_back(record);
                    }
                }
                Err(e) => {
                    self.exhausted = true;
                    return Some(Err(e));
                }
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}

impl RecordScan {
    /// Keep only records in the given status.
    pub fn with_status(
        self,
        status: ProcessingStatus,
    ) -> impl Iterator<Item = Result<FileRecord, DatabaseError>> {
        self.filter(move |r| !matches!(r, Ok(record) if record.status != status))
    }
}
