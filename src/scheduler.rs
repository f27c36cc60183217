//! Single-flight scheduling of pipeline runs.
//!
//! Accepted digests go into an in-memory in-flight map and onto an unbounded queue
//! drained by a fixed pool of workers. The map is the authority on whether a run is
//! live; a `queued` or `running` status with no in-flight entry was left behind by a
//! previous process and is treated as failed.
//!
//! Admission and healing decisions for one digest run under that digest's lock from
//! the metadata store, so they never interleave. A worker leaves the map only after
//! the run's final status is written; each admission carries a ticket so a finished
//! worker cannot clear the entry of the run that replaced it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::checksum::Digest;
use crate::pipeline::{DocumentPipeline, RunOutcome};
use crate::state_machine::{ProcessingStatus, StatusEvent};
use crate::storage::models::FileRecord;
use crate::storage::{Database, DatabaseError};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("File not found: {0}")]
    NotFound(Digest),
    #[error("Processing queue is closed")]
    Closed,
    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// What startup reconciliation did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Reconciled {
    pub failed: usize,
    pub requeued: usize,
}

/// One accepted run on the queue.
#[derive(Debug, Clone, Copy)]
struct Job {
    digest: Digest,
    ticket: u64,
}

pub struct ProcessingScheduler {
    db: Database,
    pipeline: Arc<DocumentPipeline>,
    in_flight: DashMap<Digest, u64>,
    next_ticket: AtomicU64,
    sender: mpsc::UnboundedSender<Job>,
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Job>>>,
}

/// Clears a job's in-flight entry however the run ends.
struct InFlightSlot<'a> {
    in_flight: &'a DashMap<Digest, u64>,
    job: Job,
}

impl Drop for InFlightSlot<'_> {
    fn drop(&mut self) {
        let ticket = self.job.ticket;
        self.in_flight
            .remove_if(&self.job.digest, |_, current| *current == ticket);
    }
}

impl ProcessingScheduler {
    pub fn new(db: Database, pipeline: Arc<DocumentPipeline>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            db,
            pipeline,
            in_flight: DashMap::new(),
            next_ticket: AtomicU64::new(1),
            sender,
            receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Claim the in-flight entry for `digest` and put the job on the queue.
    fn dispatch(&self, digest: Digest) -> Result<(), SchedulerError> {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        self.in_flight.insert(digest, ticket);
        if self.sender.send(Job { digest, ticket }).is_err() {
            self.in_flight
                .remove_if(&digest, |_, current| *current == ticket);
            return Err(SchedulerError::Closed);
        }
        Ok(())
    }

    /// Queue a run. Returns `false` without doing anything when a run for the digest
    /// is already queued or running, or when the content was already processed.
    pub async fn enqueue(&self, digest: &Digest) -> Result<bool, SchedulerError> {
        let _guard = self.db.lock(digest).await;

        let record = self
            .db
            .get_file(digest)?
            .ok_or(SchedulerError::NotFound(*digest))?;

        match record.status {
            ProcessingStatus::Succeeded => return Ok(false),
            ProcessingStatus::Queued | ProcessingStatus::Running
                if self.in_flight.contains_key(digest) =>
            {
                return Ok(false)
            }
            ProcessingStatus::Queued | ProcessingStatus::Running => {
                tracing::warn!(digest = %digest, status = %record.status, "Clearing stale status before enqueue");
                self.db.transition(digest, StatusEvent::Interrupt)?;
            }
            // A failed record may still have an entry whose worker is finishing up;
            // the new ticket supersedes it.
            ProcessingStatus::Unprocessed | ProcessingStatus::Failed => {}
        }

        if self.db.transition(digest, StatusEvent::Enqueue)?.is_none() {
            return Err(SchedulerError::NotFound(*digest));
        }
        if let Err(e) = self.dispatch(*digest) {
            self.db
                .transition(digest, StatusEvent::Fail("processing queue closed".to_string()))?;
            return Err(e);
        }

        tracing::info!(digest = %digest, "Enqueued for processing");
        Ok(true)
    }

    /// Current record with a stale `queued`/`running` status healed to `failed`.
    pub async fn record(&self, digest: &Digest) -> Result<FileRecord, SchedulerError> {
        let _guard = self.db.lock(digest).await;

        let record = self
            .db
            .get_file(digest)?
            .ok_or(SchedulerError::NotFound(*digest))?;

        if record.status.is_active() && !self.in_flight.contains_key(digest) {
            tracing::warn!(digest = %digest, status = %record.status, "Healing stale status");
            return self
                .db
                .transition(digest, StatusEvent::Interrupt)?
                .ok_or(SchedulerError::NotFound(*digest));
        }
        Ok(record)
    }

    pub async fn status(&self, digest: &Digest) -> Result<ProcessingStatus, SchedulerError> {
        Ok(self.record(digest).await?.status)
    }

    /// Bring records left active by a previous process back in line: `running`
    /// becomes `failed`, `queued` goes back on the queue. Call before
    /// [`ProcessingScheduler::start`].
    pub async fn reconcile(&self) -> Result<Reconciled, SchedulerError> {
        let mut report = Reconciled::default();

        for record in self.db.find_active()? {
            let digest = record.checksum;
            let _guard = self.db.lock(&digest).await;
            if self.in_flight.contains_key(&digest) {
                continue;
            }
            match self.db.get_file(&digest)?.map(|r| r.status) {
                Some(ProcessingStatus::Running) => {
                    self.db.transition(&digest, StatusEvent::Interrupt)?;
                    report.failed += 1;
                }
                Some(ProcessingStatus::Queued) => {
                    self.dispatch(digest)?;
                    report.requeued += 1;
                }
                _ => {}
            }
        }

        tracing::info!(
            failed = report.failed,
            requeued = report.requeued,
            "Reconciled processing state"
        );
        Ok(report)
    }

    /// Spawn `workers` tasks draining the queue.
    pub fn start(self: &Arc<Self>, workers: usize) -> Vec<JoinHandle<()>> {
        (0..workers.max(1))
            .map(|worker| {
                let scheduler = Arc::clone(self);
                tokio::spawn(async move { scheduler.work(worker).await })
            })
            .collect()
    }

    async fn work(&self, worker: usize) {
        tracing::debug!(worker, "Pipeline worker started");
        loop {
            let next = { self.receiver.lock().await.recv().await };
            let Some(job) = next else {
                break;
            };
            let digest = job.digest;
            let _slot = InFlightSlot {
                in_flight: &self.in_flight,
                job,
            };

            // Own task, so a panicking extractor cannot take the worker down with it.
            let pipeline = Arc::clone(&self.pipeline);
            let run = tokio::spawn(async move { pipeline.run(&digest).await }).await;

            let failure = match run {
                Ok(Ok(RunOutcome::Succeeded)) | Ok(Ok(RunOutcome::Failed(_))) => None,
                Ok(Ok(RunOutcome::Vanished)) => {
                    tracing::debug!(worker, digest = %digest, "Record removed before run finished");
                    None
                }
                Ok(Err(e)) => {
                    tracing::error!(worker, digest = %digest, error = %e, "Pipeline run aborted");
                    Some(e.to_string())
                }
                Err(e) => {
                    tracing::error!(worker, digest = %digest, error = %e, "Pipeline run panicked");
                    Some(format!("pipeline run panicked: {e}"))
                }
            };

            if let Some(reason) = failure {
                if let Err(e) = self.db.transition(&digest, StatusEvent::Fail(reason)) {
                    tracing::error!(digest = %digest, error = %e, "Failed to record run failure");
                }
            }
        }
    }
}

/// Fail every `queued` or `running` record. Used at startup when processing is not
/// configured, so nothing would ever pick those records up.
pub fn fail_stale(db: &Database) -> Result<usize, DatabaseError> {
    let mut failed = 0;
    for record in db.find_active()? {
        if db.transition(&record.checksum, StatusEvent::Interrupt)?.is_some() {
            failed += 1;
        }
    }
    Ok(failed)
}
