//! Processing status of a stored file and the transitions allowed between states.
//!
//! ```text
//! unprocessed --enqueue--> queued --start--> running --succeed--> succeeded
//!                            ^                  |
//!                            |               fail / interrupt
//!                            +---retry--- failed <-+
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    #[default]
    Unprocessed,
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl ProcessingStatus {
    /// Whether a pipeline run is (supposedly) in progress for this record.
    pub fn is_active(self) -> bool {
        matches!(self, ProcessingStatus::Queued | ProcessingStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProcessingStatus::Unprocessed => "unprocessed",
            ProcessingStatus::Queued => "queued",
            ProcessingStatus::Running => "running",
            ProcessingStatus::Succeeded => "succeeded",
            ProcessingStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unprocessed" => Some(ProcessingStatus::Unprocessed),
            "queued" => Some(ProcessingStatus::Queued),
            "running" => Some(ProcessingStatus::Running),
            "succeeded" => Some(ProcessingStatus::Succeeded),
            "failed" => Some(ProcessingStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events that drive a record through the processing lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    /// Accepted by the scheduler (first run or retry after failure).
    Enqueue,
    /// A worker picked the job up.
    Start,
    /// Result persisted.
    Succeed,
    /// A step failed; carries the reason.
    Fail(String),
    /// The process restarted while the run was active.
    Interrupt,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("cannot apply {event:?} to a record that is {from:?}")]
pub struct TransitionError {
    pub from: ProcessingStatus,
    pub event: StatusEvent,
}

/// Compute the next status, or refuse the transition.
pub fn next_status(
    from: ProcessingStatus,
    event: &StatusEvent,
) -> Result<ProcessingStatus, TransitionError> {
    use ProcessingStatus::*;

    let to = match (from, event) {
        (Unprocessed | Failed, StatusEvent::Enqueue) => Queued,
        (Queued, StatusEvent::Start) => Running,
        (Running, StatusEvent::Succeed) => Succeeded,
        (Running, StatusEvent::Fail(_)) => Failed,
        (Queued | Running, StatusEvent::Interrupt) => Failed,
        _ => {
            return Err(TransitionError {
                from,
                event: event.clone(),
            })
        }
    };
    Ok(to)
}
