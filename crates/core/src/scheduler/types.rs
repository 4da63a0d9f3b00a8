//! Types for the job scheduler.

use std::collections::BTreeMap;

use serde::Serialize;
use thiserror::Error;

use crate::queue::{QueueError, QueueStatus};
use crate::store::{JobStatus, StoreError};

/// Errors that end a scheduler cycle.
///
/// Queue trouble with a single job is handled inside the cycle; only
/// failures that leave the cycle unable to continue end up here.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Cannot prepare output directory: {0}")]
    Io(#[from] std::io::Error),
}

/// What one scheduler cycle did, per phase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    /// Jobs created from newly complete file groups.
    pub grouped: usize,
    /// Submissions found finished without errors.
    pub processed: usize,
    /// Submissions found finished with errors.
    pub processing_failed: usize,
    /// Failed jobs sent back for another attempt.
    pub retrying: usize,
    /// Jobs marked terminal_failure (attempts exhausted or precheck).
    pub terminal: usize,
    pub submitted: usize,
    /// Submissions the backend refused.
    pub rejected: usize,
}

/// Snapshot of the scheduler and the queue it feeds.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub jobs: BTreeMap<JobStatus, u64>,
    /// None when the backend could not be queried.
    pub queue: Option<QueueStatus>,
}
