//! Types for batch queue operations.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::QueueConfig;

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The backend refused the job or returned no identifier. Not retryable.
    #[error("Submission failed: {0}")]
    SubmissionFailed(String),

    /// The backend could not be queried (command failed, unexpected output).
    #[error("Queue backend error: {0}")]
    Backend(String),

    #[error("Command timed out: {0}")]
    Timeout(String),

    /// The job was still active after a cancellation request.
    #[error("Failed to delete job {queue_id}: still {state}")]
    DeleteFailed { queue_id: String, state: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl QueueError {
    /// Fatal errors must be handled as a job-level failure; everything else
    /// is transient and worth asking again next cycle.
    pub fn is_fatal(&self) -> bool {
        matches!(self, QueueError::SubmissionFailed(_))
    }
}

/// Everything a backend needs to enqueue one processing job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitRequest {
    /// Pipeline job identifier (used in the job name).
    pub job_id: i64,
    /// Raw data files the job processes.
    pub files: Vec<PathBuf>,
    /// Directory the job writes its results to.
    pub outdir: PathBuf,
}

impl SubmitRequest {
    /// File list as passed in the `DATAFILES` environment variable.
    pub fn datafiles_var(&self) -> String {
        self.files
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(";")
    }
}

/// Counts of this pipeline's jobs on the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub running: u32,
    pub queued: u32,
}

/// Admission-control ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueLimits {
    /// Ceiling on running + queued.
    pub max_jobs_running: u32,
    /// Ceiling on queued alone.
    pub max_jobs_queued: u32,
}

impl QueueLimits {
    /// Whether one more job fits under both ceilings.
    pub fn admits(&self, status: QueueStatus) -> bool {
        status.running + status.queued < self.max_jobs_running
            && status.queued < self.max_jobs_queued
    }
}

impl From<&QueueConfig> for QueueLimits {
    fn from(config: &QueueConfig) -> Self {
        Self {
            max_jobs_running: config.max_jobs_running,
            max_jobs_queued: config.max_jobs_queued,
        }
    }
}

/// Trait for batch queue backends.
#[async_trait]
pub trait QueueManager: Send + Sync {
    /// Backend name for logging.
    fn name(&self) -> &str;

    /// Admission-control ceilings in effect.
    fn limits(&self) -> QueueLimits;

    /// Enqueue one job and return the identifier the backend assigned.
    async fn submit(&self, request: &SubmitRequest) -> Result<String, QueueError>;

    /// True while the backend still tracks the job as active or queued.
    async fn is_running(&self, queue_id: &str) -> Result<bool, QueueError>;

    /// True if the job left a non-empty error log.
    async fn had_errors(&self, queue_id: &str) -> Result<bool, QueueError>;

    /// Full error output of the job.
    async fn get_errors(&self, queue_id: &str) -> Result<String, QueueError>;

    /// Cancel a job and confirm it is gone (or being cancelled).
    async fn delete(&self, queue_id: &str) -> Result<(), QueueError>;

    /// Running and queued counts for this pipeline's jobs.
    async fn status(&self) -> Result<QueueStatus, QueueError>;

    /// Whether another job may be submitted now.
    async fn can_submit(&self) -> Result<bool, QueueError> {
        let status = self.status().await?;
        Ok(self.limits().admits(status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limits_admit_below_both_ceilings() {
        let limits = QueueLimits {
            max_jobs_running: 5,
            max_jobs_queued: 2,
        };
        assert!(limits.admits(QueueStatus {
            running: 3,
            queued: 1
        }));
        // running + queued at ceiling
        assert!(!limits.admits(QueueStatus {
            running: 4,
            queued: 1
        }));
        // queued at ceiling
        assert!(!limits.admits(QueueStatus {
            running: 0,
            queued: 2
        }));
    }

    #[test]
    fn test_datafiles_var() {
        let request = SubmitRequest {
            job_id: 7,
            files: vec![PathBuf::from("/raw/a.fits"), PathBuf::from("/raw/b.fits")],
            outdir: PathBuf::from("/results/job7"),
        };
        assert_eq!(request.datafiles_var(), "/raw/a.fits;/raw/b.fits");
    }

    #[test]
    fn test_only_submission_failures_are_fatal() {
        assert!(QueueError::SubmissionFailed("no id".to_string()).is_fatal());
        assert!(!QueueError::Backend("qstat died".to_string()).is_fatal());
        assert!(!QueueError::Timeout("qstat".to_string()).is_fatal());
    }
}
