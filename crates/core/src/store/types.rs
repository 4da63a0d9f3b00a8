//! Persisted entity types and their status vocabularies.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by the persistent store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Contention outlived the retry budget.
    #[error("database still busy after {attempts} attempts")]
    Busy { attempts: u32 },

    /// Underlying SQLite failure.
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    /// A job status change outside the allowed edges.
    #[error("job {job_id}: cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: i64,
        from: JobStatus,
        to: JobStatus,
    },

    /// The write would break a uniqueness invariant (second running
    /// submission, file grouped twice, ...).
    #[error("conflict: {0}")]
    Conflict(String),

    /// A stored value could not be decoded.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("store lock poisoned")]
    Poisoned,
}

impl StoreError {
    /// Whether this error is transient lock contention worth retrying.
    pub fn is_contention(&self) -> bool {
        match self {
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

/// Declares a status enum persisted as snake_case text.
macro_rules! status_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            /// All variants, in declaration order.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// Returns the persisted string representation.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = StoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(StoreError::Corrupt(format!(
                        "unknown {} '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

status_enum!(
    /// Lifecycle of a raw data file.
    FileStatus {
        New => "new",
        Downloading => "downloading",
        Downloaded => "downloaded",
        Failed => "failed",
    }
);

status_enum!(
    /// Outcome of one retrieval attempt.
    AttemptStatus {
        Downloading => "downloading",
        Downloaded => "downloaded",
        Failed => "failed",
    }
);

status_enum!(
    /// Lifecycle of an archive restore request.
    RestoreStatus {
        Waiting => "waiting",
        Ready => "ready",
        Finished => "finished",
        Failed => "failed",
    }
);

status_enum!(
    /// Lifecycle of a processing job.
    JobStatus {
        New => "new",
        Submitted => "submitted",
        Processed => "processed",
        Failed => "failed",
        Retrying => "retrying",
        TerminalFailure => "terminal_failure",
        Uploaded => "uploaded",
    }
);

status_enum!(
    /// Outcome of one submission of a job to the batch queue.
    SubmitStatus {
        Running => "running",
        Processed => "processed",
        ProcessingFailed => "processing_failed",
        PrecheckFailed => "precheck_failed",
        SubmissionFailed => "submission_failed",
    }
);

impl JobStatus {
    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// `new|retrying -> failed` covers a submission the backend rejected.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (New, Submitted)
                | (Retrying, Submitted)
                | (Submitted, Processed)
                | (Submitted, Failed)
                | (New, Failed)
                | (Retrying, Failed)
                | (Failed, Retrying)
                | (Failed, TerminalFailure)
                | (New, TerminalFailure)
                | (Retrying, TerminalFailure)
                | (Processed, Uploaded)
        )
    }

    /// No automatic transition leaves a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::TerminalFailure | JobStatus::Uploaded)
    }
}

impl RestoreStatus {
    /// Restores still holding (or about to hold) disk space.
    pub fn is_active(self) -> bool {
        matches!(self, RestoreStatus::Waiting | RestoreStatus::Ready)
    }
}

/// A raw data file known to the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataFile {
    pub id: i64,
    /// Restore the file was listed under (None for files registered by hand).
    pub restore_id: Option<i64>,
    pub remote_name: String,
    pub local_path: PathBuf,
    /// Size reported by the archive listing.
    pub size: Option<u64>,
    pub status: FileStatus,
    pub details: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A file about to be inserted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewDataFile {
    pub remote_name: String,
    pub local_path: PathBuf,
    pub size: Option<u64>,
}

/// One retrieval attempt for a file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadAttempt {
    pub id: i64,
    pub file_id: i64,
    pub status: AttemptStatus,
    pub details: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A staging request against the archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Restore {
    pub id: i64,
    /// Opaque token returned by the archive.
    pub guid: String,
    pub status: RestoreStatus,
    /// Sum of listed file sizes (0 until listed).
    pub size: u64,
    /// When the file listing was recorded.
    pub listed_at: Option<DateTime<Utc>>,
    pub details: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One schedulable unit covering a complete file group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub status: JobStatus,
    pub details: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One attempt to run a job on the batch queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSubmit {
    pub id: i64,
    pub job_id: i64,
    /// Identifier assigned by the queue (None when submission was rejected).
    pub queue_id: Option<String>,
    pub output_dir: PathBuf,
    pub status: SubmitStatus,
    pub details: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_through_text() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), *status);
        }
        assert_eq!(
            "processing_failed".parse::<SubmitStatus>().unwrap(),
            SubmitStatus::ProcessingFailed
        );
    }

    #[test]
    fn test_unknown_status_is_corrupt() {
        let err = "exploded".parse::<FileStatus>().unwrap_err();
        assert!(matches!(err, StoreError::Corrupt(_)));
        assert!(err.to_string().contains("FileStatus"));
    }

    #[test]
    fn test_job_transitions() {
        use JobStatus::*;
        assert!(New.can_transition_to(Submitted));
        assert!(Submitted.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Retrying));
        assert!(Retrying.can_transition_to(Submitted));
        assert!(Failed.can_transition_to(TerminalFailure));
        assert!(New.can_transition_to(TerminalFailure));
        assert!(Processed.can_transition_to(Uploaded));

        assert!(!New.can_transition_to(Processed));
        assert!(!Submitted.can_transition_to(Retrying));
        assert!(!TerminalFailure.can_transition_to(Retrying));
        assert!(!Uploaded.can_transition_to(New));
        assert!(!Failed.can_transition_to(Submitted));
    }

    #[test]
    fn test_terminal_and_active_flags() {
        assert!(JobStatus::TerminalFailure.is_terminal());
        assert!(JobStatus::Uploaded.is_terminal());
        assert!(!JobStatus::Failed.is_terminal());
        assert!(RestoreStatus::Waiting.is_active());
        assert!(!RestoreStatus::Finished.is_active());
    }

    #[test]
    fn test_status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&JobStatus::TerminalFailure).unwrap(),
            "\"terminal_failure\""
        );
    }

    #[test]
    fn test_busy_error_is_contention() {
        let busy = StoreError::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        ));
        assert!(busy.is_contention());
        assert!(!StoreError::Poisoned.is_contention());
    }
}
