//! Jobs, their files and their queue submissions.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use rusqlite::{params, OptionalExtension, Row, Transaction};

use super::files::row_to_file;
use super::sqlite::{decode_err, now_text, parse_time};
use super::{DataFile, Job, JobStatus, JobSubmit, SqliteStore, StoreError, SubmitStatus};

const JOB_COLUMNS: &str = "id, status, details, created_at, updated_at";
const SUBMIT_COLUMNS: &str =
    "id, job_id, queue_id, output_dir, status, details, created_at, updated_at";

fn row_to_job(row: &Row) -> rusqlite::Result<Job> {
    let status: String = row.get(1)?;
    let created_at: String = row.get(3)?;
    let updated_at: String = row.get(4)?;
    Ok(Job {
        id: row.get(0)?,
        status: status.parse().map_err(decode_err)?,
        details: row.get(2)?,
        created_at: parse_time(&created_at).map_err(decode_err)?,
        updated_at: parse_time(&updated_at).map_err(decode_err)?,
    })
}

fn row_to_submit(row: &Row) -> rusqlite::Result<JobSubmit> {
    let output_dir: String = row.get(3)?;
    let status: String = row.get(4)?;
    let created_at: String = row.get(6)?;
    let updated_at: String = row.get(7)?;
    Ok(JobSubmit {
        id: row.get(0)?,
        job_id: row.get(1)?,
        queue_id: row.get(2)?,
        output_dir: PathBuf::from(output_dir),
        status: status.parse().map_err(decode_err)?,
        details: row.get(5)?,
        created_at: parse_time(&created_at).map_err(decode_err)?,
        updated_at: parse_time(&updated_at).map_err(decode_err)?,
    })
}

fn load_job(tx: &Transaction<'_>, id: i64) -> Result<Job, StoreError> {
    tx.query_row(
        &format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS),
        params![id],
        row_to_job,
    )
    .optional()?
    .ok_or(StoreError::NotFound { entity: "job", id })
}

fn load_submit(tx: &Transaction<'_>, id: i64) -> Result<JobSubmit, StoreError> {
    tx.query_row(
        &format!("SELECT {} FROM job_submits WHERE id = ?", SUBMIT_COLUMNS),
        params![id],
        row_to_submit,
    )
    .optional()?
    .ok_or(StoreError::NotFound {
        entity: "job submit",
        id,
    })
}

/// Move a job along a legal edge, inside an open transaction.
fn transition_job(
    tx: &Transaction<'_>,
    job_id: i64,
    to: JobStatus,
    details: &str,
) -> Result<Job, StoreError> {
    let current = load_job(tx, job_id)?;
    if !current.status.can_transition_to(to) {
        return Err(StoreError::InvalidTransition {
            job_id,
            from: current.status,
            to,
        });
    }
    tx.execute(
        "UPDATE jobs SET status = ?, details = ?, updated_at = ? WHERE id = ?",
        params![to.as_str(), details, now_text(), job_id],
    )?;
    load_job(tx, job_id)
}

fn count_running(tx: &Transaction<'_>, job_id: i64) -> Result<i64, StoreError> {
    Ok(tx.query_row(
        "SELECT COUNT(*) FROM job_submits WHERE job_id = ? AND status = ?",
        params![job_id, SubmitStatus::Running.as_str()],
        |row| row.get(0),
    )?)
}

fn insert_submit(
    tx: &Transaction<'_>,
    job_id: i64,
    queue_id: Option<&str>,
    output_dir: &Path,
    status: SubmitStatus,
    details: &str,
) -> Result<JobSubmit, StoreError> {
    let now = now_text();
    tx.execute(
        "INSERT INTO job_submits (job_id, queue_id, output_dir, status, details, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
        params![
            job_id,
            queue_id,
            output_dir.to_string_lossy(),
            status.as_str(),
            details,
            now,
            now
        ],
    )?;
    load_submit(tx, tx.last_insert_rowid())
}

impl SqliteStore {
    /// Create a job in `new` covering the given files.
    ///
    /// Fails with a conflict if any of the files already belongs to a job.
    pub fn create_job_with_files(&self, file_ids: &[i64], details: &str) -> Result<Job, StoreError> {
        self.transaction(|tx| {
            for file_id in file_ids {
                let owner: Option<i64> = tx
                    .query_row(
                        "SELECT job_id FROM job_files WHERE file_id = ?",
                        params![file_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                if let Some(job_id) = owner {
                    return Err(StoreError::Conflict(format!(
                        "file {} already belongs to job {}",
                        file_id, job_id
                    )));
                }
            }

            let now = now_text();
            tx.execute(
                "INSERT INTO jobs (status, details, created_at, updated_at) VALUES (?, ?, ?, ?)",
                params![JobStatus::New.as_str(), details, now, now],
            )?;
            let job_id = tx.last_insert_rowid();
            for file_id in file_ids {
                tx.execute(
                    "INSERT INTO job_files (job_id, file_id, created_at, updated_at) VALUES (?, ?, ?, ?)",
                    params![job_id, file_id, now, now],
                )?;
            }
            load_job(tx, job_id)
        })
    }

    pub fn get_job(&self, id: i64) -> Result<Option<Job>, StoreError> {
        self.transaction(|tx| {
            Ok(tx
                .query_row(
                    &format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS),
                    params![id],
                    row_to_job,
                )
                .optional()?)
        })
    }

    /// Jobs in any of the given states, oldest first.
    pub fn jobs_with_status(&self, statuses: &[JobStatus]) -> Result<Vec<Job>, StoreError> {
        let wanted = statuses
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {} FROM jobs WHERE status IN ({}) ORDER BY id ASC",
            JOB_COLUMNS, wanted
        );
        self.transaction(|tx| {
            let mut stmt = tx.prepare(&sql)?;
            let rows = stmt.query_map([], row_to_job)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    /// Files covered by a job, ordered by name.
    pub fn job_files(&self, job_id: i64) -> Result<Vec<DataFile>, StoreError> {
        self.transaction(|tx| {
            let mut stmt = tx.prepare(
                "SELECT f.id, f.restore_id, f.remote_name, f.local_path, f.size, f.status, \
                 f.details, f.created_at, f.updated_at \
                 FROM files f JOIN job_files jf ON jf.file_id = f.id \
                 WHERE jf.job_id = ? ORDER BY f.remote_name ASC",
            )?;
            let rows = stmt.query_map(params![job_id], row_to_file)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    /// Move a job along a legal edge of its state machine.
    pub fn update_job_status(
        &self,
        job_id: i64,
        status: JobStatus,
        details: &str,
    ) -> Result<Job, StoreError> {
        self.transaction(|tx| transition_job(tx, job_id, status, details))
    }

    /// Record an accepted submission: a `running` JobSubmit and the job moved
    /// to `submitted`, atomically. Refuses to create a second running
    /// submission for the same job.
    pub fn record_submission(
        &self,
        job_id: i64,
        queue_id: &str,
        output_dir: &Path,
        details: &str,
    ) -> Result<JobSubmit, StoreError> {
        self.transaction(|tx| {
            if count_running(tx, job_id)? > 0 {
                return Err(StoreError::Conflict(format!(
                    "job {} already has a running submission",
                    job_id
                )));
            }
            let submit = insert_submit(
                tx,
                job_id,
                Some(queue_id),
                output_dir,
                SubmitStatus::Running,
                details,
            )?;
            transition_job(tx, job_id, JobStatus::Submitted, details)?;
            Ok(submit)
        })
    }

    /// Record a submission the queue rejected. The attempt counts against
    /// the job's retry budget and the job moves to `failed`.
    pub fn record_rejected_submission(
        &self,
        job_id: i64,
        output_dir: &Path,
        details: &str,
    ) -> Result<JobSubmit, StoreError> {
        self.transaction(|tx| {
            let submit = insert_submit(
                tx,
                job_id,
                None,
                output_dir,
                SubmitStatus::SubmissionFailed,
                details,
            )?;
            transition_job(tx, job_id, JobStatus::Failed, details)?;
            Ok(submit)
        })
    }

    /// Close a running submission and move its job accordingly
    /// (`processed` → job `processed`, `processing_failed` → job `failed`).
    pub fn record_submit_outcome(
        &self,
        submit_id: i64,
        outcome: SubmitStatus,
        details: &str,
    ) -> Result<Job, StoreError> {
        let job_status = match outcome {
            SubmitStatus::Processed => JobStatus::Processed,
            SubmitStatus::ProcessingFailed => JobStatus::Failed,
            other => {
                return Err(StoreError::Conflict(format!(
                    "{} is not an outcome of a running submission",
                    other
                )))
            }
        };
        self.transaction(|tx| {
            let submit = load_submit(tx, submit_id)?;
            if submit.status != SubmitStatus::Running {
                return Err(StoreError::Conflict(format!(
                    "submission {} is already {}",
                    submit_id, submit.status
                )));
            }
            tx.execute(
                "UPDATE job_submits SET status = ?, details = ?, updated_at = ? WHERE id = ?",
                params![outcome.as_str(), details, now_text(), submit_id],
            )?;
            transition_job(tx, submit.job_id, job_status, details)
        })
    }

    /// Submissions still marked running, oldest first.
    pub fn running_submits(&self) -> Result<Vec<JobSubmit>, StoreError> {
        self.transaction(|tx| {
            let mut stmt = tx.prepare(&format!(
                "SELECT {} FROM job_submits WHERE status = ? ORDER BY id ASC",
                SUBMIT_COLUMNS
            ))?;
            let rows = stmt.query_map(params![SubmitStatus::Running.as_str()], row_to_submit)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    /// All submissions of a job, oldest first.
    pub fn job_submits(&self, job_id: i64) -> Result<Vec<JobSubmit>, StoreError> {
        self.transaction(|tx| {
            let mut stmt = tx.prepare(&format!(
                "SELECT {} FROM job_submits WHERE job_id = ? ORDER BY id ASC",
                SUBMIT_COLUMNS
            ))?;
            let rows = stmt.query_map(params![job_id], row_to_submit)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    pub fn count_job_submits(&self, job_id: i64) -> Result<u32, StoreError> {
        self.transaction(|tx| {
            let count: i64 = tx.query_row(
                "SELECT COUNT(*) FROM job_submits WHERE job_id = ?",
                params![job_id],
                |row| row.get(0),
            )?;
            Ok(count as u32)
        })
    }

    /// Mark a processed job as uploaded. Called by the result uploader.
    pub fn mark_job_uploaded(&self, job_id: i64, details: &str) -> Result<Job, StoreError> {
        self.update_job_status(job_id, JobStatus::Uploaded, details)
    }

    /// Number of jobs per status (statuses with no jobs are included as 0).
    pub fn job_status_counts(&self) -> Result<BTreeMap<JobStatus, u64>, StoreError> {
        self.transaction(|tx| {
            let mut counts: BTreeMap<JobStatus, u64> =
                JobStatus::ALL.iter().map(|s| (*s, 0)).collect();
            let mut stmt = tx.prepare("SELECT status, COUNT(*) FROM jobs GROUP BY status")?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let status: String = row.get(0)?;
                let count: i64 = row.get(1)?;
                counts.insert(status.parse()?, count as u64);
            }
            Ok(counts)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FileStatus, NewDataFile};

    fn store_with_job() -> (SqliteStore, Job) {
        let store = SqliteStore::in_memory().unwrap();
        let file = store
            .insert_file(
                &NewDataFile {
                    remote_name: "x.fits".to_string(),
                    local_path: PathBuf::from("/data/raw/x.fits"),
                    size: Some(1),
                },
                FileStatus::Downloaded,
            )
            .unwrap();
        let job = store.create_job_with_files(&[file.id], "Created").unwrap();
        (store, job)
    }

    #[test]
    fn test_create_job_links_files() {
        let (store, job) = store_with_job();
        assert_eq!(job.status, JobStatus::New);
        let files = store.job_files(job.id).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].remote_name, "x.fits");
    }

    #[test]
    fn test_file_cannot_join_two_jobs() {
        let (store, job) = store_with_job();
        let file_id = store.job_files(job.id).unwrap()[0].id;
        let result = store.create_job_with_files(&[file_id], "again");
        assert!(matches!(result, Err(StoreError::Conflict(_))));
        assert_eq!(store.jobs_with_status(&[JobStatus::New]).unwrap().len(), 1);
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let (store, job) = store_with_job();
        let result = store.update_job_status(job.id, JobStatus::Processed, "skip");
        assert!(matches!(
            result,
            Err(StoreError::InvalidTransition {
                from: JobStatus::New,
                to: JobStatus::Processed,
                ..
            })
        ));
    }

    #[test]
    fn test_submission_and_outcome() {
        let (store, job) = store_with_job();
        let submit = store
            .record_submission(job.id, "1234.pbs", Path::new("/results/job1/attempt1"), "Submitted")
            .unwrap();
        assert_eq!(submit.status, SubmitStatus::Running);
        assert_eq!(
            store.get_job(job.id).unwrap().unwrap().status,
            JobStatus::Submitted
        );
        assert_eq!(store.running_submits().unwrap().len(), 1);

        let job = store
            .record_submit_outcome(submit.id, SubmitStatus::Processed, "Done")
            .unwrap();
        assert_eq!(job.status, JobStatus::Processed);
        assert!(store.running_submits().unwrap().is_empty());

        let job = store.mark_job_uploaded(job.id, "Uploaded").unwrap();
        assert_eq!(job.status, JobStatus::Uploaded);
    }

    #[test]
    fn test_second_running_submission_refused() {
        let (store, job) = store_with_job();
        store
            .record_submission(job.id, "1.pbs", Path::new("/r/1"), "Submitted")
            .unwrap();
        let again = store.record_submission(job.id, "2.pbs", Path::new("/r/2"), "Submitted");
        assert!(matches!(again, Err(StoreError::Conflict(_))));
        assert_eq!(store.count_job_submits(job.id).unwrap(), 1);
    }

    #[test]
    fn test_outcome_only_once() {
        let (store, job) = store_with_job();
        let submit = store
            .record_submission(job.id, "1.pbs", Path::new("/r/1"), "Submitted")
            .unwrap();
        store
            .record_submit_outcome(submit.id, SubmitStatus::ProcessingFailed, "segfault")
            .unwrap();
        let again = store.record_submit_outcome(submit.id, SubmitStatus::Processed, "late");
        assert!(matches!(again, Err(StoreError::Conflict(_))));
        assert_eq!(
            store.get_job(job.id).unwrap().unwrap().status,
            JobStatus::Failed
        );
    }

    #[test]
    fn test_rejected_submission_counts_as_attempt() {
        let (store, job) = store_with_job();
        let submit = store
            .record_rejected_submission(job.id, Path::new("/r/1"), "qsub refused")
            .unwrap();
        assert_eq!(submit.status, SubmitStatus::SubmissionFailed);
        assert!(submit.queue_id.is_none());
        assert_eq!(store.count_job_submits(job.id).unwrap(), 1);
        assert_eq!(
            store.get_job(job.id).unwrap().unwrap().status,
            JobStatus::Failed
        );
    }

    #[test]
    fn test_status_counts() {
        let (store, job) = store_with_job();
        store.create_job_with_files(&[], "second").unwrap();
        store
            .update_job_status(job.id, JobStatus::TerminalFailure, "precheck")
            .unwrap();

        let counts = store.job_status_counts().unwrap();
        assert_eq!(counts[&JobStatus::New], 1);
        assert_eq!(counts[&JobStatus::TerminalFailure], 1);
        assert_eq!(counts[&JobStatus::Uploaded], 0);
    }
}
