//! The job scheduler daemon.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::types::{CycleReport, SchedulerError, SchedulerStatus};
use crate::config::SchedulerConfig;
use crate::daemon::CycleLoop;
use crate::datafile::{complete_groups, precheck};
use crate::metrics::{JOBS_SUBMITTED, JOB_OUTCOMES, TERMINAL_FAILURES};
use crate::notify::{JobFailure, Notifications};
use crate::queue::{QueueError, QueueManager, SubmitRequest};
use crate::store::{Job, JobStatus, JobSubmit, SqliteStore, SubmitStatus};

/// Longest error log excerpt kept in a row's details.
const DETAILS_EXCERPT: usize = 500;

/// Drives jobs through their lifecycle against one batch queue.
///
/// Every cycle runs four phases in a fixed order:
/// 1. **Group** complete sets of downloaded files into new jobs
/// 2. **Poll** running submissions for their outcome
/// 3. **Recover** failed jobs (retry or give up)
/// 4. **Submit** new and retrying jobs while the queue admits them
pub struct JobScheduler {
    store: Arc<SqliteStore>,
    queue: Arc<dyn QueueManager>,
    config: SchedulerConfig,
    notifications: Notifications,
    daemon: CycleLoop,
}

impl JobScheduler {
    pub fn new(
        store: Arc<SqliteStore>,
        queue: Arc<dyn QueueManager>,
        config: SchedulerConfig,
        notifications: Notifications,
    ) -> Self {
        Self {
            store,
            queue,
            config,
            notifications,
            daemon: CycleLoop::new("scheduler"),
        }
    }

    /// Run cycles every `poll_interval_secs` until `stop`.
    pub async fn start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let interval = Duration::from_secs(self.config.poll_interval_secs);
        let started = self
            .daemon
            .start(interval, self.notifications.clone(), move || {
                let this = Arc::clone(&this);
                async move { this.run_cycle().await.map(|_| ()) }
            })
            .await;
        if started {
            info!("Job scheduler started with {} backend", self.queue.name());
        }
    }

    /// Stop after the current cycle.
    pub async fn stop(&self) {
        self.daemon.stop().await;
        info!("Job scheduler stopped");
    }

    pub async fn status(&self) -> Result<SchedulerStatus, SchedulerError> {
        let jobs = self.store.job_status_counts()?;
        let queue = match self.queue.status().await {
            Ok(status) => Some(status),
            Err(e) => {
                warn!("Could not query {} status: {}", self.queue.name(), e);
                None
            }
        };
        Ok(SchedulerStatus {
            running: self.daemon.is_running(),
            jobs,
            queue,
        })
    }

    /// One Group → Poll → Recover → Submit cycle.
    pub async fn run_cycle(&self) -> Result<CycleReport, SchedulerError> {
        let mut report = CycleReport::default();
        self.group(&mut report)?;
        self.poll(&mut report).await?;
        self.recover(&mut report).await?;
        self.submit(&mut report).await?;

        if report != CycleReport::default() {
            info!("Scheduler cycle: {:?}", report);
        }
        Ok(report)
    }

    fn group(&self, report: &mut CycleReport) -> Result<(), SchedulerError> {
        let files = self.store.ungrouped_downloaded_files()?;
        for group in complete_groups(&files) {
            let ids: Vec<i64> = group.iter().map(|f| f.id).collect();
            let names: Vec<&str> = group.iter().map(|f| f.remote_name.as_str()).collect();
            let job = self
                .store
                .create_job_with_files(&ids, &format!("Grouped {}", names.join(", ")))?;
            info!("Created job {} for {}", job.id, names.join(", "));
            report.grouped += 1;
        }
        Ok(())
    }

    async fn poll(&self, report: &mut CycleReport) -> Result<(), SchedulerError> {
        for submit in self.store.running_submits()? {
            let Some(queue_id) = submit.queue_id.as_deref() else {
                warn!("Running submission {} has no queue id", submit.id);
                continue;
            };

            match self.queue.is_running(queue_id).await {
                Ok(true) => {
                    debug!("Job {} ({}) still running", submit.job_id, queue_id);
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    // Outcome unknown: keep the job submitted and ask again.
                    warn!(
                        "Could not poll job {} ({}), will retry: {}",
                        submit.job_id, queue_id, e
                    );
                    continue;
                }
            }

            let had_errors = match self.queue.had_errors(queue_id).await {
                Ok(had_errors) => had_errors,
                Err(e) => {
                    warn!("Could not inspect {} error log: {}", queue_id, e);
                    continue;
                }
            };

            if had_errors {
                let errors = self
                    .queue
                    .get_errors(queue_id)
                    .await
                    .unwrap_or_else(|e| format!("(error log unreadable: {})", e));
                self.store.record_submit_outcome(
                    submit.id,
                    SubmitStatus::ProcessingFailed,
                    &format!("Processing failed: {}", excerpt(&errors)),
                )?;
                JOB_OUTCOMES.with_label_values(&["processing_failed"]).inc();
                warn!("Job {} ({}) failed", submit.job_id, queue_id);
                report.processing_failed += 1;
                self.notify_failure(&submit, &errors).await?;
            } else {
                self.store.record_submit_outcome(
                    submit.id,
                    SubmitStatus::Processed,
                    &format!("Processed by {}", queue_id),
                )?;
                JOB_OUTCOMES.with_label_values(&["processed"]).inc();
                info!("Job {} ({}) processed", submit.job_id, queue_id);
                report.processed += 1;
            }
        }
        Ok(())
    }

    async fn notify_failure(&self, submit: &JobSubmit, errors: &str) -> Result<(), SchedulerError> {
        let files = self.job_paths(submit.job_id)?;
        let attempt = self.store.count_job_submits(submit.job_id)?;
        self.notifications
            .job_failed(&JobFailure {
                job_id: submit.job_id,
                queue_id: submit.queue_id.as_deref(),
                errors,
                files: &files,
                attempt,
                max_attempts: self.config.max_attempts,
            })
            .await;
        Ok(())
    }

    async fn recover(&self, report: &mut CycleReport) -> Result<(), SchedulerError> {
        for job in self.store.jobs_with_status(&[JobStatus::Failed])? {
            let attempts = self.store.count_job_submits(job.id)?;
            if attempts < self.config.max_attempts {
                self.store.update_job_status(
                    job.id,
                    JobStatus::Retrying,
                    &format!(
                        "Retrying after attempt {} of {}",
                        attempts, self.config.max_attempts
                    ),
                )?;
                info!("Job {} will be retried", job.id);
                report.retrying += 1;
            } else {
                self.give_up(&job, attempts).await?;
                report.terminal += 1;
            }
        }
        Ok(())
    }

    /// Mark a job whose attempts are used up as terminally failed.
    async fn give_up(&self, job: &Job, attempts: u32) -> Result<(), SchedulerError> {
        self.store.update_job_status(
            job.id,
            JobStatus::TerminalFailure,
            &format!("Failed {} of {} attempts", attempts, self.config.max_attempts),
        )?;
        TERMINAL_FAILURES
            .with_label_values(&["attempts_exhausted"])
            .inc();
        error!("Job {} terminally failed after {} attempts", job.id, attempts);

        let files = self.store.job_files(job.id)?;
        let mut deleted = false;
        if self.config.delete_rawdata_on_terminal_failure {
            deleted = true;
            for file in &files {
                match tokio::fs::remove_file(&file.local_path).await {
                    Ok(()) => {
                        self.store.annotate_file(
                            file.id,
                            &format!("Raw data deleted after job {} terminally failed", job.id),
                        )?;
                        info!("Deleted {}", file.local_path.display());
                    }
                    Err(e) => {
                        deleted = false;
                        warn!("Could not delete {}: {}", file.local_path.display(), e);
                    }
                }
            }
        }

        let last = self.store.job_submits(job.id)?.pop();
        let paths: Vec<PathBuf> = files.into_iter().map(|f| f.local_path).collect();
        self.notifications
            .terminal_failure(
                &JobFailure {
                    job_id: job.id,
                    queue_id: last.as_ref().and_then(|s| s.queue_id.as_deref()),
                    errors: last.as_ref().map(|s| s.details.as_str()).unwrap_or(""),
                    files: &paths,
                    attempt: attempts,
                    max_attempts: self.config.max_attempts,
                },
                deleted,
            )
            .await;
        Ok(())
    }

    async fn submit(&self, report: &mut CycleReport) -> Result<(), SchedulerError> {
        for job in self
            .store
            .jobs_with_status(&[JobStatus::New, JobStatus::Retrying])?
        {
            match self.queue.can_submit().await {
                Ok(true) => {}
                Ok(false) => {
                    debug!("{} queue is full", self.queue.name());
                    break;
                }
                Err(e) => {
                    warn!("Could not query {} status: {}", self.queue.name(), e);
                    break;
                }
            }

            let files = self.job_paths(job.id)?;
            if let Err(e) = precheck(&files, self.config.min_observation_secs).await {
                self.store.update_job_status(
                    job.id,
                    JobStatus::TerminalFailure,
                    &format!("Presubmission check failed: {}", e),
                )?;
                TERMINAL_FAILURES.with_label_values(&["precheck"]).inc();
                error!("Job {} failed presubmission check: {}", job.id, e);
                self.notifications
                    .precheck_failed(job.id, &e.to_string(), &files)
                    .await;
                report.terminal += 1;
                continue;
            }

            let attempt = self.store.count_job_submits(job.id)? + 1;
            let outdir = self
                .config
                .results_dir
                .join(format!("job{}", job.id))
                .join(format!("attempt{}", attempt));
            tokio::fs::create_dir_all(&outdir).await?;

            let request = SubmitRequest {
                job_id: job.id,
                files,
                outdir,
            };
            match self.queue.submit(&request).await {
                Ok(queue_id) => {
                    self.store.record_submission(
                        job.id,
                        &queue_id,
                        &request.outdir,
                        &format!("Submitted as {} (attempt {})", queue_id, attempt),
                    )?;
                    JOBS_SUBMITTED.inc();
                    info!("Submitted job {} as {} (attempt {})", job.id, queue_id, attempt);
                    report.submitted += 1;
                }
                Err(QueueError::SubmissionFailed(reason)) => {
                    let submit = self.store.record_rejected_submission(
                        job.id,
                        &request.outdir,
                        &format!("Submission rejected: {}", reason),
                    )?;
                    JOB_OUTCOMES.with_label_values(&["submission_failed"]).inc();
                    warn!("Submission of job {} rejected: {}", job.id, reason);
                    report.rejected += 1;
                    self.notify_failure(&submit, &reason).await?;
                }
                Err(e) => {
                    warn!("Could not submit job {}, will retry: {}", job.id, e);
                    break;
                }
            }
        }
        Ok(())
    }

    fn job_paths(&self, job_id: i64) -> Result<Vec<PathBuf>, SchedulerError> {
        Ok(self
            .store
            .job_files(job_id)?
            .into_iter()
            .map(|f| f.local_path)
            .collect())
    }
}

/// First `DETAILS_EXCERPT` characters of an error log.
fn excerpt(text: &str) -> String {
    let text = text.trim();
    match text.char_indices().nth(DETAILS_EXCERPT) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}
