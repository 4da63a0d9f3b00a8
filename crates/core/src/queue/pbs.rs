//! PBS/Torque queue manager.
//!
//! Every call queries the server afresh (`qstat`), which is fine for a
//! responsive PBS server.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::command::{
    is_pipeline_job_name, parse_submit_output, CommandRunner, ProcessRunner, QueueLogs,
    SubmitOptions,
};
use super::{QueueError, QueueLimits, QueueManager, QueueStatus, SubmitRequest};
use crate::config::QueueConfig;

/// PBS queue manager.
pub struct PbsQueueManager {
    runner: Arc<dyn CommandRunner>,
    options: SubmitOptions,
    logs: QueueLogs,
    limits: QueueLimits,
    user: Option<String>,
    delete_confirm_delay: Duration,
}

impl PbsQueueManager {
    /// Create a PBS manager that shells out to the real commands.
    pub fn new(config: &QueueConfig) -> Self {
        let runner = Arc::new(ProcessRunner::new(Duration::from_secs(
            config.command_timeout_secs,
        )));
        Self::with_runner(config, runner)
    }

    /// Create a PBS manager with a custom command runner.
    pub fn with_runner(config: &QueueConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            options: SubmitOptions::from(config),
            logs: QueueLogs::new(&config.log_dir),
            limits: QueueLimits::from(config),
            user: config.user.clone().or_else(|| std::env::var("USER").ok()),
            delete_confirm_delay: Duration::from_secs(config.delete_confirm_delay_secs),
        }
    }

    /// `job_state` of a job, or None if the server no longer knows it.
    async fn job_state(&self, queue_id: &str) -> Result<Option<String>, QueueError> {
        let output = self
            .runner
            .run("qstat", &["-f".to_string(), queue_id.to_string()])
            .await?;

        if !output.success {
            let stderr = output.stderr.to_lowercase();
            if stderr.contains("unknown job id") || stderr.contains("job has finished") {
                return Ok(None);
            }
            return Err(QueueError::Backend(format!(
                "qstat -f {} failed: {}",
                queue_id,
                output.stderr.trim()
            )));
        }

        Ok(parse_job_state(&output.stdout))
    }
}

/// Pull `job_state = X` out of `qstat -f` output.
fn parse_job_state(full: &str) -> Option<String> {
    full.lines()
        .filter_map(|line| line.trim().strip_prefix("job_state"))
        .filter_map(|rest| rest.trim().strip_prefix('='))
        .map(|state| state.trim().to_string())
        .next()
}

/// Width of the qstat `Name` column; longer names are cut to this.
const QSTAT_NAME_WIDTH: usize = 15;

/// Whether a name shown by qstat belongs to one of our jobs.
///
/// A name at least [`QSTAT_NAME_WIDTH`] long may have been truncated and is
/// accepted when it is a prefix of `<job_name>_`.
fn is_our_listed_name(shown: &str, job_name: &str) -> bool {
    if is_pipeline_job_name(shown, job_name) {
        return true;
    }
    shown.chars().count() >= QSTAT_NAME_WIDTH && format!("{}_", job_name).starts_with(shown)
}

/// Count our jobs in plain `qstat` output.
///
/// Columns: `Job id  Name  User  Time Use  S  Queue`.
fn parse_qstat_listing(listing: &str, job_name: &str) -> QueueStatus {
    let mut status = QueueStatus::default();
    for line in listing.lines() {
        let cols: Vec<&str> = line.split_whitespace().collect();
        if cols.len() < 6 || !cols[0].chars().next().is_some_and(|c| c.is_ascii_digit()) {
            continue;
        }
        if !is_our_listed_name(cols[1], job_name) {
            continue;
        }
        match cols[4] {
            "R" | "E" => status.running += 1,
            "Q" | "H" | "W" | "T" => status.queued += 1,
            _ => {}
        }
    }
    status
}

#[async_trait]
impl QueueManager for PbsQueueManager {
    fn name(&self) -> &str {
        "pbs"
    }

    fn limits(&self) -> QueueLimits {
        self.limits
    }

    async fn submit(&self, request: &SubmitRequest) -> Result<String, QueueError> {
        let args = self.options.submit_args(request);
        let output = self.runner.run("qsub", &args).await?;
        let queue_id = parse_submit_output(&output)?;
        info!("Submitted job {} to PBS as {}", request.job_id, queue_id);
        Ok(queue_id)
    }

    async fn is_running(&self, queue_id: &str) -> Result<bool, QueueError> {
        let state = self.job_state(queue_id).await?;
        debug!("PBS job {} state: {:?}", queue_id, state);
        Ok(matches!(state.as_deref(), Some(s) if s != "C"))
    }

    async fn had_errors(&self, queue_id: &str) -> Result<bool, QueueError> {
        self.logs.has_errors(queue_id).await
    }

    async fn get_errors(&self, queue_id: &str) -> Result<String, QueueError> {
        self.logs.errors(queue_id).await
    }

    async fn delete(&self, queue_id: &str) -> Result<(), QueueError> {
        let output = self.runner.run("qdel", &[queue_id.to_string()]).await?;
        if !output.success {
            warn!("qdel {} reported: {}", queue_id, output.stderr.trim());
        }

        tokio::time::sleep(self.delete_confirm_delay).await;

        match self.job_state(queue_id).await? {
            None => Ok(()),
            Some(state) if state == "C" || state == "E" => Ok(()),
            Some(state) => Err(QueueError::DeleteFailed {
                queue_id: queue_id.to_string(),
                state,
            }),
        }
    }

    async fn status(&self) -> Result<QueueStatus, QueueError> {
        let mut args = Vec::new();
        if let Some(user) = &self.user {
            args.extend(["-u".to_string(), user.clone()]);
        }
        let output = self.runner.run("qstat", &args).await?;
        if !output.success {
            return Err(QueueError::Backend(format!(
                "qstat failed: {}",
                output.stderr.trim()
            )));
        }
        Ok(parse_qstat_listing(&output.stdout, &self.options.job_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::command::ScriptedRunner;
    use std::path::PathBuf;

    fn config(log_dir: PathBuf) -> QueueConfig {
        QueueConfig {
            backend: crate::config::QueueBackend::Pbs,
            max_jobs_running: 3,
            max_jobs_queued: 1,
            job_name: "pulsarflow".to_string(),
            queue_name: None,
            resources: "nodes=1:ppn=1".to_string(),
            script: PathBuf::from("/opt/search.sh"),
            log_dir,
            delete_confirm_delay_secs: 0,
            command_timeout_secs: 5,
            user: Some("survey".to_string()),
            moab: Default::default(),
        }
    }

    fn manager(runner: Arc<ScriptedRunner>) -> PbsQueueManager {
        PbsQueueManager::with_runner(&config(PathBuf::from("/tmp/logs")), runner)
    }

    const LISTING: &str = "\
Job id                    Name             User            Time Use S Queue
------------------------- ---------------- --------------- -------- - -----
101.head                  pulsarflow_1     survey          01:00:00 R batch
102.head                  pulsarflow_2     survey          0        Q batch
103.head                  other_analysis   survey          0        Q batch
104.head                  pulsarflow_4     survey          02:00:00 C batch
105.head                  pulsarflow_5     survey          0        H batch
";

    #[test]
    fn test_parse_listing_counts_only_our_jobs() {
        let status = parse_qstat_listing(LISTING, "pulsarflow");
        assert_eq!(status.running, 1);
        assert_eq!(status.queued, 2);
    }

    #[test]
    fn test_parse_listing_handles_truncated_names() {
        let listing = "\
201.head  longpipelinenam  survey 0 Q batch
202.head  pulsarflow_1234  survey 0 Q batch
";
        assert_eq!(parse_qstat_listing(listing, "longpipelinename").queued, 1);
        assert_eq!(parse_qstat_listing(listing, "pulsarflow").queued, 1);
    }

    #[test]
    fn test_parse_listing_rejects_near_miss_names() {
        let listing = "\
301.head  pul              survey 0 Q batch
302.head  pulsarflowx_3    survey 0 Q batch
303.head  pulsarflow       survey 0 R batch
304.head  pulsarflow_test  survey 0 R batch
";
        assert_eq!(parse_qstat_listing(listing, "pulsarflow"), QueueStatus::default());
    }

    #[test]
    fn test_parse_job_state() {
        let full = "Job Id: 101.head\n    Job_Name = pulsarflow_1\n    job_state = R\n";
        assert_eq!(parse_job_state(full), Some("R".to_string()));
        assert_eq!(parse_job_state("Job Id: 1\n"), None);
    }

    #[tokio::test]
    async fn test_submit_returns_queue_id() {
        let runner = Arc::new(ScriptedRunner::default());
        runner.push(true, "101.head\n", "");
        let pbs = manager(Arc::clone(&runner));

        let request = SubmitRequest {
            job_id: 1,
            files: vec![PathBuf::from("/raw/a.fits")],
            outdir: PathBuf::from("/results/job1/attempt1"),
        };
        assert_eq!(pbs.submit(&request).await.unwrap(), "101.head");

        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls[0].0, "qsub");
        assert!(calls[0].1.contains(&"pulsarflow_1".to_string()));
    }

    #[tokio::test]
    async fn test_submit_without_id_is_fatal() {
        let runner = Arc::new(ScriptedRunner::default());
        runner.push(true, "", "");
        let pbs = manager(runner);
        let request = SubmitRequest {
            job_id: 1,
            files: vec![],
            outdir: PathBuf::from("/r"),
        };
        let err = pbs.submit(&request).await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_is_running() {
        let runner = Arc::new(ScriptedRunner::default());
        runner.push(true, "    job_state = Q\n", "");
        runner.push(true, "    job_state = C\n", "");
        runner.push(false, "", "qstat: Unknown Job Id 101.head");
        runner.push(false, "", "cannot connect to server");
        let pbs = manager(runner);

        assert!(pbs.is_running("101.head").await.unwrap());
        assert!(!pbs.is_running("101.head").await.unwrap());
        assert!(!pbs.is_running("101.head").await.unwrap());
        assert!(matches!(
            pbs.is_running("101.head").await,
            Err(QueueError::Backend(_))
        ));
    }

    #[tokio::test]
    async fn test_status_and_can_submit() {
        let runner = Arc::new(ScriptedRunner::default());
        runner.push(true, LISTING, "");
        runner.push(true, LISTING, "");
        let pbs = manager(Arc::clone(&runner));

        let status = pbs.status().await.unwrap();
        assert_eq!(status, QueueStatus { running: 1, queued: 2 });
        // 3 jobs against max_jobs_running = 3
        assert!(!pbs.can_submit().await.unwrap());

        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls[0].1, vec!["-u".to_string(), "survey".to_string()]);
    }

    #[tokio::test]
    async fn test_delete_confirms_removal() {
        let runner = Arc::new(ScriptedRunner::default());
        runner.push(true, "", "");
        runner.push(false, "", "qstat: Unknown Job Id 101.head");
        let pbs = manager(runner);
        assert!(pbs.delete("101.head").await.is_ok());
    }

    #[tokio::test]
    async fn test_delete_accepts_exiting_job() {
        let runner = Arc::new(ScriptedRunner::default());
        runner.push(true, "", "");
        runner.push(true, "    job_state = E\n", "");
        let pbs = manager(runner);
        assert!(pbs.delete("101.head").await.is_ok());
    }

    #[tokio::test]
    async fn test_delete_fails_when_still_running() {
        let runner = Arc::new(ScriptedRunner::default());
        runner.push(true, "", "");
        runner.push(true, "    job_state = R\n", "");
        let pbs = manager(runner);
        let err = pbs.delete("101.head").await.unwrap_err();
        assert!(matches!(err, QueueError::DeleteFailed { ref state, .. } if state == "R"));
    }

    #[tokio::test]
    async fn test_error_logs_keyed_by_job_number() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("101.ER"), "Traceback: bad header\n").unwrap();
        let runner = Arc::new(ScriptedRunner::default());
        let pbs = PbsQueueManager::with_runner(&config(dir.path().to_path_buf()), runner);

        assert!(pbs.had_errors("101.head").await.unwrap());
        assert!(pbs.get_errors("101.head").await.unwrap().contains("bad header"));
        assert!(!pbs.had_errors("102.head").await.unwrap());
    }
}
