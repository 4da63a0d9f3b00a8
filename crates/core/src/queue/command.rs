//! Process boundary shared by the command-line queue backends.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use super::{QueueError, SubmitRequest};
use crate::config::QueueConfig;

/// Captured result of one backend command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Runs backend commands. Swapped for a scripted runner in tests.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, QueueError>;
}

/// Runs commands as child processes with a timeout.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    timeout: Duration,
}

impl ProcessRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, QueueError> {
        debug!("Running {} {:?}", program, args);
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = timeout(self.timeout, child)
            .await
            .map_err(|_| QueueError::Timeout(program.to_string()))??;

        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Typed submission options common to `qsub` and `msub`.
#[derive(Debug, Clone)]
pub struct SubmitOptions {
    pub job_name: String,
    pub queue_name: Option<String>,
    pub resources: String,
    pub script: PathBuf,
    pub log_dir: PathBuf,
}

impl From<&QueueConfig> for SubmitOptions {
    fn from(config: &QueueConfig) -> Self {
        Self {
            job_name: config.job_name.clone(),
            queue_name: config.queue_name.clone(),
            resources: config.resources.clone(),
            script: config.script.clone(),
            log_dir: config.log_dir.clone(),
        }
    }
}

impl SubmitOptions {
    /// Name given to the batch job of a pipeline job.
    pub fn job_name_for(&self, job_id: i64) -> String {
        format!("{}_{}", self.job_name, job_id)
    }

    /// Argument vector for a PBS-style submission command.
    pub fn submit_args(&self, request: &SubmitRequest) -> Vec<String> {
        let mut args = vec![
            "-N".to_string(),
            self.job_name_for(request.job_id),
            "-V".to_string(),
            "-v".to_string(),
            format!(
                "DATAFILES={},OUTDIR={}",
                request.datafiles_var(),
                request.outdir.to_string_lossy()
            ),
            "-l".to_string(),
            self.resources.clone(),
            "-o".to_string(),
            format!("{}/", self.log_dir.to_string_lossy().trim_end_matches('/')),
            "-e".to_string(),
            format!("{}/", self.log_dir.to_string_lossy().trim_end_matches('/')),
        ];
        if let Some(queue) = &self.queue_name {
            args.extend(["-q".to_string(), queue.clone()]);
        }
        args.push(self.script.to_string_lossy().into_owned());
        args
    }
}

/// Extract the queue identifier from submission stdout.
///
/// The identifier is the last non-empty line; an empty output is a rejected
/// submission.
pub fn parse_submit_output(output: &CommandOutput) -> Result<String, QueueError> {
    if !output.success {
        return Err(QueueError::SubmissionFailed(format!(
            "submit command failed: {}",
            output.stderr.trim()
        )));
    }
    output
        .stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .last()
        .map(str::to_string)
        .ok_or_else(|| {
            QueueError::SubmissionFailed(format!(
                "no job identifier returned (stderr: {})",
                output.stderr.trim()
            ))
        })
}

/// Numeric part of a queue identifier ("1234.server" -> "1234").
pub fn job_number(queue_id: &str) -> &str {
    queue_id.split('.').next().unwrap_or(queue_id)
}

/// Whether a batch job name is `<job_name>_<pipeline job id>`.
pub fn is_pipeline_job_name(name: &str, job_name: &str) -> bool {
    name.strip_prefix(job_name)
        .and_then(|rest| rest.strip_prefix('_'))
        .is_some_and(|id| !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()))
}

/// Location of the per-job log files written by the batch system.
#[derive(Debug, Clone)]
pub struct QueueLogs {
    dir: PathBuf,
}

impl QueueLogs {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `<log_dir>/<job number>.ER`
    pub fn error_path(&self, queue_id: &str) -> PathBuf {
        self.dir.join(format!("{}.ER", job_number(queue_id)))
    }

    /// `<log_dir>/<job number>.OU`
    pub fn output_path(&self, queue_id: &str) -> PathBuf {
        self.dir.join(format!("{}.OU", job_number(queue_id)))
    }

    /// Whether the error log exists and holds anything but whitespace.
    pub async fn has_errors(&self, queue_id: &str) -> Result<bool, QueueError> {
        Ok(read_if_exists(&self.error_path(queue_id))
            .await?
            .map(|text| !text.trim().is_empty())
            .unwrap_or(false))
    }

    /// Error log contents, or a placeholder naming the missing file.
    pub async fn errors(&self, queue_id: &str) -> Result<String, QueueError> {
        let path = self.error_path(queue_id);
        Ok(read_if_exists(&path)
            .await?
            .unwrap_or_else(|| format!("No error log found at {}", path.display())))
    }
}

async fn read_if_exists(path: &Path) -> Result<Option<String>, QueueError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(QueueError::Io(e)),
    }
}

/// Replays canned outputs and records the commands it was asked to run.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct ScriptedRunner {
    outputs: std::sync::Mutex<std::collections::VecDeque<CommandOutput>>,
    pub(crate) calls: std::sync::Mutex<Vec<(String, Vec<String>)>>,
}

#[cfg(test)]
impl ScriptedRunner {
    pub(crate) fn push(&self, success: bool, stdout: &str, stderr: &str) {
        self.outputs.lock().unwrap().push_back(CommandOutput {
            success,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        });
    }
}

#[cfg(test)]
#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, QueueError> {
        self.calls
            .lock()
            .unwrap()
            .push((program.to_string(), args.to_vec()));
        self.outputs
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| QueueError::Backend("no scripted output".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> SubmitOptions {
        SubmitOptions {
            job_name: "pulsarflow".to_string(),
            queue_name: Some("batch".to_string()),
            resources: "nodes=1:ppn=1".to_string(),
            script: PathBuf::from("/opt/search.sh"),
            log_dir: PathBuf::from("/data/logs/"),
        }
    }

    #[test]
    fn test_submit_args() {
        let request = SubmitRequest {
            job_id: 12,
            files: vec![PathBuf::from("/raw/a.fits"), PathBuf::from("/raw/b.fits")],
            outdir: PathBuf::from("/results/job12/attempt1"),
        };
        let args = options().submit_args(&request);
        assert_eq!(args[0..2], ["-N".to_string(), "pulsarflow_12".to_string()]);
        assert!(args.contains(
            &"DATAFILES=/raw/a.fits;/raw/b.fits,OUTDIR=/results/job12/attempt1".to_string()
        ));
        assert!(args.contains(&"/data/logs/".to_string()));
        assert_eq!(args.last().unwrap(), "/opt/search.sh");
        let q = args.iter().position(|a| a == "-q").unwrap();
        assert_eq!(args[q + 1], "batch");
    }

    #[test]
    fn test_parse_submit_output() {
        let ok = CommandOutput {
            success: true,
            stdout: "\n1234.headnode\n".to_string(),
            stderr: String::new(),
        };
        assert_eq!(parse_submit_output(&ok).unwrap(), "1234.headnode");

        let empty = CommandOutput {
            success: true,
            ..Default::default()
        };
        assert!(matches!(
            parse_submit_output(&empty),
            Err(QueueError::SubmissionFailed(_))
        ));

        let rejected = CommandOutput {
            success: false,
            stdout: String::new(),
            stderr: "qsub: Unknown queue".to_string(),
        };
        let err = parse_submit_output(&rejected).unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("Unknown queue"));
    }

    #[test]
    fn test_job_number() {
        assert_eq!(job_number("1234.headnode.example.org"), "1234");
        assert_eq!(job_number("5678"), "5678");
    }

    #[test]
    fn test_is_pipeline_job_name() {
        assert!(is_pipeline_job_name("pulsarflow_12", "pulsarflow"));
        assert!(!is_pipeline_job_name("pulsarflow", "pulsarflow"));
        assert!(!is_pipeline_job_name("pulsarflow_", "pulsarflow"));
        assert!(!is_pipeline_job_name("pulsarflowx_1", "pulsarflow"));
        assert!(!is_pipeline_job_name("pul", "pulsarflow"));
        assert!(!is_pipeline_job_name("pulsarflow_1_rerun", "pulsarflow"));
    }

    #[tokio::test]
    async fn test_logs() {
        let dir = tempfile::tempdir().unwrap();
        let logs = QueueLogs::new(dir.path());

        assert!(!logs.has_errors("1.head").await.unwrap());
        assert!(logs.errors("1.head").await.unwrap().contains("No error log"));

        std::fs::write(dir.path().join("1.ER"), "  \n").unwrap();
        assert!(!logs.has_errors("1.head").await.unwrap());

        std::fs::write(dir.path().join("2.ER"), "Segmentation fault\n").unwrap();
        assert!(logs.has_errors("2.head").await.unwrap());
        assert_eq!(logs.errors("2").await.unwrap(), "Segmentation fault\n");
    }

    #[tokio::test]
    async fn test_process_runner_captures_output() {
        let runner = ProcessRunner::new(Duration::from_secs(5));
        let output = runner
            .run("sh", &["-c".to_string(), "echo 99.head; echo oops >&2".to_string()])
            .await
            .unwrap();
        assert!(output.success);
        assert_eq!(output.stdout.trim(), "99.head");
        assert_eq!(output.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn test_process_runner_timeout() {
        let runner = ProcessRunner::new(Duration::from_millis(50));
        let result = runner.run("sleep", &["5".to_string()]).await;
        assert!(matches!(result, Err(QueueError::Timeout(_))));
    }
}
