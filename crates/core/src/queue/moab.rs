//! Moab queue manager.
//!
//! Moab servers are slow to answer and rate-limit `showq`, so the manager
//! keeps one backend-wide listing and reuses it for `cache_ttl_secs`. The
//! listing is requested as XML, which carries job names and has no summary
//! lines mixed in with the jobs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex_lite::Regex;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::command::{
    is_pipeline_job_name, job_number, parse_submit_output, CommandRunner, ProcessRunner,
    QueueLogs, SubmitOptions,
};
use super::{QueueError, QueueLimits, QueueManager, QueueStatus, SubmitRequest};
use crate::config::QueueConfig;

static QUEUE_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r#"(?s)<queue\b([^>]*?)(?:/>|>(.*?)</queue>)"#).ok());
static JOB_PATTERN: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r#"<job\b([^>]*?)/?>"#).ok());
static ATTR_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r#"([A-Za-z_]+)="([^"]*)""#).ok());

/// Which `showq` queue a job was listed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Active,
    Eligible,
    Blocked,
}

impl Section {
    fn from_option(option: &str) -> Option<Self> {
        match option {
            "active" => Some(Self::Active),
            "eligible" => Some(Self::Eligible),
            "blocked" => Some(Self::Blocked),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ShowqEntry {
    job_number: String,
    name: String,
    user: String,
    state: String,
    section: Section,
}

#[derive(Clone)]
struct CachedListing {
    /// When the `showq` call that produced the listing was started.
    fetched_at: Instant,
    entries: Arc<Vec<ShowqEntry>>,
}

/// Moab queue manager.
pub struct MoabQueueManager {
    runner: Arc<dyn CommandRunner>,
    options: SubmitOptions,
    logs: QueueLogs,
    limits: QueueLimits,
    user: Option<String>,
    delete_confirm_delay: Duration,
    cache_ttl: Duration,
    cache: RwLock<Option<CachedListing>>,
    /// Job numbers submitted through this manager that no listing has shown yet.
    submitted: Mutex<HashMap<String, Instant>>,
}

impl MoabQueueManager {
    /// Create a Moab manager that shells out to the real commands.
    pub fn new(config: &QueueConfig) -> Self {
        let runner = Arc::new(ProcessRunner::new(Duration::from_secs(
            config.command_timeout_secs,
        )));
        Self::with_runner(config, runner)
    }

    /// Create a Moab manager with a custom command runner.
    pub fn with_runner(config: &QueueConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            options: SubmitOptions::from(config),
            logs: QueueLogs::new(&config.log_dir),
            limits: QueueLimits::from(config),
            user: config.user.clone().or_else(|| std::env::var("USER").ok()),
            delete_confirm_delay: Duration::from_secs(config.delete_confirm_delay_secs),
            cache_ttl: Duration::from_secs(config.moab.cache_ttl_secs),
            cache: RwLock::new(None),
            submitted: Mutex::new(HashMap::new()),
        }
    }

    /// Cached listing, refreshed once older than the TTL.
    async fn listing(&self) -> Result<CachedListing, QueueError> {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.as_ref() {
                if cached.fetched_at.elapsed() < self.cache_ttl {
                    return Ok(cached.clone());
                }
            }
        }
        self.refresh().await
    }

    /// Fetch a fresh listing and replace the cache.
    async fn refresh(&self) -> Result<CachedListing, QueueError> {
        let started = Instant::now();
        let output = self
            .runner
            .run("showq", &["--format=xml".to_string()])
            .await?;
        if !output.success {
            return Err(QueueError::Backend(format!(
                "showq failed: {}",
                output.stderr.trim()
            )));
        }

        let listing = CachedListing {
            fetched_at: started,
            entries: Arc::new(parse_showq(&output.stdout)?),
        };
        debug!("showq listed {} jobs", listing.entries.len());
        *self.cache.write().await = Some(listing.clone());
        Ok(listing)
    }
}

fn find<'a>(entries: &'a [ShowqEntry], queue_id: &str) -> Option<&'a ShowqEntry> {
    let number = job_number(queue_id);
    entries.iter().find(|e| e.job_number == number)
}

fn attributes<'t>(pattern: &Regex, tag: &'t str) -> HashMap<&'t str, &'t str> {
    pattern
        .captures_iter(tag)
        .filter_map(|c| Some((c.get(1)?.as_str(), c.get(2)?.as_str())))
        .collect()
}

/// Parse `showq --format=xml` output into entries tagged with their queue.
///
/// Output without any `<queue>` element is an error, never an empty listing.
fn parse_showq(listing: &str) -> Result<Vec<ShowqEntry>, QueueError> {
    let (Some(queue_pattern), Some(job_pattern), Some(attr_pattern)) = (
        QUEUE_PATTERN.as_ref(),
        JOB_PATTERN.as_ref(),
        ATTR_PATTERN.as_ref(),
    ) else {
        return Err(QueueError::Backend("showq patterns failed to compile".to_string()));
    };

    let mut entries = Vec::new();
    let mut queues = 0;
    for queue in queue_pattern.captures_iter(listing) {
        queues += 1;
        let queue_attrs = attributes(attr_pattern, queue.get(1).map_or("", |m| m.as_str()));
        let Some(section) = queue_attrs.get("option").and_then(|o| Section::from_option(o)) else {
            continue;
        };
        let body = queue.get(2).map_or("", |m| m.as_str());

        for job in job_pattern.captures_iter(body) {
            let attrs = attributes(attr_pattern, job.get(1).map_or("", |m| m.as_str()));
            let Some(id) = attrs.get("JobID") else { continue };
            let number = job_number(id);
            if number.is_empty() || !number.chars().all(|c| c.is_ascii_digit()) {
                continue;
            }
            let field = |key: &str| attrs.get(key).map(|v| v.to_string()).unwrap_or_default();
            entries.push(ShowqEntry {
                job_number: number.to_string(),
                name: field("JobName"),
                user: field("User"),
                state: field("State"),
                section,
            });
        }
    }

    if queues == 0 {
        return Err(QueueError::Backend(format!(
            "unrecognised showq output: {}",
            listing.chars().take(200).collect::<String>()
        )));
    }
    Ok(entries)
}

fn is_cancelling(state: &str) -> bool {
    matches!(state, "Canceling" | "Removed" | "Completed" | "Vacated")
}

#[async_trait]
impl QueueManager for MoabQueueManager {
    fn name(&self) -> &str {
        "moab"
    }

    fn limits(&self) -> QueueLimits {
        self.limits
    }

    async fn submit(&self, request: &SubmitRequest) -> Result<String, QueueError> {
        let args = self.options.submit_args(request);
        let output = self.runner.run("msub", &args).await?;
        let queue_id = parse_submit_output(&output)?;
        info!("Submitted job {} to Moab as {}", request.job_id, queue_id);

        self.submitted
            .lock()
            .await
            .insert(job_number(&queue_id).to_string(), Instant::now());
        *self.cache.write().await = None;
        Ok(queue_id)
    }

    async fn is_running(&self, queue_id: &str) -> Result<bool, QueueError> {
        let listing = match self.listing().await {
            Ok(listing) => listing,
            Err(e) => {
                // Never report a job finished because the listing failed.
                warn!(
                    "Could not list Moab jobs, assuming {} is still running: {}",
                    queue_id, e
                );
                return Ok(true);
            }
        };

        let number = job_number(queue_id);
        let mut submitted = self.submitted.lock().await;
        if let Some(entry) = find(&listing.entries, queue_id) {
            submitted.remove(number);
            return Ok(!is_cancelling(&entry.state));
        }
        if submitted
            .get(number)
            .is_some_and(|at| listing.fetched_at < *at)
        {
            debug!("Moab listing predates submission of {}", queue_id);
            return Ok(true);
        }
        submitted.remove(number);
        Ok(false)
    }

    async fn had_errors(&self, queue_id: &str) -> Result<bool, QueueError> {
        self.logs.has_errors(queue_id).await
    }

    async fn get_errors(&self, queue_id: &str) -> Result<String, QueueError> {
        self.logs.errors(queue_id).await
    }

    async fn delete(&self, queue_id: &str) -> Result<(), QueueError> {
        let output = self
            .runner
            .run("canceljob", &[job_number(queue_id).to_string()])
            .await?;
        if !output.success {
            warn!("canceljob {} reported: {}", queue_id, output.stderr.trim());
        }

        tokio::time::sleep(self.delete_confirm_delay).await;

        let listing = self.refresh().await?;
        match find(&listing.entries, queue_id) {
            None => Ok(()),
            Some(entry) if is_cancelling(&entry.state) => Ok(()),
            Some(entry) => Err(QueueError::DeleteFailed {
                queue_id: queue_id.to_string(),
                state: entry.state.clone(),
            }),
        }
    }

    async fn status(&self) -> Result<QueueStatus, QueueError> {
        let listing = self.listing().await?;
        let mut status = QueueStatus::default();
        for entry in listing.entries.iter() {
            if self.user.as_deref().is_some_and(|u| u != entry.user) {
                continue;
            }
            if !is_pipeline_job_name(&entry.name, &self.options.job_name) {
                continue;
            }
            match entry.section {
                Section::Active => status.running += 1,
                Section::Eligible | Section::Blocked => status.queued += 1,
            }
        }
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::command::ScriptedRunner;
    use std::path::PathBuf;

    fn config(cache_ttl_secs: u64) -> QueueConfig {
        QueueConfig {
            backend: crate::config::QueueBackend::Moab,
            max_jobs_running: 4,
            max_jobs_queued: 2,
            job_name: "pulsarflow".to_string(),
            queue_name: None,
            resources: "nodes=1:ppn=1".to_string(),
            script: PathBuf::from("/opt/search.sh"),
            log_dir: PathBuf::from("/tmp/logs"),
            delete_confirm_delay_secs: 0,
            command_timeout_secs: 5,
            user: Some("survey".to_string()),
            moab: crate::config::MoabConfig { cache_ttl_secs },
        }
    }

    fn request(job_id: i64) -> SubmitRequest {
        SubmitRequest {
            job_id,
            files: vec![PathBuf::from("/raw/a.fits")],
            outdir: PathBuf::from(format!("/results/job{}/attempt1", job_id)),
        }
    }

    const SHOWQ: &str = r#"<Data><Object>queue</Object><cluster LocalActiveNodes="3" LocalAllocProcs="10" LocalConfigNodes="128" LocalIdleProcs="1014" LocalUpProcs="1024" time="1705053600"></cluster>
<queue count="3" option="active">
<job AWDuration="3600" Class="batch" DRMJID="5678.head" JobID="5678" JobName="pulsarflow_1" ReqProcs="1" State="Running" User="survey"></job>
<job AWDuration="600" Class="batch" DRMJID="5680.head" JobID="5680" JobName="pulsarflow_7" ReqProcs="8" State="Running" User="other"></job>
<job AWDuration="60" Class="batch" DRMJID="5682.head" JobID="5682" JobName="calibration" ReqProcs="1" State="Running" User="survey"></job>
</queue>
<queue count="1" option="eligible">
<job Class="batch" DRMJID="5679.head" JobID="5679" JobName="pulsarflow_2" ReqProcs="1" State="Idle" User="survey"/>
</queue>
<queue count="1" option="blocked">
<job Class="batch" DRMJID="5681.head" JobID="5681" JobName="pulsarflow_3" ReqProcs="1" State="Canceling" User="survey"></job>
</queue>
</Data>"#;

    const EMPTY: &str = r#"<Data><Object>queue</Object><queue count="0" option="active"></queue><queue count="0" option="eligible"/><queue count="0" option="blocked"/></Data>"#;

    #[test]
    fn test_parse_showq_sections() {
        let entries = parse_showq(SHOWQ).unwrap();
        let numbers: Vec<&str> = entries.iter().map(|e| e.job_number.as_str()).collect();
        assert_eq!(numbers, vec!["5678", "5680", "5682", "5679", "5681"]);
        assert_eq!(entries[0].section, Section::Active);
        assert_eq!(entries[0].name, "pulsarflow_1");
        assert_eq!(entries[3].section, Section::Eligible);
        assert_eq!(entries[4].section, Section::Blocked);
        assert_eq!(entries[4].state, "Canceling");
    }

    #[test]
    fn test_parse_showq_ignores_summaries_and_empty_queues() {
        let listing = r#"<Data><cluster LocalActiveNodes="2" LocalUpProcs="1024"></cluster>
<queue count="0" option="active"/>
<queue count="1" option="eligible"><job JobID="12.head" JobName="pulsarflow_9" State="Idle" User="survey"/></queue>
</Data>"#;
        let entries = parse_showq(listing).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].job_number, "12");
        assert_eq!(entries[0].section, Section::Eligible);

        assert!(parse_showq(EMPTY).unwrap().is_empty());
    }

    #[test]
    fn test_parse_showq_rejects_unrecognised_output() {
        let text = "active jobs------\n5678 survey Running 1\n\n1 active job\n";
        assert!(matches!(parse_showq(text), Err(QueueError::Backend(_))));
    }

    #[tokio::test]
    async fn test_listing_is_cached_within_ttl() {
        let runner = Arc::new(ScriptedRunner::default());
        runner.push(true, SHOWQ, "");
        let moab = MoabQueueManager::with_runner(&config(600), runner.clone());

        assert!(moab.is_running("5678.moab").await.unwrap());
        assert!(moab.is_running("5679").await.unwrap());
        assert!(!moab.is_running("9999").await.unwrap());

        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], ("showq".to_string(), vec!["--format=xml".to_string()]));
    }

    #[tokio::test]
    async fn test_listing_refreshed_after_ttl() {
        let runner = Arc::new(ScriptedRunner::default());
        runner.push(true, SHOWQ, "");
        runner.push(true, EMPTY, "");
        let moab = MoabQueueManager::with_runner(&config(0), runner.clone());

        assert!(moab.is_running("5678").await.unwrap());
        assert!(!moab.is_running("5678").await.unwrap());
        assert_eq!(runner.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_listing_failure_assumes_running() {
        let runner = Arc::new(ScriptedRunner::default());
        runner.push(false, "", "ERROR: cannot connect to Moab server");
        runner.push(true, "ERROR: server busy, try again\n", "");
        let moab = MoabQueueManager::with_runner(&config(0), runner);

        assert!(moab.is_running("5678").await.unwrap());
        assert!(moab.is_running("5678").await.unwrap());
    }

    #[tokio::test]
    async fn test_submit_drops_cached_listing() {
        let runner = Arc::new(ScriptedRunner::default());
        runner.push(true, EMPTY, "");
        runner.push(true, "\n5700\n", "");
        runner.push(
            true,
            r#"<Data><queue count="1" option="eligible"><job JobID="5700" JobName="pulsarflow_4" State="Idle" User="survey"/></queue></Data>"#,
            "",
        );
        let moab = MoabQueueManager::with_runner(&config(60), runner.clone());

        assert!(moab.can_submit().await.unwrap());
        let queue_id = moab.submit(&request(4)).await.unwrap();
        assert!(moab.is_running(&queue_id).await.unwrap());

        let calls = runner.calls.lock().unwrap();
        let programs: Vec<&str> = calls.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(programs, vec!["showq", "msub", "showq"]);
    }

    #[tokio::test]
    async fn test_job_missing_from_listing_older_than_submit_is_running() {
        let runner = Arc::new(ScriptedRunner::default());
        runner.push(true, "5700\n", "");
        let moab = MoabQueueManager::with_runner(&config(60), runner);

        let before = Instant::now() - Duration::from_millis(100);
        let queue_id = moab.submit(&request(4)).await.unwrap();
        // A listing whose showq call started before the submission
        *moab.cache.write().await = Some(CachedListing {
            fetched_at: before,
            entries: Arc::new(parse_showq(EMPTY).unwrap()),
        });
        assert!(moab.is_running(&queue_id).await.unwrap());

        // Once a newer listing also lacks it, the job is gone
        *moab.cache.write().await = Some(CachedListing {
            fetched_at: Instant::now(),
            entries: Arc::new(Vec::new()),
        });
        assert!(!moab.is_running(&queue_id).await.unwrap());
        assert!(moab.submitted.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_cancelling_job_is_not_running() {
        let runner = Arc::new(ScriptedRunner::default());
        runner.push(true, SHOWQ, "");
        let moab = MoabQueueManager::with_runner(&config(600), runner);
        assert!(!moab.is_running("5681").await.unwrap());
    }

    #[tokio::test]
    async fn test_status_counts_only_pipeline_jobs_of_our_user() {
        let runner = Arc::new(ScriptedRunner::default());
        runner.push(true, SHOWQ, "");
        let moab = MoabQueueManager::with_runner(&config(600), runner);

        let status = moab.status().await.unwrap();
        assert_eq!(status, QueueStatus { running: 1, queued: 2 });
        // queued at max_jobs_queued = 2
        assert!(!moab.can_submit().await.unwrap());
    }

    #[tokio::test]
    async fn test_status_without_user_still_filters_by_name() {
        let runner = Arc::new(ScriptedRunner::default());
        runner.push(true, SHOWQ, "");
        let mut moab = MoabQueueManager::with_runner(&config(600), runner);
        moab.user = None;

        let status = moab.status().await.unwrap();
        assert_eq!(status, QueueStatus { running: 2, queued: 2 });
    }

    #[tokio::test]
    async fn test_submit_uses_msub() {
        let runner = Arc::new(ScriptedRunner::default());
        runner.push(true, "\n5690\n", "");
        let moab = MoabQueueManager::with_runner(&config(600), runner.clone());

        assert_eq!(moab.submit(&request(3)).await.unwrap(), "5690");
        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls[0].0, "msub");
        assert!(calls[0].1.contains(&"pulsarflow_3".to_string()));
    }

    #[tokio::test]
    async fn test_delete_bypasses_cache_to_confirm() {
        let runner = Arc::new(ScriptedRunner::default());
        runner.push(true, SHOWQ, "");
        runner.push(true, "job '5678' cancelled\n", "");
        runner.push(true, EMPTY, "");
        let moab = MoabQueueManager::with_runner(&config(600), runner.clone());

        assert!(moab.is_running("5678").await.unwrap());
        moab.delete("5678").await.unwrap();

        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls[1].0, "canceljob");
        assert_eq!(calls[2].0, "showq");
    }

    #[tokio::test]
    async fn test_delete_fails_when_still_active() {
        let runner = Arc::new(ScriptedRunner::default());
        runner.push(false, "", "ERROR: cannot cancel job");
        runner.push(true, SHOWQ, "");
        let moab = MoabQueueManager::with_runner(&config(600), runner);

        let err = moab.delete("5678").await.unwrap_err();
        assert!(matches!(err, QueueError::DeleteFailed { ref state, .. } if state == "Running"));
    }
}
