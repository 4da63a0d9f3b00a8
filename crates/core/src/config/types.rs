use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    pub scheduler: SchedulerConfig,
    pub queue: QueueConfig,
    #[serde(default)]
    pub acquisition: Option<AcquisitionConfig>,
    #[serde(default)]
    pub notify: NotifyConfig,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
    /// Pause between attempts when the database is busy or locked.
    #[serde(default = "default_busy_retry_interval_ms")]
    pub busy_retry_interval_ms: u64,
    /// Log a warning once a single transaction has been retried this many times.
    #[serde(default = "default_busy_warn_after")]
    pub busy_warn_after: u32,
    /// Give up (and surface an error) after this many retries.
    #[serde(default = "default_busy_max_retries")]
    pub busy_max_retries: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_retry_interval_ms: default_busy_retry_interval_ms(),
            busy_warn_after: default_busy_warn_after(),
            busy_max_retries: default_busy_max_retries(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("pulsarflow.db")
}

fn default_busy_retry_interval_ms() -> u64 {
    100
}

fn default_busy_warn_after() -> u32 {
    50
}

fn default_busy_max_retries() -> u32 {
    6000 // ten minutes at the default interval
}

/// Job scheduler configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerConfig {
    /// Seconds to sleep between scheduler cycles.
    #[serde(default = "default_scheduler_interval")]
    pub poll_interval_secs: u64,
    /// Submissions allowed per job before it is marked terminal.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Remove the raw input files of a job once it fails terminally.
    #[serde(default)]
    pub delete_rawdata_on_terminal_failure: bool,
    /// Base directory for per-attempt output directories.
    pub results_dir: PathBuf,
    /// Shortest observation (seconds) worth processing.
    #[serde(default = "default_min_observation_secs")]
    pub min_observation_secs: f64,
}

fn default_scheduler_interval() -> u64 {
    300
}

fn default_max_attempts() -> u32 {
    2
}

fn default_min_observation_secs() -> f64 {
    140.0
}

/// Batch queue backends
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueueBackend {
    Pbs,
    Moab,
}

/// Batch queue configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueConfig {
    pub backend: QueueBackend,
    /// Ceiling on running + queued pipeline jobs.
    #[serde(default = "default_max_jobs_running")]
    pub max_jobs_running: u32,
    /// Ceiling on queued pipeline jobs alone.
    #[serde(default = "default_max_jobs_queued")]
    pub max_jobs_queued: u32,
    /// Prefix for job names; also used to recognize our jobs in listings.
    #[serde(default = "default_job_name")]
    pub job_name: String,
    /// Destination queue (class), backend default when unset.
    #[serde(default)]
    pub queue_name: Option<String>,
    /// Resource request passed with `-l` (e.g. "nodes=1:ppn=1,walltime=24:00:00").
    #[serde(default = "default_resources")]
    pub resources: String,
    /// Processing script executed by the batch job.
    pub script: PathBuf,
    /// Directory receiving `<queue id>.OU` and `<queue id>.ER` logs.
    pub log_dir: PathBuf,
    /// Seconds to wait before confirming a deletion.
    #[serde(default = "default_delete_confirm_delay")]
    pub delete_confirm_delay_secs: u64,
    /// Timeout for any single backend command.
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    /// User whose jobs are counted in listings. Defaults to `$USER`.
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub moab: MoabConfig,
}

fn default_max_jobs_running() -> u32 {
    50
}

fn default_max_jobs_queued() -> u32 {
    10
}

fn default_job_name() -> String {
    "pulsarflow".to_string()
}

fn default_resources() -> String {
    "nodes=1:ppn=1".to_string()
}

fn default_delete_confirm_delay() -> u64 {
    5
}

fn default_command_timeout() -> u64 {
    60
}

/// Moab-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MoabConfig {
    /// How long a `showq` listing is reused before the backend is queried again.
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
}

impl Default for MoabConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_cache_ttl(),
        }
    }
}

fn default_cache_ttl() -> u64 {
    60
}

/// File acquisition configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AcquisitionConfig {
    #[serde(default = "default_acquisition_interval")]
    pub poll_interval_secs: u64,
    /// Download attempts allowed per file.
    #[serde(default = "default_numretries")]
    pub numretries: u32,
    /// Ceiling on restores that are waiting or ready.
    #[serde(default = "default_numrestores")]
    pub numrestores: u32,
    /// Disk budget (bytes) for downloaded plus in-flight data.
    pub space_to_use: u64,
    pub download_dir: PathBuf,
    #[serde(default = "default_max_concurrent_downloads")]
    pub max_concurrent_downloads: usize,
    /// Number of files requested per restore.
    #[serde(default = "default_restore_size")]
    pub restore_size: u32,
    /// Listed files containing any of these substrings are skipped.
    #[serde(default = "default_exclude_patterns")]
    pub exclude_patterns: Vec<String>,
    pub archive: ArchiveConfig,
}

fn default_acquisition_interval() -> u64 {
    60
}

fn default_numretries() -> u32 {
    3
}

fn default_numrestores() -> u32 {
    2
}

fn default_max_concurrent_downloads() -> usize {
    4
}

fn default_restore_size() -> u32 {
    16
}

fn default_exclude_patterns() -> Vec<String> {
    vec!["b7s".to_string()]
}

/// Remote archive endpoints and credentials
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ArchiveConfig {
    /// Base URL of the restore/location web service.
    pub api_url: String,
    pub username: String,
    pub password: String,
    pub ftp_host: String,
    #[serde(default = "default_ftp_port")]
    pub ftp_port: u16,
    pub ftp_username: String,
    pub ftp_password: String,
    #[serde(default = "default_archive_timeout")]
    pub timeout_secs: u64,
}

fn default_ftp_port() -> u16 {
    21
}

fn default_archive_timeout() -> u64 {
    120
}

/// Email notification configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct NotifyConfig {
    #[serde(default)]
    pub send_on_failure: bool,
    #[serde(default)]
    pub send_on_terminal_failure: bool,
    /// Email when a daemon cycle fails unexpectedly.
    #[serde(default)]
    pub send_on_crash: bool,
    #[serde(default)]
    pub recipient: Option<String>,
    #[serde(default)]
    pub sender: Option<String>,
    #[serde(default)]
    pub sendmail_path: Option<PathBuf>,
}

impl NotifyConfig {
    /// Whether any notification type is switched on.
    pub fn any_enabled(&self) -> bool {
        self.send_on_failure || self.send_on_terminal_failure || self.send_on_crash
    }
}

/// Sanitized config for display (secrets redacted)
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedConfig {
    pub database: DatabaseConfig,
    pub scheduler: SchedulerConfig,
    pub queue: QueueConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acquisition: Option<SanitizedAcquisitionConfig>,
    pub notify: NotifyConfig,
}

/// Acquisition config with archive passwords hidden
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedAcquisitionConfig {
    pub numretries: u32,
    pub numrestores: u32,
    pub space_to_use: u64,
    pub download_dir: PathBuf,
    pub api_url: String,
    pub ftp_host: String,
    pub password_configured: bool,
    pub ftp_password_configured: bool,
}

impl From<&Config> for SanitizedConfig {
    fn from(config: &Config) -> Self {
        Self {
            database: config.database.clone(),
            scheduler: config.scheduler.clone(),
            queue: config.queue.clone(),
            acquisition: config
                .acquisition
                .as_ref()
                .map(|a| SanitizedAcquisitionConfig {
                    numretries: a.numretries,
                    numrestores: a.numrestores,
                    space_to_use: a.space_to_use,
                    download_dir: a.download_dir.clone(),
                    api_url: a.archive.api_url.clone(),
                    ftp_host: a.archive.ftp_host.clone(),
                    password_configured: !a.archive.password.is_empty(),
                    ftp_password_configured: !a.archive.ftp_password.is_empty(),
                }),
            notify: config.notify.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[scheduler]
results_dir = "/data/results"

[queue]
backend = "pbs"
script = "/opt/pipeline/search.sh"
log_dir = "/data/qsublog"
"#;

    #[test]
    fn test_deserialize_minimal_config() {
        let config: Config = toml::from_str(MINIMAL).unwrap();
        assert_eq!(config.queue.backend, QueueBackend::Pbs);
        assert_eq!(config.scheduler.max_attempts, 2);
        assert_eq!(config.queue.max_jobs_running, 50);
        assert_eq!(config.queue.max_jobs_queued, 10);
        assert_eq!(config.database.path.to_str().unwrap(), "pulsarflow.db");
        assert!(config.acquisition.is_none());
        assert!(!config.notify.any_enabled());
    }

    #[test]
    fn test_deserialize_missing_queue_fails() {
        let toml = r#"
[scheduler]
results_dir = "/data/results"
"#;
        let result: Result<Config, _> = toml::from_str(toml);
        assert!(result.is_err());
    }

    #[test]
    fn test_deserialize_acquisition_defaults() {
        let toml = format!(
            "{}{}",
            MINIMAL,
            r#"
[acquisition]
space_to_use = 1000000000
download_dir = "/data/raw"

[acquisition.archive]
api_url = "http://archive.example.org/ws"
username = "survey"
password = "secret"
ftp_host = "ftp.example.org"
ftp_username = "survey"
ftp_password = "secret"
"#
        );
        let config: Config = toml::from_str(&toml).unwrap();
        let acq = config.acquisition.unwrap();
        assert_eq!(acq.numretries, 3);
        assert_eq!(acq.numrestores, 2);
        assert_eq!(acq.exclude_patterns, vec!["b7s".to_string()]);
        assert_eq!(acq.archive.ftp_port, 21);
    }

    #[test]
    fn test_moab_backend_and_cache() {
        let toml = r#"
[scheduler]
results_dir = "/data/results"

[queue]
backend = "moab"
script = "/opt/pipeline/search.sh"
log_dir = "/data/qsublog"

[queue.moab]
cache_ttl_secs = 15
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.queue.backend, QueueBackend::Moab);
        assert_eq!(config.queue.moab.cache_ttl_secs, 15);
    }

    #[test]
    fn test_sanitized_config_hides_passwords() {
        let toml = format!(
            "{}{}",
            MINIMAL,
            r#"
[acquisition]
space_to_use = 10
download_dir = "/data/raw"

[acquisition.archive]
api_url = "http://archive.example.org/ws"
username = "survey"
password = "secret"
ftp_host = "ftp.example.org"
ftp_username = "survey"
ftp_password = ""
"#
        );
        let config: Config = toml::from_str(&toml).unwrap();
        let sanitized = SanitizedConfig::from(&config);
        let acq = sanitized.acquisition.unwrap();
        assert!(acq.password_configured);
        assert!(!acq.ftp_password_configured);

        let json = serde_json::to_string(&SanitizedConfig::from(&config)).unwrap();
        assert!(!json.contains("secret"));
    }
}
