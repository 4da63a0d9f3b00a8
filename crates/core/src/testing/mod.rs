//! Testing utilities and mock implementations.
//!
//! This module provides mock implementations of the external collaborators
//! (batch queue, archive, mailer), allowing the daemons' cycles to be driven
//! end to end without a cluster.
//!
//! # Example
//!
//! ```rust,ignore
//! use pulsarflow_core::testing::{MockArchive, MockNotifier, MockQueueManager};
//!
//! let queue = MockQueueManager::new();
//! let archive = MockArchive::new();
//! archive.stage_restore("guid", vec![("a.fits", bytes)]).await;
//!
//! scheduler.run_cycle().await?;
//! queue.finish_all(Some("Segmentation fault")).await;
//! ```

mod mock_archive;
mod mock_notifier;
mod mock_queue;

pub use mock_archive::MockArchive;
pub use mock_notifier::MockNotifier;
pub use mock_queue::{MockJob, MockQueueManager};

/// Test fixtures and helper functions.
pub mod fixtures {
    use std::path::{Path, PathBuf};

    use crate::config::{
        AcquisitionConfig, ArchiveConfig, Config, DatabaseConfig, MoabConfig, NotifyConfig,
        QueueBackend, QueueConfig, SchedulerConfig,
    };

    /// Raw file name for one subband of an observation.
    pub fn raw_name(beam: u8, subband: u8, seq: u32) -> String {
        format!("4bit-p2030.55000.J1906+0746.b{}s{}g0.{:05}.fits", beam, subband, seq)
    }

    /// Primary FITS header holding the given cards, padded to one block.
    pub fn fits_header(cards: &[(&str, &str)]) -> Vec<u8> {
        let mut header = String::new();
        header.push_str(&format!("{:<80}", "SIMPLE  =                    T"));
        for (key, value) in cards {
            header.push_str(&format!(
                "{:<80}",
                format!("{:<8}= {:>20} / test card", key, value)
            ));
        }
        header.push_str(&format!("{:<80}", "END"));
        let mut bytes = header.into_bytes();
        let padded = bytes.len().div_ceil(2880) * 2880;
        bytes.resize(padded, b' ');
        bytes
    }

    /// File contents of an observation lasting `scan_secs`.
    pub fn observation(scan_secs: f64) -> Vec<u8> {
        let mut bytes = fits_header(&[("SCANLEN", &format!("{:.1}", scan_secs))]);
        bytes.extend(std::iter::repeat(0x5a).take(2880));
        bytes
    }

    /// Write an observation file and return its path.
    pub fn write_observation(dir: &Path, name: &str, scan_secs: f64) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, observation(scan_secs)).unwrap();
        path
    }

    /// Full configuration rooted in a scratch directory.
    pub fn config(root: &Path) -> Config {
        Config {
            database: DatabaseConfig {
                path: root.join("pulsarflow.db"),
                busy_retry_interval_ms: 1,
                busy_warn_after: 10,
                busy_max_retries: 100,
            },
            scheduler: SchedulerConfig {
                poll_interval_secs: 1,
                max_attempts: 2,
                delete_rawdata_on_terminal_failure: false,
                results_dir: root.join("results"),
                min_observation_secs: 140.0,
            },
            queue: QueueConfig {
                backend: QueueBackend::Pbs,
                max_jobs_running: 10,
                max_jobs_queued: 5,
                job_name: "pulsarflow".to_string(),
                queue_name: None,
                resources: "nodes=1:ppn=1".to_string(),
                script: root.join("search.sh"),
                log_dir: root.join("logs"),
                delete_confirm_delay_secs: 0,
                command_timeout_secs: 5,
                user: Some("survey".to_string()),
                moab: MoabConfig::default(),
            },
            acquisition: Some(AcquisitionConfig {
                poll_interval_secs: 1,
                numretries: 3,
                numrestores: 2,
                space_to_use: 1 << 30,
                download_dir: root.join("raw"),
                max_concurrent_downloads: 4,
                restore_size: 4,
                exclude_patterns: vec!["b7s".to_string()],
                archive: ArchiveConfig {
                    api_url: "http://archive.invalid".to_string(),
                    username: "survey".to_string(),
                    password: "secret".to_string(),
                    ftp_host: "archive.invalid".to_string(),
                    ftp_port: 21,
                    ftp_username: "survey".to_string(),
                    ftp_password: "secret".to_string(),
                    timeout_secs: 5,
                },
            }),
            notify: NotifyConfig {
                send_on_failure: true,
                send_on_terminal_failure: true,
                send_on_crash: true,
                recipient: Some("ops@example.org".to_string()),
                sender: None,
                sendmail_path: None,
            },
        }
    }
}
