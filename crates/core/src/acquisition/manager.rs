//! The acquisition daemon: restores, listings and download workers.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use super::types::{AcquisitionError, AcquisitionStatus, CycleSummary};
use super::worker;
use crate::archive::{ArchiveApi, ArchiveError, FileSource, RestoreLocation};
use crate::config::AcquisitionConfig;
use crate::daemon::CycleLoop;
use crate::datafile::is_excluded;
use crate::metrics::RESTORES_REQUESTED;
use crate::notify::Notifications;
use crate::store::{
    DataFile, FileStatus, NewDataFile, Restore, RestoreStatus, SqliteStore, StoreError,
};

struct Worker {
    attempt_id: i64,
    remote_name: String,
    handle: JoinHandle<Result<DataFile, StoreError>>,
}

/// Drives restores from request to completion and supervises the download
/// workers of ready restores.
pub struct AcquisitionManager {
    store: Arc<SqliteStore>,
    api: Arc<dyn ArchiveApi>,
    source: Arc<dyn FileSource>,
    config: AcquisitionConfig,
    notifications: Notifications,
    /// Live workers by file id.
    workers: Mutex<HashMap<i64, Worker>>,
    daemon: CycleLoop,
}

impl AcquisitionManager {
    pub fn new(
        store: Arc<SqliteStore>,
        api: Arc<dyn ArchiveApi>,
        source: Arc<dyn FileSource>,
        config: AcquisitionConfig,
        notifications: Notifications,
    ) -> Self {
        Self {
            store,
            api,
            source,
            config,
            notifications,
            workers: Mutex::new(HashMap::new()),
            daemon: CycleLoop::new("downloader"),
        }
    }

    /// Recover interrupted downloads, then run cycles until `stop`.
    pub async fn start(self: &Arc<Self>) -> Result<(), AcquisitionError> {
        self.recover_interrupted().await?;

        let this = Arc::clone(self);
        let interval = Duration::from_secs(self.config.poll_interval_secs);
        self.daemon
            .start(interval, self.notifications.clone(), move || {
                let this = Arc::clone(&this);
                async move { this.run_cycle().await.map(|_| ()) }
            })
            .await;
        info!("Acquisition manager started");
        Ok(())
    }

    /// Stop cycling and wait for in-flight downloads.
    pub async fn stop(&self) {
        self.daemon.stop().await;
        if let Err(e) = self.wait_for_workers().await {
            error!("Failed to record final download results: {}", e);
        }
        info!("Acquisition manager stopped");
    }

    /// Close attempts left open by a previous process. Their files become
    /// `failed` and re-enter retry accounting.
    pub async fn recover_interrupted(&self) -> Result<usize, AcquisitionError> {
        let workers = self.workers.lock().await;
        let mut recovered = 0;
        for file in self.store.files_with_status(FileStatus::Downloading)? {
            if workers.contains_key(&file.id) {
                continue;
            }
            let open = self.store.open_download_attempts(file.id)?;
            if open.is_empty() {
                warn!("File {} is downloading without an open attempt", file.remote_name);
                continue;
            }
            for attempt in open {
                self.store.finish_download_attempt(
                    attempt.id,
                    false,
                    "Interrupted: downloader stopped during transfer",
                )?;
            }
            recovered += 1;
        }
        if recovered > 0 {
            info!("Recovered {} interrupted downloads", recovered);
        }
        Ok(recovered)
    }

    /// One acquisition cycle.
    pub async fn run_cycle(&self) -> Result<CycleSummary, AcquisitionError> {
        let mut summary = CycleSummary::default();

        summary.restores_ready = self.poll_waiting_restores().await?;
        let (listed, failed) = self.list_ready_restores().await?;
        summary.restores_listed = listed;
        summary.restores_failed = failed;
        summary.downloads_finished = self.reap_workers(false).await?;
        summary.downloads_started = self.start_workers().await?;
        summary.restores_finished = self.finalize_restores().await?;
        summary.restore_requested = self.request_restore_if_allowed().await?;

        debug!("Acquisition cycle: {:?}", summary);
        Ok(summary)
    }

    /// Await every live worker and record its result.
    pub async fn wait_for_workers(&self) -> Result<usize, AcquisitionError> {
        self.reap_workers(true).await
    }

    pub async fn status(&self) -> Result<AcquisitionStatus, AcquisitionError> {
        let active = self
            .store
            .restores_with_status(&[RestoreStatus::Waiting, RestoreStatus::Ready])?;
        let count = |status| -> Result<usize, StoreError> {
            Ok(self.store.files_with_status(status)?.len())
        };
        Ok(AcquisitionStatus {
            running: self.daemon.is_running(),
            active_restores: active.len(),
            active_workers: self.workers.lock().await.len(),
            files_new: count(FileStatus::New)?,
            files_downloading: count(FileStatus::Downloading)?,
            files_downloaded: count(FileStatus::Downloaded)?,
            files_failed: count(FileStatus::Failed)?,
            space_used: self.space_used(&active),
        })
    }

    async fn poll_waiting_restores(&self) -> Result<usize, AcquisitionError> {
        let mut ready = 0;
        for restore in self.store.restores_with_status(&[RestoreStatus::Waiting])? {
            match self.api.location(&restore.guid).await {
                Ok(RestoreLocation::Ready) => {
                    self.store.update_restore_status(
                        restore.id,
                        RestoreStatus::Ready,
                        "Archive finished staging",
                    )?;
                    info!("Restore {} is ready", restore.guid);
                    ready += 1;
                }
                Ok(RestoreLocation::Pending) => {
                    debug!("Restore {} still staging", restore.guid);
                }
                Err(e) => warn!("Could not poll restore {}: {}", restore.guid, e),
            }
        }
        Ok(ready)
    }

    /// Record listings of ready restores that have none yet.
    async fn list_ready_restores(&self) -> Result<(usize, usize), AcquisitionError> {
        let mut listed = 0;
        let mut failed = 0;
        for restore in self.store.restores_with_status(&[RestoreStatus::Ready])? {
            if restore.listed_at.is_some() {
                continue;
            }

            match self.source.list_files(&restore.guid).await {
                Ok(remote) => {
                    let total = remote.len();
                    let files: Vec<NewDataFile> = remote
                        .into_iter()
                        .filter(|f| !is_excluded(&f.name, &self.config.exclude_patterns))
                        .map(|f| NewDataFile {
                            local_path: self.config.download_dir.join(&f.name),
                            remote_name: f.name,
                            size: Some(f.size),
                        })
                        .collect();
                    let details = format!(
                        "Listed {} files ({} excluded)",
                        files.len(),
                        total - files.len()
                    );
                    self.store
                        .record_restore_listing(restore.id, &files, &details)?;
                    info!("Restore {}: {}", restore.guid, details);
                    listed += 1;
                }
                Err(ArchiveError::DirectoryNotFound(reason)) => {
                    self.store.update_restore_status(
                        restore.id,
                        RestoreStatus::Failed,
                        &format!("Staging directory not found: {}", reason),
                    )?;
                    error!("Restore {} failed: staging directory not found", restore.guid);
                    self.notifications
                        .restore_failed(&restore.guid, "staging directory not found")
                        .await;
                    failed += 1;
                }
                Err(e) => warn!("Could not list restore {}: {}", restore.guid, e),
            }
        }
        Ok((listed, failed))
    }

    /// Collect finished workers (all of them when `wait` is set).
    async fn reap_workers(&self, wait: bool) -> Result<usize, AcquisitionError> {
        let mut workers = self.workers.lock().await;
        let done: Vec<i64> = workers
            .iter()
            .filter(|(_, w)| wait || w.handle.is_finished())
            .map(|(id, _)| *id)
            .collect();

        for file_id in &done {
            let Some(worker) = workers.remove(file_id) else {
                continue;
            };
            match worker.handle.await {
                Ok(Ok(file)) => debug!("Worker for {} ended: {}", file.remote_name, file.status),
                Ok(Err(e)) => {
                    // The worker could not record its own outcome.
                    error!("Worker for {} failed: {}", worker.remote_name, e);
                    self.store.finish_download_attempt(
                        worker.attempt_id,
                        false,
                        &format!("Worker error: {}", e),
                    )?;
                }
                Err(e) => {
                    error!("Worker for {} panicked: {}", worker.remote_name, e);
                    self.store.finish_download_attempt(
                        worker.attempt_id,
                        false,
                        "Worker crashed",
                    )?;
                }
            }
        }
        Ok(done.len())
    }

    /// Whether a file should get a new attempt.
    fn eligible(&self, file: &DataFile) -> Result<bool, StoreError> {
        Ok(match file.status {
            FileStatus::New => true,
            FileStatus::Failed => {
                self.store.count_download_attempts(file.id)? < self.config.numretries
            }
            FileStatus::Downloading | FileStatus::Downloaded => false,
        })
    }

    async fn start_workers(&self) -> Result<usize, AcquisitionError> {
        let mut workers = self.workers.lock().await;
        let mut started = 0;

        'restores: for restore in self.store.restores_with_status(&[RestoreStatus::Ready])? {
            if restore.listed_at.is_none() {
                continue;
            }
            for file in self.store.files_for_restore(restore.id)? {
                if workers.len() >= self.config.max_concurrent_downloads {
                    break 'restores;
                }
                if workers.contains_key(&file.id) || !self.eligible(&file)? {
                    continue;
                }

                let attempt = match self.store.start_download_attempt(file.id) {
                    Ok(attempt) => attempt,
                    Err(StoreError::Conflict(reason)) => {
                        debug!("Skipping {}: {}", file.remote_name, reason);
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                };

                let handle = tokio::spawn(worker::download(
                    Arc::clone(&self.store),
                    Arc::clone(&self.source),
                    restore.guid.clone(),
                    file.clone(),
                    attempt.id,
                ));
                workers.insert(
                    file.id,
                    Worker {
                        attempt_id: attempt.id,
                        remote_name: file.remote_name.clone(),
                        handle,
                    },
                );
                started += 1;
            }
        }
        Ok(started)
    }

    /// Finish ready restores whose files have all resolved.
    async fn finalize_restores(&self) -> Result<usize, AcquisitionError> {
        let workers = self.workers.lock().await;
        let mut finished = 0;

        for restore in self.store.restores_with_status(&[RestoreStatus::Ready])? {
            if restore.listed_at.is_none() {
                continue;
            }
            let files = self.store.files_for_restore(restore.id)?;
            let mut downloaded = 0;
            let mut failed = Vec::new();
            let mut unresolved = false;

            for file in &files {
                if workers.contains_key(&file.id) {
                    unresolved = true;
                    break;
                }
                match file.status {
                    FileStatus::Downloaded => downloaded += 1,
                    FileStatus::Failed if !self.eligible(file)? => {
                        failed.push(file.remote_name.as_str())
                    }
                    _ => {
                        unresolved = true;
                        break;
                    }
                }
            }
            if unresolved {
                continue;
            }

            let details = if failed.is_empty() {
                format!("{} files downloaded", downloaded)
            } else {
                format!(
                    "{} files downloaded, {} failed permanently: {}",
                    downloaded,
                    failed.len(),
                    failed.join(", ")
                )
            };
            self.store
                .update_restore_status(restore.id, RestoreStatus::Finished, &details)?;
            info!("Restore {} finished: {}", restore.guid, details);
            finished += 1;
        }
        Ok(finished)
    }

    /// Bytes on disk plus the listed size of every active restore.
    fn space_used(&self, active: &[Restore]) -> u64 {
        disk_usage(&self.config.download_dir) + active.iter().map(|r| r.size).sum::<u64>()
    }

    async fn request_restore_if_allowed(&self) -> Result<bool, AcquisitionError> {
        let active = self
            .store
            .restores_with_status(&[RestoreStatus::Waiting, RestoreStatus::Ready])?;
        if active.len() >= self.config.numrestores as usize {
            debug!(
                "{} restores active, ceiling is {}",
                active.len(),
                self.config.numrestores
            );
            return Ok(false);
        }

        let used = self.space_used(&active);
        if used >= self.config.space_to_use {
            info!(
                "Not requesting a restore: {} bytes in use of {}",
                used, self.config.space_to_use
            );
            return Ok(false);
        }

        match self.api.request_restore(self.config.restore_size).await {
            Ok(guid) => {
                self.store.insert_restore(&guid)?;
                RESTORES_REQUESTED.inc();
                info!("Requested restore {} of {} files", guid, self.config.restore_size);
                Ok(true)
            }
            Err(e) => {
                warn!("Restore request failed: {}", e);
                Ok(false)
            }
        }
    }
}

/// Total size of regular files under `dir` (0 if it does not exist).
fn disk_usage(dir: &Path) -> u64 {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|meta| meta.len())
        .sum()
}
