//! Types for the acquisition daemon.

use serde::Serialize;
use thiserror::Error;

use crate::archive::ArchiveError;
use crate::store::StoreError;

/// Errors that end an acquisition cycle.
///
/// Per-restore and per-file archive problems are recorded on the rows
/// concerned and do not end the cycle.
#[derive(Debug, Error)]
pub enum AcquisitionError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Archive error: {0}")]
    Archive(#[from] ArchiveError),

    #[error("Acquisition is not configured")]
    NotConfigured,
}

/// What one acquisition cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleSummary {
    /// Restores the archive reported staged.
    pub restores_ready: usize,
    /// Restores whose file listing was recorded.
    pub restores_listed: usize,
    /// Restores failed because their staging directory was missing.
    pub restores_failed: usize,
    /// Workers reaped this cycle.
    pub downloads_finished: usize,
    pub downloads_started: usize,
    pub restores_finished: usize,
    pub restore_requested: bool,
}

/// Snapshot of acquisition progress.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AcquisitionStatus {
    pub running: bool,
    pub active_restores: usize,
    pub active_workers: usize,
    pub files_new: usize,
    pub files_downloading: usize,
    pub files_downloaded: usize,
    pub files_failed: usize,
    /// Bytes counted against `space_to_use`.
    pub space_used: u64,
}
