//! Raw data acquisition from the tape archive.
//!
//! The downloader requests restores while disk space and the restore
//! ceiling allow, lists what the archive staged, and fans the files out to
//! a bounded pool of download workers:
//! - **Restores**: waiting -> ready -> finished (or failed when the staging
//!   directory never appears)
//! - **Files**: new -> downloading -> downloaded, or failed and retried up to
//!   `numretries` attempts

mod manager;
mod types;
mod worker;

pub use manager::AcquisitionManager;
pub use types::{AcquisitionError, AcquisitionStatus, CycleSummary};
