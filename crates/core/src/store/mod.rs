//! Persistent pipeline state.
//!
//! One SQLite database holds restores, files, download attempts, jobs, job
//! files and job submissions. It is shared by independent daemon processes;
//! every access is a short transaction retried on contention.

mod files;
mod jobs;
mod retry;
mod sqlite;
mod types;

pub use retry::RetryPolicy;
pub use sqlite::SqliteStore;
pub use types::*;
