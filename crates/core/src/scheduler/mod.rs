//! Job scheduler for the batch processing queue.
//!
//! Jobs move through `new -> submitted -> processed`, with failed attempts
//! retried up to `max_attempts` before the job is given up on. Jobs whose
//! input can never be processed skip straight to `terminal_failure`.

mod runner;
mod types;

pub use runner::JobScheduler;
pub use types::{CycleReport, SchedulerError, SchedulerStatus};
