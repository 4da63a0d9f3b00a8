//! Batch queue abstraction.
//!
//! This module provides a `QueueManager` trait over the cluster's batch
//! scheduler, with PBS and Moab backends selected by configuration.

mod command;
mod moab;
mod pbs;
mod types;

use std::sync::Arc;

pub use command::{
    job_number, parse_submit_output, CommandOutput, CommandRunner, ProcessRunner, QueueLogs,
    SubmitOptions,
};
pub use moab::MoabQueueManager;
pub use pbs::PbsQueueManager;
pub use types::*;

use crate::config::{QueueBackend, QueueConfig};

/// Build the queue manager named by the configuration.
pub fn create_queue_manager(config: &QueueConfig) -> Arc<dyn QueueManager> {
    match config.backend {
        QueueBackend::Pbs => Arc::new(PbsQueueManager::new(config)),
        QueueBackend::Moab => Arc::new(MoabQueueManager::new(config)),
    }
}
