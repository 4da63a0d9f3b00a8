pub mod acquisition;
pub mod archive;
pub mod config;
pub mod daemon;
pub mod datafile;
pub mod metrics;
pub mod notify;
pub mod queue;
pub mod scheduler;
pub mod store;
pub mod testing;

pub use acquisition::{AcquisitionError, AcquisitionManager, AcquisitionStatus, CycleSummary};
pub use archive::{
    ArchiveApi, ArchiveError, FileSource, FtpFileSource, HttpArchiveApi, RemoteFile,
    RestoreLocation,
};
pub use config::{
    load_config, load_config_from_str, validate_config, AcquisitionConfig, Config, ConfigError,
    QueueBackend, SanitizedConfig, SchedulerConfig,
};
pub use datafile::{complete_groups, precheck, DataFileName, PrecheckError};
pub use notify::{create_notifier, Notifications, Notifier, NotifyError};
pub use queue::{
    create_queue_manager, MoabQueueManager, PbsQueueManager, QueueError, QueueLimits,
    QueueManager, QueueStatus, SubmitRequest,
};
pub use scheduler::{CycleReport, JobScheduler, SchedulerError, SchedulerStatus};
pub use store::{
    DataFile, FileStatus, Job, JobStatus, JobSubmit, Restore, RestoreStatus, RetryPolicy,
    SqliteStore, StoreError, SubmitStatus,
};
