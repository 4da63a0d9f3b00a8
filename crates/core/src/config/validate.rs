use super::{types::Config, ConfigError};

/// Validate configuration
///
/// Ceilings and intervals must be non-zero, and email notifications need a
/// recipient.
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let fail = |msg: &str| Err(ConfigError::ValidationError(msg.to_string()));

    if config.scheduler.max_attempts == 0 {
        return fail("scheduler.max_attempts cannot be 0");
    }
    if config.scheduler.poll_interval_secs == 0 {
        return fail("scheduler.poll_interval_secs cannot be 0");
    }
    if config.queue.max_jobs_running == 0 {
        return fail("queue.max_jobs_running cannot be 0");
    }
    if config.database.busy_max_retries == 0 {
        return fail("database.busy_max_retries cannot be 0");
    }

    if let Some(acq) = &config.acquisition {
        if acq.numretries == 0 {
            return fail("acquisition.numretries cannot be 0");
        }
        if acq.numrestores == 0 {
            return fail("acquisition.numrestores cannot be 0");
        }
        if acq.poll_interval_secs == 0 {
            return fail("acquisition.poll_interval_secs cannot be 0");
        }
        if acq.max_concurrent_downloads == 0 {
            return fail("acquisition.max_concurrent_downloads cannot be 0");
        }
    }

    if config.notify.any_enabled() && config.notify.recipient.is_none() {
        return fail("notify.recipient is required when notifications are enabled");
    }

    Ok(())
}
