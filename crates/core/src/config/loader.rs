use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use std::path::Path;

use super::{types::Config, ConfigError};

/// Load configuration from file with environment variable overrides
///
/// Nested keys are addressed with a double underscore, e.g.
/// `PULSARFLOW_QUEUE__MAX_JOBS_QUEUED=4`.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound(path.display().to_string()));
    }

    let config: Config = Figment::new()
        .merge(Toml::file(path))
        .merge(Env::prefixed("PULSARFLOW_").split("__"))
        .extract()
        .map_err(|e| ConfigError::ParseError(e.to_string()))?;

    Ok(config)
}

/// Load configuration from TOML string (useful for testing)
pub fn load_config_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    toml::from_str(toml_str).map_err(|e| ConfigError::ParseError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_config_from_str_valid() {
        let toml = r#"
[scheduler]
results_dir = "/data/results"
max_attempts = 4

[queue]
backend = "pbs"
script = "/opt/search.sh"
log_dir = "/data/logs"
"#;
        let config = load_config_from_str(toml).unwrap();
        assert_eq!(config.scheduler.max_attempts, 4);
    }

    #[test]
    fn test_load_config_from_str_missing_scheduler() {
        let toml = r#"
[queue]
backend = "pbs"
script = "/opt/search.sh"
log_dir = "/data/logs"
"#;
        let result = load_config_from_str(toml);
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_load_config_file_not_found() {
        let result = load_config(Path::new("/nonexistent/pulsarflow.toml"));
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn test_load_config_from_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(
            temp_file,
            r#"
[database]
path = "/var/lib/pulsarflow/state.db"

[scheduler]
results_dir = "/data/results"

[queue]
backend = "moab"
script = "/opt/search.sh"
log_dir = "/data/logs"
max_jobs_queued = 3
"#
        )
        .unwrap();

        let config = load_config(temp_file.path()).unwrap();
        assert_eq!(config.queue.max_jobs_queued, 3);
        assert_eq!(
            config.database.path.to_str().unwrap(),
            "/var/lib/pulsarflow/state.db"
        );
    }
}
