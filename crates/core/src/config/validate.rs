use super::{types::Config, ConfigError};

/// Validate configuration
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.server.port == 0 {
        return Err(invalid("server.port cannot be 0"));
    }

    if !config.library.staging_root.is_absolute() {
        return Err(invalid("library.staging_root must be an absolute path"));
    }

    let pipeline = &config.pipeline;
    if !(50..=1000).contains(&pipeline.poll_interval_ms) {
        return Err(invalid("pipeline.poll_interval_ms must be between 50 and 1000"));
    }
    if pipeline.cancel_grace_secs == 0 {
        return Err(invalid("pipeline.cancel_grace_secs cannot be 0"));
    }
    if pipeline.bus_capacity == 0 {
        return Err(invalid("pipeline.bus_capacity cannot be 0"));
    }

    for (name, retry) in [
        ("download.retry", &config.download.retry),
        ("transfer.retry", &config.transfer.retry),
    ] {
        if retry.max_attempts == 0 {
            return Err(invalid(format!("{}.max_attempts cannot be 0", name)));
        }
        if retry.backoff_multiplier < 1.0 {
            return Err(invalid(format!(
                "{}.backoff_multiplier must be at least 1.0",
                name
            )));
        }
    }

    if let Some(remote) = &config.remote {
        if remote.host.trim().is_empty() {
            return Err(invalid("remote.host cannot be empty"));
        }
        if remote.library_dir.trim().is_empty() {
            return Err(invalid("remote.library_dir cannot be empty"));
        }
    }

    Ok(())
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::RemoteEndpoint;
    use std::path::PathBuf;

    #[test]
    fn test_validate_default_config() {
        assert!(validate_config(&Config::default()).is_ok());
    }

    #[test]
    fn test_validate_port_zero_fails() {
        let mut config = Config::default();
        config.server.port = 0;
        let err = validate_config(&config).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_validate_relative_staging_root_fails() {
        let mut config = Config::default();
        config.library.staging_root = PathBuf::from("staging");
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_poll_interval_bounds() {
        let mut config = Config::default();
        config.pipeline.poll_interval_ms = 10;
        assert!(validate_config(&config).is_err());

        config.pipeline.poll_interval_ms = 250;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_validate_retry_attempts_and_backoff() {
        let mut config = Config::default();
        config.transfer.retry.max_attempts = 0;
        assert!(validate_config(&config).is_err());

        let mut config = Config::default();
        config.download.retry.backoff_multiplier = 0.5;
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("download.retry"));
    }

    #[test]
    fn test_validate_remote_requires_host() {
        let mut config = Config::default();
        config.remote = Some(RemoteEndpoint::new("  ", "deck", "/home/deck/games"));
        assert!(validate_config(&config).is_err());
    }
}
