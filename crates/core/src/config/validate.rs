use regex_lite::Regex;

use super::{types::Config, ConfigError};

/// Validate configuration
/// Currently validates:
/// - scheduler.workers and scheduler.max_polls are non-zero
/// - source.page_size_limit is non-zero
/// - at least one URL template, each containing `{name}`
/// - source.identifier_pattern compiles and has a capture group
/// - at least one tracked period
/// - realtime.interval_secs is non-zero
/// - realtime.utc_offset_minutes is within a day
/// - a shared WebDriver endpoint is only used with a single worker
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.scheduler.workers == 0 {
        return Err(ConfigError::ValidationError(
            "scheduler.workers cannot be 0".to_string(),
        ));
    }

    if config.scheduler.max_polls == 0 {
        return Err(ConfigError::ValidationError(
            "scheduler.max_polls cannot be 0".to_string(),
        ));
    }

    if config.source.page_size_limit == 0 {
        return Err(ConfigError::ValidationError(
            "source.page_size_limit cannot be 0".to_string(),
        ));
    }

    if config.source.url_templates.is_empty() {
        return Err(ConfigError::ValidationError(
            "source.url_templates cannot be empty".to_string(),
        ));
    }

    if let Some(bad) = config
        .source
        .url_templates
        .iter()
        .find(|t| !t.contains("{name}"))
    {
        return Err(ConfigError::ValidationError(format!(
            "source.url_templates entry has no {{name}} placeholder: {}",
            bad
        )));
    }

    let pattern = Regex::new(&config.source.identifier_pattern).map_err(|e| {
        ConfigError::ValidationError(format!("source.identifier_pattern is invalid: {}", e))
    })?;
    if pattern.captures_len() < 2 {
        return Err(ConfigError::ValidationError(
            "source.identifier_pattern needs a capture group".to_string(),
        ));
    }

    if config.tracked.periods.is_empty() {
        return Err(ConfigError::ValidationError(
            "tracked.periods cannot be empty".to_string(),
        ));
    }

    if config.realtime.interval_secs == 0 {
        return Err(ConfigError::ValidationError(
            "realtime.interval_secs cannot be 0".to_string(),
        ));
    }

    if config.realtime.utc_offset_minutes.abs() >= 24 * 60 {
        return Err(ConfigError::ValidationError(format!(
            "realtime.utc_offset_minutes out of range: {}",
            config.realtime.utc_offset_minutes
        )));
    }

    // One driver endpoint serves one session at a time.
    if !config.browser.spawn_driver && config.scheduler.workers > 1 {
        return Err(ConfigError::ValidationError(format!(
            "browser.spawn_driver is false but scheduler.workers is {}; \
             enable spawn_driver or set workers = 1",
            config.scheduler.workers
        )));
    }

    if config.browser.spawn_driver && config.browser.driver_path.trim().is_empty() {
        return Err(ConfigError::ValidationError(
            "browser.driver_path cannot be empty".to_string(),
        ));
    }

    Ok(())
}
