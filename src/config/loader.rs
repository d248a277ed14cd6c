/// Configuration loading from TOML file
use std::path::Path;

use tracing::debug;

use crate::error::{FeedError, Result};
use crate::types::{FeedConfig, TimeRange};
use crate::utils::{parse_time_value, parse_time_zone, tf_to_secs};

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<FeedConfig> {
    let content = std::fs::read_to_string(path.as_ref())
        .map_err(|e| FeedError::ConfigError(format!("Failed to read config file: {}", e)))?;
    let config = parse_config(&content)?;
    debug!("Configuration loaded from {}", path.as_ref().display());
    Ok(config)
}

pub fn parse_config(content: &str) -> Result<FeedConfig> {
    let config: FeedConfig = toml::from_str(content)
        .map_err(|e| FeedError::ConfigError(format!("Failed to parse config: {}", e)))?;

    // Validate config
    validate_config(&config)?;

    Ok(config)
}

pub fn validate_config(config: &FeedConfig) -> Result<()> {
    if !(0.0..1.0).contains(&config.pre_fire) {
        return Err(FeedError::ConfigError(format!(
            "Invalid pre_fire: {}, must be in [0, 1)",
            config.pre_fire
        )));
    }

    if config.batch_size == 0 {
        return Err(FeedError::ConfigError("batch_size must be > 0".to_string()));
    }

    if config.io_timeout_secs == 0 {
        return Err(FeedError::ConfigError("io_timeout_secs must be > 0".to_string()));
    }

    for tf in config.timeframes.iter().chain(config.warm_nums.keys()) {
        tf_to_secs(tf).map_err(|_| FeedError::ConfigError(format!("Invalid timeframe: {}", tf)))?;
    }

    let range = resolve_time_range(config)?;
    if range.end_ms > 0 && range.start_ms >= range.end_ms {
        return Err(FeedError::ConfigError(format!(
            "time_range start {} must be before end {}",
            range.start_ms, range.end_ms
        )));
    }

    Ok(())
}

/// Replay range in milliseconds, dates read in the configured time zone
pub fn resolve_time_range(config: &FeedConfig) -> Result<TimeRange> {
    let tz = parse_time_zone(&config.time_zone)?;
    Ok(TimeRange {
        start_ms: parse_time_value(&config.time_range.start, tz)?,
        end_ms: parse_time_value(&config.time_range.end, tz)?,
    })
}
