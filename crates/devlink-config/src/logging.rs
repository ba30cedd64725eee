// ── Tracing setup ──
//
// `RUST_LOG` wins over the configured level. Output goes to stderr, or to
// a daily-rotated file when `rotating_log` is set; the returned guard must
// be held for the life of the process so buffered lines get flushed.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

use crate::ConfigError;

/// `[logger]` section.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggerSettings {
    /// Filter directive, e.g. `info` or `devlink_core=debug,info`.
    pub level: String,

    /// Write to rotating files instead of stderr.
    pub rotating_log: bool,

    /// How many rotated files to keep.
    pub rotating_log_backup_count: usize,

    /// Directory for rotated files. Defaults to the platform data dir.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
}

impl Default for LoggerSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            rotating_log: false,
            rotating_log_backup_count: 7,
            log_dir: None,
        }
    }
}

impl LoggerSettings {
    pub fn filter(&self) -> Result<EnvFilter, ConfigError> {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return Ok(filter);
        }
        EnvFilter::try_new(&self.level).map_err(|e| ConfigError::Validation {
            field: "logger.level".into(),
            reason: e.to_string(),
        })
    }

    pub fn resolved_log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(crate::default_log_dir)
    }
}

/// Install the global subscriber.
///
/// Returns the file writer's guard when logging to files, `None` for
/// stderr. Fails if a global subscriber is already set.
pub fn init(settings: &LoggerSettings) -> Result<Option<WorkerGuard>, ConfigError> {
    let filter = settings.filter()?;

    if !settings.rotating_log {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr).with_target(true))
            .try_init()
            .map_err(|e| ConfigError::Logging(e.to_string()))?;
        return Ok(None);
    }

    let dir = settings.resolved_log_dir();
    std::fs::create_dir_all(&dir)?;
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("devlink")
        .filename_suffix("log")
        .max_log_files(settings.rotating_log_backup_count.max(1))
        .build(&dir)
        .map_err(|e| ConfigError::Logging(e.to_string()))?;
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true),
        )
        .try_init()
        .map_err(|e| ConfigError::Logging(e.to_string()))?;

    Ok(Some(guard))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn bad_level_is_a_validation_error() {
        let settings = LoggerSettings {
            level: "devlink=loud".into(),
            ..LoggerSettings::default()
        };
        // RUST_LOG set in the environment would bypass the configured level.
        if std::env::var_os("RUST_LOG").is_none() {
            assert!(matches!(
                settings.filter(),
                Err(ConfigError::Validation { ref field, .. }) if field == "logger.level"
            ));
        }
    }

    #[test]
    fn explicit_log_dir_wins() {
        let settings = LoggerSettings {
            log_dir: Some(PathBuf::from("/var/log/devlink")),
            ..LoggerSettings::default()
        };
        assert_eq!(settings.resolved_log_dir(), PathBuf::from("/var/log/devlink"));
    }
}
