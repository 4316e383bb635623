//! Tracing setup for Strata binaries.
//!
//! stderr carries events at the requested level. `STRATA_LOG` replaces that
//! level with full `EnvFilter` directives. When a log directory is given,
//! a daily file there receives info-level Strata events, or whatever
//! `STRATA_LOG` selects.

use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};
use tracing::level_filters::LevelFilter;
use tracing::Span;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Environment variable holding `EnvFilter` directives.
pub const LOG_ENV: &str = "STRATA_LOG";

const FILE_DIRECTIVES: &str = "strata=info,strata_datastore=info,strata_db=info";

pub struct LogConfig<'a> {
    /// Prefix of the daily log file name.
    pub app_name: &'a str,
    pub level: LevelFilter,
    /// Write daily log files here when set.
    pub log_dir: Option<PathBuf>,
}

pub fn init_logging(config: LogConfig<'_>) -> Result<()> {
    let env = std::env::var(LOG_ENV).ok();

    let console = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(directives_filter(env.as_deref(), &config.level.to_string())?);

    let file = match &config.log_dir {
        Some(dir) => Some(
            tracing_subscriber::fmt::layer()
                .with_writer(daily_appender(dir, config.app_name)?)
                .with_ansi(false)
                .with_filter(directives_filter(env.as_deref(), FILE_DIRECTIVES)?),
        ),
        None => None,
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file)
        .try_init()
        .map_err(|e| anyhow!("Failed to install tracing subscriber: {}", e))
}

/// Span carrying the datastore root and command for everything a command logs.
pub fn datastore_span(datastore_root: &Path, command: &str) -> Span {
    tracing::info_span!("datastore", root = %datastore_root.display(), command)
}

fn directives_filter(env: Option<&str>, fallback: &str) -> Result<EnvFilter> {
    match env.map(str::trim) {
        Some(directives) if !directives.is_empty() => EnvFilter::try_new(directives)
            .with_context(|| format!("Invalid {} directives: {}", LOG_ENV, directives)),
        _ => Ok(EnvFilter::new(fallback)),
    }
}

fn daily_appender(dir: &Path, app_name: &str) -> Result<RollingFileAppender> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(app_name)
        .filename_suffix("log")
        .build(dir)
        .with_context(|| format!("Failed to open log file in {}", dir.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn env_directives_replace_fallback() {
        let filter = directives_filter(Some("strata_datastore=trace"), "warn").unwrap();
        assert_eq!(filter.to_string(), "strata_datastore=trace");

        let filter = directives_filter(Some("   "), "warn").unwrap();
        assert_eq!(filter.to_string(), "warn");
        let filter = directives_filter(None, &LevelFilter::DEBUG.to_string()).unwrap();
        assert_eq!(filter.to_string(), "debug");
    }

    #[test]
    fn bad_env_directives_are_reported() {
        let err = directives_filter(Some("strata=loud"), "warn").unwrap_err();
        assert!(err.to_string().contains(LOG_ENV));
    }

    #[test]
    fn daily_appender_creates_directory_and_file() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("logs");
        let mut appender = daily_appender(&dir, "strata").unwrap();
        appender.write_all(b"line\n").unwrap();
        appender.flush().unwrap();

        let names: Vec<String> = std::fs::read_dir(&dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(names[0].starts_with("strata") && names[0].ends_with("log"));
    }
}
