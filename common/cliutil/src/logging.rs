// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::prelude::*;
use tracing_subscriber::Layer;

/// Name of the environment variable containing the log directory/file.
/// If both are set, it's an error. If neither is set, no file logging happens.
pub const LOG_DIR_ENV: &str = "STRATA_LOG_DIR";
pub const LOG_FILE_ENV: &str = "STRATA_LOG_FILE";

/// Chooses whether to log to the console. "0" disables it.
pub const CONSOLE_LOG_ENV: &str = "STRATA_LOG_CONSOLE";

/// RAII guard that keeps the tracing subscriber's span alive.
pub struct LogGuard {
    _span_guard: tracing::span::EnteredSpan,
}

/// Configuration for the process-wide tracing subscriber.
pub struct LoggingConfig {
    /// Path to write logs to, and a filter for what gets written there. `None`
    /// disables file logging.
    pub log_file: Option<(PathBuf, EnvFilter)>,
    /// Filter for what gets written to the console. `None` disables it.
    pub console_logger: Option<EnvFilter>,
}

impl LoggingConfig {
    pub fn from_env() -> Result<Self> {
        let timestamp = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_nanos();

        let log_file = match (std::env::var_os(LOG_FILE_ENV), std::env::var_os(LOG_DIR_ENV)) {
            (Some(_), Some(_)) => bail!("You can't have both {LOG_FILE_ENV} and {LOG_DIR_ENV} set"),
            (Some(file), None) => Some(PathBuf::from(file)),
            (None, Some(dir)) => {
                let name = format!("{}.{timestamp}.log", crate::get_current_process_name());
                Some(Path::new(&dir).join(name))
            }
            (None, None) => None,
        };

        let console_logger = match std::env::var(CONSOLE_LOG_ENV).ok().as_deref() {
            Some("0") => None,
            _ => Some(
                EnvFilter::builder()
                    .with_default_directive(LevelFilter::INFO.into())
                    .from_env()?,
            ),
        };

        let log_file = match log_file {
            Some(log_file) => Some((
                log_file,
                EnvFilter::builder()
                    .with_default_directive(LevelFilter::INFO.into())
                    .from_env()?,
            )),
            None => None,
        };

        Ok(Self {
            log_file,
            console_logger,
        })
    }

    /// Installs the tracing subscriber and starts a `main` span.
    pub fn setup(self) -> Result<LogGuard> {
        let mut layers = Vec::new();

        if let Some(filter) = self.console_logger {
            layers.push(
                tracing_subscriber::fmt::layer()
                    .with_ansi(true)
                    .with_writer(std::io::stderr)
                    .with_filter(filter)
                    .boxed(),
            );
        }

        if let Some((log_file, filter)) = self.log_file {
            let f = std::fs::File::create(&log_file)
                .with_context(|| format!("Failed to open log file {log_file:?}"))?;
            layers.push(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(f)
                    .with_filter(filter)
                    .boxed(),
            );
        }

        tracing_subscriber::registry().with(layers).try_init().context(
            "Failed to start tracing. A tracing subscriber is probably already running.",
        )?;

        let span_guard = tracing::trace_span!("main").entered();

        Ok(LogGuard {
            _span_guard: span_guard,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fileutil::SafeTempDir;

    #[test]
    fn setup_logging_writes_to_file() -> Result<()> {
        const INFO_MESSAGE: &str = "log at level info";

        let dir = SafeTempDir::new()?;
        std::env::set_var("RUST_LOG", "INFO");
        let log_file = dir.path().join("out.log");
        std::env::set_var(LOG_FILE_ENV, &log_file);
        std::env::set_var(CONSOLE_LOG_ENV, "0");

        {
            let _guard = LoggingConfig::from_env()?.setup()?;
            tracing::info!("{}", INFO_MESSAGE);
        }

        let log_content = std::fs::read_to_string(log_file)?;
        assert!(log_content.contains(INFO_MESSAGE));
        Ok(())
    }
}
