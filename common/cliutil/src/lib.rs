// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Provides functions common to all Rust-based CLI programs in this
//! workspace: consistent startup logging and top-level error reporting.

use std::{
    ffi::OsStr,
    fmt::Debug,
    process::{ExitCode, Termination},
};

use anyhow::{bail, Result};
use itertools::Itertools;

mod config;
mod logging;

pub use crate::config::*;
pub use crate::logging::*;

/// Wraps a CLI main function to provide common startup/cleanup logic: sets up
/// logging, optionally logs the command line, and converts the top-level
/// [`Result`] into an [`ExitCode`].
pub fn cli_main<F, T, E>(main: F, config: Config) -> ExitCode
where
    F: FnOnce() -> Result<T, E>,
    T: Termination,
    E: Debug,
{
    let _log_guard = config.logging.setup().unwrap();
    if config.log_command_line {
        log_current_command_line();
    }
    handle_top_level_result(main())
}

/// Logs the command line of the current process.
pub fn log_current_command_line() {
    let escaped_command = std::env::args()
        .map(|s| shell_escape::escape(s.into()))
        .join(" ");
    tracing::info!("COMMAND: {}", escaped_command);
}

/// Handles the top-level [`Result`] and returns an [`ExitCode`], printing a
/// single `[ERR] <context>: <detail>` line to stderr on failure.
pub fn handle_top_level_result<T: Termination, E: Debug>(result: Result<T, E>) -> ExitCode {
    match result {
        Err(error) => {
            eprintln!("[ERR] {}: {:?}", get_current_process_name(), error);
            ExitCode::FAILURE
        }
        Ok(value) => value.report(),
    }
}

/// Returns the current process name, or `__unknown__` if it failed to get one.
pub fn get_current_process_name() -> String {
    let current_exe = std::env::current_exe().unwrap_or_default();
    current_exe
        .file_name()
        .unwrap_or(OsStr::new("__unknown__"))
        .to_string_lossy()
        .into_owned()
}

/// Splits a `KEY=VALUE` spec into its two halves.
pub fn split_key_value(spec: &str) -> Result<(&str, &str)> {
    let mut parts = spec.splitn(2, '=');
    let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
        bail!("invalid spec: {:?}", spec);
    };
    Ok((key, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_key_value_works() {
        assert_eq!(split_key_value("A=1").unwrap(), ("A", "1"));
        assert_eq!(split_key_value("A=1=2").unwrap(), ("A", "1=2"));
        assert!(split_key_value("A").is_err());
    }
}
