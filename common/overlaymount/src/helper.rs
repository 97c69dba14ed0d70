// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::path::PathBuf;

use anyhow::{Context, Result};

const HELPER_NAME: &str = "overlayfs-mount-helper";
const HELPER_PATH_ENV: &str = "STRATA_OVERLAYFS_MOUNT_HELPER";

/// Locates the `overlayfs-mount-helper` binary.
///
/// Checked in order: an explicit path in [`HELPER_PATH_ENV`], a binary next
/// to the current executable, then whatever `$PATH` resolves.
pub(crate) fn helper_binary_path() -> Result<PathBuf> {
    if let Some(path) = std::env::var_os(HELPER_PATH_ENV) {
        return Ok(PathBuf::from(path));
    }

    let current_exe = std::env::current_exe().context("current_exe")?;
    if let Some(dir) = current_exe.parent() {
        let candidate = dir.join(HELPER_NAME);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }

    Ok(PathBuf::from(HELPER_NAME))
}
