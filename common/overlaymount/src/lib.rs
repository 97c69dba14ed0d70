// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Safe construction and teardown of overlayfs mounts.

mod guard;
mod helper;
mod options;

pub use guard::MountGuard;
pub use options::build_overlay_options;

use std::path::Path;
use std::process::Command;

use anyhow::{ensure, Result};

/// Mounts overlayfs at `mount_dir` using the given `lower_chain` (colon
/// separated, highest-priority entry first, per [`build_overlay_options`]),
/// `upper_dir`, and `work_dir`.
///
/// The actual `mount(2)` syscall is delegated to a tiny helper binary so that
/// this process never has to `chdir` to keep the option string short; see
/// [`helper::helper_binary_path`].
pub fn mount_overlayfs(
    mount_dir: &Path,
    lower_chain: &str,
    upper_dir: &Path,
    work_dir: &Path,
) -> Result<MountGuard> {
    let options = build_overlay_options(lower_chain, upper_dir, work_dir)?;

    let helper_path = helper::helper_binary_path()?;
    let status = Command::new(helper_path)
        .arg(&options)
        .arg(mount_dir)
        .status()?;
    ensure!(
        status.success(),
        "overlayfs_mount_helper failed mounting {}: {:?}",
        mount_dir.display(),
        status
    );

    Ok(MountGuard::new(mount_dir))
}
