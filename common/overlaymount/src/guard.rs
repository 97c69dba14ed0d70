// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::path::{Path, PathBuf};

use nix::mount::{umount2, MntFlags};
use tracing::warn;

/// Unmounts a mount point on drop. Unmount failures are logged as `[WARN]`
/// rather than escalated, since they must never mask the build error that is
/// already unwinding through the stack.
#[must_use]
pub struct MountGuard {
    dir: Option<PathBuf>,
}

impl MountGuard {
    pub(crate) fn new(dir: &Path) -> Self {
        Self {
            dir: Some(dir.to_path_buf()),
        }
    }
}

impl Drop for MountGuard {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            if let Err(err) = umount2(&dir, MntFlags::MNT_DETACH) {
                warn!("failed to unmount {}: {}", dir.display(), err);
            }
        }
    }
}
