// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Namespace/chroot sandbox backing `strata run`.

use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use baseresolve::{resolve_base_chain, ExternalRuntime};
use imagestore::ImageStore;
use layerstore::LayerStore;
use nix::mount::{mount, MsFlags};
use nix::sched::{unshare, CloneFlags};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{chdir, chroot, fork, sethostname, ForkResult};
use overlaymount::MountGuard;

/// An overlay mount of a resolved `--base-image` chain, torn down on drop.
pub struct ContainerMount {
    merged: PathBuf,
    _mount: MountGuard,
    _temp: fileutil::SafeTempDir,
}

impl ContainerMount {
    pub fn path(&self) -> &Path {
        &self.merged
    }
}

pub fn mount_container_chain(chain: &str) -> Result<ContainerMount> {
    let temp = fileutil::SafeTempDir::new()?;
    let merged = temp.path().join("merged");
    let upper = temp.path().join("upper");
    let work = temp.path().join("work");
    for dir in [&merged, &upper, &work] {
        std::fs::create_dir(dir).with_context(|| format!("mkdir {}", dir.display()))?;
    }

    let mount = overlaymount::mount_overlayfs(&merged, chain, &upper, &work)?;
    Ok(ContainerMount { merged, _mount: mount, _temp: temp })
}

/// Resolves a `--base-image` reference (our own store, or an external
/// runtime) into a mounted overlay ready to chroot into.
pub fn resolve_container_dir(
    reference: &str,
    images: &ImageStore,
    layers: &LayerStore,
    runtime: &dyn ExternalRuntime,
) -> Result<ContainerMount> {
    let chain = resolve_base_chain(reference, images, layers, runtime)?;
    mount_container_chain(&chain)
}

/// Forks a child that unshares PID, mount, UTS, and (when the kernel allows
/// it) time namespaces, chroots into `container_dir`, and execs
/// `/bin/sh -c <command>`. Returns the child's exit code to the caller; the
/// child itself never returns here.
pub fn run_container(container_dir: &Path, hostname: &str, command: &str) -> Result<i32> {
    let full = CloneFlags::CLONE_NEWPID
        | CloneFlags::CLONE_NEWNS
        | CloneFlags::CLONE_NEWUTS
        | CloneFlags::from_bits_retain(nix::libc::CLONE_NEWTIME);
    if let Err(err) = unshare(full) {
        if err != nix::errno::Errno::EINVAL {
            return Err(err).context("unshare");
        }
        tracing::warn!("kernel rejected CLONE_NEWTIME, retrying without it");
        let fallback = CloneFlags::CLONE_NEWPID | CloneFlags::CLONE_NEWNS | CloneFlags::CLONE_NEWUTS;
        unshare(fallback).context("unshare")?;
    }

    match unsafe { fork() }.context("fork")? {
        ForkResult::Parent { child } => match waitpid(child, None).context("waitpid")? {
            WaitStatus::Exited(_, code) => Ok(code),
            WaitStatus::Signaled(_, signal, _) => Ok(128 + signal as i32),
            other => anyhow::bail!("unexpected wait status: {other:?}"),
        },
        ForkResult::Child => {
            if let Err(err) = exec_in_container(container_dir, hostname, command) {
                eprintln!("[ERR] strata run: {err:?}");
                std::process::exit(127);
            }
            unreachable!("exec replaced the child process image");
        }
    }
}

fn exec_in_container(container_dir: &Path, hostname: &str, command: &str) -> Result<()> {
    mount(None::<&str>, "/", None::<&str>, MsFlags::MS_REC | MsFlags::MS_PRIVATE, None::<&str>)
        .context("making / private")?;
    chroot(container_dir).with_context(|| format!("chroot {}", container_dir.display()))?;
    chdir("/").context("chdir /")?;
    mount(Some("proc"), "/proc", Some("proc"), MsFlags::empty(), None::<&str>).context("mount /proc")?;
    sethostname(hostname).context("sethostname")?;

    let err = Command::new("/bin/sh").arg("-c").arg(command).exec();
    Err(err).context("exec /bin/sh")
}
