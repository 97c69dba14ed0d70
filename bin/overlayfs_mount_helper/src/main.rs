// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A tiny helper to mount overlayfs.
//!
//! This exists as a standalone binary, rather than calling `mount(2)`
//! in-process, so that the caller never has to change its own working
//! directory to keep overlay mount option strings short.

use std::{
    ffi::{OsStr, OsString},
    process::ExitCode,
};

use nix::mount::MsFlags;

fn mount_overlayfs(mount_dir: &OsStr, options: &OsStr) -> nix::Result<()> {
    nix::mount::mount(
        Some("overlay"),
        mount_dir,
        Some("overlay"),
        MsFlags::empty(),
        Some(options),
    )
}

fn main() -> ExitCode {
    let args: Vec<OsString> = std::env::args_os().collect();
    if args.len() != 3 {
        eprintln!("overlayfs-mount-helper: [ERR] wrong number of args");
        return ExitCode::FAILURE;
    }

    let options = &args[1];
    let mount_dir = &args[2];

    // Some distributions patch the kernel so "userxattr" becomes the
    // default overlayfs behavior. If the caller didn't specify either way,
    // force "nouserxattr" to get the vanilla kernel's default, falling back
    // to no flag at all if the kernel rejects it.
    if options
        .to_string_lossy()
        .split(',')
        .all(|option| option != "userxattr" && option != "nouserxattr")
    {
        let modified_options = String::from(options.to_string_lossy()) + ",nouserxattr";
        match mount_overlayfs(mount_dir, &OsString::from(modified_options)) {
            Ok(()) => return ExitCode::SUCCESS,
            Err(err) if err == nix::errno::Errno::EINVAL => {
                // Fall through and retry without "nouserxattr".
            }
            Err(err) => {
                eprintln!("overlayfs-mount-helper: [ERR] mount failed: {}", err.desc());
                return ExitCode::FAILURE;
            }
        }
    }

    match mount_overlayfs(mount_dir, options) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("overlayfs-mount-helper: [ERR] mount failed: {}", err.desc());
            ExitCode::FAILURE
        }
    }
}
