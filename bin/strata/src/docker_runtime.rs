// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! An [`ExternalRuntime`] backed by the `docker` CLI, for builds and runs
//! that reference an image this store doesn't own.

use std::path::PathBuf;
use std::process::Command;

use anyhow::Result;
use baseresolve::ExternalRuntime;

pub struct DockerRuntime;

impl ExternalRuntime for DockerRuntime {
    fn resolve_image_upper_dir(&self, reference: &str) -> Result<Option<PathBuf>> {
        let output = Command::new("docker")
            .args(["inspect", "--format={{.GraphDriver.Data.UpperDir}}"])
            .arg(reference)
            .output();

        let output = match output {
            Ok(output) => output,
            Err(_) => return Ok(None),
        };
        if !output.status.success() {
            return Ok(None);
        }

        let upper_dir = String::from_utf8_lossy(&output.stdout).trim().to_owned();
        if upper_dir.is_empty() {
            return Ok(None);
        }
        Ok(Some(PathBuf::from(upper_dir)))
    }
}
