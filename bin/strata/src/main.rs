// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! `strata`: builds content-addressed container images from overlay
//! filesystem layers, and runs a base directory or image in a lightweight
//! namespace sandbox.

mod cmd;
mod docker_runtime;
mod run_container;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};

/// Root directory holding the `layers/`, `images/`, and `cache/` store
/// subdirectories, overridable per invocation.
const DEFAULT_ROOT_ENV: &str = "STRATA_ROOT";
const DEFAULT_ROOT: &str = "/var/lib/strata";

#[derive(Parser)]
#[command(name = "strata", about = "Content-addressed overlay image builder")]
struct Cli {
    /// Store root holding layers/, images/, and cache/. Defaults to
    /// $STRATA_ROOT, or /var/lib/strata if unset.
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Builds an image from a buildfile.
    Build {
        /// Path to the buildfile.
        #[arg(long, default_value = "Buildfile")]
        file: PathBuf,
        /// Directory COPY/ADD context paths are resolved against. Defaults
        /// to the buildfile's own directory.
        #[arg(long)]
        context: Option<PathBuf>,
        /// Output image reference, e.g. `demo:latest`.
        #[arg(short = 't', long = "tag")]
        tag: String,
        /// `KEY=VALUE` build argument, repeatable.
        #[arg(long = "build-arg")]
        build_arg: Vec<String>,
    },
    /// Runs a base directory or image in a namespaced sandbox.
    Run {
        /// Host directory to use directly as the container root's upper
        /// directory. Mutually exclusive with `--base-image`.
        #[arg(long)]
        base_dir: Option<PathBuf>,
        /// Our own image store reference, or (if not found there) a
        /// reference resolved via an external container runtime.
        #[arg(long)]
        base_image: Option<String>,
        /// Container hostname.
        #[arg(long, default_value = "strata")]
        name: String,
        /// Command to run, passed to `/bin/sh -c`.
        command: String,
    },
    /// Prints an image's layer history.
    History { reference: String },
    /// Lists known images.
    Images,
    /// Removes an image reference (its layers are reclaimed by `prune`).
    Rmi { reference: String },
    /// Removes layers unreferenced by any image, and stale cache entries.
    Prune,
    /// Reserved for a future "run a command in an existing container" verb.
    Exec,
}

fn main() -> ExitCode {
    cliutil::cli_main(run, cliutil::Config::default())
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let root = cli.root.unwrap_or_else(|| {
        std::env::var_os(DEFAULT_ROOT_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_ROOT))
    });

    match cli.command {
        Command::Build { file, context, tag, build_arg } => cmd::build(&root, &file, context.as_deref(), &tag, &build_arg),
        Command::Run { base_dir, base_image, name, command } => {
            cmd::run(&root, base_dir.as_deref(), base_image.as_deref(), &name, &command)
        }
        Command::History { reference } => cmd::history(&root, &reference),
        Command::Images => cmd::images(&root),
        Command::Rmi { reference } => cmd::rmi(&root, &reference),
        Command::Prune => cmd::prune(&root),
        Command::Exec => anyhow::bail!("exec is reserved and not yet implemented"),
    }
}
