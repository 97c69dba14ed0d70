// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-instruction cache-key descriptors and the filesystem effect each
//! instruction has once a layer is actually being built.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use fileutil::{hash_path_recursive, normalize_container_path, SafeTempDir};
use layerstore::LayerStore;
use overlaymount::MountGuard;

use crate::error::{BuildError, Result};
use crate::stage::StageCtx;

/// Fetches the remote resource named by an `ADD <url> <dst>` instruction.
/// Abstracted so tests don't need network access.
pub trait UrlFetcher {
    fn fetch(&self, url: &str, dst: &Path) -> anyhow::Result<()>;
}

/// Default fetcher: shells out to `curl -fsSL -o <dst> <url>`.
pub struct CurlFetcher;

impl UrlFetcher for CurlFetcher {
    fn fetch(&self, url: &str, dst: &Path) -> anyhow::Result<()> {
        processes::run_and_check(Command::new("curl").arg("-fsSL").arg("-o").arg(dst).arg(url))
    }
}

/// One buildfile instruction, already token-parsed and argument-substituted,
/// ready to be hashed into a cache key and applied to a mounted layer.
#[derive(Debug, Clone)]
pub enum Instruction {
    Run { command: String },
    Workdir { path: String },
    CopyFromContext { src: String, dst: String },
    CopyFromStage { stage_index: usize, from_token: String, src: String, dst: String },
    AddUrl { url: String, dst: String },
    AddFromContext { src: String, dst: String },
    /// Placeholder layer for a stage that would otherwise produce none.
    Noop,
}

impl Instruction {
    /// Human-readable text, used both for `LayerMeta::instruction` and the
    /// `[CACHE HIT]`/`[BUILT]` progress lines.
    pub fn display(&self) -> String {
        match self {
            Instruction::Run { command } => format!("RUN {command}"),
            Instruction::Workdir { path } => format!("WORKDIR {path}"),
            Instruction::CopyFromContext { src, dst } => format!("COPY {src} {dst}"),
            Instruction::CopyFromStage { from_token, src, dst, .. } => {
                format!("COPY --from={from_token} {src} {dst}")
            }
            Instruction::AddUrl { url, dst } => format!("ADD {url} {dst}"),
            Instruction::AddFromContext { src, dst } => format!("ADD {src} {dst}"),
            Instruction::Noop => "NOOP".to_owned(),
        }
    }

    /// Builds the descriptor string folded into the stage's running state
    /// hash. Its exact shape is a cache key, not user-facing text, but stays
    /// stable across runs so identical instructions land on the same hash.
    pub fn descriptor(&self, stage: &StageCtx, stages: &[StageCtx], context_dir: &Path) -> Result<String> {
        Ok(match self {
            Instruction::Run { command } => format!("RUN|wd={}|cmd={command}", stage.workdir),
            Instruction::Workdir { path } => {
                format!("WORKDIR|path={}", normalize_container_path(&stage.workdir, path))
            }
            Instruction::CopyFromContext { src, dst } => {
                let host_src = context_dir.join(src);
                let src_hash = hash_context_source(&host_src)?;
                format!(
                    "COPY|src={}|src_hash={src_hash}|dst={}",
                    host_src.display(),
                    normalize_container_path(&stage.workdir, dst),
                )
            }
            Instruction::CopyFromStage { stage_index, from_token, src, dst } => {
                let source_stage = stages.get(*stage_index).ok_or_else(|| {
                    BuildError::Resolve(format!("--from stage index {stage_index} out of range"))
                })?;
                format!(
                    "COPY|from={from_token}|src={src}|src_state={}|dst={}",
                    source_stage.state_hash,
                    normalize_container_path(&stage.workdir, dst),
                )
            }
            Instruction::AddUrl { url, dst } => {
                format!("ADD|url={url}|dst={}", normalize_container_path(&stage.workdir, dst))
            }
            Instruction::AddFromContext { src, dst } => {
                let host_src = context_dir.join(src);
                let src_hash = hash_context_source(&host_src)?;
                format!(
                    "ADD|src={}|src_hash={src_hash}|dst={}",
                    host_src.display(),
                    normalize_container_path(&stage.workdir, dst),
                )
            }
            Instruction::Noop => "NOOP|final-stage".to_owned(),
        })
    }

    /// Applies this instruction's filesystem effect under the mounted
    /// overlay merge directory `merged`.
    pub fn apply(
        &self,
        merged: &Path,
        stage: &StageCtx,
        stages: &[StageCtx],
        layers: &LayerStore,
        context_dir: &Path,
        url_fetcher: &dyn UrlFetcher,
    ) -> Result<()> {
        match self {
            Instruction::Run { command } => run_in_chroot(merged, &stage.workdir, command),
            Instruction::Workdir { path } => {
                let normalized = normalize_container_path(&stage.workdir, path);
                let target = join_container_path(merged, &normalized);
                std::fs::create_dir_all(&target)
                    .map_err(|e| BuildError::Mount(format!("mkdir -p {}: {e}", target.display())))?;
                std::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o755))
                    .map_err(|e| BuildError::Mount(format!("chmod 0755 {}: {e}", target.display())))
            }
            Instruction::CopyFromContext { src, dst } => {
                let host_src = context_dir.join(src);
                copy_into_rootfs(&host_src, merged, &stage.workdir, src, dst)
            }
            Instruction::CopyFromStage { stage_index, src, dst, .. } => {
                let source_stage = stages.get(*stage_index).ok_or_else(|| {
                    BuildError::Resolve(format!("--from stage index {stage_index} out of range"))
                })?;
                let chain = source_stage.current_chain(layers)?;
                let snapshot = with_stage_snapshot(&chain)?;
                let host_src = join_container_path(snapshot.path(), &normalize_container_path("/", src));
                copy_into_rootfs(&host_src, merged, &stage.workdir, src, dst)
            }
            Instruction::AddUrl { url, dst } => {
                let scratch = SafeTempDir::new().map_err(BuildError::Other)?;
                let download_name = url.rsplit('/').next().filter(|s| !s.is_empty()).unwrap_or("download");
                let downloaded = scratch.path().join(download_name);
                url_fetcher
                    .fetch(url, &downloaded)
                    .map_err(|e| BuildError::Child(format!("fetching {url}: {e}")))?;
                copy_into_rootfs(&downloaded, merged, &stage.workdir, download_name, dst)
            }
            Instruction::AddFromContext { src, dst } => {
                let host_src = context_dir.join(src);
                copy_into_rootfs(&host_src, merged, &stage.workdir, src, dst)
            }
            Instruction::Noop => Ok(()),
        }
    }
}

fn hash_context_source(host_src: &Path) -> Result<String> {
    hash_path_recursive(host_src)
        .map_err(|e| BuildError::Other(e.context(format!("hashing build context source {}", host_src.display()))))
}

/// Joins a container-absolute path onto a mounted root, dropping its leading
/// `/` so it lands under `root` rather than replacing it.
fn join_container_path(root: &Path, container_path: &str) -> PathBuf {
    root.join(container_path.trim_start_matches('/'))
}

/// Copies `host_src` into `merged` at the container path obtained by
/// resolving `dst` against `workdir`, preserving `raw_dst`'s trailing-slash
/// "copy into this directory" semantics across normalization.
fn copy_into_rootfs(host_src: &Path, merged: &Path, workdir: &str, _raw_src: &str, raw_dst: &str) -> Result<()> {
    let normalized = normalize_container_path(workdir, raw_dst);
    let mut target = join_container_path(merged, &normalized).to_string_lossy().into_owned();
    if raw_dst.ends_with('/') && !target.ends_with('/') {
        target.push('/');
    }
    fileutil::copy_path_recursive(host_src, Path::new(&target))
        .map_err(|e| BuildError::Other(e.context(format!("copying {} to {}", host_src.display(), target))))
}

/// Runs `/bin/sh -c <command>` chrooted into `merged`, starting in `workdir`.
fn run_in_chroot(merged: &Path, workdir: &str, command: &str) -> Result<()> {
    let sh_path = merged.join("bin/sh");
    let sh_meta = std::fs::metadata(&sh_path)
        .map_err(|_| BuildError::Child(format!("{} not found in layer rootfs", sh_path.display())))?;
    if !sh_meta.is_file() || sh_meta.permissions().mode() & 0o111 == 0 {
        return Err(BuildError::Child(format!("{} is not executable", sh_path.display())));
    }

    let host_workdir = join_container_path(merged, workdir);
    std::fs::create_dir_all(&host_workdir)
        .map_err(|e| BuildError::Mount(format!("mkdir -p {}: {e}", host_workdir.display())))?;

    let root = merged.to_path_buf();
    let chroot_workdir = workdir.trim_start_matches('/').to_owned();

    let mut cmd = Command::new("/bin/sh");
    cmd.arg("-c").arg(command);
    unsafe {
        use std::os::unix::process::CommandExt;
        cmd.pre_exec(move || {
            nix::unistd::chroot(&root).map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
            std::env::set_current_dir(format!("/{chroot_workdir}"))?;
            Ok(())
        });
    }

    processes::run_and_check(&mut cmd).map_err(|e| BuildError::Child(e.to_string()))
}

/// An overlay mount of a stage's current chain onto a scratch merge
/// directory with an empty upper, used to read a prior stage's output for
/// `COPY --from=`. Unmounts, then removes its temp directory, on drop.
pub struct StageSnapshot {
    merged: PathBuf,
    _mount: MountGuard,
    _temp: SafeTempDir,
}

impl StageSnapshot {
    pub fn path(&self) -> &Path {
        &self.merged
    }
}

pub fn with_stage_snapshot(chain: &str) -> Result<StageSnapshot> {
    let temp = SafeTempDir::new().map_err(BuildError::Other)?;
    let merged = temp.path().join("merged");
    let upper = temp.path().join("upper");
    let work = temp.path().join("work");
    for dir in [&merged, &upper, &work] {
        std::fs::create_dir(dir).map_err(|e| BuildError::Mount(format!("mkdir {}: {e}", dir.display())))?;
    }

    let mount = overlaymount::mount_overlayfs(&merged, chain, &upper, &work)
        .map_err(|e| BuildError::Mount(format!("mounting stage snapshot: {e}")))?;

    Ok(StageSnapshot {
        merged,
        _mount: mount,
        _temp: temp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage_with(state_hash: &str) -> StageCtx {
        let mut stage = StageCtx::new(None, "/".to_owned(), buildfile::ArgMap::new());
        stage.state_hash = state_hash.to_owned();
        stage
    }

    #[test]
    fn run_descriptor_includes_workdir_and_command() -> Result<()> {
        let mut stage = stage_with("x");
        stage.workdir = "/app".to_owned();
        let instr = Instruction::Run { command: "echo hi".to_owned() };
        let descriptor = instr.descriptor(&stage, &[], Path::new("/ctx"))?;
        assert_eq!(descriptor, "RUN|wd=/app|cmd=echo hi");
        Ok(())
    }

    #[test]
    fn workdir_descriptor_normalizes_relative_path() -> Result<()> {
        let mut stage = stage_with("x");
        stage.workdir = "/app".to_owned();
        let instr = Instruction::Workdir { path: "sub".to_owned() };
        let descriptor = instr.descriptor(&stage, &[], Path::new("/ctx"))?;
        assert_eq!(descriptor, "WORKDIR|path=/app/sub");
        Ok(())
    }

    #[test]
    fn copy_from_context_descriptor_hashes_source_contents() -> Result<()> {
        let ctx_dir = tempfile::tempdir().unwrap();
        std::fs::write(ctx_dir.path().join("a.txt"), b"hello").unwrap();

        let stage = stage_with("x");
        let instr = Instruction::CopyFromContext { src: "a.txt".to_owned(), dst: "/a.txt".to_owned() };
        let descriptor = instr.descriptor(&stage, &[], ctx_dir.path())?;
        assert!(descriptor.starts_with("COPY|src="));
        assert!(descriptor.contains("src_hash="));
        Ok(())
    }

    #[test]
    fn copy_from_stage_descriptor_uses_source_stage_state() -> Result<()> {
        let stage = stage_with("current");
        let source_stage = stage_with("source-state");
        let instr = Instruction::CopyFromStage {
            stage_index: 0,
            from_token: "builder".to_owned(),
            src: "/out".to_owned(),
            dst: "/in".to_owned(),
        };
        let descriptor = instr.descriptor(&stage, std::slice::from_ref(&source_stage), Path::new("/ctx"))?;
        assert!(descriptor.contains("from=builder"));
        assert!(descriptor.contains("src_state=source-state"));
        Ok(())
    }

    #[test]
    fn copy_from_stage_descriptor_changes_when_alias_renamed_for_same_index() -> Result<()> {
        let stage = stage_with("current");
        let source_stage = stage_with("source-state");
        let by_alias = Instruction::CopyFromStage {
            stage_index: 0,
            from_token: "builder".to_owned(),
            src: "/out".to_owned(),
            dst: "/in".to_owned(),
        };
        let by_other_alias = Instruction::CopyFromStage {
            stage_index: 0,
            from_token: "compiler".to_owned(),
            src: "/out".to_owned(),
            dst: "/in".to_owned(),
        };
        let stages = std::slice::from_ref(&source_stage);
        let d1 = by_alias.descriptor(&stage, stages, Path::new("/ctx"))?;
        let d2 = by_other_alias.descriptor(&stage, stages, Path::new("/ctx"))?;
        assert_ne!(d1, d2);
        Ok(())
    }

    #[test]
    fn copy_from_stage_out_of_range_is_a_resolve_error() {
        let stage = stage_with("current");
        let instr = Instruction::CopyFromStage {
            stage_index: 5,
            from_token: "5".to_owned(),
            src: "/a".to_owned(),
            dst: "/b".to_owned(),
        };
        let err = instr.descriptor(&stage, &[], Path::new("/ctx")).unwrap_err();
        assert!(matches!(err, BuildError::Resolve(_)));
    }
}
