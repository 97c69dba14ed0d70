// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fs::Permissions;
use std::os::unix::fs::{symlink, MetadataExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};

/// Normalizes a path used inside a container's root file system.
///
/// Relative inputs are joined to `workdir` (`/` if empty). `.` components are
/// dropped and `..` pops the last pushed component; `..` at the root is a
/// no-op. The result always starts with `/`.
pub fn normalize_container_path(workdir: &str, path: &str) -> String {
    let base = if workdir.is_empty() { "/" } else { workdir };
    let joined = if path.starts_with('/') {
        PathBuf::from(path)
    } else {
        PathBuf::from(base).join(path)
    };

    let mut stack: Vec<String> = Vec::new();
    for component in joined.components() {
        match component {
            Component::RootDir | Component::Prefix(_) => {}
            Component::CurDir => {}
            Component::ParentDir => {
                stack.pop();
            }
            Component::Normal(part) => {
                stack.push(part.to_string_lossy().into_owned());
            }
        }
    }

    format!("/{}", stack.join("/"))
}

/// Recursively copies `src` into `dst`, preserving symlink targets and the
/// low 9 permission bits of regular files and directories.
///
/// If `dst` ends with `/` or already names a directory, `src` is copied as
/// `dst/basename(src)` instead of directly onto `dst`.
pub fn copy_path_recursive(src: &Path, dst: &Path) -> Result<()> {
    let dst_is_dir_like = dst.as_os_str().to_string_lossy().ends_with('/')
        || matches!(std::fs::metadata(dst), Ok(m) if m.is_dir());

    let real_dst = if dst_is_dir_like {
        let name = src
            .file_name()
            .with_context(|| format!("{} has no file name", src.display()))?;
        std::fs::create_dir_all(dst)
            .with_context(|| format!("mkdir -p {}", dst.display()))?;
        dst.join(name)
    } else {
        dst.to_owned()
    };

    copy_entry(src, &real_dst)
}

fn copy_entry(src: &Path, dst: &Path) -> Result<()> {
    let metadata = std::fs::symlink_metadata(src)
        .with_context(|| format!("lstat {}", src.display()))?;

    if metadata.is_symlink() {
        let target = std::fs::read_link(src)?;
        if dst.symlink_metadata().is_ok() {
            std::fs::remove_file(dst)
                .with_context(|| format!("rm {}", dst.display()))?;
        }
        symlink(&target, dst)
            .with_context(|| format!("ln -s {} {}", target.display(), dst.display()))?;
    } else if metadata.is_dir() {
        std::fs::create_dir_all(dst)
            .with_context(|| format!("mkdir -p {}", dst.display()))?;
        std::fs::set_permissions(dst, Permissions::from_mode(metadata.mode() & 0o777))?;

        let mut entries: Vec<_> = std::fs::read_dir(src)?.collect::<std::io::Result<_>>()?;
        entries.sort_by_key(|e| e.file_name());
        for entry in entries {
            copy_entry(&entry.path(), &dst.join(entry.file_name()))?;
        }
    } else if metadata.is_file() {
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(src, dst)
            .with_context(|| format!("cp {} {}", src.display(), dst.display()))?;
        std::fs::set_permissions(dst, Permissions::from_mode(metadata.mode() & 0o777))?;
    } else {
        anyhow::bail!("unsupported file type for {}", src.display());
    }

    Ok(())
}

/// Returns the aggregate size in bytes of all regular files under `path`.
pub fn dir_size_bytes(path: &Path) -> Result<u64> {
    let mut total: u64 = 0;
    for entry in walkdir::WalkDir::new(path) {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if metadata.is_file() {
            total += metadata.len();
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_absolute() {
        assert_eq!(normalize_container_path("/", "/a/b"), "/a/b");
    }

    #[test]
    fn normalize_relative_to_workdir() {
        assert_eq!(normalize_container_path("/a", "b"), "/a/b");
    }

    #[test]
    fn normalize_dot_dot() {
        assert_eq!(normalize_container_path("/a/b", "../c"), "/a/c");
    }

    #[test]
    fn normalize_chain() {
        let wd = normalize_container_path("/a/", "");
        let wd = normalize_container_path(&wd, "b");
        let wd = normalize_container_path(&wd, "../c");
        assert_eq!(wd, "/a/c");
    }

    #[test]
    fn normalize_dot_dot_above_root_is_noop() {
        assert_eq!(normalize_container_path("/", "../../x"), "/x");
    }

    #[test]
    fn normalize_is_idempotent() {
        let once = normalize_container_path("/a", "b/../c");
        let twice = normalize_container_path("/", &once);
        assert_eq!(once, twice);
    }

    #[test]
    fn copy_file_to_existing_dir_uses_basename() -> Result<()> {
        let src_dir = tempfile::tempdir()?;
        let dst_dir = tempfile::tempdir()?;
        let src_file = src_dir.path().join("a.txt");
        std::fs::write(&src_file, b"hi")?;
        std::fs::create_dir(dst_dir.path().join("out"))?;

        copy_path_recursive(&src_file, &dst_dir.path().join("out"))?;

        assert_eq!(
            std::fs::read_to_string(dst_dir.path().join("out/a.txt"))?,
            "hi"
        );
        Ok(())
    }

    #[test]
    fn copy_file_trailing_slash_uses_basename() -> Result<()> {
        let src_dir = tempfile::tempdir()?;
        let dst_dir = tempfile::tempdir()?;
        let src_file = src_dir.path().join("a.txt");
        std::fs::write(&src_file, b"hi")?;
        let dst_spec = dst_dir.path().join("sub/");

        copy_path_recursive(&src_file, &dst_spec)?;

        assert_eq!(
            std::fs::read_to_string(dst_dir.path().join("sub/a.txt"))?,
            "hi"
        );
        Ok(())
    }

    #[test]
    fn copy_preserves_symlink_target() -> Result<()> {
        let src_dir = tempfile::tempdir()?;
        let dst_dir = tempfile::tempdir()?;
        symlink("/nonexistent/target", src_dir.path().join("link"))?;

        copy_path_recursive(&src_dir.path().join("link"), &dst_dir.path().join("link"))?;

        let target = std::fs::read_link(dst_dir.path().join("link"))?;
        assert_eq!(target, PathBuf::from("/nonexistent/target"));
        Ok(())
    }

    #[test]
    fn copy_merges_existing_directory() -> Result<()> {
        let src_dir = tempfile::tempdir()?;
        let dst_dir = tempfile::tempdir()?;
        std::fs::write(src_dir.path().join("new.txt"), b"new")?;
        std::fs::write(dst_dir.path().join("existing.txt"), b"existing")?;

        copy_path_recursive(src_dir.path(), dst_dir.path())?;

        assert_eq!(
            std::fs::read_to_string(dst_dir.path().join("existing.txt"))?,
            "existing"
        );
        assert_eq!(
            std::fs::read_to_string(dst_dir.path().join("new.txt"))?,
            "new"
        );
        Ok(())
    }
}
