// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::os::unix::fs::MetadataExt;
use std::path::Path;

use anyhow::{Context, Result};

const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

/// A streaming FNV-1a-style 64-bit fold.
///
/// This is not cryptographically strong; it exists only to key a local build
/// cache. Values are rendered as 16 lowercase hex characters.
pub struct Hasher {
    state: u64,
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

impl Hasher {
    pub fn new() -> Self {
        Self {
            state: FNV_OFFSET_BASIS,
        }
    }

    pub fn fold(&mut self, bytes: &[u8]) -> &mut Self {
        for &byte in bytes {
            self.state ^= byte as u64;
            self.state = self.state.wrapping_mul(FNV_PRIME);
        }
        self
    }

    pub fn finish_hex(&self) -> String {
        format!("{:016x}", self.state)
    }
}

/// Folds the UTF-8 bytes of `s` and renders the result as 16 hex chars.
pub fn hash_string(s: &str) -> String {
    let mut h = Hasher::new();
    h.fold(s.as_bytes());
    h.finish_hex()
}

/// Walks `path` and folds `{kind-marker, relative-path, size, bytes|target}`
/// for each entry in sorted-child order, producing a content hash over the
/// whole tree. File sizes are folded as little-endian `u64` so the result is
/// portable across machines.
pub fn hash_path_recursive(path: &Path) -> Result<String> {
    let mut hasher = Hasher::new();
    fold_entry(&mut hasher, path, Path::new(""))?;
    Ok(hasher.finish_hex())
}

fn fold_entry(hasher: &mut Hasher, root: &Path, relative: &Path) -> Result<()> {
    let full = root.join(relative);
    let metadata = std::fs::symlink_metadata(&full)
        .with_context(|| format!("lstat {}", full.display()))?;
    let rel_str = relative.to_string_lossy();

    if metadata.is_symlink() {
        let target = std::fs::read_link(&full)?;
        hasher.fold(b"L");
        hasher.fold(rel_str.as_bytes());
        hasher.fold(target.to_string_lossy().as_bytes());
    } else if metadata.is_file() {
        let bytes = std::fs::read(&full).with_context(|| format!("read {}", full.display()))?;
        hasher.fold(b"F");
        hasher.fold(rel_str.as_bytes());
        hasher.fold(&(bytes.len() as u64).to_le_bytes());
        hasher.fold(&bytes);
    } else if metadata.is_dir() {
        hasher.fold(b"D");
        hasher.fold(rel_str.as_bytes());

        let mut children: Vec<_> = std::fs::read_dir(&full)?.collect::<std::io::Result<_>>()?;
        children.sort_by_key(|e| e.file_name());
        for child in children {
            fold_entry(hasher, root, &relative.join(child.file_name()))?;
        }
    } else {
        hasher.fold(b"O");
        hasher.fold(rel_str.as_bytes());
        hasher.fold(&metadata.mode().to_le_bytes());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_string_is_deterministic() {
        assert_eq!(hash_string("hello"), hash_string("hello"));
        assert_ne!(hash_string("hello"), hash_string("world"));
    }

    #[test]
    fn hash_string_empty_is_valid() {
        assert_eq!(hash_string("").len(), 16);
    }

    #[test]
    fn identical_trees_hash_equal() -> Result<()> {
        let a = tempfile::tempdir()?;
        let b = tempfile::tempdir()?;
        for root in [a.path(), b.path()] {
            std::fs::create_dir(root.join("sub"))?;
            std::fs::write(root.join("sub/file.txt"), b"same contents")?;
        }

        assert_eq!(hash_path_recursive(a.path())?, hash_path_recursive(b.path())?);
        Ok(())
    }

    #[test]
    fn differing_contents_hash_differently() -> Result<()> {
        let a = tempfile::tempdir()?;
        let b = tempfile::tempdir()?;
        std::fs::write(a.path().join("file.txt"), b"one")?;
        std::fs::write(b.path().join("file.txt"), b"two")?;

        assert_ne!(hash_path_recursive(a.path())?, hash_path_recursive(b.path())?);
        Ok(())
    }

    #[test]
    fn differing_names_hash_differently() -> Result<()> {
        let a = tempfile::tempdir()?;
        let b = tempfile::tempdir()?;
        std::fs::write(a.path().join("one.txt"), b"x")?;
        std::fs::write(b.path().join("two.txt"), b"x")?;

        assert_ne!(hash_path_recursive(a.path())?, hash_path_recursive(b.path())?);
        Ok(())
    }
}
