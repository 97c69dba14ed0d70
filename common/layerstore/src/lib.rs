// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! On-disk layout and chain resolution for immutable, content-addressed
//! filesystem layers.
//!
//! A layer lives at `<root>/<id>/` with an empty `diff/` and `work/`, a
//! `lower` file holding its parent chain, a `link` file holding its short
//! id, and (once built) a `meta` file. A short-id symlink farm lives at
//! `<root>/l/<short>` so that overlay mount option strings stay well under
//! the kernel's length limit even for deep chains.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, ensure, Context, Result};

/// Name of the short-id symlink directory, relative to the layer store root.
const LINKS_DIR: &str = "l";

/// Persisted, read-only record of a single layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayerMeta {
    pub id: String,
    /// Parent layer id, or `-` for "no parent".
    pub parent: String,
    pub hash: String,
    pub created_at: i64,
    pub size: u64,
    pub instruction: String,
    pub workdir: String,
}

impl LayerMeta {
    pub fn has_parent(&self) -> bool {
        !self.parent.is_empty() && self.parent != "-"
    }
}

/// Handle onto the layer store rooted at a given directory.
pub struct LayerStore {
    root: PathBuf,
}

impl LayerStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn layer_dir(&self, layer_id: &str) -> PathBuf {
        self.root.join(layer_id)
    }

    fn links_dir(&self) -> PathBuf {
        self.root.join(LINKS_DIR)
    }

    /// Ensures the store's top-level directories exist.
    pub fn ensure_initialized(&self) -> Result<()> {
        fs::create_dir_all(&self.root).with_context(|| format!("mkdir -p {}", self.root.display()))?;
        fs::create_dir_all(self.links_dir())
            .with_context(|| format!("mkdir -p {}", self.links_dir().display()))?;
        Ok(())
    }

    /// A layer is "live" only if it has a directory **and** a committed
    /// `meta` file; a half-built layer with no meta is treated as absent.
    pub fn layer_exists(&self, layer_id: &str) -> bool {
        if layer_id.is_empty() {
            return false;
        }
        self.layer_dir(layer_id).join("meta").is_file()
    }

    /// Creates `<root>/<id>/{diff,work}`, writes `lower` and `link`, and
    /// publishes the short-id symlink. Returns `(diff_dir, work_dir)`.
    ///
    /// The layer is not yet "live" (no `meta`) until [`Self::write_metadata`]
    /// is called; callers must remove the directory on any failure before
    /// that point.
    pub fn create_layer_dirs(&self, layer_id: &str, lower_chain: &str) -> Result<(PathBuf, PathBuf)> {
        let layer_root = self.layer_dir(layer_id);
        fs::create_dir(&layer_root)
            .with_context(|| format!("mkdir {}", layer_root.display()))?;

        let diff_dir = layer_root.join("diff");
        let work_dir = layer_root.join("work");
        fs::create_dir(&diff_dir).with_context(|| format!("mkdir {}", diff_dir.display()))?;
        fs::create_dir(&work_dir).with_context(|| format!("mkdir {}", work_dir.display()))?;

        fs::write(layer_root.join("lower"), format!("{lower_chain}\n"))
            .with_context(|| format!("write {}/lower", layer_root.display()))?;

        let short_id = short_id(layer_id);
        fs::write(layer_root.join("link"), format!("{short_id}\n"))
            .with_context(|| format!("write {}/link", layer_root.display()))?;

        let symlink_path = self.links_dir().join(&short_id);
        let _ = fs::remove_file(&symlink_path);
        std::os::unix::fs::symlink(format!("../{layer_id}/diff"), &symlink_path)
            .with_context(|| format!("symlink {}", symlink_path.display()))?;

        Ok((diff_dir, work_dir))
    }

    /// Removes a layer directory and its short-id symlink (if any), ignoring
    /// a missing layer. Used both to roll back half-built layers and by
    /// `prune`.
    pub fn remove_layer(&self, layer_id: &str) -> Result<()> {
        let layer_root = self.layer_dir(layer_id);
        if let Ok(short) = self.read_short_id(layer_id) {
            let _ = fs::remove_file(self.links_dir().join(short));
        }
        fileutil::remove_dir_all_with_chmod(&layer_root)
            .with_context(|| format!("rm -rf {}", layer_root.display()))
    }

    fn read_short_id(&self, layer_id: &str) -> Result<String> {
        let contents = fs::read_to_string(self.layer_dir(layer_id).join("link"))?;
        Ok(contents.trim_end().to_owned())
    }

    pub fn write_metadata(&self, meta: &LayerMeta) -> Result<()> {
        ensure!(!meta.id.is_empty(), "layer meta must have an id");
        let path = self.layer_dir(&meta.id).join("meta");
        let contents = format!(
            "id={}\nparent={}\nhash={}\ncreated_at={}\nsize={}\ninstruction={}\nworkdir={}\n",
            meta.id, meta.parent, meta.hash, meta.created_at, meta.size, meta.instruction, meta.workdir,
        );
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))
    }

    pub fn read_metadata(&self, layer_id: &str) -> Result<LayerMeta> {
        let path = self.layer_dir(layer_id).join("meta");
        let contents = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;

        let mut meta = LayerMeta {
            id: layer_id.to_owned(),
            ..Default::default()
        };
        for line in contents.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            match key {
                "parent" => meta.parent = value.to_owned(),
                "hash" => meta.hash = value.to_owned(),
                "created_at" => meta.created_at = value.parse().unwrap_or(0),
                "size" => meta.size = value.parse().unwrap_or(0),
                "instruction" => meta.instruction = value.to_owned(),
                "workdir" => meta.workdir = value.to_owned(),
                _ => {}
            }
        }
        Ok(meta)
    }

    /// The mount-chain entry that represents this layer: its short-id
    /// symlink if one was published, else its `diff/` directory directly.
    fn mount_entry(&self, layer_id: &str) -> PathBuf {
        match self.read_short_id(layer_id) {
            Ok(short) => self.links_dir().join(short),
            Err(_) => self.layer_dir(layer_id).join("diff"),
        }
    }

    /// Rewrites one entry of a `lower` chain string: an already-published
    /// `l/<short>` path is passed through, a `<root>/<id>/diff` path is
    /// rewritten to its short-id symlink form (if published), and any other
    /// (foreign) entry is passed through unchanged.
    fn normalize_chain_entry(&self, entry: &str) -> String {
        if entry.starts_with(self.links_dir().to_string_lossy().as_ref()) {
            return entry.to_owned();
        }

        if let Some(layer_id) = self.extract_layer_id_from_diff_entry(entry) {
            return self.mount_entry(&layer_id).to_string_lossy().into_owned();
        }

        entry.to_owned()
    }

    fn extract_layer_id_from_diff_entry(&self, entry: &str) -> Option<String> {
        let prefix = format!("{}/", self.root.display());
        let rest = entry.strip_prefix(&prefix)?;
        let (layer_id, tail) = rest.split_once('/')?;
        if tail != "diff" || layer_id.is_empty() {
            return None;
        }
        Some(layer_id.to_owned())
    }

    fn normalize_chain(&self, chain: &str) -> String {
        chain
            .split(':')
            .filter(|s| !s.is_empty())
            .map(|entry| self.normalize_chain_entry(entry))
            .collect::<Vec<_>>()
            .join(":")
    }

    /// Resolves a top layer id into the full colon-separated lower chain:
    /// the layer's own mount entry first, then the normalized entries of its
    /// recorded `lower` file.
    pub fn layer_chain_from_top(&self, layer_id: &str) -> Result<String> {
        ensure!(self.layer_exists(layer_id), "layer {layer_id} does not exist");

        let entry = self.mount_entry(layer_id);
        let lower_path = self.layer_dir(layer_id).join("lower");
        let lower_line = fs::read_to_string(&lower_path).unwrap_or_default();
        let lower_line = lower_line.trim_end();

        if lower_line.is_empty() {
            return Ok(entry.to_string_lossy().into_owned());
        }

        let normalized = self.normalize_chain(lower_line);
        if normalized.is_empty() {
            return Ok(entry.to_string_lossy().into_owned());
        }

        Ok(format!("{}:{}", entry.display(), normalized))
    }

    /// Lists the ids of every live layer directory directly under the store
    /// root (the `l/` link farm is excluded).
    pub fn list_layer_ids(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let read_dir = match fs::read_dir(&self.root) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(e).context(format!("readdir {}", self.root.display())),
        };

        for entry in read_dir {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name == LINKS_DIR {
                continue;
            }
            if self.layer_exists(&name) {
                ids.push(name.into_owned());
            }
        }
        Ok(ids)
    }

    /// Walks `parent` links starting at `layer_id` until `-` or a missing
    /// layer, returning the visited metadata in walk order (top first).
    pub fn walk_ancestry(&self, layer_id: &str) -> Result<Vec<LayerMeta>> {
        let mut out = Vec::new();
        let mut current = layer_id.to_owned();
        while !current.is_empty() {
            let Ok(meta) = self.read_metadata(&current) else {
                break;
            };
            let parent = meta.parent.clone();
            out.push(meta);
            if parent.is_empty() || parent == "-" {
                break;
            }
            current = parent;
        }
        Ok(out)
    }
}

/// Derives the short-id token from a layer id: its first 26 non-`-` bytes.
fn short_id(layer_id: &str) -> String {
    layer_id.chars().filter(|&c| c != '-').take(26).collect()
}

/// Splits a chain string into its component entries, rejecting an empty
/// chain (callers always have at least one lower entry to mount against).
pub fn split_chain(chain: &str) -> Result<Vec<&str>> {
    let entries: Vec<&str> = chain.split(':').filter(|s| !s.is_empty()).collect();
    if entries.is_empty() {
        bail!("lower chain is empty");
    }
    Ok(entries)
}
