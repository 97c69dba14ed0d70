// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Maps a build state hash to the layer id that already realizes it.
//!
//! There is no explicit invalidation: a cache entry whose layer has since
//! been pruned is simply treated as a miss, and can itself be swept later.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use layerstore::LayerStore;

pub struct BuildCache {
    root: PathBuf,
}

impl BuildCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn ensure_initialized(&self) -> Result<()> {
        fs::create_dir_all(&self.root).with_context(|| format!("mkdir -p {}", self.root.display()))
    }

    fn entry_path(&self, hash: &str) -> PathBuf {
        self.root.join(hash)
    }

    pub fn register(&self, hash: &str, layer_id: &str) -> Result<()> {
        let path = self.entry_path(hash);
        fs::write(&path, format!("{layer_id}\n")).with_context(|| format!("write {}", path.display()))
    }

    /// Returns the cached layer id for `hash`, or `None` if there is no
    /// entry, the entry is unreadable, or the layer it names no longer
    /// exists.
    pub fn lookup(&self, hash: &str, layers: &LayerStore) -> Option<String> {
        let contents = fs::read_to_string(self.entry_path(hash)).ok()?;
        let layer_id = contents.trim_end().to_owned();
        if layer_id.is_empty() || !layers.layer_exists(&layer_id) {
            return None;
        }
        Some(layer_id)
    }

    /// Removes every cache entry whose layer no longer exists. Used by
    /// `prune` after it removes unreferenced layers.
    pub fn sweep_stale(&self, layers: &LayerStore) -> Result<usize> {
        let mut removed = 0;
        let read_dir = match fs::read_dir(&self.root) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e).context(format!("readdir {}", self.root.display())),
        };

        for entry in read_dir {
            let entry = entry?;
            let path = entry.path();
            let layer_id = fs::read_to_string(&path).unwrap_or_default();
            let layer_id = layer_id.trim_end();
            if layer_id.is_empty() || !layers.layer_exists(layer_id) {
                let _ = fs::remove_file(&path);
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_stores() -> (tempfile::TempDir, BuildCache, LayerStore) {
        let dir = tempfile::tempdir().unwrap();
        let cache = BuildCache::new(dir.path().join("cache"));
        cache.ensure_initialized().unwrap();
        let layers = LayerStore::new(dir.path().join("layers"));
        layers.ensure_initialized().unwrap();
        (dir, cache, layers)
    }

    #[test]
    fn register_then_lookup_hits() -> Result<()> {
        let (_dir, cache, layers) = new_stores();
        layers.create_layer_dirs("layer-1", "")?;
        layers.write_metadata(&layerstore::LayerMeta {
            id: "layer-1".into(),
            parent: "-".into(),
            hash: "hash1".into(),
            created_at: 0,
            size: 0,
            instruction: "NOOP".into(),
            workdir: "/".into(),
        })?;

        cache.register("hash1", "layer-1")?;
        assert_eq!(cache.lookup("hash1", &layers), Some("layer-1".into()));
        Ok(())
    }

    #[test]
    fn stale_entry_is_a_miss() -> Result<()> {
        let (_dir, cache, layers) = new_stores();
        cache.register("hash-stale", "no-such-layer")?;
        assert_eq!(cache.lookup("hash-stale", &layers), None);
        Ok(())
    }

    #[test]
    fn unregistered_hash_is_a_miss() {
        let (_dir, cache, layers) = new_stores();
        assert_eq!(cache.lookup("unknown", &layers), None);
    }

    #[test]
    fn sweep_removes_only_stale_entries() -> Result<()> {
        let (_dir, cache, layers) = new_stores();
        layers.create_layer_dirs("live", "")?;
        layers.write_metadata(&layerstore::LayerMeta {
            id: "live".into(),
            parent: "-".into(),
            hash: "live-hash".into(),
            created_at: 0,
            size: 0,
            instruction: "NOOP".into(),
            workdir: "/".into(),
        })?;
        cache.register("live-hash", "live")?;
        cache.register("dead-hash", "dead")?;

        let removed = cache.sweep_stale(&layers)?;
        assert_eq!(removed, 1);
        assert!(cache.lookup("live-hash", &layers).is_some());
        Ok(())
    }
}
