// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Mapping from `name:tag` image references to a top layer and default
//! command.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, ensure, Context, Result};
use layerstore::LayerStore;

/// A parsed `name:tag` reference. `tag` defaults to `latest` when absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub name: String,
    pub tag: String,
}

impl ImageRef {
    pub fn display(&self) -> String {
        format!("{}:{}", self.name, self.tag)
    }
}

/// Splits `ref` on the last `:` that is not preceded by a `/`, so that a
/// registry-style host:port prefix doesn't get mistaken for a tag
/// separator. Missing tag defaults to `latest`.
pub fn parse_image_ref(reference: &str) -> Result<ImageRef> {
    ensure!(!reference.is_empty(), "empty image reference");

    let last_colon = reference.rfind(':');
    let last_slash = reference.rfind('/');

    let tag_at = match (last_colon, last_slash) {
        (Some(c), Some(s)) if c > s => Some(c),
        (Some(c), None) => Some(c),
        _ => None,
    };

    if let Some(at) = tag_at {
        let name = &reference[..at];
        let tag = &reference[at + 1..];
        ensure!(!name.is_empty(), "image reference {reference:?} has an empty name");
        ensure!(!tag.is_empty(), "image reference {reference:?} has an empty tag");
        return Ok(ImageRef {
            name: name.to_owned(),
            tag: tag.to_owned(),
        });
    }

    Ok(ImageRef {
        name: reference.to_owned(),
        tag: "latest".to_owned(),
    })
}

/// Replaces every byte outside `[A-Za-z0-9._-]` with `_`. Lossy: two distinct
/// references can map to the same sanitized component, in which case the
/// later save silently overwrites the earlier one's metadata file.
fn sanitize_component(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '_' })
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageMeta {
    pub name: String,
    pub tag: String,
    pub reference: String,
    pub top_layer: String,
    pub created_at: String,
    pub cmd: String,
}

pub struct ImageStore {
    root: PathBuf,
}

impl ImageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn ensure_initialized(&self) -> Result<()> {
        fs::create_dir_all(&self.root).with_context(|| format!("mkdir -p {}", self.root.display()))
    }

    fn meta_path(&self, image_ref: &ImageRef) -> PathBuf {
        self.root.join(format!(
            "{}__{}.meta",
            sanitize_component(&image_ref.name),
            sanitize_component(&image_ref.tag)
        ))
    }

    /// Writes `name, tag, ref, top_layer, created_at, cmd`. `created_at`
    /// defaults to the current epoch seconds if empty.
    pub fn save(&self, meta: &ImageMeta) -> Result<()> {
        let image_ref = ImageRef {
            name: meta.name.clone(),
            tag: meta.tag.clone(),
        };
        let created_at = if meta.created_at.is_empty() {
            epoch_seconds_now().to_string()
        } else {
            meta.created_at.clone()
        };

        let path = self.meta_path(&image_ref);
        let contents = format!(
            "name={}\ntag={}\nref={}\ntop_layer={}\ncreated_at={}\ncmd={}\n",
            meta.name, meta.tag, image_ref.display(), meta.top_layer, created_at, meta.cmd,
        );
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))
    }

    pub fn load(&self, image_ref: &ImageRef) -> Result<ImageMeta> {
        self.load_from_path(&self.meta_path(image_ref))
    }

    fn load_from_path(&self, path: &Path) -> Result<ImageMeta> {
        let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let mut meta = ImageMeta::default();
        for line in contents.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            match key {
                "name" => meta.name = value.to_owned(),
                "tag" => meta.tag = value.to_owned(),
                "ref" => meta.reference = value.to_owned(),
                "top_layer" => meta.top_layer = value.to_owned(),
                "created_at" => meta.created_at = value.to_owned(),
                "cmd" => meta.cmd = value.to_owned(),
                _ => {}
            }
        }
        Ok(meta)
    }

    pub fn exists(&self, image_ref: &ImageRef) -> bool {
        self.meta_path(image_ref).is_file()
    }

    /// Enumerates every `*.meta` file in the store.
    pub fn list(&self) -> Result<Vec<ImageMeta>> {
        let mut images = Vec::new();
        let read_dir = match fs::read_dir(&self.root) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(images),
            Err(e) => return Err(e).context(format!("readdir {}", self.root.display())),
        };

        for entry in read_dir {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.ends_with(".meta") {
                continue;
            }
            if let Ok(meta) = self.load_from_path(&entry.path()) {
                images.push(meta);
            }
        }
        Ok(images)
    }

    /// Resolves `ref`'s chain through the layer store, for use as a build's
    /// `FROM` source.
    pub fn resolve_chain(&self, image_ref: &ImageRef, layers: &LayerStore) -> Result<String> {
        let meta = self.load(image_ref)?;
        ensure!(!meta.top_layer.is_empty(), "image {} has no top layer", image_ref.display());
        layers.layer_chain_from_top(&meta.top_layer)
    }

    pub fn remove(&self, image_ref: &ImageRef) -> Result<()> {
        let path = self.meta_path(image_ref);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                bail!("image not found: {}", image_ref.display())
            }
            Err(e) => Err(e).context(format!("rm {}", path.display())),
        }
    }
}

fn epoch_seconds_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Formats an age in seconds as `<N>s|m|h|d`, selecting the largest unit
/// whose integer component is non-zero.
pub fn format_age(created_at: i64, now: i64) -> String {
    let delta = (now - created_at).max(0);
    if delta < 60 {
        format!("{delta}s")
    } else if delta < 3600 {
        format!("{}m", delta / 60)
    } else if delta < 86400 {
        format!("{}h", delta / 3600)
    } else {
        format!("{}d", delta / 86400)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ref_defaults_tag() -> Result<()> {
        assert_eq!(parse_image_ref("demo")?, ImageRef { name: "demo".into(), tag: "latest".into() });
        Ok(())
    }

    #[test]
    fn parse_ref_splits_on_last_colon_not_before_slash() -> Result<()> {
        let r = parse_image_ref("registry.example.com:5000/demo:v2")?;
        assert_eq!(r.name, "registry.example.com:5000/demo");
        assert_eq!(r.tag, "v2");
        Ok(())
    }

    #[test]
    fn parse_ref_rejects_empty_tag() {
        assert!(parse_image_ref("demo:").is_err());
    }

    #[test]
    fn roundtrip_via_display() -> Result<()> {
        let r = parse_image_ref("demo:latest")?;
        assert_eq!(r.display(), "demo:latest");
        Ok(())
    }

    #[test]
    fn save_and_load_roundtrip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = ImageStore::new(dir.path());
        store.ensure_initialized()?;

        let meta = ImageMeta {
            name: "demo".into(),
            tag: "latest".into(),
            reference: "demo:latest".into(),
            top_layer: "abc123".into(),
            created_at: "1000".into(),
            cmd: "/bin/sh".into(),
        };
        store.save(&meta)?;

        let image_ref = ImageRef { name: "demo".into(), tag: "latest".into() };
        assert!(store.exists(&image_ref));
        let loaded = store.load(&image_ref)?;
        assert_eq!(loaded, meta);
        Ok(())
    }

    #[test]
    fn remove_missing_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::new(dir.path());
        let image_ref = ImageRef { name: "nope".into(), tag: "latest".into() };
        assert!(store.remove(&image_ref).is_err());
    }

    #[test]
    fn format_age_picks_largest_nonzero_unit() {
        assert_eq!(format_age(100, 130), "30s");
        assert_eq!(format_age(0, 125), "2m");
        assert_eq!(format_age(0, 7300), "2h");
        assert_eq!(format_age(0, 172_800), "2d");
    }
}
