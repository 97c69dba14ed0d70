// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Resolves a `FROM` reference into an overlay lower chain, whether it
//! names our own image store or an external container runtime's image.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use imagestore::{parse_image_ref, ImageStore};
use layerstore::LayerStore;

/// The core never talks to a specific container runtime directly; it asks
/// this capability for the on-disk upper directory backing a `name[:tag]`
/// reference it could not find in its own image store.
pub trait ExternalRuntime {
    /// Returns the upper (diff) directory for `reference`, or `None` if the
    /// runtime has no such image.
    fn resolve_image_upper_dir(&self, reference: &str) -> Result<Option<PathBuf>>;
}

/// An [`ExternalRuntime`] that never finds anything, for builds that don't
/// need interop with another runtime's image store.
pub struct NoExternalRuntime;

impl ExternalRuntime for NoExternalRuntime {
    fn resolve_image_upper_dir(&self, _reference: &str) -> Result<Option<PathBuf>> {
        Ok(None)
    }
}

/// Resolves `reference` into a colon-separated overlay lower chain.
///
/// - An absolute path containing `:` is already a formed chain, returned
///   verbatim.
/// - An absolute path without `:` is treated as an external runtime's upper
///   directory; [`chain_from_upper_dir`] reads its sibling `lower` file, or
///   falls back to the path alone.
/// - Anything else is a `name[:tag]` reference: our own image store is
///   tried first, then `runtime`.
pub fn resolve_base_chain(reference: &str, images: &ImageStore, layers: &LayerStore, runtime: &dyn ExternalRuntime) -> Result<String> {
    if reference.starts_with('/') {
        if reference.contains(':') {
            return Ok(reference.to_owned());
        }
        return chain_from_upper_dir(Path::new(reference));
    }

    let image_ref = parse_image_ref(reference)?;
    if let Ok(chain) = images.resolve_chain(&image_ref, layers) {
        return Ok(chain);
    }

    match runtime.resolve_image_upper_dir(reference)? {
        Some(upper) => chain_from_upper_dir(&upper),
        None => bail!("cannot resolve FROM reference: {reference}"),
    }
}

/// Builds a chain from an external upper directory `U`: strips a trailing
/// `/diff` to get `O`, reads `O/lower` (colon-separated entries relative to
/// `O`'s parent), and emits `U` followed by each resolved entry. If `O/lower`
/// is absent or empty, emits just `U`.
pub fn chain_from_upper_dir(upper: &Path) -> Result<String> {
    let upper_str = upper.to_string_lossy().into_owned();
    let owner = upper_str.strip_suffix("/diff").unwrap_or(&upper_str);
    let owner_parent = match Path::new(owner).parent() {
        Some(p) => p,
        None => return Ok(upper_str),
    };

    let lower_path = Path::new(owner).join("lower");
    let Ok(raw) = fs::read_to_string(&lower_path) else {
        return Ok(upper_str);
    };
    let raw = raw.trim_end();
    if raw.is_empty() {
        return Ok(upper_str);
    }

    let mut entries = vec![upper_str.clone()];
    for token in raw.split(':').filter(|s| !s.is_empty()) {
        entries.push(owner_parent.join(token).to_string_lossy().into_owned());
    }
    Ok(entries.join(":"))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubRuntime(Option<PathBuf>);
    impl ExternalRuntime for StubRuntime {
        fn resolve_image_upper_dir(&self, _reference: &str) -> Result<Option<PathBuf>> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn absolute_chain_with_colon_passes_through() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let images = ImageStore::new(dir.path().join("images"));
        let layers = LayerStore::new(dir.path().join("layers"));
        let chain = resolve_base_chain("/a:/b", &images, &layers, &NoExternalRuntime)?;
        assert_eq!(chain, "/a:/b");
        Ok(())
    }

    #[test]
    fn absolute_path_without_lower_file_is_single_entry() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let base = dir.path().join("base");
        fs::create_dir(&base)?;
        let images = ImageStore::new(dir.path().join("images"));
        let layers = LayerStore::new(dir.path().join("layers"));

        let chain = resolve_base_chain(&base.to_string_lossy(), &images, &layers, &NoExternalRuntime)?;
        assert_eq!(chain, base.to_string_lossy());
        Ok(())
    }

    #[test]
    fn chain_from_upper_dir_reads_sibling_lower_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let owner = dir.path().join("container1");
        fs::create_dir(&owner)?;
        let upper = owner.join("diff");
        fs::create_dir(&upper)?;
        fs::write(owner.join("lower"), "other/diff\n")?;
        fs::create_dir_all(dir.path().join("other/diff"))?;

        let chain = chain_from_upper_dir(&upper)?;
        let parts: Vec<_> = chain.split(':').collect();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0], upper.to_string_lossy());
        assert!(parts[1].ends_with("other/diff"));
        Ok(())
    }

    #[test]
    fn name_ref_falls_back_to_external_runtime() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let upper = dir.path().join("ext/diff");
        fs::create_dir_all(&upper)?;
        let images = ImageStore::new(dir.path().join("images"));
        let layers = LayerStore::new(dir.path().join("layers"));
        images.ensure_initialized()?;
        layers.ensure_initialized()?;

        let runtime = StubRuntime(Some(upper.clone()));
        let chain = resolve_base_chain("some-image:latest", &images, &layers, &runtime)?;
        assert_eq!(chain, upper.to_string_lossy());
        Ok(())
    }

    #[test]
    fn unresolvable_name_ref_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let images = ImageStore::new(dir.path().join("images"));
        let layers = LayerStore::new(dir.path().join("layers"));
        assert!(resolve_base_chain("nope:latest", &images, &layers, &NoExternalRuntime).is_err());
    }
}
