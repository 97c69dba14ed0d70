// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use buildcache::BuildCache;
use buildengine::{build_image, BuildOptions};
use buildfile::ArgMap;
use imagestore::{format_age, parse_image_ref, ImageStore};
use layerstore::LayerStore;

use crate::docker_runtime::DockerRuntime;
use crate::run_container;

fn open_layers(root: &Path) -> LayerStore {
    LayerStore::new(root.join("layers"))
}

fn open_images(root: &Path) -> ImageStore {
    ImageStore::new(root.join("images"))
}

fn open_cache(root: &Path) -> BuildCache {
    BuildCache::new(root.join("cache"))
}

fn epoch_seconds_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

pub fn build(root: &Path, file: &Path, context: Option<&Path>, tag: &str, build_args: &[String]) -> Result<()> {
    let contents = std::fs::read_to_string(file).with_context(|| format!("reading buildfile {}", file.display()))?;
    let buildfile_dir = file.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));
    let context_dir = context.map(Path::to_path_buf).unwrap_or_else(|| buildfile_dir.clone());

    let mut cli_args = ArgMap::new();
    for spec in build_args {
        let (key, value) = cliutil::split_key_value(spec)?;
        cli_args.set(key, value);
    }

    let layers = open_layers(root);
    let images = open_images(root);
    let cache = open_cache(root);
    let runtime = DockerRuntime;

    let options = BuildOptions::new(buildfile_dir, context_dir, cli_args, tag.to_owned(), &layers, &images, &cache, &runtime);
    let built_ref = build_image(&contents, &options)?;
    println!("Successfully built {built_ref}");
    Ok(())
}

pub fn run(root: &Path, base_dir: Option<&Path>, base_image: Option<&str>, name: &str, command: &str) -> Result<()> {
    let exit_code = match (base_dir, base_image) {
        (Some(dir), None) => run_container::run_container(dir, name, command)?,
        (None, Some(reference)) => {
            let layers = open_layers(root);
            let images = open_images(root);
            let runtime = DockerRuntime;
            let mount = run_container::resolve_container_dir(reference, &images, &layers, &runtime)?;
            run_container::run_container(mount.path(), name, command)?
        }
        (Some(_), Some(_)) => anyhow::bail!("--base-dir and --base-image are mutually exclusive"),
        (None, None) => anyhow::bail!("one of --base-dir or --base-image is required"),
    };

    std::process::exit(exit_code);
}

pub fn history(root: &Path, reference: &str) -> Result<()> {
    let images = open_images(root);
    let layers = open_layers(root);

    let image_ref = parse_image_ref(reference)?;
    let meta = images.load(&image_ref)?;

    println!("{:<40} {:<10} {:<8} INSTRUCTION", "LAYER", "CREATED", "SIZE");
    let now = epoch_seconds_now();
    for layer in layers.walk_ancestry(&meta.top_layer)? {
        println!(
            "{:<40} {:<10} {:<8} {}",
            layer.id,
            format_age(layer.created_at, now),
            layer.size,
            layer.instruction,
        );
    }
    Ok(())
}

pub fn images(root_dir: &Path) -> Result<()> {
    let store = open_images(root_dir);
    let now = epoch_seconds_now();

    println!("{:<24} {:<12} {:<10} COMMAND", "REPOSITORY", "TAG", "CREATED");
    for meta in store.list()? {
        let created_at: i64 = meta.created_at.parse().unwrap_or(0);
        println!(
            "{:<24} {:<12} {:<10} {}",
            meta.name,
            meta.tag,
            format_age(created_at, now),
            meta.cmd,
        );
    }
    Ok(())
}

pub fn rmi(root: &Path, reference: &str) -> Result<()> {
    let image_ref = parse_image_ref(reference)?;
    open_images(root).remove(&image_ref)?;
    println!("Removed {}", image_ref.display());
    Ok(())
}

/// Removes every layer unreferenced by any remaining image (mark-and-sweep
/// over each image's `top_layer` ancestry chain), then sweeps build cache
/// entries that now point at a removed layer.
pub fn prune(root: &Path) -> Result<()> {
    let layers = open_layers(root);
    let images = open_images(root);
    let cache = open_cache(root);

    let mut used: HashSet<String> = HashSet::new();
    for meta in images.list()? {
        if meta.top_layer.is_empty() {
            continue;
        }
        for layer in layers.walk_ancestry(&meta.top_layer)? {
            used.insert(layer.id);
        }
    }

    let mut removed_layers = 0;
    for layer_id in layers.list_layer_ids()? {
        if !used.contains(&layer_id) {
            layers.remove_layer(&layer_id)?;
            removed_layers += 1;
        }
    }

    let removed_cache_entries = cache.sweep_stale(&layers)?;
    println!("Removed {removed_layers} layer(s), {removed_cache_entries} stale cache entr(y/ies)");
    Ok(())
}
