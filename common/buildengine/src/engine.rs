// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Drives a buildfile's instructions through [`crate::appliers::Instruction`]
//! and [`create_layer`], publishing the final stage as an image.

use std::path::{Path, PathBuf};

use baseresolve::{resolve_base_chain, ExternalRuntime};
use buildcache::BuildCache;
use buildfile::{
    parse_arg_kv, parse_base_and_alias, parse_copy_tokens, parse_two_tokens, scan_lines, stage_index_by_name,
    substitute_args, ArgMap,
};
use fileutil::dir_size_bytes;
use imagestore::{parse_image_ref, ImageMeta, ImageStore};
use layerstore::{LayerMeta, LayerStore};

use crate::appliers::{with_stage_snapshot, CurlFetcher, Instruction, UrlFetcher};
use crate::error::{BuildError, Result};
use crate::stage::StageCtx;

/// Everything [`build_image`] needs beyond the buildfile text itself.
pub struct BuildOptions<'a> {
    pub buildfile_dir: PathBuf,
    pub context_dir: PathBuf,
    pub cli_args: ArgMap,
    pub image_ref: String,
    pub layers: &'a LayerStore,
    pub images: &'a ImageStore,
    pub cache: &'a BuildCache,
    pub runtime: &'a dyn ExternalRuntime,
    pub url_fetcher: &'a dyn UrlFetcher,
}

impl<'a> BuildOptions<'a> {
    /// Convenience constructor using the default `curl`-backed fetcher.
    pub fn new(
        buildfile_dir: PathBuf,
        context_dir: PathBuf,
        cli_args: ArgMap,
        image_ref: String,
        layers: &'a LayerStore,
        images: &'a ImageStore,
        cache: &'a BuildCache,
        runtime: &'a dyn ExternalRuntime,
    ) -> Self {
        Self {
            buildfile_dir,
            context_dir,
            cli_args,
            image_ref,
            layers,
            images,
            cache,
            runtime,
            url_fetcher: &CurlFetcher,
        }
    }
}

/// Parses and runs `contents` as a buildfile, returning the published
/// image's `name:tag` reference.
pub fn build_image(contents: &str, options: &BuildOptions) -> Result<String> {
    options.layers.ensure_initialized().map_err(|e| BuildError::Store(e.to_string()))?;
    options.images.ensure_initialized().map_err(|e| BuildError::Store(e.to_string()))?;
    options.cache.ensure_initialized().map_err(|e| BuildError::Store(e.to_string()))?;

    let mut global_args = options.cli_args.clone();
    let mut stages: Vec<StageCtx> = Vec::new();
    let mut stage_aliases: Vec<String> = Vec::new();
    let mut current: Option<usize> = None;

    for raw in scan_lines(contents) {
        // FROM/BASEDIR always substitute against the global map: stage maps
        // don't exist until the stage they open is pushed below.
        let rest = if raw.instruction == "FROM" || raw.instruction == "BASEDIR" {
            substitute_args(&raw.rest, &global_args)
        } else {
            let scope_args = match current {
                Some(idx) => &stages[idx].args,
                None => &global_args,
            };
            substitute_args(&raw.rest, scope_args)
        };

        match raw.instruction.as_str() {
            "ARG" => {
                let (key, default) = parse_arg_kv(&rest)
                    .map_err(|e| BuildError::Parse { line: raw.line_no, message: e.to_string() })?;

                let previous = match current {
                    Some(idx) => stages[idx].args.get(&key).map(str::to_owned),
                    None => global_args.get(&key).map(str::to_owned),
                };
                let value = options
                    .cli_args
                    .get(&key)
                    .map(str::to_owned)
                    .or(default)
                    .or(previous)
                    .unwrap_or_default();

                match current {
                    Some(idx) => stages[idx].args.set(&key, &value),
                    None => global_args.set(&key, &value),
                }
            }

            "FROM" | "BASEDIR" => {
                let (base_expr, alias) = parse_base_and_alias(&rest)
                    .map_err(|e| BuildError::Parse { line: raw.line_no, message: e.to_string() })?;

                let base_chain = if raw.instruction == "BASEDIR" {
                    let dir = options.buildfile_dir.join(&base_expr);
                    let metadata = std::fs::metadata(&dir)
                        .map_err(|e| BuildError::Resolve(format!("BASEDIR {}: {e}", dir.display())))?;
                    if !metadata.is_dir() {
                        return Err(BuildError::Resolve(format!("BASEDIR {} is not a directory", dir.display())));
                    }
                    dir.to_string_lossy().into_owned()
                } else {
                    resolve_base_chain(&base_expr, options.images, options.layers, options.runtime)
                        .map_err(|e| BuildError::Resolve(e.to_string()))?
                };

                let stage_args = global_args.clone();
                stages.push(StageCtx::new(alias.clone(), base_chain, stage_args));
                stage_aliases.push(alias.unwrap_or_default());
                current = Some(stages.len() - 1);
            }

            "RUN" => {
                let idx = current_stage(current, raw.line_no)?;
                create_layer(&mut stages, idx, Instruction::Run { command: rest }, options)?;
            }

            "WORKDIR" => {
                let idx = current_stage(current, raw.line_no)?;
                let normalized = fileutil::normalize_container_path(&stages[idx].workdir, &rest);
                create_layer(&mut stages, idx, Instruction::Workdir { path: rest }, options)?;
                stages[idx].workdir = normalized;
            }

            "COPY" => {
                let idx = current_stage(current, raw.line_no)?;
                let (from_stage, src, dst) = parse_copy_tokens(&rest)
                    .map_err(|e| BuildError::Parse { line: raw.line_no, message: e.to_string() })?;

                let instr = match from_stage {
                    Some(name) => {
                        let visible = &stage_aliases[..idx];
                        let stage_index = stage_index_by_name(visible, &name).ok_or_else(|| {
                            BuildError::Resolve(format!("COPY --from={name}: no such prior stage"))
                        })?;
                        Instruction::CopyFromStage { stage_index, from_token: name, src, dst }
                    }
                    None => Instruction::CopyFromContext { src, dst },
                };
                create_layer(&mut stages, idx, instr, options)?;
            }

            "ADD" => {
                let idx = current_stage(current, raw.line_no)?;
                let (src, dst) = parse_two_tokens(&rest)
                    .map_err(|e| BuildError::Parse { line: raw.line_no, message: e.to_string() })?;

                let instr = if src.starts_with("http://") || src.starts_with("https://") {
                    Instruction::AddUrl { url: src, dst }
                } else {
                    Instruction::AddFromContext { src, dst }
                };
                create_layer(&mut stages, idx, instr, options)?;
            }

            "CMD" => {
                let idx = current_stage(current, raw.line_no)?;
                stages[idx].cmd = rest;
            }

            other => {
                return Err(BuildError::Parse {
                    line: raw.line_no,
                    message: format!("unknown instruction {other:?}"),
                })
            }
        }
    }

    let final_idx = stages.len().checked_sub(1).ok_or_else(|| {
        BuildError::Config("buildfile has no FROM/BASEDIR stage".to_owned())
    })?;

    if !stages[final_idx].has_layer() {
        create_layer(&mut stages, final_idx, Instruction::Noop, options)?;
    }

    let image_ref = parse_image_ref(&options.image_ref).map_err(|e| BuildError::Config(e.to_string()))?;
    let final_stage = &stages[final_idx];
    options
        .images
        .save(&ImageMeta {
            name: image_ref.name.clone(),
            tag: image_ref.tag.clone(),
            reference: image_ref.display(),
            top_layer: final_stage.top_layer.clone(),
            created_at: String::new(),
            cmd: final_stage.cmd.clone(),
        })
        .map_err(|e| BuildError::Store(e.to_string()))?;

    Ok(image_ref.display())
}

fn current_stage(current: Option<usize>, line: usize) -> Result<usize> {
    current.ok_or_else(|| BuildError::Parse {
        line,
        message: "instruction used before any FROM/BASEDIR".to_owned(),
    })
}

/// Computes the cache-keyed state transition for `instr` in stage `idx`,
/// either reusing a cached layer or mounting, applying, and committing a new
/// one. Advances the stage's `top_layer`/`state_hash` on success; leaves it
/// untouched (and removes any half-built layer directory) on failure.
fn create_layer(stages: &mut [StageCtx], idx: usize, instr: Instruction, options: &BuildOptions) -> Result<()> {
    let current = stages[idx].clone();
    let descriptor = instr.descriptor(&current, stages, &options.context_dir)?;
    let new_state = fileutil::hash_string(&format!("{}|{}", current.state_hash, descriptor));

    if let Some(cached_id) = options.cache.lookup(&new_state, options.layers) {
        println!("[CACHE HIT] {}", instr.display());
        tracing::info!(layer = %cached_id, "cache hit for {}", instr.display());
        stages[idx].top_layer = cached_id;
        stages[idx].state_hash = new_state;
        return Ok(());
    }

    let layer_id = uuid::Uuid::new_v4().to_string();
    let lower_chain = stages[idx].current_chain(options.layers)?;
    let (diff_dir, work_dir) = options
        .layers
        .create_layer_dirs(&layer_id, &lower_chain)
        .map_err(|e| BuildError::Store(e.to_string()))?;

    let result = build_layer_contents(&diff_dir, &work_dir, &lower_chain, &instr, stages, idx, options);

    let size = match result {
        Ok(size) => size,
        Err(err) => {
            let _ = options.layers.remove_layer(&layer_id);
            return Err(err);
        }
    };

    let meta = LayerMeta {
        id: layer_id.clone(),
        parent: if stages[idx].has_layer() { stages[idx].top_layer.clone() } else { "-".to_owned() },
        hash: new_state.clone(),
        created_at: epoch_seconds_now(),
        size,
        instruction: instr.display(),
        workdir: stages[idx].workdir.clone(),
    };
    options.layers.write_metadata(&meta).map_err(|e| BuildError::Store(e.to_string()))?;
    options
        .cache
        .register(&new_state, &layer_id)
        .map_err(|e| BuildError::Store(e.to_string()))?;

    println!("[BUILT] {}", instr.display());
    tracing::info!(layer = %layer_id, "built {}", instr.display());
    stages[idx].top_layer = layer_id;
    stages[idx].state_hash = new_state;
    Ok(())
}

fn build_layer_contents(
    diff_dir: &Path,
    work_dir: &Path,
    lower_chain: &str,
    instr: &Instruction,
    stages: &[StageCtx],
    idx: usize,
    options: &BuildOptions,
) -> Result<u64> {
    let temp = fileutil::SafeTempDir::new().map_err(BuildError::Other)?;
    let merged = temp.path().join("merged");
    std::fs::create_dir(&merged).map_err(|e| BuildError::Mount(format!("mkdir {}: {e}", merged.display())))?;

    let mount = overlaymount::mount_overlayfs(&merged, lower_chain, diff_dir, work_dir)
        .map_err(|e| BuildError::Mount(e.to_string()))?;

    instr.apply(&merged, &stages[idx], stages, options.layers, &options.context_dir, options.url_fetcher)?;

    drop(mount);
    dir_size_bytes(diff_dir).map_err(BuildError::Other)
}

fn epoch_seconds_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Mounts a completed stage's output for inspection outside of a build,
/// e.g. a future `export` subcommand that wants a stage's final filesystem.
pub fn open_stage_snapshot(stage: &StageCtx, layers: &LayerStore) -> Result<crate::appliers::StageSnapshot> {
    let chain = stage.current_chain(layers)?;
    with_stage_snapshot(&chain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use baseresolve::NoExternalRuntime;
    use std::fs;

    fn make_base_rootfs(dir: &Path) {
        fs::create_dir_all(dir.join("bin")).unwrap();
        fs::copy("/bin/sh", dir.join("bin/sh")).unwrap();
    }

    struct TestEnv {
        _root: tempfile::TempDir,
        layers: LayerStore,
        images: ImageStore,
        cache: BuildCache,
        base_dir: PathBuf,
    }

    fn new_env() -> TestEnv {
        let root = tempfile::tempdir().unwrap();
        let layers = LayerStore::new(root.path().join("layers"));
        let images = ImageStore::new(root.path().join("images"));
        let cache = BuildCache::new(root.path().join("cache"));
        layers.ensure_initialized().unwrap();
        images.ensure_initialized().unwrap();
        cache.ensure_initialized().unwrap();

        let base_dir = root.path().join("base");
        make_base_rootfs(&base_dir);

        TestEnv { _root: root, layers, images, cache, base_dir }
    }

    // These exercise real overlay mounts and chroots, mirroring how the rest
    // of this workspace tests container/mount code; they need CAP_SYS_ADMIN.
    #[test]
    #[ignore = "requires CAP_SYS_ADMIN for overlayfs mounts"]
    fn single_stage_run_twice_is_a_cache_hit() -> anyhow::Result<()> {
        let env = new_env();
        let buildfile = format!(
            "BASEDIR {}\nRUN echo hi > /marker\n",
            env.base_dir.display(),
        );

        let ref1 = run_build(&env, &buildfile, "demo:latest")?;
        let ref2 = run_build(&env, &buildfile, "demo:latest")?;
        assert_eq!(ref1, ref2);
        Ok(())
    }

    #[test]
    #[ignore = "requires CAP_SYS_ADMIN for overlayfs mounts"]
    fn arg_override_changes_top_layer() -> anyhow::Result<()> {
        let env = new_env();
        let buildfile = format!(
            "BASEDIR {}\nARG V=1\nRUN echo $V > /marker\n",
            env.base_dir.display(),
        );

        let with_default = run_build(&env, &buildfile, "demo:one")?;
        let with_override = run_build_with_args(&env, &buildfile, "demo:two", ArgMap::from_pairs([("V", "2")]))?;
        let meta_one = env.images.load(&imagestore::parse_image_ref("demo:one")?)?;
        let meta_two = env.images.load(&imagestore::parse_image_ref("demo:two")?)?;
        assert_ne!(meta_one.top_layer, meta_two.top_layer);
        assert_eq!(with_default, "demo:one");
        assert_eq!(with_override, "demo:two");
        Ok(())
    }

    #[test]
    #[ignore = "requires CAP_SYS_ADMIN for overlayfs mounts"]
    fn copy_from_builder_stage_sees_its_output() -> anyhow::Result<()> {
        let env = new_env();
        let buildfile = format!(
            "BASEDIR {base} AS builder\nRUN echo built > /out.txt\nBASEDIR {base}\nCOPY --from=builder /out.txt /out.txt\n",
            base = env.base_dir.display(),
        );
        run_build(&env, &buildfile, "demo:latest")?;
        Ok(())
    }

    #[test]
    fn bad_from_stage_name_is_a_resolve_error() {
        let env = new_env();
        let buildfile = format!(
            "BASEDIR {}\nCOPY --from=missing /a /b\n",
            env.base_dir.display(),
        );
        let err = run_build(&env, &buildfile, "demo:latest").unwrap_err();
        assert!(matches!(err, BuildError::Resolve(_)));
    }

    #[test]
    fn unknown_instruction_is_a_parse_error() {
        let env = new_env();
        let buildfile = format!("BASEDIR {}\nFROBNICATE x\n", env.base_dir.display());
        let err = run_build(&env, &buildfile, "demo:latest").unwrap_err();
        assert!(matches!(err, BuildError::Parse { .. }));
    }

    #[test]
    fn instruction_before_any_stage_is_a_parse_error() {
        let env = new_env();
        let err = run_build(&env, "RUN echo hi\n", "demo:latest").unwrap_err();
        assert!(matches!(err, BuildError::Parse { .. }));
    }

    #[test]
    fn empty_buildfile_is_a_config_error() {
        let env = new_env();
        let err = run_build(&env, "", "demo:latest").unwrap_err();
        assert!(matches!(err, BuildError::Config(_)));
    }

    fn run_build(env: &TestEnv, buildfile: &str, image_ref: &str) -> Result<String> {
        run_build_with_args(env, buildfile, image_ref, ArgMap::new())
    }

    fn run_build_with_args(env: &TestEnv, buildfile: &str, image_ref: &str, cli_args: ArgMap) -> Result<String> {
        let options = BuildOptions::new(
            env._root.path().to_owned(),
            env._root.path().to_owned(),
            cli_args,
            image_ref.to_owned(),
            &env.layers,
            &env.images,
            &env.cache,
            &NoExternalRuntime,
        );
        build_image(buildfile, &options)
    }
}
