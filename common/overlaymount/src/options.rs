// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::path::{Path, PathBuf};

use anyhow::{bail, ensure, Context, Result};

/// Builds `lowerdir=<chain>,upperdir=<upper>,workdir=<work>` mount options,
/// after validating that neither `upper` nor `work` is nested inside (or
/// equal to) any lower entry.
pub fn build_overlay_options(lower_chain: &str, upper: &Path, work: &Path) -> Result<String> {
    let lower_entries: Vec<&str> = lower_chain.split(':').filter(|s| !s.is_empty()).collect();
    ensure!(!lower_entries.is_empty(), "lower chain must not be empty");

    let canonical_upper = upper
        .canonicalize()
        .with_context(|| format!("canonicalize {}", upper.display()))?;
    let canonical_work = work
        .canonicalize()
        .with_context(|| format!("canonicalize {}", work.display()))?;

    for entry in &lower_entries {
        let canonical_lower = Path::new(entry)
            .canonicalize()
            .with_context(|| format!("canonicalize lower entry {}", entry))?;

        if canonical_lower == Path::new("/") {
            bail!("lower entry {} resolves to the file system root", entry);
        }

        for (name, candidate) in [("upperdir", &canonical_upper), ("workdir", &canonical_work)] {
            ensure_not_nested(name, candidate, &canonical_lower)?;
        }
    }

    Ok(format!(
        "lowerdir={},upperdir={},workdir={}",
        lower_chain,
        upper.display(),
        work.display(),
    ))
}

fn ensure_not_nested(name: &str, candidate: &Path, lower: &Path) -> Result<()> {
    if candidate == lower || candidate.starts_with(lower) {
        bail!(
            "{} {} is the lower directory {} or nested inside it",
            name,
            candidate.display(),
            lower.display()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fileutil::SafeTempDir;

    #[test]
    fn builds_expected_string() -> Result<()> {
        let temp = SafeTempDir::new()?;
        let lower = temp.path().join("lower");
        let upper = temp.path().join("upper");
        let work = temp.path().join("work");
        for d in [&lower, &upper, &work] {
            std::fs::create_dir(d)?;
        }

        let options = build_overlay_options(&lower.to_string_lossy(), &upper, &work)?;
        assert!(options.starts_with("lowerdir="));
        assert!(options.contains(&format!("upperdir={}", upper.display())));
        assert!(options.contains(&format!("workdir={}", work.display())));
        Ok(())
    }

    #[test]
    fn rejects_upper_nested_in_lower() -> Result<()> {
        let temp = SafeTempDir::new()?;
        let lower = temp.path().join("lower");
        let work = temp.path().join("work");
        std::fs::create_dir(&lower)?;
        std::fs::create_dir(&work)?;
        let upper = lower.join("upper");
        std::fs::create_dir(&upper)?;

        assert!(build_overlay_options(&lower.to_string_lossy(), &upper, &work).is_err());
        Ok(())
    }

    #[test]
    fn does_not_reject_sibling_with_shared_prefix() -> Result<()> {
        let temp = SafeTempDir::new()?;
        let a = temp.path().join("a");
        let a_bc = temp.path().join("a_bc");
        let work = temp.path().join("work");
        for d in [&a, &a_bc, &work] {
            std::fs::create_dir(d)?;
        }

        // "a_bc" must not be considered inside "a" despite sharing a string
        // prefix.
        assert!(build_overlay_options(&a.to_string_lossy(), &a_bc, &work).is_ok());
        Ok(())
    }

    #[test]
    fn rejects_root_lower() {
        let upper = PathBuf::from("/tmp");
        let work = PathBuf::from("/var/tmp");
        assert!(build_overlay_options("/", &upper, &work).is_err());
    }
}
