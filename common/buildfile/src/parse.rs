// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use anyhow::{bail, ensure, Result};

/// One non-blank, non-comment line: its 1-based line number, the upper-cased
/// instruction token, and the whitespace-trimmed remainder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLine {
    pub line_no: usize,
    pub instruction: String,
    pub rest: String,
}

/// Splits buildfile text into [`RawLine`]s, skipping blank lines and lines
/// whose first non-whitespace byte is `#`.
pub fn scan_lines(contents: &str) -> Vec<RawLine> {
    let mut out = Vec::new();
    for (idx, line) in contents.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let (instruction, rest) = match trimmed.split_once(char::is_whitespace) {
            Some((head, tail)) => (head, tail.trim()),
            None => (trimmed, ""),
        };

        out.push(RawLine {
            line_no: idx + 1,
            instruction: instruction.to_uppercase(),
            rest: rest.to_owned(),
        });
    }
    out
}

/// Parses `ARG KEY[=DEFAULT]`.
pub fn parse_arg_kv(rest: &str) -> Result<(String, Option<String>)> {
    match rest.split_once('=') {
        Some((key, value)) => {
            ensure!(!key.is_empty() && is_identifier(key), "invalid ARG key: {key:?}");
            Ok((key.to_owned(), Some(value.to_owned())))
        }
        None => {
            ensure!(!rest.is_empty() && is_identifier(rest), "invalid ARG key: {rest:?}");
            Ok((rest.to_owned(), None))
        }
    }
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Parses `base [AS alias]`, used by `FROM`/`BASEDIR`.
pub fn parse_base_and_alias(rest: &str) -> Result<(String, Option<String>)> {
    let mut tokens = rest.split_whitespace();
    let base = tokens.next().ok_or_else(|| anyhow::anyhow!("missing base expression"))?;

    let alias = match (tokens.next(), tokens.next()) {
        (Some(as_kw), Some(alias)) if as_kw.eq_ignore_ascii_case("AS") => Some(alias.to_owned()),
        _ => None,
    };

    Ok((base.to_owned(), alias))
}

/// Parses two whitespace-separated tokens, used by `ADD src dst`.
pub fn parse_two_tokens(rest: &str) -> Result<(String, String)> {
    let mut tokens = rest.split_whitespace();
    let first = tokens.next().ok_or_else(|| anyhow::anyhow!("expected two tokens, got none"))?;
    let second = tokens.next().ok_or_else(|| anyhow::anyhow!("expected two tokens, got one"))?;
    Ok((first.to_owned(), second.to_owned()))
}

/// Parses `[--from=STAGE] src dst`, used by `COPY`.
pub fn parse_copy_tokens(rest: &str) -> Result<(Option<String>, String, String)> {
    let mut tokens = rest.split_whitespace();
    let mut first = tokens.next().ok_or_else(|| anyhow::anyhow!("COPY requires at least two tokens"))?;

    let from_stage = if let Some(stage) = first.strip_prefix("--from=") {
        let stage = stage.to_owned();
        first = tokens.next().ok_or_else(|| anyhow::anyhow!("COPY --from requires src and dst"))?;
        Some(stage)
    } else {
        None
    };

    let dst = tokens.next().ok_or_else(|| anyhow::anyhow!("COPY requires src and dst"))?;
    if tokens.next().is_some() {
        bail!("COPY takes exactly two path tokens (plus optional --from=)");
    }

    Ok((from_stage, first.to_owned(), dst.to_owned()))
}

/// Resolves a `COPY --from=` reference against known stage names/indices.
/// Lookup scans only `stages` up to and including the caller's current
/// position, since later stages are never visible.
pub fn stage_index_by_name(stages: &[String], name_or_index: &str) -> Option<usize> {
    if name_or_index.is_empty() {
        return None;
    }

    if name_or_index.bytes().all(|b| b.is_ascii_digit()) {
        if let Ok(idx) = name_or_index.parse::<usize>() {
            if idx < stages.len() {
                return Some(idx);
            }
        }
    }

    stages.iter().position(|s| s == name_or_index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_skips_blank_and_comment_lines() {
        let lines = scan_lines("FROM /tmp/base\n\n# a comment\nRUN echo hi\n");
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].instruction, "FROM");
        assert_eq!(lines[1].rest, "echo hi");
    }

    #[test]
    fn scan_uppercases_instruction_case_insensitively() {
        let lines = scan_lines("from /tmp/base");
        assert_eq!(lines[0].instruction, "FROM");
    }

    #[test]
    fn parse_arg_kv_with_and_without_default() -> Result<()> {
        assert_eq!(parse_arg_kv("V=1")?, ("V".into(), Some("1".into())));
        assert_eq!(parse_arg_kv("V")?, ("V".into(), None));
        Ok(())
    }

    #[test]
    fn parse_base_and_alias_detects_as() -> Result<()> {
        assert_eq!(parse_base_and_alias("/tmp/base AS builder")?, ("/tmp/base".into(), Some("builder".into())));
        assert_eq!(parse_base_and_alias("/tmp/base")?, ("/tmp/base".into(), None));
        Ok(())
    }

    #[test]
    fn parse_copy_tokens_with_from() -> Result<()> {
        let (from, src, dst) = parse_copy_tokens("--from=builder /out/file /file")?;
        assert_eq!(from.as_deref(), Some("builder"));
        assert_eq!(src, "/out/file");
        assert_eq!(dst, "/file");
        Ok(())
    }

    #[test]
    fn parse_copy_tokens_without_from() -> Result<()> {
        let (from, src, dst) = parse_copy_tokens("a.txt /b.txt")?;
        assert_eq!(from, None);
        assert_eq!(src, "a.txt");
        assert_eq!(dst, "/b.txt");
        Ok(())
    }

    #[test]
    fn stage_index_by_name_prefers_alias_then_index() {
        let stages = vec!["builder".to_owned(), "1".to_owned()];
        assert_eq!(stage_index_by_name(&stages, "builder"), Some(0));
        assert_eq!(stage_index_by_name(&stages, "0"), Some(0));
        assert_eq!(stage_index_by_name(&stages, "missing"), None);
    }
}
