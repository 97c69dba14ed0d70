// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Line-oriented buildfile scanning, instruction token parsing, and
//! `$VAR`/`${VAR}` argument substitution.
//!
//! This crate only recognizes instruction shapes and expands arguments; it
//! has no notion of stages, layers, or the filesystem side effects an
//! instruction causes. See `buildengine` for that.

mod args;
mod parse;

pub use args::{substitute_args, ArgMap};
pub use parse::{parse_arg_kv, parse_base_and_alias, parse_copy_tokens, parse_two_tokens, scan_lines, stage_index_by_name, RawLine};
