// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::HashMap;

/// One of the three argument scopes: CLI (immutable per build), global
/// (seeded from CLI, mutated by pre-`FROM` `ARG`), or stage (snapshotted
/// from global at `FROM` time, mutated by in-stage `ARG`).
#[derive(Debug, Clone, Default)]
pub struct ArgMap(HashMap<String, String>);

impl ArgMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self(pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.0.insert(key.to_owned(), value.to_owned());
    }
}

/// Expands `$KEY` and `${KEY}` references in `input` against `args`.
///
/// `$$` becomes a literal `$`; a bare `$` not followed by an identifier
/// character or `{` is left as-is; a missing key expands to the empty
/// string.
pub fn substitute_args(input: &str, args: &ArgMap) -> String {
    let bytes = input.as_bytes();
    let mut out = String::with_capacity(input.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'$' {
            // Advance by one UTF-8 scalar, not one byte, to stay on
            // character boundaries.
            let ch = input[i..].chars().next().unwrap();
            out.push(ch);
            i += ch.len_utf8();
            continue;
        }

        if bytes.get(i + 1) == Some(&b'$') {
            out.push('$');
            i += 2;
            continue;
        }

        if bytes.get(i + 1) == Some(&b'{') {
            let start = i + 2;
            let end = input[start..].find('}').map(|p| start + p);
            match end {
                Some(end) => {
                    let key = &input[start..end];
                    out.push_str(args.get(key).unwrap_or(""));
                    i = end + 1;
                }
                None => {
                    // Unterminated ${...}: treat the rest literally, mirroring
                    // the scanner's tolerance for malformed input.
                    out.push_str(&input[i..]);
                    break;
                }
            }
            continue;
        }

        let start = i + 1;
        let mut end = start;
        while end < bytes.len() && (bytes[end].is_ascii_alphanumeric() || bytes[end] == b'_') {
            end += 1;
        }

        if end == start {
            out.push('$');
            i += 1;
            continue;
        }

        let key = &input[start..end];
        out.push_str(args.get(key).unwrap_or(""));
        i = end;
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_bare_and_braced() {
        let mut args = ArgMap::new();
        args.set("V", "9");
        assert_eq!(substitute_args("echo $V", &args), "echo 9");
        assert_eq!(substitute_args("echo ${V}x", &args), "echo 9x");
    }

    #[test]
    fn missing_key_is_empty() {
        let args = ArgMap::new();
        assert_eq!(substitute_args("x=$MISSING", &args), "x=");
    }

    #[test]
    fn dollar_dollar_is_literal() {
        let args = ArgMap::new();
        assert_eq!(substitute_args("echo $$5", &args), "echo $5");
    }

    #[test]
    fn bare_dollar_before_non_identifier_is_literal() {
        let args = ArgMap::new();
        assert_eq!(substitute_args("price: $ 5", &args), "price: $ 5");
    }

    #[test]
    fn cli_overrides_take_effect_through_lookup() {
        let mut args = ArgMap::new();
        args.set("V", "1");
        args.set("V", "9");
        assert_eq!(substitute_args("$V", &args), "9");
    }
}
