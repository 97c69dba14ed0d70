// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

/// Error taxonomy for the build engine. Variant choice is informational —
/// every kind is fatal to the current build, and the top-level CLI handler
/// reports all of them uniformly as `[ERR] <context>: <detail>`.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("{0}")]
    Config(String),

    #[error("line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("{0}")]
    Resolve(String),

    #[error("{0}")]
    Mount(String),

    #[error("{0}")]
    Child(String),

    #[error("{0}")]
    Store(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, BuildError>;
