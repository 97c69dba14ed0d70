// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-stage build state: the running cache key, the stage's own argument
//! scope, and its most recently built layer.

use buildfile::ArgMap;
use layerstore::LayerStore;

use crate::error::{BuildError, Result};

/// Mutable state threaded through one stage's instructions, from the `FROM`
/// that opened it to the final layer it builds.
#[derive(Debug, Clone)]
pub struct StageCtx {
    pub name: Option<String>,
    pub base_chain: String,
    /// Most recently built layer id, or empty if the stage has built none yet.
    pub top_layer: String,
    pub state_hash: String,
    pub workdir: String,
    pub args: ArgMap,
    pub cmd: String,
}

impl StageCtx {
    pub fn new(name: Option<String>, base_chain: String, args: ArgMap) -> Self {
        let state_hash = fileutil::hash_string(&format!("BASE|{base_chain}"));
        Self {
            name,
            base_chain,
            top_layer: String::new(),
            state_hash,
            workdir: "/".to_owned(),
            args,
            cmd: "/bin/sh".to_owned(),
        }
    }

    pub fn has_layer(&self) -> bool {
        !self.top_layer.is_empty()
    }

    /// The overlay lower chain as of this stage's current top layer, or its
    /// base chain if it has built no layers yet.
    pub fn current_chain(&self, layers: &LayerStore) -> Result<String> {
        if self.top_layer.is_empty() {
            Ok(self.base_chain.clone())
        } else {
            layers
                .layer_chain_from_top(&self.top_layer)
                .map_err(|e| BuildError::Store(e.to_string()))
        }
    }
}
