// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Drives a buildfile's instructions against the layer, image, and build
//! caches, producing a content-addressed image from overlay filesystem
//! layers.

mod appliers;
mod engine;
mod error;
mod stage;

pub use appliers::{with_stage_snapshot, CurlFetcher, Instruction, StageSnapshot, UrlFetcher};
pub use engine::{build_image, open_stage_snapshot, BuildOptions};
pub use error::{BuildError, Result};
pub use stage::StageCtx;
