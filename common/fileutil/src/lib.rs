// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

mod hash;
mod path;
mod remove;
mod tempdir;

pub use hash::*;
pub use path::*;
pub use remove::*;
pub use tempdir::*;
