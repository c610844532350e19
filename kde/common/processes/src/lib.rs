// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Helpers for driving child processes (git, cmake, make and friends) with
//! sensible signal handling.

mod processes;

pub use crate::processes::*;
