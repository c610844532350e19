// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Readers over the external metadata repository: the per-project database
//! and the branch-group policy file.

pub mod branchgroup;
pub mod projects;
