// Copyright 2025 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Lock types used by the security server. Guards are returned directly from `lock()`, `read()`
//! and `write()`, without poisoning.

pub use parking_lot::{Mutex, RwLock};
