// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Shared integration-test setup. Each test binary that exercises the
// channel facades calls `common::init()` so a failing/coalesced path logs
// through `env_logger` when the test is run with `RUST_LOG=debug`.

use std::sync::Once;

static INIT: Once = Once::new();

pub fn init() {
    INIT.call_once(|| {
        let _ = env_logger::try_init();
    });
}
