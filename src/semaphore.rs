// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Cross-platform named counting semaphore.
// Delegates to platform::PlatformSemaphore (POSIX sem_open or Win32 CreateSemaphore).

use std::io;

use crate::platform::PlatformSemaphore;

/// A named, inter-process counting semaphore.
///
/// On POSIX this is a `sem_t` opened with `sem_open`. On Windows this is a
/// kernel semaphore object via `CreateSemaphoreW`.
pub struct IpcSemaphore {
    inner: PlatformSemaphore,
}

impl IpcSemaphore {
    /// Open (or create) a named semaphore with the given initial count.
    pub fn open(name: &str, initial_count: u32) -> io::Result<Self> {
        let inner = PlatformSemaphore::open(name, initial_count)?;
        Ok(Self { inner })
    }

    /// Decrement the semaphore, blocking if its count is zero.
    ///
    /// `None` blocks indefinitely. `Some(ms)` returns `Ok(false)` on timeout
    /// rather than an error — only OS failures surface as `Err`.
    pub fn wait(&self, timeout_ms: Option<u64>) -> io::Result<bool> {
        self.inner.wait(timeout_ms)
    }

    /// Increment the semaphore's count by `count`.
    pub fn post(&self, count: u32) -> io::Result<()> {
        self.inner.post(count)
    }

    /// Remove the backing storage for a named semaphore (static helper).
    pub fn clear_storage(name: &str) {
        PlatformSemaphore::clear_storage(name);
    }
}
