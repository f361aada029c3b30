// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Pure Rust implementation of cpp-ipc shared memory and named mutex primitives.
// Binary-compatible with the C++ libipc library — same memory layout, same naming
// conventions, same POSIX/Win32 syscalls.

pub mod shm_name;

mod platform;

mod shm;
pub use shm::{ShmHandle, ShmOpenMode};

mod mutex;
pub use mutex::IpcMutex;

mod condition;
pub use condition::IpcCondition;

mod semaphore;
pub use semaphore::IpcSemaphore;

mod waiter;
pub use waiter::Waiter;

mod spin_lock;
pub use spin_lock::SpinLock;

mod chunk_storage;

pub mod buffer;
pub use buffer::{Buffer, IpcBuffer};

pub mod ring;
pub use ring::{Relation, Side, UnicastRing};

pub mod queue;
pub use queue::UnicastQueue;

mod channel;
pub use channel::{Channel, Mode, Route};

mod chan;
pub use chan::{BroadcastChan, UnicastChan};

mod error;
pub use error::{IpcError, IpcResult};
