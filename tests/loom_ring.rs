// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Loom model-checking for the SPSC turn-counter protocol used by
// `ring::UnicastRing` (see that module's doc comment for the full
// writable/readable mapping). Exercised here against a minimal in-process
// ring rather than the shared-memory one, since loom cannot model syscalls;
// the synchronisation protocol is identical.
//
// Run with: `RUSTFLAGS="--cfg loom" cargo test --test loom_ring --release`

#![cfg(loom)]

use loom::sync::atomic::{AtomicU32, Ordering};
use loom::sync::Arc;
use loom::thread;
use std::cell::UnsafeCell;

const CAPACITY: u32 = 2;

struct LoomRing {
    turn: [AtomicU32; CAPACITY as usize],
    data: [UnsafeCell<u32>; CAPACITY as usize],
}

unsafe impl Send for LoomRing {}
unsafe impl Sync for LoomRing {}

impl LoomRing {
    fn new() -> Self {
        Self {
            turn: [AtomicU32::new(0), AtomicU32::new(0)],
            data: [UnsafeCell::new(0), UnsafeCell::new(0)],
        }
    }

    fn push(&self, cursor: u32, value: u32) {
        let idx = (cursor % CAPACITY) as usize;
        while self.turn[idx].load(Ordering::Acquire) != cursor {
            loom::thread::yield_now();
        }
        unsafe { *self.data[idx].get() = value };
        self.turn[idx].store(cursor.wrapping_add(1), Ordering::Release);
    }

    fn pop(&self, cursor: u32) -> u32 {
        let idx = (cursor % CAPACITY) as usize;
        let want = cursor.wrapping_add(1);
        while self.turn[idx].load(Ordering::Acquire) != want {
            loom::thread::yield_now();
        }
        let value = unsafe { *self.data[idx].get() };
        self.turn[idx].store(cursor.wrapping_add(CAPACITY), Ordering::Release);
        value
    }
}

/// Per-producer FIFO order survives every interleaving loom can schedule.
#[test]
fn loom_spsc_preserves_order() {
    loom::model(|| {
        let ring = Arc::new(LoomRing::new());
        let producer_ring = Arc::clone(&ring);

        let producer = thread::spawn(move || {
            producer_ring.push(0, 10);
            producer_ring.push(1, 20);
        });

        let first = ring.pop(0);
        let second = ring.pop(1);

        producer.join().unwrap();
        assert_eq!((first, second), (10, 20));
    });
}

/// A slot can only be reused once its prior reader has released it — the
/// next writer visiting that index must observe `turn == cursor`, never
/// write over data the consumer hasn't read yet.
#[test]
fn loom_spsc_no_overrun_on_wrap() {
    loom::model(|| {
        let ring = Arc::new(LoomRing::new());
        let producer_ring = Arc::clone(&ring);

        let producer = thread::spawn(move || {
            producer_ring.push(0, 1);
            producer_ring.push(1, 2);
            producer_ring.push(2, 3); // wraps into slot 0, reused from cursor 0
        });

        let a = ring.pop(0);
        let b = ring.pop(1);
        let c = ring.pop(2);

        producer.join().unwrap();
        assert_eq!((a, b, c), (1, 2, 3));
    });
}
