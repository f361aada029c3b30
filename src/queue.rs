// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Queue facade: binds the ring header, the unicast producer/consumer
// algorithms, and the connection registry to one concrete element shape
// (message id, remaining-bytes count, inline chunk), and adds push/pop with
// optional blocking through the waiter.

use std::io;

use crate::ring::{Relation, Side, UnicastRing};

/// One chunk of a (possibly multi-chunk) message.
///
/// `producer_id` identifies the producer handle that pushed this element; it
/// is stamped automatically by the ring on `push` (ignoring whatever value
/// the caller set) and populated from the slot on `pop`, so a consumer can
/// key its reassembly table by `(producer_id, id)` rather than `id` alone.
#[derive(Debug, Clone)]
pub struct Element {
    pub producer_id: u32,
    pub id: u32,
    pub remaining: i32,
    pub data: Vec<u8>,
}

/// Bytes available inline in one ring slot (see [`crate::ring::INLINE_PAYLOAD`]).
pub const INLINE_PAYLOAD: usize = crate::ring::INLINE_PAYLOAD;

/// A unicast message queue: exactly one consumer receives each pushed
/// element, regardless of how many producers or consumers are attached.
pub struct UnicastQueue {
    ring: UnicastRing,
}

impl UnicastQueue {
    pub fn open(name: &str, side: Side, relation: Relation) -> io::Result<Self> {
        Ok(Self {
            ring: UnicastRing::open(name, side, relation)?,
        })
    }

    /// Push one element, blocking up to `timeout_ms` (`None` = forever) if
    /// the ring is momentarily full. Unlike broadcast, unicast never
    /// force-pushes: a full ring under `try_push` or an expired deadline
    /// under `push` both surface as `Ok(false)`.
    pub fn push(&self, element: &Element, timeout_ms: Option<u64>) -> io::Result<bool> {
        self.ring
            .push_element(element.id, element.remaining, &element.data, timeout_ms)
    }

    /// Push without blocking at all.
    pub fn try_push(&self, element: &Element) -> io::Result<bool> {
        self.push(element, Some(0))
    }

    /// Pop one element, blocking up to `timeout_ms` if the ring is empty.
    pub fn pop(&self, timeout_ms: Option<u64>) -> io::Result<Option<Element>> {
        Ok(self.ring.pop_element(timeout_ms)?.map(
            |(producer_id, id, remaining, data)| Element {
                producer_id,
                id,
                remaining,
                data,
            },
        ))
    }

    /// Pop without blocking at all.
    pub fn try_pop(&self) -> io::Result<Option<Element>> {
        self.pop(Some(0))
    }

    /// Number of endpoints currently attached to this ring (either side).
    pub fn attached_count(&self) -> u32 {
        self.ring.attached_count()
    }

    /// Block until at least `count` endpoints are attached, preventing a
    /// producer from racing ahead of consumers that have not yet connected.
    pub fn wait_for_attached(&self, count: u32, timeout_ms: Option<u64>) -> io::Result<bool> {
        self.ring.wait_for_attached(count, timeout_ms)
    }

    pub fn disconnect(&self) -> io::Result<()> {
        self.ring.disconnect()
    }

    pub fn clear_storage(name: &str) {
        UnicastRing::clear_storage(name);
    }
}
