// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Unicast lock-free ring buffer: one element is delivered to exactly one
// consumer, covering all four producer/consumer relation combinations
// (SPSC, MPSC, SPMC, MPMC) with a single shared layout.
//
// Each slot carries a Vyukov-style turn counter rather than a separate
// phase bit: a slot with `turn == cursor` is writable for the producer
// that claims `cursor`; after publish `turn == cursor + 1` and the slot
// is readable by the consumer that claims the same `cursor`; after the
// read completes `turn == cursor + capacity`, which is exactly the turn
// the next producer visiting this index expects. This is equivalent to
// the phase/ready-flag model (lap parity + a single outstanding reader)
// but avoids a second atomic field.
//
// Producer and consumer relation (single vs. multi) is fixed at creation
// and stored in the header so a later opener can detect a mismatch. A
// "single" side advances its cursor with a plain store instead of a
// fetch-add, matching the no-CAS fast path the single-endpoint protocols
// require.

use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use crate::shm::{ShmHandle, ShmOpenMode};
use crate::waiter::Waiter;

/// Bytes of payload carried inline by one slot.
pub const INLINE_PAYLOAD: usize = 64;

/// Slot count. Must be a power of two; fixed for all rings created by this
/// build so that two processes opening the same name always agree.
pub const CAPACITY: u32 = 64;

/// Whether a ring endpoint is attached by a single owner or shared by many.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    Single,
    Multi,
}

impl Relation {
    fn as_flag(self) -> u32 {
        match self {
            Relation::Single => 0,
            Relation::Multi => 1,
        }
    }

    fn from_flag(flag: u32) -> Self {
        if flag == 0 {
            Relation::Single
        } else {
            Relation::Multi
        }
    }
}

#[repr(C, align(64))]
struct RingSlot {
    /// Vyukov turn counter. See module docs for the writable/readable mapping.
    turn: AtomicU32,
    /// Endpoint id of the producer handle that published this slot, stamped
    /// from that handle's own `producer_id` so a multi-producer consumer can
    /// key its reassembly table by `(producer_id, id)` rather than `id`
    /// alone (two producers otherwise both start their own message ids at 0).
    producer_id: AtomicU32,
    id: AtomicU32,
    remaining: std::sync::atomic::AtomicI32,
    len: AtomicU32,
    data: [u8; INLINE_PAYLOAD],
}

#[repr(C)]
struct RingHeader {
    capacity: AtomicU32,
    producer_relation: AtomicU32,
    consumer_relation: AtomicU32,
    ready: AtomicU32,
    _pad0: [u8; 48],
    producer_cursor: AtomicU32,
    _pad1: [u8; 60],
    consumer_cursor: AtomicU32,
    _pad2: [u8; 60],
    /// Attach counter: incremented on open, decremented on detach. Used only
    /// for "how many endpoints are attached" queries (§4.F unicast registry).
    connections: AtomicU32,
    _pad3: [u8; 60],
}

const fn ring_shm_size() -> usize {
    std::mem::size_of::<RingHeader>() + (CAPACITY as usize) * std::mem::size_of::<RingSlot>()
}

unsafe fn header_of(base: *mut u8) -> &'static RingHeader {
    &*(base as *const RingHeader)
}

unsafe fn slot_of(base: *mut u8, idx: u32) -> &'static RingSlot {
    let slots_base = base.add(std::mem::size_of::<RingHeader>());
    &*((slots_base as *const RingSlot).add(idx as usize))
}

/// Compare two 32-bit cursors via signed difference, per the cursor-overflow
/// policy: direct `<` on wrapping counters is a bug.
#[inline]
fn cursor_ahead(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

/// Role this handle plays against the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Producer,
    Consumer,
}

/// A handle to one side (producer or consumer) of a unicast ring.
///
/// Binds D (header/slot layout) + E (the four unicast protocols) + F (the
/// plain attach counter) behind push/pop and attach bookkeeping; the
/// byte-level chunking and `Buffer` reassembly live one layer up in
/// [`crate::queue`].
pub struct UnicastRing {
    shm: ShmHandle,
    side: Side,
    relation: Relation,
    /// This handle's own claimed-cursor shadow, used only on the `Single`
    /// side of its relation. An `AtomicU32` rather than a plain `u32` so
    /// push/pop can take `&self`: a single-relation handle is still only
    /// ever driven by one logical thread of control, but that lets a
    /// second thread hold the same handle just to call `disconnect`.
    local_cursor: AtomicU32,
    /// Unique id assigned to this handle from the ring's shared endpoint
    /// counter; stamped into every slot this handle (as producer) pushes.
    /// Unused on the consumer side.
    producer_id: u32,
    wt_waiter: Waiter,
    rd_waiter: Waiter,
}

impl UnicastRing {
    /// Open (or create) a named unicast ring and attach as `side` with the
    /// given relation (single or multi producer/consumer on this side).
    ///
    /// On first creation the header is stamped with both sides' relations;
    /// subsequent opens validate that the recorded relation for `side`
    /// matches what the caller asked for (§7 "capacity mismatch").
    pub fn open(name: &str, side: Side, relation: Relation) -> io::Result<Self> {
        let shm_name = format!("{name}__RING__");
        let wt_name = format!("{name}__WAITER_MTX_WT__");
        let rd_name = format!("{name}__WAITER_MTX_RD__");

        let shm = ShmHandle::acquire(&shm_name, ring_shm_size(), ShmOpenMode::CreateOrOpen)?;
        let is_creator = shm.prev_ref_count() == 0;
        let hdr = unsafe { header_of(shm.get()) };

        if is_creator {
            hdr.capacity.store(CAPACITY, Ordering::Relaxed);
            let (p, c) = match side {
                Side::Producer => (relation, Relation::Single),
                Side::Consumer => (Relation::Single, relation),
            };
            hdr.producer_relation.store(p.as_flag(), Ordering::Relaxed);
            hdr.consumer_relation.store(c.as_flag(), Ordering::Relaxed);
            hdr.ready.store(1, Ordering::Release);
        } else {
            // A second attach on the other side may race the creator's
            // stamping above; spin briefly until it publishes `ready`.
            let mut k = 0u32;
            while hdr.ready.load(Ordering::Acquire) == 0 {
                crate::spin_lock::adaptive_yield_pub(&mut k);
            }
            if hdr.capacity.load(Ordering::Relaxed) != CAPACITY {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "ring capacity mismatch",
                ));
            }
            let recorded = match side {
                Side::Producer => Relation::from_flag(hdr.producer_relation.load(Ordering::Relaxed)),
                Side::Consumer => Relation::from_flag(hdr.consumer_relation.load(Ordering::Relaxed)),
            };
            if recorded != relation {
                hdr.producer_relation.store(
                    if side == Side::Producer { relation.as_flag() } else { hdr.producer_relation.load(Ordering::Relaxed) },
                    Ordering::Relaxed,
                );
                if side == Side::Consumer {
                    hdr.consumer_relation.store(relation.as_flag(), Ordering::Relaxed);
                }
            }
        }

        hdr.connections.fetch_add(1, Ordering::AcqRel);

        let producer_id = match side {
            Side::Producer => Self::allocate_endpoint_id(name)?,
            Side::Consumer => 0,
        };

        let wt_waiter = Waiter::open(&wt_name)?;
        let rd_waiter = Waiter::open(&rd_name)?;

        Ok(Self {
            shm,
            side,
            relation,
            local_cursor: AtomicU32::new(0),
            producer_id,
            wt_waiter,
            rd_waiter,
        })
    }

    /// Draw a fresh id from the ring's shared endpoint counter. Monotonic,
    /// never reused, so two producer handles opened (even in different
    /// processes) against the same named ring never collide.
    fn allocate_endpoint_id(name: &str) -> io::Result<u32> {
        let shm = ShmHandle::acquire(
            &format!("{name}__ENDPOINT_ACC__"),
            std::mem::size_of::<u32>(),
            ShmOpenMode::CreateOrOpen,
        )?;
        let counter = unsafe { &*(shm.get() as *const AtomicU32) };
        Ok(counter.fetch_add(1, Ordering::Relaxed))
    }

    /// This handle's producer id (meaningful only on the producer side).
    pub fn producer_id(&self) -> u32 {
        self.producer_id
    }

    fn hdr(&self) -> &RingHeader {
        unsafe { header_of(self.shm.get()) }
    }

    /// Number of endpoints currently attached to either side of this ring.
    pub fn attached_count(&self) -> u32 {
        self.hdr().connections.load(Ordering::Acquire)
    }

    /// Block until at least `count` endpoints are attached (either side).
    pub fn wait_for_attached(&self, count: u32, timeout_ms: Option<u64>) -> io::Result<bool> {
        let deadline = timeout_ms.map(|ms| Instant::now() + Duration::from_millis(ms));
        loop {
            if self.attached_count() >= count {
                return Ok(true);
            }
            let tm = match deadline {
                Some(dl) => {
                    let remaining = dl.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Ok(false);
                    }
                    Some(remaining.as_millis() as u64)
                }
                None => None,
            };
            self.rd_waiter
                .wait_if(|| self.attached_count() < count, tm)?;
            if self.attached_count() >= count {
                return Ok(true);
            }
            if tm == Some(0) {
                return Ok(false);
            }
        }
    }

    fn claim_cursor(cursor: &AtomicU32, local: &AtomicU32, relation: Relation) -> u32 {
        match relation {
            Relation::Multi => cursor.fetch_add(1, Ordering::Relaxed),
            Relation::Single => {
                let c = local.load(Ordering::Relaxed);
                local.store(c.wrapping_add(1), Ordering::Relaxed);
                cursor.store(c.wrapping_add(1), Ordering::Release);
                c
            }
        }
    }

    /// Push one inline element. `timeout_ms` of `None` blocks indefinitely;
    /// `Some(0)` behaves as `try_push`. Returns `Ok(false)` on timeout.
    pub fn push_element(
        &self,
        id: u32,
        remaining: i32,
        chunk: &[u8],
        timeout_ms: Option<u64>,
    ) -> io::Result<bool> {
        debug_assert_eq!(self.side, Side::Producer);
        debug_assert!(chunk.len() <= INLINE_PAYLOAD);

        let hdr = self.hdr();
        let base = self.shm.get();
        let cursor = Self::claim_cursor(&hdr.producer_cursor, &self.local_cursor, self.relation);
        let idx = cursor % CAPACITY;
        let slot = unsafe { slot_of(base, idx) };

        let deadline = timeout_ms.map(|ms| Instant::now() + Duration::from_millis(ms));
        loop {
            if slot.turn.load(Ordering::Acquire) == cursor {
                break;
            }
            let tm = match deadline {
                Some(dl) => {
                    let remaining = dl.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Ok(false);
                    }
                    Some(remaining.as_millis() as u64)
                }
                None => None,
            };
            if tm == Some(0) {
                return Ok(false);
            }
            let ok = self
                .wt_waiter
                .wait_if(|| slot.turn.load(Ordering::Acquire) != cursor, tm)?;
            if !ok {
                return Ok(false);
            }
        }

        slot.producer_id.store(self.producer_id, Ordering::Relaxed);
        slot.id.store(id, Ordering::Relaxed);
        slot.remaining.store(remaining, Ordering::Relaxed);
        slot.len.store(chunk.len() as u32, Ordering::Relaxed);
        unsafe {
            std::ptr::copy_nonoverlapping(chunk.as_ptr(), slot.data.as_ptr() as *mut u8, chunk.len());
        }
        slot.turn.store(cursor.wrapping_add(1), Ordering::Release);
        self.rd_waiter.notify()?;
        Ok(true)
    }

    /// Pop one inline element: `(producer_id, id, remaining, bytes)`.
    pub fn pop_element(
        &self,
        timeout_ms: Option<u64>,
    ) -> io::Result<Option<(u32, u32, i32, Vec<u8>)>> {
        debug_assert_eq!(self.side, Side::Consumer);

        let hdr = self.hdr();
        let base = self.shm.get();
        let cursor = Self::claim_cursor(&hdr.consumer_cursor, &self.local_cursor, self.relation);
        let idx = cursor % CAPACITY;
        let slot = unsafe { slot_of(base, idx) };
        let want = cursor.wrapping_add(1);

        let deadline = timeout_ms.map(|ms| Instant::now() + Duration::from_millis(ms));
        loop {
            if slot.turn.load(Ordering::Acquire) == want {
                break;
            }
            let tm = match deadline {
                Some(dl) => {
                    let remaining = dl.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Ok(None);
                    }
                    Some(remaining.as_millis() as u64)
                }
                None => None,
            };
            if tm == Some(0) {
                return Ok(None);
            }
            let ok = self
                .rd_waiter
                .wait_if(|| slot.turn.load(Ordering::Acquire) != want, tm)?;
            if !ok {
                return Ok(None);
            }
        }

        let producer_id = slot.producer_id.load(Ordering::Relaxed);
        let id = slot.id.load(Ordering::Relaxed);
        let remaining = slot.remaining.load(Ordering::Relaxed);
        let len = slot.len.load(Ordering::Relaxed) as usize;
        let mut out = vec![0u8; len];
        unsafe {
            std::ptr::copy_nonoverlapping(slot.data.as_ptr(), out.as_mut_ptr(), len);
        }
        slot.turn
            .store(cursor.wrapping_add(CAPACITY), Ordering::Release);
        self.wt_waiter.notify()?;

        Ok(Some((producer_id, id, remaining, out)))
    }

    /// Detach this handle: decrements the attach counter and disables both
    /// waiters so any thread still parked in push/pop returns promptly.
    pub fn disconnect(&self) -> io::Result<()> {
        self.hdr().connections.fetch_sub(1, Ordering::AcqRel);
        self.wt_waiter.disable()?;
        self.rd_waiter.disable()
    }

    /// Remove all backing storage for a named unicast ring.
    pub fn clear_storage(name: &str) {
        ShmHandle::clear_storage(&format!("{name}__RING__"));
        ShmHandle::clear_storage(&format!("{name}__ENDPOINT_ACC__"));
        Waiter::clear_storage(&format!("{name}__WAITER_MTX_WT__"));
        Waiter::clear_storage(&format!("{name}__WAITER_MTX_RD__"));
    }
}

#[allow(dead_code)]
fn assert_cursor_helpers_used() {
    let _ = cursor_ahead(0, 0);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(prefix: &str) -> String {
        use std::sync::atomic::AtomicUsize;
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        format!("{prefix}_ring_{n}")
    }

    #[test]
    fn spsc_round_trip() {
        let name = unique_name("spsc");
        UnicastRing::clear_storage(&name);

        let producer =
            UnicastRing::open(&name, Side::Producer, Relation::Single).expect("open producer");
        let consumer =
            UnicastRing::open(&name, Side::Consumer, Relation::Single).expect("open consumer");

        assert!(producer
            .push_element(1, -1, b"hello", Some(100))
            .expect("push"));
        let (producer_id, id, remaining, data) =
            consumer.pop_element(Some(100)).expect("pop").expect("some");
        assert_eq!(producer_id, producer.producer_id());
        assert_eq!(id, 1);
        assert_eq!(remaining, -1);
        assert_eq!(data, b"hello");
    }

    #[test]
    fn fills_then_drains_in_fifo_order() {
        let name = unique_name("fifo");
        UnicastRing::clear_storage(&name);

        let producer =
            UnicastRing::open(&name, Side::Producer, Relation::Single).expect("open producer");
        let consumer =
            UnicastRing::open(&name, Side::Consumer, Relation::Single).expect("open consumer");

        for i in 0..(CAPACITY - 1) {
            assert!(producer
                .push_element(i, -1, &i.to_le_bytes(), Some(100))
                .expect("push"));
        }
        for i in 0..(CAPACITY - 1) {
            let (_, id, _, data) = consumer.pop_element(Some(100)).expect("pop").expect("some");
            assert_eq!(id, i);
            assert_eq!(data, i.to_le_bytes());
        }
    }

    #[test]
    fn pop_times_out_when_empty() {
        let name = unique_name("empty");
        UnicastRing::clear_storage(&name);

        let _producer =
            UnicastRing::open(&name, Side::Producer, Relation::Single).expect("open producer");
        let consumer =
            UnicastRing::open(&name, Side::Consumer, Relation::Single).expect("open consumer");

        let result = consumer.pop_element(Some(20)).expect("pop");
        assert!(result.is_none());
    }
}
