// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Public channel facade for the unicast transport. Resolves a logical name
// into a queue + waiter pair, assigns monotonically increasing message ids,
// splits/reassembles payloads across chunks, and exposes the boolean
// send/recv contract described for the public API.
//
// The broadcast transport's facade (`chan<_, _, broadcast>`, i.e. `Route`
// and `Channel`) lives in `channel.rs`; this module covers the four
// unicast relation combinations (`chan<_, _, unicast>`) on top of
// `queue::UnicastQueue`.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use crate::buffer::Buffer;
use crate::error::{IpcError, IpcResult};
use crate::queue::{Element, UnicastQueue, INLINE_PAYLOAD};
use crate::ring::{Relation, Side};

/// `chan<single, single, unicast>`, `chan<multi, single, unicast>`,
/// `chan<single, multi, unicast>`, or `chan<multi, multi, unicast>`,
/// selected by the `producer_relation`/`consumer_relation` passed to
/// [`UnicastChan::connect`].
pub struct UnicastChan {
    name: String,
    queue: UnicastQueue,
    side: Side,
    next_id: AtomicU32,
    /// Partial messages awaiting their terminal chunk, keyed by
    /// `(producer_id, message_id)`: message ids are only unique per
    /// producer, so for `chan<multi, _, unicast>` two producers both start
    /// at id 0 and a consumer keying on `id` alone would merge their
    /// interleaved chunks. Owned by this handle rather than a thread-local,
    /// per the reassembly table's locality requirement: a multi-consumer
    /// handle may interleave chunks from different producers across
    /// whichever thread happens to pop them. `Mutex`-guarded (rather than
    /// `&mut self`) so `disconnect` can be called from another thread while
    /// this handle sits blocked in `recv`.
    pending: Mutex<HashMap<(u32, u32), Vec<u8>>>,
}

impl UnicastChan {
    /// Connect to a named unicast channel. `side` selects whether this
    /// handle produces or consumes; `relation` declares whether this side
    /// is shared by multiple handles (`Multi`) or owned by exactly one
    /// (`Single`). A failed open is logged here, where `IpcError` is
    /// actually constructed, before being propagated to the caller (§7:
    /// "the connect path maps system errors to failure booleans but logs
    /// the underlying code through a collaborator logging sink").
    pub fn connect(name: &str, side: Side, relation: Relation) -> IpcResult<Self> {
        let queue = UnicastQueue::open(name, side, relation)
            .map_err(|e| IpcError::from(e).log_and_propagate("connect"))?;
        Ok(Self {
            name: name.to_string(),
            queue,
            side,
            next_id: AtomicU32::new(0),
            pending: Mutex::new(HashMap::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn attached_count(&self) -> u32 {
        self.queue.attached_count()
    }

    pub fn wait_for_attached(&self, count: u32, timeout_ms: Option<u64>) -> io::Result<bool> {
        match self.queue.wait_for_attached(count, timeout_ms) {
            Ok(ok) => Ok(ok),
            Err(e) => Ok(IpcError::from(e).log_and_coalesce("wait_for_attached")),
        }
    }

    /// Split `data` into one or more elements sharing a fresh message id
    /// and push them in order, blocking up to `timeout_ms` per chunk.
    /// Returns `false` the moment any chunk fails to enqueue or a deeper
    /// error is raised, per the `send` contract (§7: `send`/`recv` surface
    /// only `{success, timeout, disconnect}`; anything else is logged and
    /// coalesced via [`IpcError::log_and_coalesce`]).
    pub fn send(&self, data: &[u8], timeout_ms: Option<u64>) -> io::Result<bool> {
        debug_assert_eq!(self.side, Side::Producer);

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if data.is_empty() {
            let elem = Element {
                producer_id: 0,
                id,
                remaining: -1,
                data: Vec::new(),
            };
            return Ok(Self::push_ok(self.queue.push(&elem, timeout_ms)));
        }

        let mut offset = 0usize;
        while offset < data.len() {
            let chunk_len = std::cmp::min(INLINE_PAYLOAD, data.len() - offset);
            let chunk = &data[offset..offset + chunk_len];
            offset += chunk_len;
            let remaining = (data.len() - offset) as i32;
            let remaining = if offset >= data.len() { -1 } else { remaining };
            let elem = Element {
                producer_id: 0,
                id,
                remaining,
                data: chunk.to_vec(),
            };
            if !Self::push_ok(self.queue.push(&elem, timeout_ms)) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn try_send(&self, data: &[u8]) -> io::Result<bool> {
        self.send(data, Some(0))
    }

    /// Coalesce a push result into the plain `send` contract: a system
    /// error is logged and treated the same as a full-ring failure.
    fn push_ok(result: io::Result<bool>) -> bool {
        match result {
            Ok(ok) => ok,
            Err(e) => IpcError::from(e).log_and_coalesce("send"),
        }
    }

    /// Coalesce a pop result into the plain `recv` contract: a system error
    /// is logged and treated the same as an empty ring.
    fn pop_ok(result: io::Result<Option<Element>>) -> Option<Element> {
        match result {
            Ok(elem) => elem,
            Err(e) => {
                IpcError::from(e).log_and_coalesce("recv");
                None
            }
        }
    }

    /// Pop elements, reassembling chunks by `(producer_id, message_id)`,
    /// until a terminal chunk completes a message or the deadline (or
    /// disconnect) elapses. Returns an empty [`Buffer`] on timeout,
    /// disconnect, or a coalesced deeper error.
    pub fn recv(&self, timeout_ms: Option<u64>) -> io::Result<Buffer> {
        debug_assert_eq!(self.side, Side::Consumer);

        loop {
            let elem = match Self::pop_ok(self.queue.pop(timeout_ms)) {
                Some(e) => e,
                None => return Ok(Buffer::empty()),
            };
            let key = (elem.producer_id, elem.id);
            if elem.remaining < 0 {
                let mut pending = self.pending.lock().unwrap();
                let bytes = match pending.remove(&key) {
                    Some(mut prefix) => {
                        prefix.extend_from_slice(&elem.data);
                        prefix
                    }
                    None => elem.data,
                };
                return Ok(Buffer::Owned(bytes));
            }
            self.pending
                .lock()
                .unwrap()
                .entry(key)
                .or_insert_with(Vec::new)
                .extend_from_slice(&elem.data);
        }
    }

    pub fn try_recv(&self) -> io::Result<Buffer> {
        match Self::pop_ok(self.queue.try_pop()) {
            None => Ok(Buffer::empty()),
            Some(elem) if elem.remaining < 0 => {
                let key = (elem.producer_id, elem.id);
                let mut pending = self.pending.lock().unwrap();
                let bytes = match pending.remove(&key) {
                    Some(mut prefix) => {
                        prefix.extend_from_slice(&elem.data);
                        prefix
                    }
                    None => elem.data,
                };
                Ok(Buffer::Owned(bytes))
            }
            Some(elem) => {
                let key = (elem.producer_id, elem.id);
                self.pending
                    .lock()
                    .unwrap()
                    .entry(key)
                    .or_insert_with(Vec::new)
                    .extend_from_slice(&elem.data);
                Ok(Buffer::empty())
            }
        }
    }

    /// Disconnect: clears this handle's attach count and disables the
    /// waiter so a thread blocked in `recv` wakes within one round trip.
    /// A teardown path: failures are logged and swallowed, never
    /// propagated (§7).
    pub fn disconnect(&self) {
        if let Err(e) = self.queue.disconnect() {
            IpcError::from(e).log_and_coalesce("disconnect");
        }
    }

    pub fn clear_storage(name: &str) {
        UnicastQueue::clear_storage(name);
    }
}

/// Re-exported broadcast facades, kept under their own names in
/// `channel.rs` (`chan<single, multi, broadcast>` and
/// `chan<multi, multi, broadcast>`).
pub use crate::channel::{Channel as BroadcastChan, Route};

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(prefix: &str) -> String {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        format!("{prefix}_chan_{n}")
    }

    #[test]
    fn round_trips_small_message() {
        let name = unique_name("small");
        UnicastChan::clear_storage(&name);

        let sender =
            UnicastChan::connect(&name, Side::Producer, Relation::Single).expect("sender");
        let receiver =
            UnicastChan::connect(&name, Side::Consumer, Relation::Single).expect("receiver");

        assert!(sender.send(b"Hello, World!\0", Some(500)).expect("send"));
        let buf = receiver.recv(Some(500)).expect("recv");
        assert_eq!(buf.as_bytes(), b"Hello, World!\0");
    }

    #[test]
    fn round_trips_multi_chunk_message() {
        let name = unique_name("chunked");
        UnicastChan::clear_storage(&name);

        let sender =
            UnicastChan::connect(&name, Side::Producer, Relation::Single).expect("sender");
        let receiver =
            UnicastChan::connect(&name, Side::Consumer, Relation::Single).expect("receiver");

        let payload: Vec<u8> = (0..300u32).map(|i| (i % 256) as u8).collect();
        assert!(sender.send(&payload, Some(1000)).expect("send"));
        let buf = receiver.recv(Some(1000)).expect("recv");
        assert_eq!(buf.len(), 300);
        assert_eq!(buf.as_bytes(), payload.as_slice());
    }

    #[test]
    fn round_trips_empty_message() {
        let name = unique_name("empty_msg");
        UnicastChan::clear_storage(&name);

        let sender =
            UnicastChan::connect(&name, Side::Producer, Relation::Single).expect("sender");
        let receiver =
            UnicastChan::connect(&name, Side::Consumer, Relation::Single).expect("receiver");

        assert!(sender.send(b"", Some(500)).expect("send"));
        let buf = receiver.recv(Some(500)).expect("recv");
        assert!(buf.is_empty());
    }

    #[test]
    fn disconnect_wakes_blocked_recv() {
        use std::sync::Arc;
        use std::time::{Duration, Instant};

        let name = unique_name("disc");
        UnicastChan::clear_storage(&name);

        let _sender =
            UnicastChan::connect(&name, Side::Producer, Relation::Single).expect("sender");
        // Same handle, shared via `Arc` so one thread can block in `recv`
        // while another calls `disconnect` concurrently (both take `&self`).
        let receiver = Arc::new(
            UnicastChan::connect(&name, Side::Consumer, Relation::Single).expect("receiver"),
        );

        let disconnect_handle = receiver.clone();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            disconnect_handle.disconnect();
        });

        let start = Instant::now();
        let buf = receiver.recv(None).expect("recv");
        t.join().unwrap();

        assert!(buf.is_empty());
        assert!(start.elapsed() < Duration::from_millis(500));
    }
}
