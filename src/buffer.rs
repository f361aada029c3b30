// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Port of cpp-ipc/include/libipc/buffer.h + buffer.cpp.
// An owning byte buffer used as the message type for IPC channels.
// In Rust this wraps a `Vec<u8>` instead of the C++ pimpl + custom destructor.

/// An owning byte buffer for IPC message data.
///
/// This is the Rust equivalent of `ipc::buffer`. Messages sent through
/// `Route` or `Channel` are serialised into `IpcBuffer` for transmission
/// and deserialised back on the receiver side.
#[derive(Clone)]
pub struct IpcBuffer {
    data: Vec<u8>,
}

impl IpcBuffer {
    /// Create an empty buffer.
    pub const fn new() -> Self {
        Self { data: Vec::new() }
    }

    /// Create a buffer from raw bytes (copies the data).
    pub fn from_slice(data: &[u8]) -> Self {
        Self { data: data.to_vec() }
    }

    /// Create a buffer taking ownership of a `Vec<u8>`.
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Create a buffer from a string (includes the null terminator for C++ compat).
    pub fn from_str(s: &str) -> Self {
        let mut v = Vec::with_capacity(s.len() + 1);
        v.extend_from_slice(s.as_bytes());
        v.push(0);
        Self { data: v }
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of bytes in the buffer.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Pointer to the data.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Mutable pointer to the data.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Consume into the underlying `Vec<u8>`.
    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    /// Convert to a `Vec<u8>` (clone).
    pub fn to_vec(&self) -> Vec<u8> {
        self.data.clone()
    }

    /// Swap contents with another buffer.
    pub fn swap(&mut self, other: &mut IpcBuffer) {
        std::mem::swap(&mut self.data, &mut other.data);
    }
}

impl Default for IpcBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for IpcBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl Eq for IpcBuffer {}

impl std::fmt::Debug for IpcBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcBuffer")
            .field("len", &self.data.len())
            .finish()
    }
}

impl From<Vec<u8>> for IpcBuffer {
    fn from(v: Vec<u8>) -> Self {
        Self::from_vec(v)
    }
}

impl From<&[u8]> for IpcBuffer {
    fn from(s: &[u8]) -> Self {
        Self::from_slice(s)
    }
}

impl From<&str> for IpcBuffer {
    fn from(s: &str) -> Self {
        Self::from_str(s)
    }
}

impl From<String> for IpcBuffer {
    fn from(s: String) -> Self {
        Self::from_str(&s)
    }
}

/// A handle identifying the pool a [`Buffer::Pooled`] range was reclaimed
/// from, so `Drop` can recycle it without the caller needing to know.
pub trait PoolHandle: Send + Sync {
    /// Release `len` bytes starting at `ptr` back to the pool.
    ///
    /// # Safety
    /// `ptr` must have been handed out by this same pool with at least
    /// `len` bytes of capacity, and must not already have been released.
    unsafe fn release(&self, ptr: *mut u8, len: usize);
}

/// Owning message buffer returned by `recv`.
///
/// Messages reassembled purely in-process (no pooled storage involved) are
/// `Owned`; messages recovered straight out of chunk storage without an
/// intermediate copy are `Pooled`, carrying the pool handle needed to
/// recycle the range on drop. Both arms expose the same move-only API so
/// callers never need to know which case they got.
pub enum Buffer {
    Owned(Vec<u8>),
    Pooled {
        ptr: std::ptr::NonNull<u8>,
        len: usize,
        pool: std::sync::Arc<dyn PoolHandle>,
    },
}

unsafe impl Send for Buffer {}

impl Buffer {
    /// An empty owned buffer, returned on timeout or disconnect.
    pub fn empty() -> Self {
        Buffer::Owned(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn len(&self) -> usize {
        match self {
            Buffer::Owned(v) => v.len(),
            Buffer::Pooled { len, .. } => *len,
        }
    }

    /// View the buffer's bytes regardless of which arm backs them.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Buffer::Owned(v) => v.as_slice(),
            Buffer::Pooled { ptr, len, .. } => unsafe {
                std::slice::from_raw_parts(ptr.as_ptr(), *len)
            },
        }
    }

    /// Consume into an owned `Vec<u8>`, copying out of pooled storage if
    /// necessary.
    pub fn into_vec(self) -> Vec<u8> {
        match self {
            Buffer::Owned(v) => v,
            Buffer::Pooled { .. } => self.as_bytes().to_vec(),
        }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Buffer::Pooled { ptr, len, pool } = self {
            unsafe { pool.release(ptr.as_ptr(), *len) };
        }
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Buffer::Owned(v) => f.debug_tuple("Owned").field(&v.len()).finish(),
            Buffer::Pooled { len, .. } => f.debug_tuple("Pooled").field(len).finish(),
        }
    }
}

impl PartialEq for Buffer {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(v: Vec<u8>) -> Self {
        Buffer::Owned(v)
    }
}
