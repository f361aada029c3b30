// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Structured error kinds surfaced by the channel facade's connect path.
// send/recv themselves only ever return success/timeout/disconnect bools —
// anything deeper is logged here and coalesced, per the propagation policy.

use thiserror::Error;

/// Result alias for fallible setup operations (`open`, `connect`, ...).
pub type IpcResult<T> = Result<T, IpcError>;

/// Error kinds the core can surface. `send`/`recv` never propagate these
/// directly; they log through [`log`] and report only a bool or an empty
/// [`crate::Buffer`].
#[derive(Debug, Error)]
pub enum IpcError {
    #[error("name invalid: {0}")]
    NameInvalid(String),

    #[error("system error: {0}")]
    System(#[from] std::io::Error),

    #[error("capacity mismatch: ring reports {found}, caller expected {expected}")]
    CapacityMismatch { expected: u32, found: u32 },

    #[error("subscriber slots exhausted (max 32)")]
    SubscriberSlotsExhausted,

    #[error("operation attempted on a disconnected handle")]
    Disconnected,

    #[error("operation timed out")]
    Timeout,
}

impl IpcError {
    /// Log this error through the collaborator logging sink: `Disconnected`
    /// and `Timeout` are expected outcomes of normal operation (logged at
    /// `debug`), anything else is logged at `warn`.
    fn log(&self, context: &str) {
        match self {
            IpcError::Disconnected | IpcError::Timeout => {
                log::debug!("{context}: {self}");
            }
            _ => log::warn!("{context}: {self}"),
        }
    }

    /// Log this error through the collaborator logging sink and coalesce it
    /// into the boolean contract `send`/`recv` actually return.
    pub fn log_and_coalesce(self, context: &str) -> bool {
        self.log(context);
        false
    }

    /// Log this error and return it unchanged, for paths (e.g. `connect`)
    /// that must still propagate a constructed value to the caller rather
    /// than coalesce to a bool.
    pub fn log_and_propagate(self, context: &str) -> Self {
        self.log(context);
        self
    }
}
