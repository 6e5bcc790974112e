// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Error taxonomy shared by both mutex backends, the condition variable and
// the lock referee transport.

use std::io;

use thiserror::Error;

/// Successful outcome of acquiring a robust mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    /// The lock was acquired and the protected state is consistent.
    Acquired,
    /// The lock was acquired, but the previous owner died while holding it.
    /// Call `mark_consistent` before unlocking, or the mutex becomes
    /// permanently unusable.
    OwnerDead,
}

impl LockOutcome {
    pub fn is_owner_dead(self) -> bool {
        self == LockOutcome::OwnerDead
    }
}

/// Errors surfaced by the synchronization primitives.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The mutex was unlocked while inconsistent; it can never be acquired again.
    #[error("mutex is not recoverable")]
    NotRecoverable,

    /// `try_lock` found the mutex held.
    #[error("mutex is busy")]
    Busy,

    /// A timed operation expired.
    #[error("operation timed out")]
    Timeout,

    /// The call is not valid in the current state.
    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),

    /// A bounded table (waiter slots, record slots) is full.
    #[error("resource exhausted")]
    ResourceExhausted,

    /// The lock referee could not be reached or started.
    #[error("lock referee `{rendezvous}` unreachable: {source}")]
    Unreachable {
        rendezvous: String,
        #[source]
        source: io::Error,
    },

    /// The referee or a client sent a malformed or unexpected frame.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Underlying OS error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, SyncError>;

impl SyncError {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        SyncError::Protocol(msg.into())
    }
}
