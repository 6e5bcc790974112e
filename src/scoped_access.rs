// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// RAII guards: lock a robust mutex for the lifetime of the guard, optionally
// exposing a shared memory region the mutex protects.

use std::io;

use crate::error::{LockOutcome, Result};
use crate::{RobustMutex, ShmHandle};

/// Locks the mutex on construction, unlocks on drop.
///
/// If the previous holder died, [`outcome`](Self::outcome) is
/// `OwnerDead`; repair the state and call
/// [`mark_consistent`](Self::mark_consistent) before the guard drops.
pub struct ScopedLock<'a> {
    mtx: &'a RobustMutex,
    outcome: LockOutcome,
}

impl<'a> ScopedLock<'a> {
    pub fn new(mtx: &'a RobustMutex) -> Result<Self> {
        let outcome = mtx.lock()?;
        Ok(Self { mtx, outcome })
    }

    pub fn outcome(&self) -> LockOutcome {
        self.outcome
    }

    pub fn mark_consistent(&mut self) -> Result<()> {
        self.mtx.mark_consistent()?;
        self.outcome = LockOutcome::Acquired;
        Ok(())
    }
}

impl Drop for ScopedLock<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.mtx.unlock() {
            tracing::warn!(error = %e, "scoped unlock failed");
        }
    }
}

/// A [`ScopedLock`] that also provides `read()` / `write()` access to the
/// shared memory region guarded by the mutex.
pub struct ScopedAccess<'a> {
    lock: ScopedLock<'a>,
    shm: &'a ShmHandle,
}

impl<'a> ScopedAccess<'a> {
    pub fn new(shm: &'a ShmHandle, mtx: &'a RobustMutex) -> Result<Self> {
        Ok(Self {
            lock: ScopedLock::new(mtx)?,
            shm,
        })
    }

    pub fn outcome(&self) -> LockOutcome {
        self.lock.outcome()
    }

    pub fn mark_consistent(&mut self) -> Result<()> {
        self.lock.mark_consistent()
    }

    /// The user-visible region.
    pub fn read(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.shm.as_ptr(), self.shm.user_size()) }
    }

    /// Write `buf` at the start of the region.
    pub fn write(&self, buf: &[u8]) -> io::Result<()> {
        let cap = self.shm.user_size();
        if buf.len() > cap {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("buffer too large for shared memory region ({} > {cap})", buf.len()),
            ));
        }
        unsafe {
            std::ptr::copy_nonoverlapping(buf.as_ptr(), self.shm.as_mut_ptr(), buf.len());
        }
        Ok(())
    }
}
