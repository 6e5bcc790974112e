// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Named, inter-process robust mutex.
// Delegates to the native pthread backend or the synthesized shared backend.

use std::time::Duration;

use crate::backend::Backend;
use crate::error::{LockOutcome, Result};
use crate::lock_word::LockWord;
use crate::platform::NativeMutex;
use crate::shared::SharedMutex;

pub(crate) enum MutexImpl {
    Local(NativeMutex),
    Shared(SharedMutex),
}

/// A named, inter-process mutex that survives the death of its holder.
///
/// When a holder dies, the next successful lock returns
/// [`LockOutcome::OwnerDead`]. The new owner repairs the protected state and
/// calls [`mark_consistent`](Self::mark_consistent); unlocking without doing
/// so leaves the mutex permanently unrecoverable.
pub struct RobustMutex {
    pub(crate) inner: MutexImpl,
}

impl RobustMutex {
    /// Open (or create) a named mutex on `backend`.
    ///
    /// Every participant must open a given name with the same backend.
    pub fn open(name: &str, backend: &Backend) -> Result<Self> {
        let inner = match backend {
            Backend::Local => MutexImpl::Local(NativeMutex::open(name)?),
            Backend::Shared(coordinator) => {
                MutexImpl::Shared(SharedMutex::open(name, coordinator.clone())?)
            }
        };
        Ok(Self { inner })
    }

    /// Lock, blocking indefinitely.
    pub fn lock(&self) -> Result<LockOutcome> {
        match &self.inner {
            MutexImpl::Local(m) => m.lock(),
            MutexImpl::Shared(m) => m.lock(),
        }
    }

    /// Lock, giving up with `SyncError::Timeout` after `timeout`.
    pub fn lock_timeout(&self, timeout: Duration) -> Result<LockOutcome> {
        match &self.inner {
            MutexImpl::Local(m) => m.lock_timeout(timeout),
            MutexImpl::Shared(m) => m.lock_timeout(timeout),
        }
    }

    /// Lock without blocking; `SyncError::Busy` if held.
    pub fn try_lock(&self) -> Result<LockOutcome> {
        match &self.inner {
            MutexImpl::Local(m) => m.try_lock(),
            MutexImpl::Shared(m) => m.try_lock(),
        }
    }

    pub fn unlock(&self) -> Result<()> {
        match &self.inner {
            MutexImpl::Local(m) => m.unlock(),
            MutexImpl::Shared(m) => m.unlock(),
        }
    }

    /// Declare the protected state repaired after [`LockOutcome::OwnerDead`].
    pub fn mark_consistent(&self) -> Result<()> {
        match &self.inner {
            MutexImpl::Local(m) => m.mark_consistent(),
            MutexImpl::Shared(m) => m.mark_consistent(),
        }
    }

    pub fn is_shared(&self) -> bool {
        matches!(self.inner, MutexImpl::Shared(_))
    }

    /// Lock word of a shared-backend mutex, for diagnostics.
    pub fn shared_state(&self) -> Option<LockWord> {
        match &self.inner {
            MutexImpl::Local(_) => None,
            MutexImpl::Shared(m) => Some(m.state()),
        }
    }

    /// Remove the backing storage for a named mutex on either backend.
    pub fn clear_storage(name: &str) {
        NativeMutex::clear_storage(name);
        SharedMutex::clear_storage(name);
    }
}
