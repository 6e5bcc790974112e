// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Named inter-process condition variable paired with a `RobustMutex`.
// Local: pthread_cond_t in shared memory with PTHREAD_PROCESS_SHARED.
// Shared: ticketed waits arbitrated by the lock referee.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::Backend;
use crate::error::{LockOutcome, Result, SyncError};
use crate::mutex::{MutexImpl, RobustMutex};
use crate::platform::posix::{self, CachedShm};
use crate::shared::SharedCondition;

/// Result of a condition wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CondWait {
    /// `false` when the wait timed out.
    pub signaled: bool,
    /// Outcome of re-acquiring the mutex. May be `OwnerDead` if the mutex
    /// holder died while this thread was waiting.
    pub lock: LockOutcome,
}

enum CondImpl {
    Local(NativeCondition),
    Shared(SharedCondition),
}

pub struct RobustCondvar {
    inner: CondImpl,
}

impl RobustCondvar {
    /// Open (or create) a named condition variable on `backend`.
    pub fn open(name: &str, backend: &Backend) -> Result<Self> {
        let inner = match backend {
            Backend::Local => CondImpl::Local(NativeCondition::open(name)?),
            Backend::Shared(coordinator) => {
                CondImpl::Shared(SharedCondition::open(name, Arc::clone(coordinator))?)
            }
        };
        Ok(Self { inner })
    }

    /// Wait for a signal. The caller must hold `mtx`; it is released for the
    /// duration of the wait and re-acquired before returning.
    pub fn wait(&self, mtx: &RobustMutex) -> Result<CondWait> {
        self.wait_inner(mtx, None)
    }

    /// Like [`wait`](Self::wait), giving up after `timeout`. A timed-out wait
    /// still re-acquires the mutex and reports `signaled == false`.
    pub fn wait_timeout(&self, mtx: &RobustMutex, timeout: Duration) -> Result<CondWait> {
        self.wait_inner(mtx, Some(timeout))
    }

    fn wait_inner(&self, mtx: &RobustMutex, timeout: Option<Duration>) -> Result<CondWait> {
        match (&self.inner, &mtx.inner) {
            (CondImpl::Local(c), MutexImpl::Local(m)) => c.wait(m.native_ptr(), timeout),
            (CondImpl::Shared(c), MutexImpl::Shared(m)) => c.wait(m, timeout),
            _ => Err(SyncError::InvalidOperation(
                "condition and mutex use different backends",
            )),
        }
    }

    /// Wake one waiter.
    pub fn notify(&self) -> Result<()> {
        match &self.inner {
            CondImpl::Local(c) => c.notify(),
            CondImpl::Shared(c) => c.notify(),
        }
    }

    /// Wake every current waiter.
    pub fn broadcast(&self) -> Result<()> {
        match &self.inner {
            CondImpl::Local(c) => c.broadcast(),
            CondImpl::Shared(c) => c.broadcast(),
        }
    }

    /// Remove the backing storage for a named condition variable.
    pub fn clear_storage(name: &str) {
        NativeCondition::clear_storage(name);
        SharedCondition::clear_storage(name);
    }
}

// ---------------------------------------------------------------------------
// Native implementation — pthread_cond_t in shared memory
// ---------------------------------------------------------------------------

struct NativeCondition {
    cached: Arc<CachedShm>,
    name: String,
}

impl NativeCondition {
    fn open(name: &str) -> io::Result<Self> {
        let shm_size = std::mem::size_of::<libc::pthread_cond_t>();
        let cached = posix::cached_shm_acquire(posix::cond_cache(), name, shm_size, |base| {
            let cond_ptr = base as *mut libc::pthread_cond_t;
            unsafe {
                std::ptr::write_bytes(cond_ptr, 0, 1);

                let mut attr: libc::pthread_condattr_t = std::mem::zeroed();
                let mut eno = libc::pthread_condattr_init(&mut attr);
                if eno != 0 {
                    return Err(io::Error::from_raw_os_error(eno));
                }

                eno = libc::pthread_condattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
                if eno != 0 {
                    libc::pthread_condattr_destroy(&mut attr);
                    return Err(io::Error::from_raw_os_error(eno));
                }

                eno = libc::pthread_cond_init(cond_ptr, &attr);
                libc::pthread_condattr_destroy(&mut attr);
                if eno != 0 {
                    return Err(io::Error::from_raw_os_error(eno));
                }
            }
            Ok(())
        })?;

        Ok(Self {
            cached,
            name: name.to_string(),
        })
    }

    fn cond_ptr(&self) -> *mut libc::pthread_cond_t {
        self.cached.shm.as_mut_ptr() as *mut libc::pthread_cond_t
    }

    fn wait(&self, mtx_ptr: *mut libc::pthread_mutex_t, timeout: Option<Duration>) -> Result<CondWait> {
        let eno = match timeout {
            None => unsafe { libc::pthread_cond_wait(self.cond_ptr(), mtx_ptr) },
            Some(t) => {
                let ts = posix::realtime_deadline(t);
                unsafe { libc::pthread_cond_timedwait(self.cond_ptr(), mtx_ptr, &ts) }
            }
        };
        let (signaled, lock) = match eno {
            0 => (true, LockOutcome::Acquired),
            libc::ETIMEDOUT => (false, LockOutcome::Acquired),
            #[cfg(not(target_os = "macos"))]
            libc::EOWNERDEAD => (true, LockOutcome::OwnerDead),
            #[cfg(not(target_os = "macos"))]
            libc::ENOTRECOVERABLE => return Err(SyncError::NotRecoverable),
            libc::EPERM => return Err(SyncError::InvalidOperation("mutex not held by this thread")),
            _ => return Err(io::Error::from_raw_os_error(eno).into()),
        };
        Ok(CondWait { signaled, lock })
    }

    fn notify(&self) -> Result<()> {
        let eno = unsafe { libc::pthread_cond_signal(self.cond_ptr()) };
        if eno != 0 {
            return Err(io::Error::from_raw_os_error(eno).into());
        }
        Ok(())
    }

    fn broadcast(&self) -> Result<()> {
        let eno = unsafe { libc::pthread_cond_broadcast(self.cond_ptr()) };
        if eno != 0 {
            return Err(io::Error::from_raw_os_error(eno).into());
        }
        Ok(())
    }

    fn clear_storage(name: &str) {
        posix::cached_shm_purge(posix::cond_cache(), name);
        posix::PlatformShm::unlink_by_name(name);
    }
}

impl Drop for NativeCondition {
    fn drop(&mut self) {
        // No pthread_cond_destroy, for the same reason as NativeMutex.
        posix::cached_shm_release(posix::cond_cache(), &self.name);
    }
}
