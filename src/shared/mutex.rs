// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Synthesized robust mutex.
//
// The uncontended path is a single compare-exchange on the lock word.
// Contended threads register in the word's waiter count and park on the
// referee; unlockers wake one of them. Crash recovery arrives as a cleanup
// job on a waiting thread, which repairs the word in place.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{expired, mutex_blocks, remaining, run_cleanup, stall, KeyCell, SharedBlock};
use crate::coordinator::Coordinator;
use crate::error::{LockOutcome, Result, SyncError};
use crate::lock_word::LockWord;
use crate::referee::WaitOutcome;
use crate::session::Session;
use crate::wire::LockKey;

#[repr(C)]
struct MutexBlock {
    cell: KeyCell,
    word: AtomicU64,
}

pub struct SharedMutex {
    block: SharedBlock<MutexBlock>,
    coordinator: Arc<dyn Coordinator>,
    key: LockKey,
}

impl SharedMutex {
    /// Open (or create) the named mutex, arbitrated by `coordinator`.
    pub fn open(name: &str, coordinator: Arc<dyn Coordinator>) -> Result<Self> {
        let block = SharedBlock::<MutexBlock>::open(mutex_blocks(), name)?;
        let b = block.get();
        let key = b
            .cell
            .ensure(coordinator.as_ref(), || b.word.store(0, Ordering::Relaxed))?;
        tracing::debug!(name, key, "shared mutex opened");
        Ok(Self {
            block,
            coordinator,
            key,
        })
    }

    /// Remove the backing storage for a named shared mutex.
    pub fn clear_storage(name: &str) {
        SharedBlock::<MutexBlock>::clear_storage(mutex_blocks(), name);
    }

    fn word(&self) -> &AtomicU64 {
        &self.block.get().word
    }

    pub(crate) fn key(&self) -> LockKey {
        debug_assert_eq!(self.key, self.block.get().cell.key());
        self.key
    }

    pub(crate) fn coordinator(&self) -> &Arc<dyn Coordinator> {
        &self.coordinator
    }

    pub(crate) fn is_held_by(&self, s: &Session) -> bool {
        self.state().is_owner(s.thread_id()) && s.holds(self.key)
    }

    /// Current lock word, for diagnostics.
    pub fn state(&self) -> LockWord {
        LockWord::from_raw(self.word().load(Ordering::Acquire))
    }

    pub fn lock(&self) -> Result<LockOutcome> {
        Session::with(self.coordinator.as_ref(), |s| self.lock_in(s, None))
    }

    pub fn lock_timeout(&self, timeout: Duration) -> Result<LockOutcome> {
        let deadline = Instant::now() + timeout;
        Session::with(self.coordinator.as_ref(), |s| self.lock_in(s, Some(deadline)))
    }

    pub fn try_lock(&self) -> Result<LockOutcome> {
        Session::with(self.coordinator.as_ref(), |s| self.try_lock_in(s))
    }

    pub fn unlock(&self) -> Result<()> {
        Session::with(self.coordinator.as_ref(), |s| self.unlock_in(s))
    }

    /// Declare the protected state repaired after `LockOutcome::OwnerDead`.
    pub fn mark_consistent(&self) -> Result<()> {
        Session::with(self.coordinator.as_ref(), |s| {
            if !self.is_held_by(s) {
                return Err(SyncError::InvalidOperation("mutex not held by this thread"));
            }
            let me = s.thread_id();
            let word = self.word();
            let mut cur = LockWord::from_raw(word.load(Ordering::Acquire));
            loop {
                if !cur.is_owner(me) {
                    return Err(SyncError::InvalidOperation("mutex not held by this thread"));
                }
                if !cur.is_owner_dead() {
                    return Err(SyncError::InvalidOperation("mutex is not inconsistent"));
                }
                let next = cur.made_consistent();
                match word.compare_exchange(cur.raw(), next.raw(), Ordering::AcqRel, Ordering::Acquire)
                {
                    Ok(_) => {
                        tracing::info!(key = self.key, "mutex marked consistent");
                        return Ok(());
                    }
                    Err(actual) => cur = LockWord::from_raw(actual),
                }
            }
        })
    }

    pub(crate) fn lock_in(&self, s: &mut Session, deadline: Option<Instant>) -> Result<LockOutcome> {
        if self.is_held_by(s) {
            return Err(SyncError::InvalidOperation("mutex already held by this thread"));
        }
        let key = self.key();
        s.start_operation(key);
        let result = self.acquire(s, key, deadline);
        s.finish_lock(key, result)
    }

    fn acquire(&self, s: &mut Session, key: LockKey, deadline: Option<Instant>) -> Result<LockWord> {
        let word = self.word();
        let me = s.thread_id();
        let mut registered = false;
        // Whether the last WAIT consumed a wakeup.
        let mut woken = false;
        let mut k = 0u32;
        loop {
            let cur = LockWord::from_raw(word.load(Ordering::Acquire));
            if cur.is_unrecoverable() {
                if registered {
                    self.withdraw(s, key)?;
                }
                return Err(SyncError::NotRecoverable);
            }

            if !cur.is_locked() {
                // A registered waiter's slot is taken out in the same step,
                // which must not race a claim holder's count update.
                if registered && cur.waiter_claim() != 0 {
                    stall(s, key, word, &mut k)?;
                    continue;
                }
                let next = cur.acquired_by(me, registered);
                if word
                    .compare_exchange(cur.raw(), next.raw(), Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    if registered && !woken {
                        self.return_wakeup(s, key, word);
                    }
                    return Ok(cur);
                }
                continue;
            }

            if expired(deadline) {
                if registered {
                    self.withdraw(s, key)?;
                }
                return Err(SyncError::Timeout);
            }

            if !registered {
                match s.register_as_waiter(word) {
                    Ok(()) => registered = true,
                    Err(SyncError::Busy) | Err(SyncError::ResourceExhausted) => {
                        stall(s, key, word, &mut k)?;
                    }
                    Err(e) => return Err(e),
                }
                // Re-check the word: the holder may have released before we
                // were counted, and would not have woken anyone.
                continue;
            }

            let outcome = s.client().wait(key, 0, remaining(deadline))?;
            woken = outcome == WaitOutcome::Woken;
            if let WaitOutcome::Cleanup(job) = outcome {
                run_cleanup(s, word, &job)?;
            }
        }
    }

    /// A registered waiter that took the lock without consuming a wakeup
    /// may have left the unlocker's wakeup behind as credit. Take it back;
    /// this thread's own unlock wakes any waiter still counted.
    fn return_wakeup(&self, s: &mut Session, key: LockKey, word: &AtomicU64) {
        let res = match s.client().wait(key, 0, Some(Duration::ZERO)) {
            Ok(WaitOutcome::Cleanup(job)) => run_cleanup(s, word, &job),
            Ok(_) => Ok(()),
            Err(e) => Err(e),
        };
        if let Err(e) = res {
            tracing::debug!(key, error = %e, "leftover wakeup not returned");
        }
    }

    /// Leave the waiter count without acquiring. A wakeup this thread may
    /// have absorbed is passed on.
    fn withdraw(&self, s: &mut Session, key: LockKey) -> Result<()> {
        let word = self.word();
        let mut k = 0u32;
        while !s.try_unregister_waiter(word) {
            stall(s, key, word, &mut k)?;
        }
        let cur = LockWord::from_raw(word.load(Ordering::Acquire));
        if !cur.is_locked() && cur.is_waited() && !cur.is_unrecoverable() {
            s.client().wake(key, 0, 1)?;
        }
        Ok(())
    }

    pub(crate) fn try_lock_in(&self, s: &mut Session) -> Result<LockOutcome> {
        let me = s.thread_id();
        let word = self.word();
        if self.is_held_by(s) {
            return Err(SyncError::Busy);
        }
        let key = self.key();
        s.start_operation(key);
        let result = loop {
            let cur = LockWord::from_raw(word.load(Ordering::Acquire));
            if cur.is_unrecoverable() {
                break Err(SyncError::NotRecoverable);
            }
            if cur.is_locked() {
                break Err(SyncError::Busy);
            }
            let next = cur.acquired_by(me, false);
            if word
                .compare_exchange(cur.raw(), next.raw(), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break Ok(cur);
            }
        };
        s.finish_lock(key, result)
    }

    pub(crate) fn unlock_in(&self, s: &mut Session) -> Result<()> {
        let word = self.word();
        let key = self.key();
        if !self.is_held_by(s) {
            return Err(SyncError::InvalidOperation("mutex not held by this thread"));
        }
        let mut cur = LockWord::from_raw(word.load(Ordering::Acquire));
        s.start_operation(key);
        let next = loop {
            let next = if cur.is_owner_dead() {
                cur.made_unrecoverable()
            } else {
                cur.released()
            };
            match word.compare_exchange(cur.raw(), next.raw(), Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => break next,
                Err(actual) => cur = LockWord::from_raw(actual),
            }
        };

        let wakeups = if next.is_unrecoverable() {
            tracing::warn!(key, "unlocked without mark_consistent; mutex is now unrecoverable");
            u32::MAX
        } else if next.is_waited() {
            1
        } else {
            0
        };
        let result = if wakeups > 0 {
            s.client().wake(key, 0, wakeups).map(|_| ())
        } else {
            Ok(())
        };
        s.finish_unlock(key);
        result
    }
}
