// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Synthesized condition variable over a shared mutex.
//
// Waiters draw tickets from `next_ticket`; signal and broadcast advance
// `released_ticket` and ask the referee to release waiters whose ticket is
// now covered. A waiter that arrives after a broadcast draws a ticket past
// the released mark and is not woken by it.
//
// Accounting: live waiters = (next - released) + outstanding wakeup credit.
// A waiter that gives up takes the credit left for its ticket if a signal
// already covered it and the wakeup has landed. Otherwise it retires one
// unreleased ticket or, if every ticket is already released, consumes one
// credit. The referee's value for the key tracks `released_ticket`, so any
// released waiter may take any credit and no unreleased waiter can.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{cond_blocks, remaining, KeyCell, SharedBlock, SharedMutex};
use crate::condition::CondWait;
use crate::coordinator::Coordinator;
use crate::error::{Result, SyncError};
use crate::referee::WaitOutcome;
use crate::session::Session;
use crate::wire::LockKey;

#[repr(C)]
struct CondBlock {
    cell: KeyCell,
    /// Key of the mutex waiters currently pair with; 0 when unbound.
    mutex_key: AtomicU32,
    _pad: u32,
    next_ticket: AtomicU64,
    released_ticket: AtomicU64,
}

pub struct SharedCondition {
    block: SharedBlock<CondBlock>,
    coordinator: Arc<dyn Coordinator>,
    key: LockKey,
}

impl SharedCondition {
    /// Open (or create) the named condition variable, arbitrated by
    /// `coordinator`.
    pub fn open(name: &str, coordinator: Arc<dyn Coordinator>) -> Result<Self> {
        let block = SharedBlock::<CondBlock>::open(cond_blocks(), name)?;
        let b = block.get();
        let key = b.cell.ensure(coordinator.as_ref(), || {
            b.mutex_key.store(0, Ordering::Relaxed);
            b.next_ticket.store(0, Ordering::Relaxed);
            b.released_ticket.store(0, Ordering::Relaxed);
        })?;
        tracing::debug!(name, key, "shared condition opened");
        Ok(Self {
            block,
            coordinator,
            key,
        })
    }

    pub fn clear_storage(name: &str) {
        SharedBlock::<CondBlock>::clear_storage(cond_blocks(), name);
    }

    fn block(&self) -> &CondBlock {
        self.block.get()
    }

    /// Waiters that have drawn a ticket and not yet been released.
    pub fn pending(&self) -> u64 {
        let b = self.block();
        let released = b.released_ticket.load(Ordering::Acquire);
        b.next_ticket.load(Ordering::Acquire).saturating_sub(released)
    }

    /// Atomically release `mutex` and wait for a signal, then reacquire
    /// `mutex`. The caller must hold `mutex`.
    pub fn wait(&self, mutex: &SharedMutex, timeout: Option<Duration>) -> Result<CondWait> {
        if mutex.coordinator().id() != self.coordinator.id() {
            return Err(SyncError::InvalidOperation(
                "mutex and condition use different coordinators",
            ));
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        Session::with(self.coordinator.as_ref(), |s| self.wait_in(s, mutex, deadline))
    }

    fn wait_in(
        &self,
        s: &mut Session,
        mutex: &SharedMutex,
        deadline: Option<Instant>,
    ) -> Result<CondWait> {
        if !mutex.is_held_by(s) {
            return Err(SyncError::InvalidOperation("mutex not held by this thread"));
        }
        self.bind_mutex(mutex.key())?;

        let ticket = self.block().next_ticket.fetch_add(1, Ordering::AcqRel);
        if let Err(e) = mutex.unlock_in(s) {
            // Nobody will wait on this ticket.
            if let Err(undo) = self.give_up(s, ticket) {
                tracing::warn!(key = self.key, ticket, error = %undo, "condition ticket not retired");
            }
            return Err(e);
        }
        let signaled = self.block_on_ticket(s, ticket, deadline)?;
        let lock = mutex.lock_in(s, None)?;
        Ok(CondWait { signaled, lock })
    }

    fn bind_mutex(&self, mutex_key: LockKey) -> Result<()> {
        let b = self.block();
        let mut bound = b.mutex_key.load(Ordering::Acquire);
        loop {
            if bound == mutex_key {
                return Ok(());
            }
            if bound != 0 && self.pending() > 0 {
                return Err(SyncError::InvalidOperation(
                    "condition is in use with a different mutex",
                ));
            }
            match b
                .mutex_key
                .compare_exchange(bound, mutex_key, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Ok(()),
                Err(actual) => bound = actual,
            }
        }
    }

    /// Park on the referee until `ticket` is released or `deadline` passes.
    /// Returns whether the wakeup was a signal.
    fn block_on_ticket(&self, s: &mut Session, ticket: u64, deadline: Option<Instant>) -> Result<bool> {
        loop {
            match s.client().wait(self.key, ticket + 1, remaining(deadline))? {
                WaitOutcome::Woken => return Ok(true),
                WaitOutcome::TimedOut => return self.give_up(s, ticket),
                WaitOutcome::Cleanup(job) => {
                    // Condition keys never carry lock state.
                    tracing::warn!(key = job.key, job = job.id, "cleanup job on condition key");
                    s.client().cleanup_done(job.key, 0)?;
                }
            }
        }
    }

    /// Settle the accounting for a waiter whose wait timed out. Returns
    /// whether the waiter leaves as signaled.
    fn give_up(&self, s: &mut Session, ticket: u64) -> Result<bool> {
        let b = self.block();
        if b.released_ticket.load(Ordering::Acquire) > ticket {
            // A signal covered this ticket: once its wakeup has landed, the
            // wakeup wins.
            if self.take_credit(s, ticket + 1, Some(Duration::ZERO))? {
                return Ok(true);
            }
        }
        let mut released = b.released_ticket.load(Ordering::Acquire);
        loop {
            let next = b.next_ticket.load(Ordering::Acquire);
            if next <= released {
                // Every ticket is released: a wakeup credit is outstanding,
                // and this thread takes one.
                return self.take_credit(s, 0, None);
            }
            match b.released_ticket.compare_exchange(
                released,
                released + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    // Keep the referee's value level with the released mark,
                    // so outstanding credit stays usable by every released
                    // ticket.
                    s.client().wake(self.key, released + 1, 0)?;
                    return Ok(false);
                }
                Err(actual) => released = actual,
            }
        }
    }

    /// Consume one wakeup credit eligible at `threshold`. With a timeout,
    /// returns `false` if none arrived in time.
    fn take_credit(
        &self,
        s: &mut Session,
        threshold: u64,
        timeout: Option<Duration>,
    ) -> Result<bool> {
        loop {
            match s.client().wait(self.key, threshold, timeout)? {
                WaitOutcome::Woken => return Ok(true),
                WaitOutcome::TimedOut if timeout.is_some() => return Ok(false),
                WaitOutcome::TimedOut => {}
                WaitOutcome::Cleanup(job) => s.client().cleanup_done(job.key, 0)?,
            }
        }
    }

    /// Wake one waiter, if any.
    pub fn notify(&self) -> Result<()> {
        let b = self.block();
        let mut released = b.released_ticket.load(Ordering::Acquire);
        loop {
            if b.next_ticket.load(Ordering::Acquire) <= released {
                return Ok(());
            }
            match b.released_ticket.compare_exchange(
                released,
                released + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => released = actual,
            }
        }
        Session::with(self.coordinator.as_ref(), |s| {
            s.client().wake(self.key, released + 1, 1).map(|_| ())
        })
    }

    /// Wake every waiter that drew a ticket before this call.
    pub fn broadcast(&self) -> Result<()> {
        let b = self.block();
        let mut released = b.released_ticket.load(Ordering::Acquire);
        let next = loop {
            let next = b.next_ticket.load(Ordering::Acquire);
            if next <= released {
                return Ok(());
            }
            match b
                .released_ticket
                .compare_exchange(released, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break next,
                Err(actual) => released = actual,
            }
        };
        let count = (next - released).min(u32::MAX as u64) as u32;
        Session::with(self.coordinator.as_ref(), |s| {
            s.client().wake(self.key, next, count).map(|_| ())
        })
    }
}
