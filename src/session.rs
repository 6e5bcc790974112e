// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Per-thread participant session.
//
// Each thread that touches a synthesized lock holds one session per
// coordinator: its referee connection and its robust record. Sessions live
// in thread-local storage and are torn down with the thread; the referee
// sees the connection drop and diagnoses the record. A thread that exits
// while holding a lock is therefore indistinguishable from one that crashed.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::coordinator::{Coordinator, CoordinatorClient};
use crate::error::{LockOutcome, Result, SyncError};
use crate::lock_word::{LockWord, ThreadId, MAX_THREAD_ID};
use crate::record::{RecordSlot, RobustRecord, MAX_HELD};
use crate::wire::LockKey;

thread_local! {
    static SESSIONS: RefCell<Vec<Session>> = const { RefCell::new(Vec::new()) };
}

#[cfg(target_os = "linux")]
fn os_thread_id() -> u32 {
    unsafe { libc::syscall(libc::SYS_gettid) as u32 }
}

#[cfg(not(target_os = "linux"))]
fn os_thread_id() -> u32 {
    use std::sync::atomic::AtomicU32;
    static NEXT: AtomicU32 = AtomicU32::new(1);
    thread_local!(static LOCAL: u32 = NEXT.fetch_add(1, Ordering::Relaxed));
    LOCAL.with(|id| (std::process::id() << 12) ^ *id)
}

/// Identity of the calling thread as recorded in lock words. Stable for the
/// life of the thread and unique among live threads on Linux.
pub fn current_thread_id() -> ThreadId {
    match os_thread_id() & MAX_THREAD_ID {
        0 => 1,
        id => id,
    }
}

pub struct Session {
    coordinator_id: u64,
    thread_id: ThreadId,
    client: Box<dyn CoordinatorClient>,
    record: RecordSlot,
}

impl Session {
    /// Connect to `coordinator` and bind a robust record to this thread.
    pub fn open(coordinator: &dyn Coordinator) -> Result<Self> {
        let mut client = coordinator.connect()?;
        let record = client.get_robust()?;
        let thread_id = current_thread_id();
        record.bind(thread_id);
        tracing::debug!(
            rendezvous = coordinator.rendezvous(),
            thread_id,
            slot = record.index(),
            "session opened"
        );
        Ok(Self {
            coordinator_id: coordinator.id(),
            thread_id,
            client,
            record,
        })
    }

    /// Run `f` with this thread's session for `coordinator`, opening it on
    /// first use.
    pub fn with<R, F>(coordinator: &dyn Coordinator, f: F) -> Result<R>
    where
        F: FnOnce(&mut Session) -> Result<R>,
    {
        SESSIONS
            .try_with(|cell| {
                let mut sessions = cell.borrow_mut();
                let idx = match sessions
                    .iter()
                    .position(|s| s.coordinator_id == coordinator.id())
                {
                    Some(i) => i,
                    None => {
                        sessions.push(Session::open(coordinator)?);
                        sessions.len() - 1
                    }
                };
                f(&mut sessions[idx])
            })
            .map_err(|_| SyncError::InvalidOperation("thread is exiting"))?
    }

    /// End this thread's session for `coordinator`, if any. Locks still held
    /// are reported to the referee as held by a dead participant.
    pub fn end(coordinator: &dyn Coordinator) -> bool {
        SESSIONS
            .try_with(|cell| {
                let mut sessions = cell.borrow_mut();
                let before = sessions.len();
                sessions.retain(|s| s.coordinator_id != coordinator.id());
                sessions.len() != before
            })
            .unwrap_or(false)
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    pub fn client(&mut self) -> &mut dyn CoordinatorClient {
        self.client.as_mut()
    }

    pub fn record(&self) -> &RobustRecord {
        &self.record
    }

    /// Whether this session acquired `key` and has not released it. A lock
    /// word naming this thread is not enough: it may be left over from an
    /// earlier session of the same thread.
    pub fn holds(&self, key: LockKey) -> bool {
        // A full record dropped entries and cannot vouch either way.
        self.record.num_locked() >= MAX_HELD || self.record.locked_keys().contains(&key)
    }

    /// Publish that this thread is about to operate on `key`.
    pub fn start_operation(&self, key: LockKey) {
        self.record.set_attempt(key);
    }

    /// Close a lock attempt on `key`. On success `observed` is the word the
    /// acquiring compare-exchange replaced.
    pub fn finish_lock(&self, key: LockKey, result: Result<LockWord>) -> Result<LockOutcome> {
        let outcome = result.map(|observed| {
            if !self.record.push_locked(key) {
                tracing::warn!(key, "robust record full; crash of this holder will not be repaired");
            }
            if observed.is_owner_dead() {
                LockOutcome::OwnerDead
            } else {
                LockOutcome::Acquired
            }
        });
        self.record.set_waiter(false);
        self.record.set_attempt(0);
        outcome
    }

    /// Close an unlock of `key`.
    pub fn finish_unlock(&self, key: LockKey) {
        self.record.pop_locked(key);
        self.record.set_attempt(0);
    }

    /// Count this thread as a waiter in `word`.
    ///
    /// Fails with `Busy` while another thread holds the waiter claim and
    /// with `ResourceExhausted` when the count is saturated; callers back off
    /// and retry.
    pub fn register_as_waiter(&self, word: &AtomicU64) -> Result<()> {
        let id = self.thread_id;
        let mut cur = LockWord::from_raw(word.load(Ordering::Acquire));
        loop {
            if cur.is_unrecoverable() {
                return Err(SyncError::NotRecoverable);
            }
            if cur.waiter_claim() != 0 {
                return Err(SyncError::Busy);
            }
            let next = cur
                .with_waiter_registered(id)
                .ok_or(SyncError::ResourceExhausted)?;
            match word.compare_exchange_weak(cur.raw(), next.raw(), Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(actual) => cur = LockWord::from_raw(actual),
            }
        }
        // Claim held: a crash from here on is repaired through the claim.
        self.record.set_waiter(true);
        word.fetch_sub(LockWord::claim_bits(id), Ordering::AcqRel);
        Ok(())
    }

    /// Withdraw this thread's waiter registration from `word`. Returns
    /// `false` while another thread holds the waiter claim.
    pub fn try_unregister_waiter(&self, word: &AtomicU64) -> bool {
        let id = self.thread_id;
        let mut cur = LockWord::from_raw(word.load(Ordering::Acquire));
        loop {
            if cur.waiter_claim() != 0 {
                return false;
            }
            if !cur.is_waited() {
                self.record.set_waiter(false);
                return true;
            }
            let next = cur.with_claim_for_removal(id);
            match word.compare_exchange_weak(cur.raw(), next.raw(), Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(actual) => cur = LockWord::from_raw(actual),
            }
        }
        self.record.set_waiter(false);
        word.fetch_sub(LockWord::claim_bits(id) + 1, Ordering::AcqRel);
        true
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        tracing::debug!(thread_id = self.thread_id, "session closed");
    }
}
