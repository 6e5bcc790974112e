// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Robust records and cleanup job blocks.
//
// The referee owns one shared table of robust records; each participant
// thread is handed a slot and keeps it current around every lock and unlock.
// When a participant's connection drops, the referee reads its slot to
// diagnose what the thread was doing.
//
// Cleanup job blocks are small transient segments through which the referee
// ships dead-participant facts to the live delegate that will repair the
// lock word.

use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::lock_word::{DeadFact, ThreadId, FACT_ATTEMPTING, FACT_HELD, FACT_WAITER};
use crate::wire::LockKey;
use crate::{ShmHandle, ShmOpenMode};

/// Most keys one participant thread can hold at once and still be diagnosed
/// after a crash.
pub const MAX_HELD: usize = 32;

const TABLE_MAGIC: u32 = 0x5242_5354; // "RBST"

/// Per-thread record describing in-flight and held locks.
#[repr(C)]
pub struct RobustRecord {
    thread_id: AtomicU32,
    attempt_key: AtomicU32,
    is_waiter: AtomicU32,
    num_locked: AtomicU32,
    locked_keys: [AtomicU32; MAX_HELD],
}

/// Snapshot of a record taken by the referee after its owner disconnected.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordSnapshot {
    pub thread_id: ThreadId,
    pub attempt_key: LockKey,
    pub is_waiter: bool,
    pub locked_keys: Vec<LockKey>,
}

impl RecordSnapshot {
    pub fn is_idle(&self) -> bool {
        self.attempt_key == 0 && self.locked_keys.is_empty()
    }

    /// Group this record's contents into per-key facts.
    pub fn facts(&self) -> Vec<(LockKey, DeadFact)> {
        let mut out: Vec<(LockKey, DeadFact)> = Vec::new();
        let mut add = |key: LockKey, flags: u32| {
            if key == 0 {
                return;
            }
            match out.iter_mut().find(|(k, _)| *k == key) {
                Some((_, fact)) => fact.flags |= flags,
                None => out.push((
                    key,
                    DeadFact {
                        thread_id: self.thread_id,
                        flags,
                    },
                )),
            }
        };
        for &key in &self.locked_keys {
            add(key, FACT_HELD);
        }
        if self.attempt_key != 0 {
            let mut flags = FACT_ATTEMPTING;
            if self.is_waiter {
                flags |= FACT_WAITER;
            }
            add(self.attempt_key, flags);
        }
        out
    }
}

impl RobustRecord {
    pub fn thread_id(&self) -> ThreadId {
        self.thread_id.load(Ordering::Acquire)
    }

    pub(crate) fn bind(&self, thread_id: ThreadId) {
        self.reset();
        self.thread_id.store(thread_id, Ordering::Release);
    }

    pub(crate) fn reset(&self) {
        self.attempt_key.store(0, Ordering::Relaxed);
        self.is_waiter.store(0, Ordering::Relaxed);
        self.num_locked.store(0, Ordering::Relaxed);
        for k in &self.locked_keys {
            k.store(0, Ordering::Relaxed);
        }
        self.thread_id.store(0, Ordering::Release);
    }

    pub fn attempt_key(&self) -> LockKey {
        self.attempt_key.load(Ordering::Acquire)
    }

    pub(crate) fn set_attempt(&self, key: LockKey) {
        self.attempt_key.store(key, Ordering::SeqCst);
    }

    pub fn is_waiter(&self) -> bool {
        self.is_waiter.load(Ordering::Acquire) != 0
    }

    pub(crate) fn set_waiter(&self, on: bool) {
        self.is_waiter.store(on as u32, Ordering::SeqCst);
    }

    pub fn num_locked(&self) -> usize {
        (self.num_locked.load(Ordering::Acquire) as usize).min(MAX_HELD)
    }

    /// Push a held key. Returns `false` when the stack is full; the lock is
    /// still held but a crash will not be diagnosed for it.
    pub(crate) fn push_locked(&self, key: LockKey) -> bool {
        let n = self.num_locked();
        if n >= MAX_HELD {
            return false;
        }
        self.locked_keys[n].store(key, Ordering::SeqCst);
        self.num_locked.store(n as u32 + 1, Ordering::SeqCst);
        true
    }

    /// Remove the most recent entry for `key`. Returns `false` if not found.
    pub(crate) fn pop_locked(&self, key: LockKey) -> bool {
        let n = self.num_locked();
        let Some(pos) = (0..n).rev().find(|&i| self.locked_keys[i].load(Ordering::Relaxed) == key)
        else {
            return false;
        };
        // Shift down so the stack stays dense; a reader only trusts [0, n).
        for i in pos..n - 1 {
            let next = self.locked_keys[i + 1].load(Ordering::Relaxed);
            self.locked_keys[i].store(next, Ordering::SeqCst);
        }
        self.num_locked.store(n as u32 - 1, Ordering::SeqCst);
        self.locked_keys[n - 1].store(0, Ordering::SeqCst);
        true
    }

    pub fn locked_keys(&self) -> Vec<LockKey> {
        (0..self.num_locked())
            .map(|i| self.locked_keys[i].load(Ordering::Acquire))
            .filter(|&k| k != 0)
            .collect()
    }

    pub fn snapshot(&self) -> RecordSnapshot {
        RecordSnapshot {
            thread_id: self.thread_id(),
            attempt_key: self.attempt_key(),
            is_waiter: self.is_waiter(),
            locked_keys: self.locked_keys(),
        }
    }
}

#[repr(C)]
struct TableHeader {
    magic: AtomicU32,
    capacity: AtomicU32,
}

fn table_size(capacity: usize) -> usize {
    std::mem::size_of::<TableHeader>() + capacity * std::mem::size_of::<RobustRecord>()
}

/// Shared table of robust records.
pub struct RecordTable {
    shm: ShmHandle,
    capacity: usize,
}

impl RecordTable {
    /// Create (or take over) the table named `name` with `capacity` slots.
    pub fn create(name: &str, capacity: usize) -> io::Result<Self> {
        if capacity == 0 || capacity > u32::MAX as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "record capacity out of range",
            ));
        }
        ShmHandle::unlink_by_name(name);
        let shm = ShmHandle::acquire(name, table_size(capacity), ShmOpenMode::Create)?;
        let table = Self { shm, capacity };
        for i in 0..capacity {
            table.slot(i).reset();
        }
        let header = table.header();
        header.capacity.store(capacity as u32, Ordering::Relaxed);
        header.magic.store(TABLE_MAGIC, Ordering::Release);
        Ok(table)
    }

    /// Map an existing table created by the referee.
    pub fn open(name: &str, capacity: usize) -> io::Result<Self> {
        let shm = ShmHandle::acquire(name, table_size(capacity), ShmOpenMode::Open)?;
        let table = Self { shm, capacity };
        let header = table.header();
        if header.magic.load(Ordering::Acquire) != TABLE_MAGIC
            || header.capacity.load(Ordering::Relaxed) as usize != capacity
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "robust record table header mismatch",
            ));
        }
        Ok(table)
    }

    fn header(&self) -> &TableHeader {
        unsafe { &*(self.shm.as_ptr() as *const TableHeader) }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Record at `index`.
    ///
    /// # Panics
    /// If `index >= capacity`.
    pub fn slot(&self, index: usize) -> &RobustRecord {
        assert!(index < self.capacity, "record slot {index} out of range");
        unsafe {
            let base = self.shm.as_ptr().add(std::mem::size_of::<TableHeader>()) as *const RobustRecord;
            &*base.add(index)
        }
    }
}

/// A participant's handle on its own record.
#[derive(Clone)]
pub struct RecordSlot {
    table: Arc<RecordTable>,
    index: usize,
}

impl RecordSlot {
    pub fn new(table: Arc<RecordTable>, index: usize) -> io::Result<Self> {
        if index >= table.capacity() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "record slot out of range",
            ));
        }
        Ok(Self { table, index })
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

impl std::ops::Deref for RecordSlot {
    type Target = RobustRecord;

    fn deref(&self) -> &RobustRecord {
        self.table.slot(self.index)
    }
}

// ---------------------------------------------------------------------------
// Cleanup job block
// ---------------------------------------------------------------------------

#[repr(C)]
struct JobHeader {
    key: u32,
    count: u32,
}

fn job_size(count: usize) -> usize {
    std::mem::size_of::<JobHeader>() + count.max(1) * std::mem::size_of::<DeadFact>()
}

/// Name of the transient block for job `id` under `rendezvous`.
pub fn job_block_name(rendezvous: &str, id: u64) -> String {
    format!("{rendezvous}_job_{id}")
}

/// Name of the robust record table under `rendezvous`.
pub fn record_table_name(rendezvous: &str) -> String {
    format!("{rendezvous}_records")
}

/// Write `facts` into a freshly created job block. The returned handle keeps
/// the block alive until the delegate reports completion.
pub fn publish_job(name: &str, key: LockKey, facts: &[DeadFact]) -> io::Result<ShmHandle> {
    ShmHandle::unlink_by_name(name);
    let shm = ShmHandle::acquire(name, job_size(facts.len()), ShmOpenMode::Create)?;
    unsafe {
        let header = shm.as_mut_ptr() as *mut JobHeader;
        (*header).key = key;
        (*header).count = facts.len() as u32;
        let body = shm.as_mut_ptr().add(std::mem::size_of::<JobHeader>()) as *mut DeadFact;
        std::ptr::copy_nonoverlapping(facts.as_ptr(), body, facts.len());
    }
    Ok(shm)
}

/// Read the facts of a job block published by the referee.
pub fn read_job(name: &str, key: LockKey, count: usize) -> io::Result<Vec<DeadFact>> {
    let shm = ShmHandle::acquire(name, job_size(count), ShmOpenMode::Open)?;
    unsafe {
        let header = &*(shm.as_ptr() as *const JobHeader);
        if header.key != key || header.count as usize != count {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "cleanup job header mismatch",
            ));
        }
        let body = shm.as_ptr().add(std::mem::size_of::<JobHeader>()) as *const DeadFact;
        Ok(std::slice::from_raw_parts(body, count).to_vec())
    }
}
