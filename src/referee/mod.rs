// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Lock referee: the arbitration service behind the synthesized robust mutex
// and condition variable.
//
// The referee never touches a lock word. It assigns keys, parks waiters in
// per-key FIFO queues, hands out wakeups, and watches participant
// connections. When a participant disconnects with a non-idle robust record,
// its facts are queued against the affected keys and shipped to a live
// waiter on that key, which applies the repair to the word it has mapped.
//
// All state sits behind one mutex, so every WAIT, WAKE and cleanup dispatch
// against a key is serialized.

pub mod server;

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use slab::Slab;

use crate::error::{Result, SyncError};
use crate::lock_word::DeadFact;
use crate::record::{record_table_name, RecordTable};
use crate::wire::LockKey;

pub use server::serve;

/// Connection handle inside the referee.
pub type ConnId = usize;

/// A repair the referee asks a live participant to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupJob {
    pub id: u64,
    pub key: LockKey,
    pub facts: Vec<DeadFact>,
}

/// Resolution of a WAIT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    Woken,
    TimedOut,
    Cleanup(CleanupJob),
}

struct Waiter {
    conn: ConnId,
    key: LockKey,
    threshold: u64,
    outcome: Option<WaitOutcome>,
    cv: Arc<Condvar>,
}

#[derive(Default)]
struct KeyState {
    queue: VecDeque<usize>,
    value: u64,
    credits: u64,
    pending: Vec<DeadFact>,
    delegate: Option<(ConnId, u64)>,
    in_flight: Vec<DeadFact>,
}

impl KeyState {
    /// A condition key's value must outlive its queue: a WAKE still in
    /// transit may carry a lower value than waiters already released.
    fn is_idle(&self) -> bool {
        self.value == 0
            && self.queue.is_empty()
            && self.credits == 0
            && self.pending.is_empty()
            && self.delegate.is_none()
    }
}

struct Conn {
    slot: Option<usize>,
}

struct Registry {
    next_key: LockKey,
    next_job: u64,
    keys: HashMap<LockKey, KeyState>,
    waiters: Slab<Waiter>,
    conns: Slab<Conn>,
    slots: Slab<()>,
}

impl Registry {
    fn check_key(&self, key: LockKey) -> Result<()> {
        if key == 0 || key >= self.next_key {
            return Err(SyncError::InvalidOperation("unknown lock key"));
        }
        Ok(())
    }

    /// Hand the pending facts of `key` to `conn` if no repair is in flight.
    fn take_job(&mut self, key: LockKey, conn: ConnId) -> Option<CleanupJob> {
        let ks = self.keys.get_mut(&key)?;
        if ks.delegate.is_some() || ks.pending.is_empty() {
            return None;
        }
        let facts = std::mem::take(&mut ks.pending);
        ks.in_flight = facts.clone();
        let id = self.next_job;
        self.next_job += 1;
        ks.delegate = Some((conn, id));
        tracing::debug!(key, job = id, conn, facts = facts.len(), "cleanup delegated");
        Some(CleanupJob { id, key, facts })
    }

    /// Deliver pending facts for `key` to the oldest queued waiter.
    fn dispatch(&mut self, key: LockKey) {
        let Some(ks) = self.keys.get_mut(&key) else {
            return;
        };
        if ks.delegate.is_some() || ks.pending.is_empty() {
            return;
        }
        let Some(wid) = ks.queue.pop_front() else {
            tracing::debug!(key, "cleanup pending until a participant waits on the key");
            return;
        };
        let conn = self.waiters[wid].conn;
        if let Some(job) = self.take_job(key, conn) {
            let w = &mut self.waiters[wid];
            w.outcome = Some(WaitOutcome::Cleanup(job));
            w.cv.notify_one();
        }
    }

    /// Add wakeup credit and release eligible queued waiters in FIFO order.
    fn release(&mut self, key: LockKey, value: u64, count: u32) -> u32 {
        let Registry { keys, waiters, .. } = self;
        let ks = keys.entry(key).or_default();
        ks.value = ks.value.max(value);
        ks.credits = ks.credits.saturating_add(count as u64);
        let mut woken = 0u32;
        let mut i = 0;
        while i < ks.queue.len() && ks.credits > 0 {
            let wid = ks.queue[i];
            let w = &mut waiters[wid];
            if w.threshold <= ks.value {
                ks.queue.remove(i);
                ks.credits -= 1;
                w.outcome = Some(WaitOutcome::Woken);
                w.cv.notify_one();
                woken += 1;
            } else {
                i += 1;
            }
        }
        woken
    }

    fn prune(&mut self, key: LockKey) {
        if self.keys.get(&key).is_some_and(KeyState::is_idle) {
            self.keys.remove(&key);
        }
    }
}

/// The arbitration service state.
pub struct Referee {
    rendezvous: String,
    registry: Mutex<Registry>,
    records: Arc<RecordTable>,
}

impl Referee {
    /// Create a referee named `rendezvous` with room for `record_capacity`
    /// concurrently connected participants.
    pub fn new(rendezvous: &str, record_capacity: usize) -> io::Result<Self> {
        let records = RecordTable::create(&record_table_name(rendezvous), record_capacity)?;
        Ok(Self {
            rendezvous: rendezvous.to_owned(),
            registry: Mutex::new(Registry {
                next_key: 1,
                next_job: 1,
                keys: HashMap::new(),
                waiters: Slab::new(),
                conns: Slab::new(),
                slots: Slab::new(),
            }),
            records: Arc::new(records),
        })
    }

    pub fn rendezvous(&self) -> &str {
        &self.rendezvous
    }

    pub fn records(&self) -> &Arc<RecordTable> {
        &self.records
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a new participant connection.
    pub fn connect(&self) -> ConnId {
        let conn = self.registry().conns.insert(Conn { slot: None });
        tracing::debug!(conn, "participant connected");
        conn
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.registry().conns.len()
    }

    /// Number of keys with live referee-side state (queues, credits, jobs).
    pub fn active_key_count(&self) -> usize {
        self.registry().keys.len()
    }

    /// INIT_LOCK: assign a fresh key. Keys are never reused.
    pub fn init_lock(&self) -> Result<LockKey> {
        let mut reg = self.registry();
        let key = reg.next_key;
        reg.next_key = key
            .checked_add(1)
            .ok_or(SyncError::ResourceExhausted)?;
        tracing::trace!(key, "lock key assigned");
        Ok(key)
    }

    /// GET_ROBUST: the record slot of `conn`, allocated on first call.
    pub fn get_robust(&self, conn: ConnId) -> Result<usize> {
        let mut reg = self.registry();
        let r = &mut *reg;
        let c = r
            .conns
            .get_mut(conn)
            .ok_or(SyncError::InvalidOperation("unknown connection"))?;
        if let Some(slot) = c.slot {
            return Ok(slot);
        }
        if r.slots.vacant_key() >= self.records.capacity() {
            tracing::warn!(conn, capacity = self.records.capacity(), "robust record table full");
            return Err(SyncError::ResourceExhausted);
        }
        let slot = r.slots.insert(());
        self.records.slot(slot).reset();
        c.slot = Some(slot);
        Ok(slot)
    }

    /// WAIT: block `conn` until woken, timed out, or handed a cleanup job.
    pub fn wait(
        &self,
        conn: ConnId,
        key: LockKey,
        threshold: u64,
        timeout: Option<Duration>,
    ) -> Result<WaitOutcome> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut reg = self.registry();
        reg.check_key(key)?;
        reg.keys.entry(key).or_default();
        if let Some(job) = reg.take_job(key, conn) {
            return Ok(WaitOutcome::Cleanup(job));
        }

        let r = &mut *reg;
        let ks = r.keys.entry(key).or_default();
        if ks.value >= threshold && ks.credits > 0 {
            ks.credits -= 1;
            r.prune(key);
            return Ok(WaitOutcome::Woken);
        }

        let cv = Arc::new(Condvar::new());
        let wid = r.waiters.insert(Waiter {
            conn,
            key,
            threshold,
            outcome: None,
            cv: Arc::clone(&cv),
        });
        ks.queue.push_back(wid);
        tracing::trace!(key, threshold, conn, "waiter queued");

        loop {
            if let Some(outcome) = reg.waiters[wid].outcome.take() {
                reg.waiters.remove(wid);
                reg.prune(key);
                return Ok(outcome);
            }
            match deadline {
                None => {
                    reg = cv.wait(reg).unwrap_or_else(|e| e.into_inner());
                }
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        // Nobody resolved us under the lock: the timeout wins.
                        let r = &mut *reg;
                        r.waiters.remove(wid);
                        if let Some(ks) = r.keys.get_mut(&key) {
                            ks.queue.retain(|&w| w != wid);
                        }
                        r.prune(key);
                        return Ok(WaitOutcome::TimedOut);
                    }
                    reg = cv
                        .wait_timeout(reg, d - now)
                        .unwrap_or_else(|e| e.into_inner())
                        .0;
                }
            }
        }
    }

    /// WAKE: release up to `count` waiters on `key` whose threshold is at
    /// most `value`. Unused wakeups are kept as credit. Never blocks.
    pub fn wake(&self, key: LockKey, value: u64, count: u32) -> Result<u32> {
        let mut reg = self.registry();
        reg.check_key(key)?;
        let woken = reg.release(key, value, count);
        reg.prune(key);
        tracing::trace!(key, value, count, woken, "wake");
        Ok(woken)
    }

    /// CLEANUP_DONE: the delegate applied the repair for `key`.
    pub fn cleanup_done(&self, conn: ConnId, key: LockKey, wakeups_owed: u32) -> Result<()> {
        let mut reg = self.registry();
        reg.check_key(key)?;
        let ks = reg.keys.entry(key).or_default();
        match ks.delegate {
            Some((c, job)) if c == conn => {
                ks.delegate = None;
                ks.in_flight.clear();
                tracing::info!(key, job, wakeups_owed, "cleanup applied");
            }
            _ => return Err(SyncError::InvalidOperation("no cleanup in flight for connection")),
        }
        if wakeups_owed > 0 {
            let value = reg.keys.get(&key).map_or(0, |ks| ks.value);
            reg.release(key, value, wakeups_owed);
        }
        reg.dispatch(key);
        reg.prune(key);
        Ok(())
    }

    /// Tear down `conn` and diagnose its robust record.
    pub fn disconnect(&self, conn: ConnId) {
        let mut reg = self.registry();
        let r = &mut *reg;
        if !r.conns.contains(conn) {
            return;
        }
        let c = r.conns.remove(conn);
        let mut touched: Vec<LockKey> = Vec::new();

        let stale: Vec<usize> = r
            .waiters
            .iter()
            .filter(|(_, w)| w.conn == conn)
            .map(|(id, _)| id)
            .collect();
        for wid in stale {
            let w = r.waiters.remove(wid);
            if let Some(ks) = r.keys.get_mut(&w.key) {
                ks.queue.retain(|&q| q != wid);
            }
            touched.push(w.key);
        }

        for (&key, ks) in r.keys.iter_mut() {
            if matches!(ks.delegate, Some((d, _)) if d == conn) {
                tracing::warn!(key, conn, "cleanup delegate died; job requeued");
                ks.delegate = None;
                let mut facts = std::mem::take(&mut ks.in_flight);
                facts.append(&mut ks.pending);
                ks.pending = facts;
                touched.push(key);
            }
        }

        if let Some(slot) = c.slot {
            let rec = self.records.slot(slot);
            let snap = rec.snapshot();
            rec.reset();
            r.slots.remove(slot);
            if snap.thread_id != 0 && !snap.is_idle() {
                tracing::warn!(
                    conn,
                    thread_id = snap.thread_id,
                    attempt_key = snap.attempt_key,
                    held = ?snap.locked_keys,
                    "participant died mid-operation; cleanup queued"
                );
                for (key, fact) in snap.facts() {
                    if r.check_key(key).is_err() {
                        continue;
                    }
                    r.keys.entry(key).or_default().pending.push(fact);
                    touched.push(key);
                }
            }
        }

        touched.sort_unstable();
        touched.dedup();
        for key in touched {
            r.dispatch(key);
            r.prune(key);
        }
        tracing::debug!(conn, "participant disconnected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock_word::{FACT_ATTEMPTING, FACT_HELD, FACT_WAITER};
    use std::thread;

    fn referee(tag: &str) -> Arc<Referee> {
        let name = format!("referee_unit_{tag}_{}", std::process::id());
        Arc::new(Referee::new(&name, 8).expect("referee"))
    }

    #[test]
    fn keys_are_unique_and_validated() {
        let r = referee("keys");
        let a = r.init_lock().unwrap();
        let b = r.init_lock().unwrap();
        assert_ne!(a, b);
        assert!(r.wake(999, 0, 1).is_err());
    }

    #[test]
    fn wake_before_wait_is_kept_as_credit() {
        let r = referee("credit");
        let key = r.init_lock().unwrap();
        let conn = r.connect();
        assert_eq!(r.wake(key, 0, 1).unwrap(), 0);
        let out = r.wait(conn, key, 0, Some(Duration::from_secs(5))).unwrap();
        assert_eq!(out, WaitOutcome::Woken);
        assert_eq!(r.active_key_count(), 0);
    }

    #[test]
    fn threshold_gates_credit() {
        let r = referee("threshold");
        let key = r.init_lock().unwrap();
        let conn = r.connect();
        r.wake(key, 3, 1).unwrap();
        let out = r.wait(conn, key, 4, Some(Duration::from_millis(20))).unwrap();
        assert_eq!(out, WaitOutcome::TimedOut);
        let out = r.wait(conn, key, 3, Some(Duration::from_millis(20))).unwrap();
        assert_eq!(out, WaitOutcome::Woken);
    }

    #[test]
    fn released_mark_survives_idle_periods() {
        let r = referee("mark");
        let key = r.init_lock().unwrap();
        let conn = r.connect();
        r.wake(key, 2, 1).unwrap();
        assert_eq!(r.wait(conn, key, 2, None).unwrap(), WaitOutcome::Woken);
        assert_eq!(r.active_key_count(), 1);
        // A late, lower wake still serves a waiter released by the higher one.
        r.wake(key, 1, 1).unwrap();
        let out = r.wait(conn, key, 2, Some(Duration::from_millis(100))).unwrap();
        assert_eq!(out, WaitOutcome::Woken);
    }

    #[test]
    fn fifo_release_order() {
        let r = referee("fifo");
        let key = r.init_lock().unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..3 {
            let r2 = Arc::clone(&r);
            let order = Arc::clone(&order);
            handles.push(thread::spawn(move || {
                let conn = r2.connect();
                let out = r2.wait(conn, key, 0, None).unwrap();
                assert_eq!(out, WaitOutcome::Woken);
                order.lock().unwrap().push(i);
            }));
            // Make queue order deterministic.
            while r.registry().keys.get(&key).map_or(0, |k| k.queue.len()) < i + 1 {
                thread::yield_now();
            }
        }
        for _ in 0..3 {
            assert_eq!(r.wake(key, 0, 1).unwrap(), 1);
            let n = order.lock().unwrap().len();
            while order.lock().unwrap().len() == n {
                thread::yield_now();
            }
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn dead_participant_cleanup_goes_to_next_waiter() {
        let r = referee("cleanup");
        let key = r.init_lock().unwrap();

        let dead = r.connect();
        let slot = r.get_robust(dead).unwrap();
        let rec = r.records().slot(slot);
        rec.bind(4242);
        rec.push_locked(key);
        r.disconnect(dead);
        assert_eq!(r.connection_count(), 0);

        let live = r.connect();
        let out = r.wait(live, key, 0, Some(Duration::from_secs(5))).unwrap();
        let job = match out {
            WaitOutcome::Cleanup(job) => job,
            other => panic!("expected cleanup, got {other:?}"),
        };
        assert_eq!(job.key, key);
        assert_eq!(job.facts, vec![DeadFact { thread_id: 4242, flags: FACT_HELD }]);

        // A second waiter is not handed the same job while it is in flight.
        let other = r.connect();
        let out = r.wait(other, key, 0, Some(Duration::from_millis(20))).unwrap();
        assert_eq!(out, WaitOutcome::TimedOut);

        r.cleanup_done(live, key, 1).unwrap();
        let out = r.wait(live, key, 0, Some(Duration::from_secs(5))).unwrap();
        assert_eq!(out, WaitOutcome::Woken);
    }

    #[test]
    fn cleanup_dispatched_to_blocked_waiter() {
        let r = referee("blocked");
        let key = r.init_lock().unwrap();
        let r2 = Arc::clone(&r);
        let h = thread::spawn(move || {
            let conn = r2.connect();
            r2.wait(conn, key, 0, None).unwrap()
        });
        while r.registry().keys.get(&key).map_or(0, |k| k.queue.len()) == 0 {
            thread::yield_now();
        }
        let dead = r.connect();
        let slot = r.get_robust(dead).unwrap();
        let rec = r.records().slot(slot);
        rec.bind(77);
        rec.set_attempt(key);
        rec.set_waiter(true);
        r.disconnect(dead);

        match h.join().unwrap() {
            WaitOutcome::Cleanup(job) => assert_eq!(
                job.facts,
                vec![DeadFact {
                    thread_id: 77,
                    flags: FACT_ATTEMPTING | FACT_WAITER
                }]
            ),
            other => panic!("expected cleanup, got {other:?}"),
        }
    }

    #[test]
    fn dead_delegate_requeues_job() {
        let r = referee("requeue");
        let key = r.init_lock().unwrap();
        let dead = r.connect();
        let slot = r.get_robust(dead).unwrap();
        r.records().slot(slot).bind(5);
        r.records().slot(slot).push_locked(key);
        r.disconnect(dead);

        let delegate = r.connect();
        assert!(matches!(
            r.wait(delegate, key, 0, None).unwrap(),
            WaitOutcome::Cleanup(_)
        ));
        r.disconnect(delegate);

        let next = r.connect();
        match r.wait(next, key, 0, None).unwrap() {
            WaitOutcome::Cleanup(job) => assert_eq!(job.facts[0].thread_id, 5),
            other => panic!("expected cleanup, got {other:?}"),
        }
        assert!(r.cleanup_done(delegate, key, 0).is_err());
        r.cleanup_done(next, key, 0).unwrap();
    }

    #[test]
    fn idle_record_needs_no_cleanup() {
        let r = referee("idle");
        let key = r.init_lock().unwrap();
        let conn = r.connect();
        let slot = r.get_robust(conn).unwrap();
        assert_eq!(r.get_robust(conn).unwrap(), slot);
        r.records().slot(slot).bind(8);
        r.disconnect(conn);
        assert_eq!(r.active_key_count(), 0);
        let c2 = r.connect();
        let out = r.wait(c2, key, 0, Some(Duration::from_millis(10))).unwrap();
        assert_eq!(out, WaitOutcome::TimedOut);
    }

    #[test]
    fn record_table_exhaustion() {
        let name = format!("referee_unit_full_{}", std::process::id());
        let r = Referee::new(&name, 1).unwrap();
        let a = r.connect();
        let b = r.connect();
        r.get_robust(a).unwrap();
        assert!(matches!(r.get_robust(b), Err(SyncError::ResourceExhausted)));
        r.disconnect(a);
        r.get_robust(b).unwrap();
    }
}
