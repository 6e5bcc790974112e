// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Synthesized robust primitives: a lock word in a named shared memory block,
// arbitrated by the lock referee.
//
// Every block starts with an init state and the referee-assigned key. The
// first opener asks the referee for a key; later openers spin until the key
// is published.

pub mod condition;
pub mod mutex;

use std::io;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use crate::backoff::{adaptive_yield, is_settled};
use crate::coordinator::Coordinator;
use crate::error::{Result, SyncError};
use crate::lock_word::LockWord;
use crate::platform::posix::{self, CachedShm, ShmCache};
use crate::referee::{CleanupJob, WaitOutcome};
use crate::session::Session;
use crate::wire::LockKey;

pub use condition::SharedCondition;
pub use mutex::SharedMutex;

const KEY_UNSET: u32 = 0;
const KEY_PENDING: u32 = 1;
const KEY_READY: u32 = 2;

/// Longest a second opener waits for the first to publish the key.
const KEY_PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a stalled retry loop parks on the referee before looking at the
/// lock word again.
const POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Header shared by every synthesized block.
#[repr(C)]
pub(crate) struct KeyCell {
    state: AtomicU32,
    key: AtomicU32,
}

impl KeyCell {
    /// The block's key, obtaining it from the referee on first use.
    /// `reset` runs before the key is published.
    fn ensure<F>(&self, coordinator: &dyn Coordinator, reset: F) -> Result<LockKey>
    where
        F: Fn(),
    {
        let deadline = Instant::now() + KEY_PUBLISH_TIMEOUT;
        let mut k = 0u32;
        loop {
            match self.state.compare_exchange(
                KEY_UNSET,
                KEY_PENDING,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return match Session::with(coordinator, |s| s.client().init_lock()) {
                        Ok(key) => {
                            reset();
                            self.key.store(key, Ordering::Relaxed);
                            self.state.store(KEY_READY, Ordering::Release);
                            Ok(key)
                        }
                        Err(e) => {
                            self.state.store(KEY_UNSET, Ordering::Release);
                            Err(e)
                        }
                    };
                }
                Err(KEY_READY) => return Ok(self.key.load(Ordering::Relaxed)),
                Err(_) if Instant::now() >= deadline => return Err(SyncError::Timeout),
                Err(_) => adaptive_yield(&mut k),
            }
        }
    }

    fn key(&self) -> LockKey {
        self.key.load(Ordering::Relaxed)
    }
}

fn mutex_blocks() -> &'static Mutex<ShmCache> {
    static CACHE: OnceLock<Mutex<ShmCache>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(ShmCache::new()))
}

fn cond_blocks() -> &'static Mutex<ShmCache> {
    static CACHE: OnceLock<Mutex<ShmCache>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(ShmCache::new()))
}

/// A named block of type `T`, mapped once per process.
pub(crate) struct SharedBlock<T> {
    cached: Arc<CachedShm>,
    cache: &'static Mutex<ShmCache>,
    name: String,
    _layout: PhantomData<T>,
}

impl<T> SharedBlock<T> {
    fn open(cache: &'static Mutex<ShmCache>, name: &str) -> io::Result<Self> {
        let size = std::mem::size_of::<T>();
        let cached = posix::cached_shm_acquire(cache, name, size, |base| {
            unsafe { std::ptr::write_bytes(base, 0, size) };
            Ok(())
        })?;
        Ok(Self {
            cached,
            cache,
            name: name.to_owned(),
            _layout: PhantomData,
        })
    }

    fn get(&self) -> &T {
        unsafe { &*(self.cached.shm.as_ptr() as *const T) }
    }

    fn clear_storage(cache: &'static Mutex<ShmCache>, name: &str) {
        posix::cached_shm_purge(cache, name);
        posix::PlatformShm::unlink_by_name(name);
    }
}

impl<T> Drop for SharedBlock<T> {
    fn drop(&mut self) {
        posix::cached_shm_release(self.cache, &self.name);
    }
}

/// Apply a delegated repair to `word` and report completion to the referee.
pub(crate) fn run_cleanup(s: &mut Session, word: &AtomicU64, job: &CleanupJob) -> Result<()> {
    let mut cur = LockWord::from_raw(word.load(Ordering::Acquire));
    let repaired = loop {
        let next = cur.repaired(&job.facts);
        if next == cur {
            break cur;
        }
        match word.compare_exchange(cur.raw(), next.raw(), Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => break next,
            Err(actual) => cur = LockWord::from_raw(actual),
        }
    };
    let owed = repaired.wakeups_owed();
    tracing::info!(
        key = job.key,
        job = job.id,
        facts = job.facts.len(),
        word = ?repaired,
        owed,
        "applied repair for dead participant"
    );
    s.client().cleanup_done(job.key, owed)
}

/// One backoff step of a retry loop that cannot make progress on its own.
///
/// Short stalls spin; once settled, the thread parks on the referee for a
/// moment so that a repair pending on `key` (for example after the holder
/// of the waiter claim died) gets delivered.
pub(crate) fn stall(s: &mut Session, key: LockKey, word: &AtomicU64, k: &mut u32) -> Result<()> {
    if !is_settled(*k) {
        adaptive_yield(k);
        return Ok(());
    }
    if let WaitOutcome::Cleanup(job) = s.client().wait(key, 0, Some(POLL_INTERVAL))? {
        run_cleanup(s, word, &job)?;
    }
    Ok(())
}

/// Time left before `deadline`, or `None` for no deadline.
/// `Some(Duration::ZERO)` once it has passed.
fn remaining(deadline: Option<Instant>) -> Option<Duration> {
    deadline.map(|d| d.saturating_duration_since(Instant::now()))
}

fn expired(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() >= d)
}
