// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Shared helpers for the integration tests.

#![allow(dead_code)]

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Once};
use std::time::Duration;

use robust_ipc::record::RecordSlot;
use robust_ipc::referee::WaitOutcome;
use robust_ipc::wire::LockKey;
use robust_ipc::{
    Backend, Coordinator, CoordinatorClient, InProcessCoordinator, Result, SyncError,
    NATIVE_ROBUST,
};

static INIT_LOGGING: Once = Once::new();

/// Route `tracing` output to the test harness. `RUST_LOG` selects the level.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .with_thread_ids(true)
            .with_ansi(false)
            .try_init();
    });
}

/// Every backend usable in this process: the native one where the platform
/// has robust mutexes, and a shared one with a private in-process referee.
pub fn backends() -> Vec<(&'static str, Backend)> {
    init_test_logging();
    let mut out = Vec::new();
    if NATIVE_ROBUST {
        out.push(("local", Backend::Local));
    }
    out.push((
        "shared",
        Backend::shared_in_process().expect("in-process referee"),
    ));
    out
}

/// A shared backend with a private in-process referee.
pub fn shared_backend() -> Backend {
    init_test_logging();
    Backend::shared_in_process().expect("in-process referee")
}

/// Faults to inject into the next referee call of a [`ScriptedCoordinator`]
/// client.
#[derive(Default)]
pub struct Script {
    fail_next_wake: AtomicBool,
    hold_next_wait: AtomicBool,
    held: Mutex<Held>,
    cv: Condvar,
}

#[derive(Default)]
struct Held {
    parked: bool,
    released: bool,
}

impl Script {
    /// The next WAKE fails without reaching the referee.
    pub fn fail_next_wake(&self) {
        self.fail_next_wake.store(true, Ordering::Release);
    }

    /// The next WAIT does not reach the referee: it parks until
    /// [`release`](Self::release) and then reports a timeout.
    pub fn hold_next_wait(&self) {
        self.hold_next_wait.store(true, Ordering::Release);
    }

    /// Block until a client sits in the held WAIT.
    pub fn until_held(&self) {
        let mut g = self.held.lock().unwrap();
        while !g.parked {
            g = self.cv.wait(g).unwrap();
        }
    }

    pub fn release(&self) {
        self.held.lock().unwrap().released = true;
        self.cv.notify_all();
    }

    fn hold(&self) {
        let mut g = self.held.lock().unwrap();
        g.parked = true;
        self.cv.notify_all();
        while !g.released {
            g = self.cv.wait(g).unwrap();
        }
    }
}

/// An in-process coordinator whose clients follow a [`Script`].
pub struct ScriptedCoordinator {
    inner: InProcessCoordinator,
    pub script: Arc<Script>,
}

impl ScriptedCoordinator {
    pub fn new() -> Arc<Self> {
        init_test_logging();
        Arc::new(Self {
            inner: InProcessCoordinator::new().expect("in-process referee"),
            script: Arc::new(Script::default()),
        })
    }

    pub fn inner(&self) -> &InProcessCoordinator {
        &self.inner
    }

    pub fn backend(self: &Arc<Self>) -> Backend {
        Backend::Shared(Arc::clone(self) as Arc<dyn Coordinator>)
    }
}

impl Coordinator for ScriptedCoordinator {
    fn id(&self) -> u64 {
        self.inner.id()
    }

    fn rendezvous(&self) -> &str {
        self.inner.rendezvous()
    }

    fn connect(&self) -> Result<Box<dyn CoordinatorClient>> {
        Ok(Box::new(ScriptedClient {
            inner: self.inner.connect()?,
            script: Arc::clone(&self.script),
        }))
    }
}

struct ScriptedClient {
    inner: Box<dyn CoordinatorClient>,
    script: Arc<Script>,
}

impl CoordinatorClient for ScriptedClient {
    fn init_lock(&mut self) -> Result<LockKey> {
        self.inner.init_lock()
    }

    fn get_robust(&mut self) -> Result<RecordSlot> {
        self.inner.get_robust()
    }

    fn wait(
        &mut self,
        key: LockKey,
        threshold: u64,
        timeout: Option<Duration>,
    ) -> Result<WaitOutcome> {
        if self.script.hold_next_wait.swap(false, Ordering::AcqRel) {
            self.script.hold();
            return Ok(WaitOutcome::TimedOut);
        }
        self.inner.wait(key, threshold, timeout)
    }

    fn cleanup_done(&mut self, key: LockKey, wakeups_owed: u32) -> Result<()> {
        self.inner.cleanup_done(key, wakeups_owed)
    }

    fn wake(&mut self, key: LockKey, value: u64, count: u32) -> Result<u32> {
        if self.script.fail_next_wake.swap(false, Ordering::AcqRel) {
            return Err(SyncError::Io(io::Error::other("scripted wake failure")));
        }
        self.inner.wake(key, value, count)
    }
}
