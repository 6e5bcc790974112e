// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Shared backend over the referee socket: an in-test referee, an
// auto-spawned `lock_referee` and a participant process that dies holding
// a lock.

mod common;

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use robust_ipc::config::{ENV_EXECUTABLE, ENV_RENDEZVOUS, ENV_RUNTIME_DIR};
use robust_ipc::referee::server::{self, RendezvousGuard};
use robust_ipc::spawn::{self, ProcessHandle};
use robust_ipc::{
    Backend, IpcCoordinator, LockOutcome, Referee, RefereeConfig, RobustMutex,
};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_name(prefix: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}_{}_{n}", std::process::id())
}

/// A fresh runtime directory. Kept short: socket paths have a length limit.
fn runtime_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(unique_name("rip"));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).expect("runtime dir");
    dir
}

fn config(rendezvous: &str, dir: &Path) -> RefereeConfig {
    RefereeConfig::new(rendezvous)
        .with_runtime_dir(dir)
        .with_executable(None)
}

/// Bind and serve a referee on a background thread of this process.
fn serve_in_test(cfg: &RefereeConfig) -> RendezvousGuard {
    let (listener, guard) = server::bind(cfg).expect("bind").expect("rendezvous free");
    let referee = Arc::new(Referee::new(&cfg.rendezvous, 64).expect("referee"));
    thread::spawn(move || {
        let _ = server::serve(listener, referee);
    });
    guard
}

#[test]
fn rendezvous_admits_one_referee() {
    common::init_test_logging();
    let dir = runtime_dir();
    let cfg = config(&unique_name("single"), &dir);

    let first = server::bind(&cfg).expect("bind");
    assert!(first.is_some());
    assert_eq!(server::running_pid(&cfg), Some(std::process::id()));
    assert!(server::bind(&cfg).expect("second bind").is_none());

    drop(first);
    assert!(!cfg.socket_path().exists());
    assert!(server::bind(&cfg).expect("rebind").is_some());
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn unreachable_without_executable() {
    common::init_test_logging();
    let dir = runtime_dir();
    let cfg = config(&unique_name("absent"), &dir);
    let backend = Backend::Shared(Arc::new(IpcCoordinator::new(cfg)));

    let name = unique_name("absent_mtx");
    RobustMutex::clear_storage(&name);
    let res = RobustMutex::open(&name, &backend);
    assert!(
        matches!(res, Err(robust_ipc::SyncError::Unreachable { .. })),
        "expected Unreachable"
    );
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn contention_over_socket() {
    common::init_test_logging();
    let dir = runtime_dir();
    let cfg = config(&unique_name("contend"), &dir);
    let _guard = serve_in_test(&cfg);
    let backend = Backend::Shared(Arc::new(IpcCoordinator::new(cfg)));

    let name = unique_name("contend_mtx");
    RobustMutex::clear_storage(&name);
    let total = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let name = name.clone();
            let backend = backend.clone();
            let total = Arc::clone(&total);
            thread::spawn(move || {
                let mtx = RobustMutex::open(&name, &backend).expect("open");
                for _ in 0..100 {
                    mtx.lock().expect("lock");
                    // Non-atomic read-modify-write under the lock.
                    let v = total.load(Ordering::Relaxed);
                    total.store(v + 1, Ordering::Relaxed);
                    mtx.unlock().expect("unlock");
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(total.load(Ordering::Relaxed), 400);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn thread_death_over_socket() {
    common::init_test_logging();
    let dir = runtime_dir();
    let cfg = config(&unique_name("death"), &dir);
    let _guard = serve_in_test(&cfg);
    let backend = Backend::Shared(Arc::new(IpcCoordinator::new(cfg)));

    let name = unique_name("death_mtx");
    RobustMutex::clear_storage(&name);
    let mtx = RobustMutex::open(&name, &backend).expect("open");
    {
        let name = name.clone();
        let backend = backend.clone();
        thread::spawn(move || {
            let m = RobustMutex::open(&name, &backend).expect("open");
            m.lock().expect("lock");
        })
        .join()
        .unwrap();
    }

    assert_eq!(mtx.lock().expect("lock"), LockOutcome::OwnerDead);
    mtx.mark_consistent().expect("mark_consistent");
    mtx.unlock().expect("unlock");
    assert_eq!(mtx.lock().expect("lock"), LockOutcome::Acquired);
    mtx.unlock().expect("unlock");
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn process_death_is_repaired() {
    common::init_test_logging();
    let dir = runtime_dir();
    let rendezvous = unique_name("proc");
    let cfg = config(&rendezvous, &dir);
    let _guard = serve_in_test(&cfg);
    let backend = Backend::Shared(Arc::new(IpcCoordinator::new(cfg)));

    let name = unique_name("proc_mtx");
    RobustMutex::clear_storage(&name);
    let mtx = RobustMutex::open(&name, &backend).expect("open");

    let out = Command::new(env!("CARGO_BIN_EXE_demo_crash_holder"))
        .arg(&name)
        .env(ENV_RENDEZVOUS, &rendezvous)
        .env(ENV_RUNTIME_DIR, &dir)
        .env(ENV_EXECUTABLE, "")
        .output()
        .expect("run demo_crash_holder");
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(out.status.success(), "holder failed: {}", String::from_utf8_lossy(&out.stderr));
    assert!(stdout.starts_with("locked"), "holder said {stdout:?}");

    assert_eq!(
        mtx.lock_timeout(Duration::from_secs(10)).expect("lock"),
        LockOutcome::OwnerDead
    );
    mtx.mark_consistent().expect("mark_consistent");
    mtx.unlock().expect("unlock");
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn referee_is_spawned_on_demand() {
    common::init_test_logging();
    let dir = runtime_dir();
    let cfg = config(&unique_name("spawned"), &dir)
        .with_executable(Some(PathBuf::from(env!("CARGO_BIN_EXE_lock_referee"))));
    let backend = Backend::Shared(Arc::new(IpcCoordinator::new(cfg.clone())));

    let name = unique_name("spawned_mtx");
    RobustMutex::clear_storage(&name);
    {
        let mtx = RobustMutex::open(&name, &backend).expect("open");
        assert_eq!(mtx.lock().expect("lock"), LockOutcome::Acquired);
        mtx.unlock().expect("unlock");
    }

    let pid = server::running_pid(&cfg).expect("referee pid");
    assert_ne!(pid, std::process::id());
    let handle = ProcessHandle {
        pid,
        name: "lock_referee".into(),
        executable: PathBuf::from(env!("CARGO_BIN_EXE_lock_referee")),
    };
    assert!(handle.is_alive());
    let r = spawn::shutdown(&handle, Duration::from_secs(2));
    assert!(r.exited || r.signaled, "referee did not stop: {r:?}");
    let _ = std::fs::remove_dir_all(&dir);
}
