// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Lock path benchmarks.
//
// Run with:
//   cargo bench --bench lock
//
// Groups:
//   uncontended — lock/unlock on one thread, per backend
//   try_lock    — try_lock/unlock on one thread, per backend
//   handoff     — two threads alternating on one mutex, per backend
//
// The shared backend uses a private in-process referee, so only the
// fast path of the lock word is measured when uncontended.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use robust_ipc::{Backend, RobustMutex, NATIVE_ROBUST};

fn backends() -> Vec<(&'static str, Backend)> {
    let mut out = Vec::new();
    if NATIVE_ROBUST {
        out.push(("local", Backend::Local));
    }
    if let Ok(shared) = Backend::shared_in_process() {
        out.push(("shared", shared));
    }
    out
}

fn open(label: &str, group: &str, backend: &Backend) -> RobustMutex {
    let name = format!("bench_{group}_{label}_{}", std::process::id());
    RobustMutex::clear_storage(&name);
    match RobustMutex::open(&name, backend) {
        Ok(m) => m,
        Err(e) => panic!("open {name}: {e}"),
    }
}

fn bench_uncontended(c: &mut Criterion) {
    let mut group = c.benchmark_group("uncontended");
    for (label, backend) in backends() {
        let mtx = open(label, "uncontended", &backend);
        group.bench_with_input(BenchmarkId::from_parameter(label), &mtx, |b, m| {
            b.iter(|| {
                black_box(m.lock().ok());
                black_box(m.unlock().ok());
            });
        });
    }
    group.finish();
}

fn bench_try_lock(c: &mut Criterion) {
    let mut group = c.benchmark_group("try_lock");
    for (label, backend) in backends() {
        let mtx = open(label, "try_lock", &backend);
        group.bench_with_input(BenchmarkId::from_parameter(label), &mtx, |b, m| {
            b.iter(|| {
                if m.try_lock().is_ok() {
                    black_box(m.unlock().ok());
                }
            });
        });
    }
    group.finish();
}

fn bench_handoff(c: &mut Criterion) {
    let mut group = c.benchmark_group("handoff");
    group.sample_size(20);
    for (label, backend) in backends() {
        let mtx = Arc::new(open(label, "handoff", &backend));
        let stop = Arc::new(AtomicBool::new(false));
        let rival = {
            let mtx = Arc::clone(&mtx);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    if mtx.lock().is_ok() {
                        let _ = mtx.unlock();
                    }
                }
            })
        };
        group.bench_function(BenchmarkId::from_parameter(label), |b| {
            b.iter(|| {
                black_box(mtx.lock().ok());
                black_box(mtx.unlock().ok());
            });
        });
        stop.store(true, Ordering::Relaxed);
        let _ = rival.join();
    }
    group.finish();
}

criterion_group!(benches, bench_uncontended, bench_try_lock, bench_handoff);
criterion_main!(benches);
