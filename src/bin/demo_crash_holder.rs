// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Crash scenario driver.
//
// Usage:
//   demo_crash_holder <mutex-name>
//
// Opens <mutex-name> on the shared backend (referee from ROBUST_IPC_*),
// locks it, prints "locked" and exits without unlocking. The next locker
// must observe OwnerDead.

use std::io::Write;

use robust_ipc::{Backend, RobustMutex};

fn main() {
    let Some(name) = std::env::args().nth(1) else {
        eprintln!("usage: demo_crash_holder <mutex-name>");
        std::process::exit(2);
    };

    let mtx = match RobustMutex::open(&name, &Backend::shared_ipc()) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("open {name}: {e}");
            std::process::exit(1);
        }
    };
    match mtx.lock() {
        Ok(outcome) => println!("locked {outcome:?}"),
        Err(e) => {
            eprintln!("lock {name}: {e}");
            std::process::exit(1);
        }
    }
    let _ = std::io::stdout().flush();
    // Skip destructors: the process dies holding the lock.
    std::process::exit(0);
}
