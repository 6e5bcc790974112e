// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Robust process-shared mutexes and condition variables.
//
// Two backends sit behind one API. `Local` uses robust pthread primitives in
// named shared memory. `Shared` keeps a lock word in shared memory and
// relies on a lock referee process to park waiters and to delegate the
// repair of locks whose holder died.

pub mod shm_name;

mod platform;

mod shm;
pub use shm::{ShmHandle, ShmOpenMode};

mod backoff;

pub mod config;
pub mod coordinator;
pub mod error;
pub mod lock_word;
pub mod record;
pub mod referee;
pub mod session;
pub mod shared;
pub mod spawn;
pub mod wire;

mod backend;
pub use backend::Backend;

mod mutex;
pub use mutex::RobustMutex;

mod condition;
pub use condition::{CondWait, RobustCondvar};

mod scoped_access;
pub use scoped_access::{ScopedAccess, ScopedLock};

pub use config::RefereeConfig;
pub use coordinator::{Coordinator, CoordinatorClient, InProcessCoordinator, IpcCoordinator};
pub use error::{LockOutcome, Result, SyncError};
pub use lock_word::LockWord;
pub use platform::NATIVE_ROBUST;
pub use referee::Referee;
pub use session::Session;
