// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Seam between the synthesized lock engines and the lock referee.
//
// A `Coordinator` names one referee; `connect` opens a participant
// connection to it. Dropping the client ends the connection, which the
// referee treats exactly like the death of the participant.

pub mod in_process;
pub mod ipc;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::Result;
use crate::record::RecordSlot;
use crate::referee::WaitOutcome;
use crate::wire::LockKey;

pub use in_process::InProcessCoordinator;
pub use ipc::IpcCoordinator;

/// One participant connection to the lock referee.
pub trait CoordinatorClient {
    /// Assign a fresh lock key.
    fn init_lock(&mut self) -> Result<LockKey>;

    /// Obtain this connection's robust record.
    fn get_robust(&mut self) -> Result<RecordSlot>;

    /// Block until woken on `key` with a release value of at least
    /// `threshold`, until `timeout`, or until handed a cleanup job.
    fn wait(
        &mut self,
        key: LockKey,
        threshold: u64,
        timeout: Option<Duration>,
    ) -> Result<WaitOutcome>;

    /// Report that the cleanup job for `key` has been applied.
    fn cleanup_done(&mut self, key: LockKey, wakeups_owed: u32) -> Result<()>;

    /// Release up to `count` waiters on `key`. Returns how many were woken
    /// immediately; the rest are kept as credit.
    fn wake(&mut self, key: LockKey, value: u64, count: u32) -> Result<u32>;
}

/// A lock referee that participants can connect to.
pub trait Coordinator: Send + Sync {
    /// Process-unique identity; each participant thread keeps one session
    /// per coordinator.
    fn id(&self) -> u64;

    /// Human-readable name for logs.
    fn rendezvous(&self) -> &str;

    fn connect(&self) -> Result<Box<dyn CoordinatorClient>>;
}

pub(crate) fn next_coordinator_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}
