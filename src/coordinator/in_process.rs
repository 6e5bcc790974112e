// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Coordinator backed by a referee living in the current process. Useful for
// single-process programs and for tests, where thread exit stands in for
// participant death.

use std::sync::Arc;
use std::time::Duration;

use super::{next_coordinator_id, Coordinator, CoordinatorClient};
use crate::config::DEFAULT_RECORD_CAPACITY;
use crate::error::Result;
use crate::record::RecordSlot;
use crate::referee::{ConnId, Referee, WaitOutcome};
use crate::wire::LockKey;

pub struct InProcessCoordinator {
    id: u64,
    referee: Arc<Referee>,
}

impl InProcessCoordinator {
    /// A private referee with default capacity.
    pub fn new() -> Result<Self> {
        Self::with_capacity(DEFAULT_RECORD_CAPACITY)
    }

    pub fn with_capacity(record_capacity: usize) -> Result<Self> {
        let id = next_coordinator_id();
        let rendezvous = format!("robust_ipc_local_{}_{id}", std::process::id());
        let referee = Referee::new(&rendezvous, record_capacity)?;
        Ok(Self::from_referee(Arc::new(referee), id))
    }

    fn from_referee(referee: Arc<Referee>, id: u64) -> Self {
        Self { id, referee }
    }

    /// The referee behind this coordinator.
    pub fn referee(&self) -> &Arc<Referee> {
        &self.referee
    }
}

impl From<Arc<Referee>> for InProcessCoordinator {
    fn from(referee: Arc<Referee>) -> Self {
        Self::from_referee(referee, next_coordinator_id())
    }
}

impl Coordinator for InProcessCoordinator {
    fn id(&self) -> u64 {
        self.id
    }

    fn rendezvous(&self) -> &str {
        self.referee.rendezvous()
    }

    fn connect(&self) -> Result<Box<dyn CoordinatorClient>> {
        let conn = self.referee.connect();
        Ok(Box::new(InProcessClient {
            referee: Arc::clone(&self.referee),
            conn,
        }))
    }
}

struct InProcessClient {
    referee: Arc<Referee>,
    conn: ConnId,
}

impl CoordinatorClient for InProcessClient {
    fn init_lock(&mut self) -> Result<LockKey> {
        self.referee.init_lock()
    }

    fn get_robust(&mut self) -> Result<RecordSlot> {
        let slot = self.referee.get_robust(self.conn)?;
        Ok(RecordSlot::new(Arc::clone(self.referee.records()), slot)?)
    }

    fn wait(
        &mut self,
        key: LockKey,
        threshold: u64,
        timeout: Option<Duration>,
    ) -> Result<WaitOutcome> {
        self.referee.wait(self.conn, key, threshold, timeout)
    }

    fn cleanup_done(&mut self, key: LockKey, wakeups_owed: u32) -> Result<()> {
        self.referee.cleanup_done(self.conn, key, wakeups_owed)
    }

    fn wake(&mut self, key: LockKey, value: u64, count: u32) -> Result<u32> {
        self.referee.wake(key, value, count)
    }
}

impl Drop for InProcessClient {
    fn drop(&mut self) {
        self.referee.disconnect(self.conn);
    }
}
