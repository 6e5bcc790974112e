// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Coordinator that talks to a `lock_referee` process over its rendezvous
// socket, spawning the referee when none answers.

use std::io;
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::{next_coordinator_id, Coordinator, CoordinatorClient};
use crate::backoff::adaptive_yield;
use crate::config::{self, RefereeConfig};
use crate::error::{Result, SyncError};
use crate::record::{job_block_name, read_job, record_table_name, RecordSlot, RecordTable};
use crate::referee::{CleanupJob, WaitOutcome};
use crate::spawn;
use crate::wire::{self, LockKey, Request, Response};

pub struct IpcCoordinator {
    id: u64,
    config: RefereeConfig,
    records: Arc<Mutex<Option<Arc<RecordTable>>>>,
}

impl IpcCoordinator {
    pub fn new(config: RefereeConfig) -> Self {
        Self {
            id: next_coordinator_id(),
            config,
            records: Arc::new(Mutex::new(None)),
        }
    }

    /// Coordinator configured from `ROBUST_IPC_*` environment variables.
    pub fn from_env() -> Self {
        Self::new(RefereeConfig::from_env())
    }

    pub fn config(&self) -> &RefereeConfig {
        &self.config
    }

    fn unreachable(&self, source: io::Error) -> SyncError {
        SyncError::Unreachable {
            rendezvous: self.config.rendezvous.clone(),
            source,
        }
    }

    /// Connect to the rendezvous socket, starting the referee if needed.
    fn establish(&self) -> Result<UnixStream> {
        let path = self.config.socket_path();
        let first = match UnixStream::connect(&path) {
            Ok(stream) => return Ok(stream),
            Err(e) => e,
        };
        let Some(exe) = self.config.executable.as_deref() else {
            return Err(self.unreachable(first));
        };

        let runtime_dir = self.config.runtime_dir.to_string_lossy();
        let capacity = self.config.record_capacity.to_string();
        let envs = [
            (config::ENV_RENDEZVOUS, self.config.rendezvous.as_str()),
            (config::ENV_RUNTIME_DIR, runtime_dir.as_ref()),
            (config::ENV_RECORD_CAPACITY, capacity.as_str()),
        ];
        // A racing spawn loses the rendezvous lock and exits on its own.
        if let Err(e) = spawn::spawn(config::REFEREE_BINARY, exe, &[], &envs) {
            tracing::warn!(executable = %exe.display(), error = %e, "failed to spawn lock referee");
            return Err(self.unreachable(e));
        }

        let deadline = Instant::now() + self.config.spawn_timeout;
        let mut k = 0u32;
        loop {
            match UnixStream::connect(&path) {
                Ok(stream) => {
                    tracing::info!(rendezvous = %self.config.rendezvous, "connected to spawned lock referee");
                    return Ok(stream);
                }
                Err(e) if Instant::now() >= deadline => return Err(self.unreachable(e)),
                Err(_) => adaptive_yield(&mut k),
            }
        }
    }
}

impl Coordinator for IpcCoordinator {
    fn id(&self) -> u64 {
        self.id
    }

    fn rendezvous(&self) -> &str {
        &self.config.rendezvous
    }

    fn connect(&self) -> Result<Box<dyn CoordinatorClient>> {
        let stream = self.establish()?;
        Ok(Box::new(IpcClient {
            stream,
            rendezvous: self.config.rendezvous.clone(),
            records: Arc::clone(&self.records),
        }))
    }
}

struct IpcClient {
    stream: UnixStream,
    rendezvous: String,
    records: Arc<Mutex<Option<Arc<RecordTable>>>>,
}

impl IpcClient {
    fn call(&mut self, req: Request) -> Result<Response> {
        wire::write_frame(&mut self.stream, &req.encode())?;
        let buf = wire::read_frame(&mut self.stream)?
            .ok_or_else(|| SyncError::protocol("lock referee closed the connection"))?;
        match Response::decode(&buf)? {
            Response::Error(code) => Err(match code {
                wire::ERR_UNKNOWN_KEY => SyncError::InvalidOperation("rejected by lock referee"),
                wire::ERR_NO_RECORD_SLOT => SyncError::ResourceExhausted,
                other => SyncError::protocol(format!("lock referee error code {other}")),
            }),
            resp => Ok(resp),
        }
    }

    fn table(&self, capacity: usize) -> Result<Arc<RecordTable>> {
        let mut cached = self.records.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(table) = cached.as_ref().filter(|t| t.capacity() == capacity) {
            return Ok(Arc::clone(table));
        }
        let table = Arc::new(RecordTable::open(&record_table_name(&self.rendezvous), capacity)?);
        *cached = Some(Arc::clone(&table));
        Ok(table)
    }
}

fn unexpected(resp: Response) -> SyncError {
    SyncError::protocol(format!("unexpected referee response {resp:?}"))
}

impl CoordinatorClient for IpcClient {
    fn init_lock(&mut self) -> Result<LockKey> {
        match self.call(Request::InitLock)? {
            Response::Key(key) => Ok(key),
            other => Err(unexpected(other)),
        }
    }

    fn get_robust(&mut self) -> Result<RecordSlot> {
        match self.call(Request::GetRobust)? {
            Response::Robust { slot, capacity } => {
                let table = self.table(capacity as usize)?;
                Ok(RecordSlot::new(table, slot as usize)?)
            }
            other => Err(unexpected(other)),
        }
    }

    fn wait(
        &mut self,
        key: LockKey,
        threshold: u64,
        timeout: Option<Duration>,
    ) -> Result<WaitOutcome> {
        let req = Request::Wait {
            key,
            threshold,
            timeout,
        };
        match self.call(req)? {
            Response::Woken => Ok(WaitOutcome::Woken),
            Response::TimedOut => Ok(WaitOutcome::TimedOut),
            Response::Cleanup { key, job, facts } => {
                let name = job_block_name(&self.rendezvous, job);
                let facts = read_job(&name, key, facts as usize)?;
                Ok(WaitOutcome::Cleanup(CleanupJob { id: job, key, facts }))
            }
            other => Err(unexpected(other)),
        }
    }

    fn cleanup_done(&mut self, key: LockKey, wakeups_owed: u32) -> Result<()> {
        match self.call(Request::CleanupDone { key, wakeups_owed })? {
            Response::Ack { .. } => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    fn wake(&mut self, key: LockKey, value: u64, count: u32) -> Result<u32> {
        match self.call(Request::Wake { key, value, count })? {
            Response::Ack { woken } => Ok(woken),
            other => Err(unexpected(other)),
        }
    }
}
