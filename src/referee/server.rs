// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Unix-domain-socket front end of the lock referee.
//
// One thread per participant connection. A connection that ends, cleanly or
// not, is disconnected from the referee, which then diagnoses its robust
// record. Only the process holding the rendezvous lock file may bind the
// socket, so racing spawns resolve to a single referee.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use super::{ConnId, Referee, WaitOutcome};
use crate::config::RefereeConfig;
use crate::error::{Result, SyncError};
use crate::record::{job_block_name, publish_job};
use crate::wire::{self, LockKey, Request, Response};
use crate::ShmHandle;

/// Holds the rendezvous lock for as long as the referee runs.
pub struct RendezvousGuard {
    _lock: File,
    socket_path: PathBuf,
}

impl Drop for RendezvousGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.socket_path);
    }
}

/// Claim the rendezvous. Returns `Ok(None)` if another referee already
/// holds it.
pub fn bind(config: &RefereeConfig) -> io::Result<Option<(UnixListener, RendezvousGuard)>> {
    fs::create_dir_all(&config.runtime_dir)?;
    let mut lock = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(config.lock_path())?;
    let rc = unsafe { libc::flock(lock.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            return Ok(None);
        }
        return Err(err);
    }
    lock.set_len(0)?;
    writeln!(lock, "{}", std::process::id())?;
    let socket_path = config.socket_path();
    // Left behind by a referee that died without cleanup.
    let _ = fs::remove_file(&socket_path);
    let listener = UnixListener::bind(&socket_path)?;
    Ok(Some((
        listener,
        RendezvousGuard {
            _lock: lock,
            socket_path,
        },
    )))
}

/// Pid of the referee currently holding the rendezvous, as written to its
/// lock file. `None` if no referee has claimed it.
pub fn running_pid(config: &RefereeConfig) -> Option<u32> {
    let text = fs::read_to_string(config.lock_path()).ok()?;
    text.trim().parse().ok()
}

/// Accept participants until the listener fails.
pub fn serve(listener: UnixListener, referee: Arc<Referee>) -> io::Result<()> {
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let referee = Arc::clone(&referee);
                thread::Builder::new()
                    .name("referee-conn".into())
                    .spawn(move || handle_connection(stream, &referee))?;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn handle_connection(mut stream: UnixStream, referee: &Referee) {
    let conn = referee.connect();
    let mut jobs: HashMap<LockKey, ShmHandle> = HashMap::new();
    match serve_requests(&mut stream, referee, conn, &mut jobs) {
        Ok(()) => tracing::debug!(conn, "connection closed"),
        Err(e) => tracing::warn!(conn, error = %e, "connection dropped"),
    }
    referee.disconnect(conn);
}

fn error_code(e: &SyncError) -> u64 {
    match e {
        SyncError::InvalidOperation(_) => wire::ERR_UNKNOWN_KEY,
        SyncError::ResourceExhausted => wire::ERR_NO_RECORD_SLOT,
        _ => wire::ERR_BAD_REQUEST,
    }
}

fn serve_requests(
    stream: &mut UnixStream,
    referee: &Referee,
    conn: ConnId,
    jobs: &mut HashMap<LockKey, ShmHandle>,
) -> Result<()> {
    while let Some(buf) = wire::read_frame(stream)? {
        let req = Request::decode(&buf)?;
        let resp = match answer(req, referee, conn, jobs) {
            Ok(resp) => resp,
            // Job block could not be published: drop the connection so the
            // referee hands the job to someone else.
            Err(SyncError::Io(e)) => return Err(SyncError::Io(e)),
            Err(e) => {
                tracing::debug!(conn, error = %e, "request rejected");
                Response::Error(error_code(&e))
            }
        };
        wire::write_frame(stream, &resp.encode())?;
    }
    Ok(())
}

fn answer(
    req: Request,
    referee: &Referee,
    conn: ConnId,
    jobs: &mut HashMap<LockKey, ShmHandle>,
) -> Result<Response> {
    let resp = match req {
        Request::InitLock => Response::Key(referee.init_lock()?),
        Request::GetRobust => {
            let slot = referee.get_robust(conn)?;
            Response::Robust {
                slot: slot as u32,
                capacity: referee.records().capacity() as u32,
            }
        }
        Request::Wait {
            key,
            threshold,
            timeout,
        } => match referee.wait(conn, key, threshold, timeout)? {
            WaitOutcome::Woken => Response::Woken,
            WaitOutcome::TimedOut => Response::TimedOut,
            WaitOutcome::Cleanup(job) => {
                let name = job_block_name(referee.rendezvous(), job.id);
                let block = publish_job(&name, job.key, &job.facts)?;
                jobs.insert(job.key, block);
                Response::Cleanup {
                    key: job.key,
                    job: job.id,
                    facts: job.facts.len() as u32,
                }
            }
        },
        Request::CleanupDone { key, wakeups_owed } => {
            referee.cleanup_done(conn, key, wakeups_owed)?;
            jobs.remove(&key);
            Response::Ack { woken: 0 }
        }
        Request::Wake { key, value, count } => Response::Ack {
            woken: referee.wake(key, value, count)?,
        },
    };
    Ok(resp)
}
