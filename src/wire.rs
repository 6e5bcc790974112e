// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Lock referee wire format.
//
// Every request and response is one fixed 24-byte little-endian frame:
//
//   offset 0   op      u8
//   offset 1   pad     [u8; 3]
//   offset 4   key     u32
//   offset 8   a       u64
//   offset 16  b       u64
//
// A connection carries one request at a time; WAIT may be answered with
// CLEANUP, which the client follows with CLEANUP_DONE and a fresh WAIT.

use std::io::{self, Read, Write};
use std::time::Duration;

use crate::error::{Result, SyncError};

pub const FRAME_LEN: usize = 24;

const OP_INIT_LOCK: u8 = 1;
const OP_WAIT: u8 = 2;
const OP_CLEANUP_DONE: u8 = 3;
const OP_WAKE: u8 = 4;
const OP_GET_ROBUST: u8 = 5;

const OP_KEY: u8 = 0x81;
const OP_WOKEN: u8 = 0x82;
const OP_TIMED_OUT: u8 = 0x83;
const OP_CLEANUP: u8 = 0x84;
const OP_ACK: u8 = 0x85;
const OP_ROBUST: u8 = 0x86;
const OP_ERROR: u8 = 0x8f;

/// `b` value of a WAIT frame meaning "no timeout".
const NO_TIMEOUT: u64 = u64::MAX;

/// Error codes carried by an ERROR response.
pub const ERR_UNKNOWN_KEY: u64 = 1;
pub const ERR_NO_RECORD_SLOT: u64 = 2;
pub const ERR_BAD_REQUEST: u64 = 3;

/// Service-assigned identifier of one mutex or condition variable.
pub type LockKey = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    InitLock,
    Wait {
        key: LockKey,
        threshold: u64,
        timeout: Option<Duration>,
    },
    CleanupDone {
        key: LockKey,
        wakeups_owed: u32,
    },
    Wake {
        key: LockKey,
        value: u64,
        count: u32,
    },
    GetRobust,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    Key(LockKey),
    Woken,
    TimedOut,
    Cleanup {
        key: LockKey,
        job: u64,
        facts: u32,
    },
    Ack {
        woken: u32,
    },
    Robust {
        slot: u32,
        capacity: u32,
    },
    Error(u64),
}

struct Frame {
    op: u8,
    key: u32,
    a: u64,
    b: u64,
}

impl Frame {
    fn new(op: u8, key: u32, a: u64, b: u64) -> Self {
        Self { op, key, a, b }
    }

    fn encode(&self) -> [u8; FRAME_LEN] {
        let mut buf = [0u8; FRAME_LEN];
        buf[0] = self.op;
        buf[4..8].copy_from_slice(&self.key.to_le_bytes());
        buf[8..16].copy_from_slice(&self.a.to_le_bytes());
        buf[16..24].copy_from_slice(&self.b.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8; FRAME_LEN]) -> Self {
        let mut key = [0u8; 4];
        let mut a = [0u8; 8];
        let mut b = [0u8; 8];
        key.copy_from_slice(&buf[4..8]);
        a.copy_from_slice(&buf[8..16]);
        b.copy_from_slice(&buf[16..24]);
        Self {
            op: buf[0],
            key: u32::from_le_bytes(key),
            a: u64::from_le_bytes(a),
            b: u64::from_le_bytes(b),
        }
    }
}

fn timeout_to_wire(timeout: Option<Duration>) -> u64 {
    match timeout {
        None => NO_TIMEOUT,
        Some(d) => (d.as_millis().min((NO_TIMEOUT - 1) as u128)) as u64,
    }
}

fn timeout_from_wire(ms: u64) -> Option<Duration> {
    if ms == NO_TIMEOUT {
        None
    } else {
        Some(Duration::from_millis(ms))
    }
}

fn count_to_u32(v: u64) -> u32 {
    v.min(u32::MAX as u64) as u32
}

impl Request {
    pub fn encode(&self) -> [u8; FRAME_LEN] {
        let frame = match *self {
            Request::InitLock => Frame::new(OP_INIT_LOCK, 0, 0, 0),
            Request::Wait {
                key,
                threshold,
                timeout,
            } => Frame::new(OP_WAIT, key, threshold, timeout_to_wire(timeout)),
            Request::CleanupDone { key, wakeups_owed } => {
                Frame::new(OP_CLEANUP_DONE, key, wakeups_owed as u64, 0)
            }
            Request::Wake { key, value, count } => Frame::new(OP_WAKE, key, value, count as u64),
            Request::GetRobust => Frame::new(OP_GET_ROBUST, 0, 0, 0),
        };
        frame.encode()
    }

    pub fn decode(buf: &[u8; FRAME_LEN]) -> Result<Self> {
        let f = Frame::decode(buf);
        let req = match f.op {
            OP_INIT_LOCK => Request::InitLock,
            OP_WAIT => Request::Wait {
                key: f.key,
                threshold: f.a,
                timeout: timeout_from_wire(f.b),
            },
            OP_CLEANUP_DONE => Request::CleanupDone {
                key: f.key,
                wakeups_owed: count_to_u32(f.a),
            },
            OP_WAKE => Request::Wake {
                key: f.key,
                value: f.a,
                count: count_to_u32(f.b),
            },
            OP_GET_ROBUST => Request::GetRobust,
            op => return Err(SyncError::protocol(format!("unknown request op {op:#04x}"))),
        };
        Ok(req)
    }
}

impl Response {
    pub fn encode(&self) -> [u8; FRAME_LEN] {
        let frame = match *self {
            Response::Key(key) => Frame::new(OP_KEY, key, 0, 0),
            Response::Woken => Frame::new(OP_WOKEN, 0, 0, 0),
            Response::TimedOut => Frame::new(OP_TIMED_OUT, 0, 0, 0),
            Response::Cleanup { key, job, facts } => Frame::new(OP_CLEANUP, key, job, facts as u64),
            Response::Ack { woken } => Frame::new(OP_ACK, 0, woken as u64, 0),
            Response::Robust { slot, capacity } => {
                Frame::new(OP_ROBUST, 0, slot as u64, capacity as u64)
            }
            Response::Error(code) => Frame::new(OP_ERROR, 0, code, 0),
        };
        frame.encode()
    }

    pub fn decode(buf: &[u8; FRAME_LEN]) -> Result<Self> {
        let f = Frame::decode(buf);
        let resp = match f.op {
            OP_KEY => Response::Key(f.key),
            OP_WOKEN => Response::Woken,
            OP_TIMED_OUT => Response::TimedOut,
            OP_CLEANUP => Response::Cleanup {
                key: f.key,
                job: f.a,
                facts: count_to_u32(f.b),
            },
            OP_ACK => Response::Ack {
                woken: count_to_u32(f.a),
            },
            OP_ROBUST => Response::Robust {
                slot: count_to_u32(f.a),
                capacity: count_to_u32(f.b),
            },
            OP_ERROR => Response::Error(f.a),
            op => return Err(SyncError::protocol(format!("unknown response op {op:#04x}"))),
        };
        Ok(resp)
    }
}

/// Read one frame. Returns `Ok(None)` on a clean end of stream.
pub fn read_frame<R: Read>(r: &mut R) -> io::Result<Option<[u8; FRAME_LEN]>> {
    let mut buf = [0u8; FRAME_LEN];
    let mut filled = 0;
    while filled < FRAME_LEN {
        match r.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "truncated referee frame",
                ))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(Some(buf))
}

pub fn write_frame<W: Write>(w: &mut W, frame: &[u8; FRAME_LEN]) -> io::Result<()> {
    w.write_all(frame)?;
    w.flush()
}
