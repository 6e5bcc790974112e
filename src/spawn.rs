// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Helper process spawning and lifecycle management, used to start the lock
// referee on demand and by tests to stop it again.

use std::ffi::{CString, OsStr};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

// ---------------------------------------------------------------------------
// ProcessHandle
// ---------------------------------------------------------------------------

/// Handle to a spawned helper process.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pub pid: u32,
    /// Logical name, for logs.
    pub name: String,
    /// Path to the binary.
    pub executable: PathBuf,
}

impl ProcessHandle {
    pub fn is_alive(&self) -> bool {
        if self.pid == 0 {
            return false;
        }
        let rc = unsafe { libc::kill(self.pid as libc::pid_t, 0) };
        rc == 0 || io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
    }
}

// ---------------------------------------------------------------------------
// WaitResult
// ---------------------------------------------------------------------------

/// Result of a [`wait_for_exit`] call.
#[derive(Debug, Default, Clone, Copy)]
pub struct WaitResult {
    pub exited: bool,
    pub exit_code: i32,
    pub signaled: bool,
    pub signal: i32,
}

// ---------------------------------------------------------------------------
// spawn
// ---------------------------------------------------------------------------

fn c_string(bytes: &[u8]) -> io::Result<CString> {
    CString::new(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

/// Spawn `executable` with `args`, inheriting the current environment with
/// `envs` layered on top.
pub fn spawn(
    name: &str,
    executable: &Path,
    args: &[&str],
    envs: &[(&str, &str)],
) -> io::Result<ProcessHandle> {
    let exe = c_string(executable.as_os_str().as_bytes())?;
    let mut argv: Vec<CString> = Vec::with_capacity(args.len() + 1);
    argv.push(exe.clone());
    for a in args {
        argv.push(c_string(a.as_bytes())?);
    }
    let mut argv_ptrs: Vec<*mut libc::c_char> =
        argv.iter().map(|s| s.as_ptr() as *mut libc::c_char).collect();
    argv_ptrs.push(std::ptr::null_mut());

    let mut env: Vec<CString> = Vec::new();
    for (k, v) in std::env::vars_os() {
        if envs.iter().any(|(ek, _)| k.as_os_str() == OsStr::new(ek)) {
            continue;
        }
        let mut kv = k.as_bytes().to_vec();
        kv.push(b'=');
        kv.extend_from_slice(v.as_bytes());
        env.push(c_string(&kv)?);
    }
    for (k, v) in envs {
        env.push(c_string(format!("{k}={v}").as_bytes())?);
    }
    let mut env_ptrs: Vec<*mut libc::c_char> =
        env.iter().map(|s| s.as_ptr() as *mut libc::c_char).collect();
    env_ptrs.push(std::ptr::null_mut());

    let mut pid: libc::pid_t = -1;
    let err = unsafe {
        libc::posix_spawn(
            &mut pid,
            exe.as_ptr(),
            std::ptr::null(),
            std::ptr::null(),
            argv_ptrs.as_mut_ptr(),
            env_ptrs.as_mut_ptr(),
        )
    };
    if err != 0 {
        return Err(io::Error::from_raw_os_error(err));
    }
    tracing::debug!(name, pid, executable = %executable.display(), "helper spawned");
    Ok(ProcessHandle {
        pid: pid as u32,
        name: name.to_owned(),
        executable: executable.to_path_buf(),
    })
}

// ---------------------------------------------------------------------------
// request_shutdown / force_kill
// ---------------------------------------------------------------------------

/// Send SIGTERM to request graceful shutdown.
pub fn request_shutdown(h: &ProcessHandle) -> bool {
    h.pid != 0 && unsafe { libc::kill(h.pid as libc::pid_t, libc::SIGTERM) == 0 }
}

/// Send SIGKILL.
pub fn force_kill(h: &ProcessHandle) -> bool {
    h.pid != 0 && unsafe { libc::kill(h.pid as libc::pid_t, libc::SIGKILL) == 0 }
}

// ---------------------------------------------------------------------------
// wait_for_exit
// ---------------------------------------------------------------------------

/// Wait for a child process to exit, with a timeout.
/// Returns immediately if the process has already been reaped.
pub fn wait_for_exit(h: &ProcessHandle, timeout: Duration) -> WaitResult {
    let mut r = WaitResult::default();
    if h.pid == 0 {
        return r;
    }
    let deadline = Instant::now() + timeout;
    loop {
        let mut status: libc::c_int = 0;
        let ret = unsafe { libc::waitpid(h.pid as libc::pid_t, &mut status, libc::WNOHANG) };
        if ret == h.pid as libc::pid_t {
            if libc::WIFEXITED(status) {
                r.exited = true;
                r.exit_code = libc::WEXITSTATUS(status);
            }
            if libc::WIFSIGNALED(status) {
                r.signaled = true;
                r.signal = libc::WTERMSIG(status);
            }
            return r;
        }
        if ret == -1 || Instant::now() >= deadline {
            return r;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

// ---------------------------------------------------------------------------
// shutdown (graceful: SIGTERM → wait → SIGKILL)
// ---------------------------------------------------------------------------

/// SIGTERM, wait `grace`, then SIGKILL if still alive.
pub fn shutdown(h: &ProcessHandle, grace: Duration) -> WaitResult {
    if h.pid == 0 {
        return WaitResult::default();
    }
    request_shutdown(h);
    let r = wait_for_exit(h, grace);
    if !r.exited && !r.signaled && h.is_alive() {
        force_kill(h);
        return wait_for_exit(h, Duration::from_secs(1));
    }
    r
}
