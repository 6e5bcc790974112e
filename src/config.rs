// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Lock referee configuration: rendezvous naming, runtime directory, helper
// executable and limits. Defaults can be overridden from the environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default rendezvous name of the lock referee.
pub const DEFAULT_RENDEZVOUS: &str = "robust_ipc_referee";

/// Default number of robust record slots (concurrently connected threads).
pub const DEFAULT_RECORD_CAPACITY: usize = 1024;

/// Name of the referee binary looked up next to the current executable.
pub const REFEREE_BINARY: &str = "lock_referee";

pub const ENV_RENDEZVOUS: &str = "ROBUST_IPC_REFEREE";
pub const ENV_RUNTIME_DIR: &str = "ROBUST_IPC_RUNTIME_DIR";
pub const ENV_EXECUTABLE: &str = "ROBUST_IPC_REFEREE_EXE";
pub const ENV_SPAWN_TIMEOUT_MS: &str = "ROBUST_IPC_SPAWN_TIMEOUT_MS";
pub const ENV_RECORD_CAPACITY: &str = "ROBUST_IPC_RECORD_CAPACITY";

/// Where to find (or how to start) the lock referee.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefereeConfig {
    /// Well-known name shared by every participant of one referee.
    pub rendezvous: String,
    /// Directory holding the rendezvous socket and its lock file.
    pub runtime_dir: PathBuf,
    /// Referee binary to spawn when none is running. `None` disables spawning.
    pub executable: Option<PathBuf>,
    /// How long a client keeps retrying after spawning the referee.
    pub spawn_timeout: Duration,
    /// Robust record slots the referee allocates.
    pub record_capacity: usize,
}

impl RefereeConfig {
    pub fn new(rendezvous: &str) -> Self {
        Self {
            rendezvous: rendezvous.to_owned(),
            runtime_dir: std::env::temp_dir(),
            executable: default_executable(),
            spawn_timeout: Duration::from_secs(5),
            record_capacity: DEFAULT_RECORD_CAPACITY,
        }
    }

    /// Defaults, overridden by `ROBUST_IPC_*` environment variables.
    pub fn from_env() -> Self {
        let mut cfg = Self::new(DEFAULT_RENDEZVOUS);
        cfg.apply_env(|k| std::env::var(k).ok());
        cfg
    }

    fn apply_env<F>(&mut self, get: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = get(ENV_RENDEZVOUS).filter(|v| !v.is_empty()) {
            self.rendezvous = v;
        }
        if let Some(v) = get(ENV_RUNTIME_DIR).filter(|v| !v.is_empty()) {
            self.runtime_dir = PathBuf::from(v);
        }
        if let Some(v) = get(ENV_EXECUTABLE) {
            self.executable = if v.is_empty() { None } else { Some(PathBuf::from(v)) };
        }
        if let Some(ms) = get(ENV_SPAWN_TIMEOUT_MS).and_then(|v| v.parse::<u64>().ok()) {
            self.spawn_timeout = Duration::from_millis(ms);
        }
        match get(ENV_RECORD_CAPACITY).and_then(|v| v.parse::<usize>().ok()) {
            Some(n) if n > 0 => self.record_capacity = n,
            Some(_) => tracing::warn!("{ENV_RECORD_CAPACITY} must be positive; keeping default"),
            None => {}
        }
    }

    pub fn with_runtime_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.runtime_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn with_executable(mut self, exe: Option<PathBuf>) -> Self {
        self.executable = exe;
        self
    }

    /// Path of the rendezvous socket.
    pub fn socket_path(&self) -> PathBuf {
        self.runtime_dir.join(format!("{}.sock", self.rendezvous))
    }

    /// Path of the lock file that elects the single running referee.
    pub fn lock_path(&self) -> PathBuf {
        self.runtime_dir.join(format!("{}.lock", self.rendezvous))
    }
}

impl Default for RefereeConfig {
    fn default() -> Self {
        Self::new(DEFAULT_RENDEZVOUS)
    }
}

/// `lock_referee` next to the running executable, if present.
fn default_executable() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    let dir = exe.parent()?;
    [dir.join(REFEREE_BINARY), dir.join("..").join(REFEREE_BINARY)]
        .into_iter()
        .find(|p| p.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn paths_derive_from_rendezvous() {
        let cfg = RefereeConfig::new("abc").with_runtime_dir("/tmp/x");
        assert_eq!(cfg.socket_path(), PathBuf::from("/tmp/x/abc.sock"));
        assert_eq!(cfg.lock_path(), PathBuf::from("/tmp/x/abc.lock"));
    }

    #[test]
    fn env_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_RENDEZVOUS, "custom"),
            (ENV_RUNTIME_DIR, "/run/robust"),
            (ENV_EXECUTABLE, ""),
            (ENV_SPAWN_TIMEOUT_MS, "250"),
            (ENV_RECORD_CAPACITY, "0"),
        ]
        .into_iter()
        .collect();
        let mut cfg = RefereeConfig::new(DEFAULT_RENDEZVOUS);
        cfg.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.rendezvous, "custom");
        assert_eq!(cfg.runtime_dir, PathBuf::from("/run/robust"));
        assert_eq!(cfg.executable, None);
        assert_eq!(cfg.spawn_timeout, Duration::from_millis(250));
        assert_eq!(cfg.record_capacity, DEFAULT_RECORD_CAPACITY);
    }
}
