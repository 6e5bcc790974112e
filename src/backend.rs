// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Backend selection for robust mutexes and condition variables.

use std::fmt;
use std::sync::Arc;

use crate::coordinator::{Coordinator, InProcessCoordinator, IpcCoordinator};
use crate::error::Result;
use crate::platform::NATIVE_ROBUST;

/// Which implementation backs a robust primitive.
#[derive(Clone)]
pub enum Backend {
    /// Robust process-shared pthread primitives.
    Local,
    /// Lock word in shared memory, arbitrated by a lock referee.
    Shared(Arc<dyn Coordinator>),
}

impl Backend {
    /// `Local` where the OS provides robust process-shared mutexes, otherwise
    /// `Shared` with a referee configured from the environment.
    pub fn platform_default() -> Self {
        if NATIVE_ROBUST {
            Backend::Local
        } else {
            Backend::shared_ipc()
        }
    }

    /// Shared backend talking to the `lock_referee` process.
    pub fn shared_ipc() -> Self {
        Backend::Shared(Arc::new(IpcCoordinator::from_env()))
    }

    /// Shared backend with a private in-process referee.
    pub fn shared_in_process() -> Result<Self> {
        Ok(Backend::Shared(Arc::new(InProcessCoordinator::new()?)))
    }

    pub fn is_shared(&self) -> bool {
        matches!(self, Backend::Shared(_))
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Local => f.write_str("Local"),
            Backend::Shared(c) => f
                .debug_struct("Shared")
                .field("rendezvous", &c.rendezvous())
                .finish(),
        }
    }
}
