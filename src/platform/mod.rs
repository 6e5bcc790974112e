// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Operating system layer: POSIX shared memory and robust pthread mutexes.

pub mod posix;

pub use posix::{NativeMutex, PlatformShm, NATIVE_ROBUST};
