// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Adaptive backoff for the short lock-word retry loops: spin → pause →
// yield → sleep.

use std::time::Duration;

/// Steps after which [`adaptive_yield`] stops escalating and sleeps.
pub const SETTLED: u32 = 32;

/// One backoff step.
///
/// - k < 4:  busy spin (do nothing)
/// - k < 16: CPU pause hint
/// - k < 32: thread yield
/// - k >= 32: sleep 1ms
#[inline]
pub fn adaptive_yield(k: &mut u32) {
    if *k < 4 {
        // busy spin
    } else if *k < 16 {
        std::hint::spin_loop();
    } else if *k < SETTLED {
        std::thread::yield_now();
    } else {
        std::thread::sleep(Duration::from_millis(1));
        return;
    }
    *k += 1;
}

/// True once the caller has backed off long enough that the contention is
/// unlikely to be transient.
#[inline]
pub fn is_settled(k: u32) -> bool {
    k >= SETTLED
}
