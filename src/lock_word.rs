// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Bit-packed lock word of the synthesized robust mutex.
//
// Layout (64 bits, stored in shared memory as an AtomicU64):
//
//   bits  0..8   waiter count (0..=255)
//   bit   8      owner died while holding (needs recovery)
//   bit   9      unrecoverable (terminal)
//   bits 10..37  owner thread id (0 = unlocked)
//   bits 37..64  waiter-claim thread id (0 = unclaimed)
//
// Every transition is a pure function returning a new word; call sites
// install it with a single compare-exchange (or, for the claim release,
// a single fetch_sub).

use std::fmt;

const COUNT_BITS: u32 = 8;
const COUNT_MASK: u64 = (1 << COUNT_BITS) - 1;

const OWNER_DEAD: u64 = 1 << 8;
const UNRECOVERABLE: u64 = 1 << 9;

const ID_BITS: u32 = 27;
const ID_MASK: u64 = (1 << ID_BITS) - 1;
const OWNER_SHIFT: u32 = 10;
const CLAIM_SHIFT: u32 = OWNER_SHIFT + ID_BITS;

/// Largest number of waiters a single lock word can count.
pub const MAX_WAITERS: u32 = COUNT_MASK as u32;

/// Largest thread identity representable in the owner and claim fields.
pub const MAX_THREAD_ID: u32 = ID_MASK as u32;

/// Identity of a participant thread. Never zero.
pub type ThreadId = u32;

/// Kind of involvement a dead participant had with a key, as diagnosed from
/// its robust record.
pub const FACT_HELD: u32 = 1 << 0;
pub const FACT_ATTEMPTING: u32 = 1 << 1;
pub const FACT_WAITER: u32 = 1 << 2;

/// One diagnosed fact about a dead participant: its identity and a set of
/// `FACT_*` flags for a single key.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeadFact {
    pub thread_id: ThreadId,
    pub flags: u32,
}

impl DeadFact {
    pub fn was_waiter(&self) -> bool {
        self.flags & FACT_WAITER != 0
    }
}

/// Value view of a lock word.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct LockWord(u64);

impl LockWord {
    pub const UNLOCKED: LockWord = LockWord(0);

    pub const fn from_raw(raw: u64) -> Self {
        LockWord(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Build a word with the given owner, claim holder and waiter count.
    /// Ids are masked to their field width; the count saturates.
    pub fn encode(owner: ThreadId, waiter_claim: ThreadId, count: u32) -> Self {
        let count = count.min(MAX_WAITERS) as u64;
        LockWord(
            count
                | ((owner as u64 & ID_MASK) << OWNER_SHIFT)
                | ((waiter_claim as u64 & ID_MASK) << CLAIM_SHIFT),
        )
    }

    pub fn owner(self) -> ThreadId {
        ((self.0 >> OWNER_SHIFT) & ID_MASK) as ThreadId
    }

    pub fn waiter_claim(self) -> ThreadId {
        ((self.0 >> CLAIM_SHIFT) & ID_MASK) as ThreadId
    }

    pub fn waiter_count(self) -> u32 {
        (self.0 & COUNT_MASK) as u32
    }

    pub fn is_locked(self) -> bool {
        self.owner() != 0
    }

    pub fn is_waited(self) -> bool {
        self.waiter_count() != 0
    }

    pub fn is_owner_dead(self) -> bool {
        self.0 & OWNER_DEAD != 0
    }

    pub fn is_unrecoverable(self) -> bool {
        self.0 & UNRECOVERABLE != 0
    }

    pub fn is_owner(self, id: ThreadId) -> bool {
        id != 0 && self.owner() == id
    }

    pub fn is_waiter_claim_owner(self, id: ThreadId) -> bool {
        id != 0 && self.waiter_claim() == id
    }

    /// Raw value of the claim field for `id`; subtracting it from the word
    /// releases the claim without touching the count.
    pub fn claim_bits(id: ThreadId) -> u64 {
        (id as u64 & ID_MASK) << CLAIM_SHIFT
    }

    fn with_owner(self, id: ThreadId) -> Self {
        LockWord((self.0 & !(ID_MASK << OWNER_SHIFT)) | ((id as u64 & ID_MASK) << OWNER_SHIFT))
    }

    fn with_claim(self, id: ThreadId) -> Self {
        LockWord((self.0 & !(ID_MASK << CLAIM_SHIFT)) | ((id as u64 & ID_MASK) << CLAIM_SHIFT))
    }

    fn with_count(self, count: u32) -> Self {
        LockWord((self.0 & !COUNT_MASK) | count.min(MAX_WAITERS) as u64)
    }

    /// Acquisition by `id`. When `consume_slot` is set the caller was a
    /// registered waiter and its slot is released in the same step.
    /// The owner-dead flag is preserved so the new owner observes it.
    pub fn acquired_by(self, id: ThreadId, consume_slot: bool) -> Self {
        let count = if consume_slot {
            self.waiter_count().saturating_sub(1)
        } else {
            self.waiter_count()
        };
        self.with_owner(id).with_count(count)
    }

    /// Plain release: owner cleared, everything else kept.
    pub fn released(self) -> Self {
        self.with_owner(0)
    }

    /// Release by an owner that never marked the state consistent.
    pub fn made_unrecoverable(self) -> Self {
        LockWord((self.with_owner(0).0 & !OWNER_DEAD) | UNRECOVERABLE)
    }

    /// Clear the owner-dead flag, keeping ownership.
    pub fn made_consistent(self) -> Self {
        LockWord(self.0 & !OWNER_DEAD)
    }

    /// Claim the waiter field for `id` and count one more waiter.
    /// Returns `None` when the count is saturated; the caller must back off.
    pub fn with_waiter_registered(self, id: ThreadId) -> Option<Self> {
        let count = self.waiter_count();
        if count >= MAX_WAITERS {
            return None;
        }
        Some(self.with_claim(id).with_count(count + 1))
    }

    /// Claim the waiter field for `id` ahead of removing one waiter.
    pub fn with_claim_for_removal(self, id: ThreadId) -> Self {
        self.with_claim(id)
    }

    /// Apply the corrections implied by a batch of dead-participant facts.
    ///
    /// A dead owner is cleared and flagged; a dead claim holder had already
    /// counted itself, so the claim is cleared and one waiter removed; a dead
    /// registered waiter removes one waiter.
    pub fn repaired(self, facts: &[DeadFact]) -> Self {
        let mut w = self;
        for fact in facts {
            let id = fact.thread_id;
            if id == 0 {
                continue;
            }
            if w.is_owner(id) {
                w = LockWord(w.with_owner(0).0 | OWNER_DEAD);
            } else if w.is_waiter_claim_owner(id) {
                let count = w.waiter_count().saturating_sub(1);
                w = w.with_claim(0).with_count(count);
            } else if fact.was_waiter() {
                let count = w.waiter_count().saturating_sub(1);
                w = w.with_count(count);
            }
        }
        w
    }

    /// Wakeups a repaired word still owes to blocked waiters.
    pub fn wakeups_owed(self) -> u32 {
        if self.is_unrecoverable() {
            return u32::MAX;
        }
        if !self.is_locked() && self.is_waited() {
            1
        } else {
            0
        }
    }
}

impl fmt::Debug for LockWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockWord")
            .field("owner", &self.owner())
            .field("claim", &self.waiter_claim())
            .field("waiters", &self.waiter_count())
            .field("owner_dead", &self.is_owner_dead())
            .field("unrecoverable", &self.is_unrecoverable())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_fields() {
        let w = LockWord::encode(1234, 99, 7);
        assert_eq!(w.owner(), 1234);
        assert_eq!(w.waiter_claim(), 99);
        assert_eq!(w.waiter_count(), 7);
        assert!(w.is_locked());
        assert!(w.is_waited());
        assert!(!w.is_owner_dead());
        assert!(!w.is_unrecoverable());
        assert!(w.is_owner(1234));
        assert!(!w.is_owner(0));
        assert!(w.is_waiter_claim_owner(99));
    }

    #[test]
    fn unlocked_word_is_zero() {
        assert_eq!(LockWord::UNLOCKED.raw(), 0);
        assert!(!LockWord::UNLOCKED.is_locked());
        assert!(!LockWord::UNLOCKED.is_owner(0));
    }

    #[test]
    fn max_ids_fit() {
        let w = LockWord::encode(MAX_THREAD_ID, MAX_THREAD_ID, MAX_WAITERS);
        assert_eq!(w.owner(), MAX_THREAD_ID);
        assert_eq!(w.waiter_claim(), MAX_THREAD_ID);
        assert_eq!(w.waiter_count(), MAX_WAITERS);
        assert!(!w.is_owner_dead());
        assert!(!w.is_unrecoverable());
    }

    #[test]
    fn saturated_registration_leaves_word_untouched() {
        let w = LockWord::encode(5, 0, MAX_WAITERS);
        assert!(w.with_waiter_registered(6).is_none());
        assert_eq!(w.owner(), 5);
        assert_eq!(w.waiter_count(), MAX_WAITERS);
        assert_eq!(w.waiter_claim(), 0);
    }

    #[test]
    fn registration_then_claim_release() {
        let w = LockWord::encode(5, 0, 2);
        let r = w.with_waiter_registered(8).unwrap();
        assert_eq!(r.waiter_claim(), 8);
        assert_eq!(r.waiter_count(), 3);
        let released = LockWord::from_raw(r.raw() - LockWord::claim_bits(8));
        assert_eq!(released.waiter_claim(), 0);
        assert_eq!(released.waiter_count(), 3);
        assert_eq!(released.owner(), 5);
    }

    #[test]
    fn acquire_consumes_slot_and_keeps_dead_flag() {
        let dead = LockWord::encode(0, 0, 2).repaired(&[]);
        let flagged = LockWord::from_raw(dead.raw() | OWNER_DEAD);
        let w = flagged.acquired_by(42, true);
        assert!(w.is_owner(42));
        assert_eq!(w.waiter_count(), 1);
        assert!(w.is_owner_dead());
    }

    #[test]
    fn unrecoverable_release() {
        let w = LockWord::encode(3, 0, 4);
        let w = LockWord::from_raw(w.raw() | OWNER_DEAD).made_unrecoverable();
        assert!(!w.is_locked());
        assert!(w.is_unrecoverable());
        assert!(!w.is_owner_dead());
        assert_eq!(w.waiter_count(), 4);
        assert_eq!(w.wakeups_owed(), u32::MAX);
    }

    #[test]
    fn repair_dead_owner() {
        let w = LockWord::encode(11, 0, 1).repaired(&[DeadFact {
            thread_id: 11,
            flags: FACT_HELD,
        }]);
        assert!(!w.is_locked());
        assert!(w.is_owner_dead());
        assert_eq!(w.waiter_count(), 1);
        assert_eq!(w.wakeups_owed(), 1);
    }

    #[test]
    fn repair_dead_owner_ignores_stale_waiter_flag() {
        // Died right after acquiring as a waiter: the slot was already consumed.
        let w = LockWord::encode(11, 0, 0).repaired(&[DeadFact {
            thread_id: 11,
            flags: FACT_ATTEMPTING | FACT_WAITER,
        }]);
        assert!(w.is_owner_dead());
        assert_eq!(w.waiter_count(), 0);
    }

    #[test]
    fn repair_dead_claim_holder() {
        let w = LockWord::encode(3, 12, 2).repaired(&[DeadFact {
            thread_id: 12,
            flags: FACT_ATTEMPTING,
        }]);
        assert_eq!(w.waiter_claim(), 0);
        assert_eq!(w.waiter_count(), 1);
        assert!(w.is_owner(3));
        assert!(!w.is_owner_dead());
    }

    #[test]
    fn repair_dead_waiter() {
        let w = LockWord::encode(3, 0, 2).repaired(&[DeadFact {
            thread_id: 13,
            flags: FACT_ATTEMPTING | FACT_WAITER,
        }]);
        assert_eq!(w.waiter_count(), 1);
        assert!(w.is_owner(3));
        assert_eq!(w.wakeups_owed(), 0);
    }

    #[test]
    fn repair_aggregates_facts() {
        let w = LockWord::encode(20, 21, 3).repaired(&[
            DeadFact { thread_id: 20, flags: FACT_HELD },
            DeadFact { thread_id: 21, flags: FACT_ATTEMPTING },
            DeadFact { thread_id: 22, flags: FACT_ATTEMPTING | FACT_WAITER },
        ]);
        assert!(!w.is_locked());
        assert!(w.is_owner_dead());
        assert_eq!(w.waiter_claim(), 0);
        assert_eq!(w.waiter_count(), 1);
    }

    #[test]
    fn repair_of_finished_unlock_is_noop() {
        let before = LockWord::encode(0, 0, 0);
        let after = before.repaired(&[DeadFact {
            thread_id: 30,
            flags: FACT_HELD | FACT_ATTEMPTING,
        }]);
        assert_eq!(before, after);
        assert_eq!(after.wakeups_owed(), 0);
    }
}
