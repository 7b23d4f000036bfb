//! The 64-bit lock word stored with every object.
//!
//! # Layout
//!
//! ```text
//!  63                                   9 8           1   0
//! +--------------------------------------+-------------+-----+
//! |              owner id (55)           |  count (8)  |shape|
//! +--------------------------------------+-------------+-----+
//! ```
//!
//! - `0` is an unlocked object
//! - shape `0`, owner non-zero: thin lock held by `owner`, `count + 1` times
//! - shape `1`: the object has an inflated monitor; the remaining bits are its handle in
//!   the [`crate::MonitorSupport`] that inflated it
//!
//! Inflation is one-way: once the shape bit is set, the word never changes again.

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use crate::context::ContextId;

const SHAPE_INFLATED: u64 = 1;
const COUNT_SHIFT: u32 = 1;
const COUNT_MASK: u64 = 0xFF << COUNT_SHIFT;
const OWNER_SHIFT: u32 = 9;

/// Highest recursion count a thin lock can record before it must inflate.
pub const THIN_COUNT_MAX: u8 = u8::MAX;

/// Decoded view of a lock word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockShape {
    /// Nobody holds the lock and no monitor exists.
    Unlocked,
    /// Held by `owner`, `count + 1` times, without a monitor.
    Thin {
        /// Context holding the lock.
        owner: ContextId,
        /// Additional holds beyond the first.
        count: u8,
    },
    /// Delegated to the monitor with this handle.
    Inflated {
        /// Index of the monitor in its support.
        monitor: usize,
    },
}

/// A raw lock word value.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct LockWord(u64);

impl LockWord {
    /// The unlocked word.
    pub const UNLOCKED: LockWord = LockWord(0);

    /// Wraps a raw value.
    #[must_use]
    pub fn from_raw(raw: u64) -> Self {
        LockWord(raw)
    }

    /// Raw value.
    #[must_use]
    pub fn raw(self) -> u64 {
        self.0
    }

    /// A thin lock held by `owner`, `count + 1` times.
    #[must_use]
    pub fn thin(owner: ContextId, count: u8) -> Self {
        LockWord((owner.get() << OWNER_SHIFT) | (u64::from(count) << COUNT_SHIFT))
    }

    /// The word of an object whose monitor has handle `monitor`.
    #[must_use]
    pub fn inflated(monitor: usize) -> Self {
        LockWord(((monitor as u64) << 1) | SHAPE_INFLATED)
    }

    /// Decodes the word.
    ///
    /// # Panics
    ///
    /// Panics if a thin word has a zero owner but non-zero count, which no operation
    /// produces.
    #[must_use]
    pub fn shape(self) -> LockShape {
        if self.0 & SHAPE_INFLATED != 0 {
            return LockShape::Inflated {
                monitor: (self.0 >> 1) as usize,
            };
        }
        if self.0 == 0 {
            return LockShape::Unlocked;
        }
        match ContextId::new(self.0 >> OWNER_SHIFT) {
            Some(owner) => LockShape::Thin {
                owner,
                count: ((self.0 & COUNT_MASK) >> COUNT_SHIFT) as u8,
            },
            None => panic!("corrupted lock word {:#x}", self.0),
        }
    }

    /// Returns `true` if the shape bit is set.
    #[must_use]
    pub fn is_inflated(self) -> bool {
        self.0 & SHAPE_INFLATED != 0
    }
}

impl fmt::Debug for LockWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LockWord({:#x}: {:?})", self.0, self.shape())
    }
}

/// Storage for an object's lock word.
///
/// The monitor layer never assumes where the word lives; an object header, a side table
/// entry or a plain [`AtomicU64`] all work. Every operation must be sequentially
/// consistent.
pub trait LockWordStorage: Send + Sync {
    /// Reads the current word.
    fn load(&self) -> LockWord;

    /// Unconditionally replaces the word.
    fn store(&self, word: LockWord);

    /// Replaces `current` with `new`; on failure returns the word actually found.
    ///
    /// # Errors
    ///
    /// Returns the observed word when it differs from `current`.
    fn compare_and_swap(&self, current: LockWord, new: LockWord) -> Result<(), LockWord>;
}

impl LockWordStorage for AtomicU64 {
    fn load(&self) -> LockWord {
        LockWord(AtomicU64::load(self, Ordering::SeqCst))
    }

    fn store(&self, word: LockWord) {
        AtomicU64::store(self, word.0, Ordering::SeqCst);
    }

    fn compare_and_swap(&self, current: LockWord, new: LockWord) -> Result<(), LockWord> {
        self.compare_exchange(current.0, new.0, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(LockWord)
    }
}

/// A standalone lock word, for objects whose layout reserves no space for one.
#[derive(Default)]
pub struct LockWordSlot(AtomicU64);

impl LockWordSlot {
    /// Creates an unlocked slot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl LockWordStorage for LockWordSlot {
    fn load(&self) -> LockWord {
        LockWordStorage::load(&self.0)
    }

    fn store(&self, word: LockWord) {
        LockWordStorage::store(&self.0, word);
    }

    fn compare_and_swap(&self, current: LockWord, new: LockWord) -> Result<(), LockWord> {
        LockWordStorage::compare_and_swap(&self.0, current, new)
    }
}

impl fmt::Debug for LockWordSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LockWordSlot").field(&self.load()).finish()
    }
}
