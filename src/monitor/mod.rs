//! Object monitors: reentrant locks, lock words and the thin/inflated fast path.
//!
//! - [`ReentrantMonitor`] is a full monitor: a reentrant lock with one lazily created
//!   condition for wait/notify.
//! - [`LockWord`] and [`LockWordStorage`] describe the per-object word that points to a
//!   monitor once one exists.
//! - [`MonitorSupport`] drives objects through the lock word, handling uncontended
//!   locking in the word itself and inflating to a [`ReentrantMonitor`] when needed.

mod lockword;
mod reentrant;
mod support;

pub use lockword::{LockShape, LockWord, LockWordSlot, LockWordStorage, THIN_COUNT_MAX};
pub use reentrant::{MonitorGuard, Reentrancy, ReentrantMonitor};
pub use support::{MonitorSupport, ObjectGuard};
