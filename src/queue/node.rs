//! Wait queue nodes and the tagged handles that link them.
//!
//! A [`Node`] records one waiting execution context. Nodes never hold references to each
//! other; every link is a [`NodeRef`], a 64-bit value combining an arena index with the
//! generation of the slot at the time the handle was created. Reusing a slot bumps its
//! generation, so a handle that outlived its node can be detected and every link CAS
//! compares the full tagged value.

use std::{
    fmt,
    sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering},
};

use bitflags::bitflags;
use strum::Display;

use crate::context::ContextId;

/// Generation-tagged handle to a node in a [`crate::queue::NodeArena`].
///
/// The low 32 bits store `index + 1` (so that `0` can mean null), the high 32 bits the
/// slot generation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NodeRef(u64);

impl NodeRef {
    /// The null handle.
    pub const NULL: NodeRef = NodeRef(0);

    pub(crate) fn new(index: usize, generation: u32) -> Self {
        let slot = u32::try_from(index + 1).expect("node arena exceeds u32 index space");
        NodeRef((u64::from(generation) << 32) | u64::from(slot))
    }

    pub(crate) fn from_raw(raw: u64) -> Self {
        NodeRef(raw)
    }

    pub(crate) fn raw(self) -> u64 {
        self.0
    }

    /// Returns `true` if this is the null handle.
    #[must_use]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Arena index of the referenced slot. Must not be called on [`NodeRef::NULL`].
    pub(crate) fn index(self) -> usize {
        debug_assert!(!self.is_null());
        (self.0 as u32 - 1) as usize
    }

    pub(crate) fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

impl fmt::Debug for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "NodeRef(null)")
        } else {
            write!(f, "NodeRef({}@{})", self.index(), self.generation())
        }
    }
}

bitflags! {
    /// Status bits of a queue node.
    ///
    /// A status of zero means the waiter is running (or about to re-check its wake
    /// condition). [`NodeStatus::CANCELLED`] occupies the sign bit so a cancelled node
    /// compares as "negative" against every live status.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct NodeStatus: u32 {
        /// The waiter is parked or about to park and must be unparked on signal.
        const WAITING = 1;
        /// The node sits in a condition queue and has not been transferred yet.
        const COND = 2;
        /// The waiter gave up; the node only waits to be unlinked.
        const CANCELLED = 1 << 31;
    }
}

impl NodeStatus {
    /// Returns `true` for the cancelled sentinel.
    pub fn is_cancelled(self) -> bool {
        self.contains(NodeStatus::CANCELLED)
    }
}

/// What the node is waiting for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
#[repr(u8)]
pub enum NodeKind {
    /// Waiting to acquire the lock.
    Exclusive = 0,
    /// Waiting on a condition, later transferred to the lock queue.
    Condition = 1,
}

/// One waiting execution context.
///
/// All fields are atomics: `prev`, `next`, `status` and `waiter` are read by other
/// contexts while the node is queued. `next_waiter` is only mutated while the lock that
/// owns the condition is held and is therefore accessed relaxed.
#[derive(Default)]
pub struct Node {
    pub(crate) generation: AtomicU32,
    prev: AtomicU64,
    next: AtomicU64,
    next_waiter: AtomicU64,
    status: AtomicU32,
    waiter: AtomicU64,
    notifier: AtomicU64,
    kind: AtomicU8,
}

impl Node {
    pub fn prev(&self) -> NodeRef {
        NodeRef(self.prev.load(Ordering::SeqCst))
    }

    pub fn set_prev(&self, prev: NodeRef) {
        self.prev.store(prev.0, Ordering::SeqCst);
    }

    /// Stores `prev` without a fence; only valid before the node is published by a tail CAS.
    pub fn set_prev_relaxed(&self, prev: NodeRef) {
        self.prev.store(prev.0, Ordering::Relaxed);
    }

    pub fn cas_prev(&self, current: NodeRef, new: NodeRef) -> bool {
        self.prev
            .compare_exchange(current.0, new.0, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn next(&self) -> NodeRef {
        NodeRef(self.next.load(Ordering::SeqCst))
    }

    pub fn set_next(&self, next: NodeRef) {
        self.next.store(next.0, Ordering::SeqCst);
    }

    pub fn cas_next(&self, current: NodeRef, new: NodeRef) -> bool {
        self.next
            .compare_exchange(current.0, new.0, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn next_waiter(&self) -> NodeRef {
        NodeRef(self.next_waiter.load(Ordering::Relaxed))
    }

    pub fn set_next_waiter(&self, next: NodeRef) {
        self.next_waiter.store(next.0, Ordering::Relaxed);
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus::from_bits_retain(self.status.load(Ordering::SeqCst))
    }

    pub fn set_status(&self, status: NodeStatus) {
        self.status.store(status.bits(), Ordering::SeqCst);
    }

    pub fn set_status_relaxed(&self, status: NodeStatus) {
        self.status.store(status.bits(), Ordering::Relaxed);
    }

    pub fn clear_status(&self) {
        self.status.store(0, Ordering::SeqCst);
    }

    /// Atomically clears `bits` and returns the status observed before.
    pub fn get_and_unset_status(&self, bits: NodeStatus) -> NodeStatus {
        NodeStatus::from_bits_retain(self.status.fetch_and(!bits.bits(), Ordering::SeqCst))
    }

    pub fn is_cancelled(&self) -> bool {
        self.status().is_cancelled()
    }

    pub fn waiter(&self) -> Option<ContextId> {
        ContextId::new(self.waiter.load(Ordering::SeqCst))
    }

    pub fn set_waiter(&self, waiter: Option<ContextId>) {
        self.waiter
            .store(waiter.map_or(0, ContextId::get), Ordering::SeqCst);
    }

    /// Context whose signal transferred this node out of a condition queue.
    pub fn notifier(&self) -> Option<ContextId> {
        ContextId::new(self.notifier.load(Ordering::Relaxed))
    }

    pub fn set_notifier(&self, notifier: Option<ContextId>) {
        self.notifier
            .store(notifier.map_or(0, ContextId::get), Ordering::Relaxed);
    }

    pub fn kind(&self) -> NodeKind {
        match self.kind.load(Ordering::Relaxed) {
            0 => NodeKind::Exclusive,
            _ => NodeKind::Condition,
        }
    }

    pub(crate) fn set_kind(&self, kind: NodeKind) {
        self.kind.store(kind as u8, Ordering::Relaxed);
    }

    /// Resets every link and flag, leaving the generation untouched.
    pub(crate) fn reset(&self) {
        self.prev.store(0, Ordering::Relaxed);
        self.next.store(0, Ordering::Relaxed);
        self.next_waiter.store(0, Ordering::Relaxed);
        self.status.store(0, Ordering::Relaxed);
        self.waiter.store(0, Ordering::Relaxed);
        self.notifier.store(0, Ordering::Relaxed);
        self.kind.store(NodeKind::Exclusive as u8, Ordering::Relaxed);
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("kind", &self.kind())
            .field("status", &self.status())
            .field("prev", &self.prev())
            .field("next", &self.next())
            .field("waiter", &self.waiter())
            .finish()
    }
}
