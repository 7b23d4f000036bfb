//! Node storage with generation-checked handles and epoch-deferred recycling.
//!
//! Nodes live in an append-only [`boxcar::Vec`] and are never freed while the arena is
//! alive; a released slot goes back to a free list once no context can still be in the
//! middle of a queue operation that read a handle to it. That grace period is provided by
//! [`crossbeam_epoch`]: every queue operation runs pinned, and [`NodeArena::retire`]
//! defers recycling until all contexts pinned at retirement time have unpinned.
//!
//! Recycling bumps the slot generation. A handle obtained before the recycle no longer
//! resolves through [`NodeArena::get`] and no longer matches any link value, which gives
//! every link CAS ABA resistance.

use std::{
    fmt,
    sync::{atomic::Ordering, Arc},
};

use crossbeam_epoch::Guard;
use crossbeam_queue::SegQueue;

use crate::queue::node::{Node, NodeKind, NodeRef};

/// Append-only arena of queue nodes.
#[derive(Default)]
pub struct NodeArena {
    nodes: boxcar::Vec<Node>,
    free: SegQueue<usize>,
}

impl NodeArena {
    /// Creates an empty arena.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Allocates a fresh node of the given kind, reusing a recycled slot when one is free.
    pub fn allocate(&self, kind: NodeKind) -> NodeRef {
        let index = match self.free.pop() {
            Some(index) => index,
            None => self.nodes.push(Node::default()),
        };

        let node = &self.nodes[index];
        node.set_kind(kind);
        NodeRef::new(index, node.generation.load(Ordering::Acquire))
    }

    /// Resolves a handle, returning `None` for null or for a handle whose slot has been
    /// recycled since the handle was created.
    pub fn get(&self, node: NodeRef) -> Option<&Node> {
        if node.is_null() {
            return None;
        }
        let slot = self.nodes.get(node.index())?;
        (slot.generation.load(Ordering::Acquire) == node.generation()).then_some(slot)
    }

    /// Resolves a handle that the calling context owns.
    ///
    /// # Panics
    ///
    /// Panics if the handle is stale: an owned node is only recycled by its owner, so a
    /// stale owned handle means the queue bookkeeping is corrupted.
    pub fn owned(&self, node: NodeRef) -> &Node {
        match self.get(node) {
            Some(slot) => slot,
            None => panic!("wait queue corrupted: owned node {node:?} was recycled"),
        }
    }

    /// Schedules a node for recycling once every context pinned right now has unpinned.
    ///
    /// Must be called exactly once per allocation, by the context that last owns the node,
    /// after the node has been unlinked from the prev chain.
    pub fn retire(self: &Arc<Self>, node: NodeRef, guard: &Guard) {
        if node.is_null() {
            return;
        }
        let arena = Arc::clone(self);
        guard.defer(move || arena.recycle(node));
    }

    fn recycle(&self, node: NodeRef) {
        let slot = &self.nodes[node.index()];
        let bumped = slot.generation.compare_exchange(
            node.generation(),
            node.generation().wrapping_add(1),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        assert!(bumped.is_ok(), "wait queue corrupted: {node:?} retired twice");

        slot.reset();
        self.free.push(node.index());
    }

    /// Number of slots ever allocated.
    pub fn capacity(&self) -> usize {
        self.nodes.count()
    }

    /// Number of slots currently on the free list.
    pub fn free_slots(&self) -> usize {
        self.free.len()
    }
}

impl fmt::Debug for NodeArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeArena")
            .field("capacity", &self.capacity())
            .field("free", &self.free_slots())
            .finish()
    }
}
