//! The lock-free CLH-style wait queue.
//!
//! `head` is a sentinel for the context that currently owns (or is about to own) the
//! lock; `tail` is the most recently enqueued node. The queue is created lazily: a null
//! `tail` means no context ever had to wait.
//!
//! Nodes are appended by a CAS on `tail` after their `prev` link has been installed, so
//! the prev chain read from `tail` is always authoritative. `next` links are set after the
//! tail CAS and may lag behind; every reader treats them as hints and repairs them.
//!
//! All operations expect the caller to be pinned ([`crossbeam_epoch::Guard`]) for as long
//! as it uses handles read from the queue.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use crossbeam_epoch::Guard;

use crate::{
    context::{self, ContextId},
    queue::{
        arena::NodeArena,
        node::{NodeKind, NodeRef, NodeStatus},
    },
};

/// Lock-free FIFO wait queue over nodes stored in a [`NodeArena`].
#[derive(Debug)]
pub struct SyncQueue {
    arena: Arc<NodeArena>,
    head: AtomicU64,
    tail: AtomicU64,
}

impl SyncQueue {
    /// Creates an uninitialized queue.
    pub fn new() -> Self {
        SyncQueue {
            arena: NodeArena::new(),
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
        }
    }

    /// The node arena backing this queue.
    pub fn arena(&self) -> &Arc<NodeArena> {
        &self.arena
    }

    /// Current head sentinel, null until the queue is initialized.
    pub fn head(&self) -> NodeRef {
        NodeRef::from_raw(self.head.load(Ordering::SeqCst))
    }

    /// Makes `node` the new head. Only called by the context that just acquired the
    /// lock through `node`.
    pub fn set_head(&self, node: NodeRef) {
        self.head.store(node.raw(), Ordering::SeqCst);
    }

    pub fn tail(&self) -> NodeRef {
        NodeRef::from_raw(self.tail.load(Ordering::SeqCst))
    }

    pub fn cas_tail(&self, current: NodeRef, new: NodeRef) -> bool {
        self.tail
            .compare_exchange(current.raw(), new.raw(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Returns `true` once any context had to queue.
    pub fn is_initialized(&self) -> bool {
        !self.tail().is_null()
    }

    /// Installs the dummy head node the first time a context needs to enqueue.
    pub fn try_initialize_head(&self, guard: &Guard) {
        let dummy = self.arena.allocate(NodeKind::Exclusive);
        if self
            .head
            .compare_exchange(0, dummy.raw(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.tail.store(dummy.raw(), Ordering::SeqCst);
            log::trace!("initialized wait queue with head {:?}", dummy);
        } else {
            self.arena.retire(dummy, guard);
        }
    }

    /// Appends a node that was not yet linked, as done when transferring a condition node.
    ///
    /// Wakes the node's waiter right away if the new predecessor turns out to be cancelled,
    /// so that the waiter can help unlink it.
    pub fn enqueue(&self, node: NodeRef, guard: &Guard) {
        let n = self.arena.owned(node);
        loop {
            let t = self.tail();
            n.set_prev_relaxed(t);
            if t.is_null() {
                self.try_initialize_head(guard);
            } else if self.cas_tail(t, node) {
                match self.arena.get(t) {
                    Some(pred) => {
                        pred.set_next(node);
                        if pred.is_cancelled() {
                            wake(n.waiter());
                        }
                    }
                    None => wake(n.waiter()),
                }
                return;
            }
        }
    }

    /// Wakes the successor of `h`, normally the head, if it is waiting.
    pub fn signal_next(&self, h: NodeRef, _guard: &Guard) {
        let Some(head) = self.arena.get(h) else {
            return;
        };
        let Some(successor) = self.arena.get(head.next()) else {
            return;
        };
        if !successor.status().is_empty() {
            successor.get_and_unset_status(NodeStatus::WAITING);
            wake(successor.waiter());
        }
    }

    /// Unlinks cancelled nodes, repairs lagging `next` links and wakes the first waiter
    /// whenever a splice made it first in line.
    ///
    /// Walks (predecessor, node, successor) triples backwards from `tail` and restarts
    /// whenever the snapshot turns out to be inconsistent. The caller must stay pinned
    /// for the whole call: a racing splice can briefly reinstate a cancelled node, and
    /// only a full walk under the same pin guarantees it is removed again before its slot
    /// can be recycled.
    pub fn clean_queue(&self, guard: &Guard) {
        'restart: loop {
            let mut q = self.tail();
            let mut s = NodeRef::NULL;
            loop {
                let Some(qn) = self.arena.get(q) else {
                    if q.is_null() {
                        return;
                    }
                    continue 'restart;
                };
                let p = qn.prev();
                if p.is_null() {
                    return;
                }
                let Some(pn) = self.arena.get(p) else {
                    continue 'restart;
                };

                let consistent = if s.is_null() {
                    self.tail() == q
                } else {
                    match self.arena.get(s) {
                        Some(sn) => sn.prev() == q && !sn.is_cancelled(),
                        None => false,
                    }
                };
                if !consistent {
                    continue 'restart;
                }

                if qn.is_cancelled() {
                    let spliced = if s.is_null() {
                        self.cas_tail(q, p)
                    } else {
                        self.arena.get(s).is_some_and(|sn| sn.cas_prev(q, p))
                    };
                    if spliced && qn.prev() == p {
                        pn.cas_next(q, s);
                        if pn.prev().is_null() {
                            self.signal_next(p, guard);
                        }
                    }
                    continue 'restart;
                }

                let n = pn.next();
                if n != q {
                    if !n.is_null() && qn.prev() == p {
                        pn.cas_next(n, q);
                        if pn.prev().is_null() {
                            self.signal_next(p, guard);
                        }
                    }
                    continue 'restart;
                }

                s = q;
                q = p;
            }
        }
    }

    /// Returns `true` if `node` is reachable from `tail` through the prev chain.
    pub fn is_enqueued(&self, node: NodeRef, _guard: &Guard) -> bool {
        let mut t = self.tail();
        while let Some(tn) = self.arena.get(t) {
            if t == node {
                return true;
            }
            t = tn.prev();
        }
        false
    }

    /// Returns `true` if some live node is queued behind the head.
    pub fn has_queued_contexts(&self, _guard: &Guard) -> bool {
        let h = self.head();
        let mut p = self.tail();
        while p != h {
            let Some(pn) = self.arena.get(p) else {
                break;
            };
            if !pn.is_cancelled() {
                return true;
            }
            p = pn.prev();
        }
        false
    }

    /// Contexts currently queued, from the most recently enqueued to the first in line.
    ///
    /// The result is a best-effort snapshot: contexts may join or leave while it is taken.
    pub fn queued_contexts(&self, _guard: &Guard) -> Vec<ContextId> {
        let mut contexts = Vec::new();
        let mut p = self.tail();
        while let Some(pn) = self.arena.get(p) {
            if let Some(waiter) = pn.waiter() {
                contexts.push(waiter);
            }
            p = pn.prev();
        }
        contexts
    }

    /// Returns `true` if `context` currently waits in this queue.
    pub fn is_queued(&self, context: ContextId, guard: &Guard) -> bool {
        self.queued_contexts(guard).contains(&context)
    }

    /// Returns `true` if the first queued node (the successor of head) is exclusive and
    /// waited on by a context other than `context`.
    pub fn has_queued_predecessors(&self, context: ContextId, _guard: &Guard) -> bool {
        let Some(head) = self.arena.get(self.head()) else {
            return false;
        };
        match self.arena.get(head.next()) {
            Some(first) if !first.is_cancelled() => {
                first.waiter().is_some_and(|waiter| waiter != context)
            }
            _ => false,
        }
    }
}

impl Default for SyncQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn wake(waiter: Option<ContextId>) {
    if let Some(id) = waiter {
        log::trace!("unparking {}", id);
        context::unpark(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::MAX_CONTEXT_ID;

    // Ids from the top of the id space are never handed to a real context.
    fn fake(n: u64) -> ContextId {
        ContextId::new(MAX_CONTEXT_ID - n).unwrap()
    }

    fn push(queue: &SyncQueue, waiter: u64) -> NodeRef {
        let guard = crossbeam_epoch::pin();
        let node = queue.arena().allocate(NodeKind::Exclusive);
        queue.arena().owned(node).set_waiter(Some(fake(waiter)));
        queue.enqueue(node, &guard);
        node
    }

    #[test]
    fn test_lazy_initialization() {
        let queue = SyncQueue::new();
        assert!(!queue.is_initialized());
        assert!(queue.head().is_null());

        let node = push(&queue, 11);
        assert!(queue.is_initialized());
        assert_eq!(queue.tail(), node);

        let head = queue.arena().owned(queue.head());
        assert_eq!(head.next(), node);
        assert_eq!(queue.arena().owned(node).prev(), queue.head());
    }

    #[test]
    fn test_queued_contexts_in_reverse_order() {
        let queue = SyncQueue::new();
        push(&queue, 1);
        push(&queue, 2);
        push(&queue, 3);

        let guard = crossbeam_epoch::pin();
        assert_eq!(queue.queued_contexts(&guard), [fake(3), fake(2), fake(1)]);
        assert!(queue.has_queued_contexts(&guard));
        assert!(queue.is_queued(fake(2), &guard));
        assert!(!queue.is_queued(fake(4), &guard));
        assert!(queue.has_queued_predecessors(fake(2), &guard));
        assert!(!queue.has_queued_predecessors(fake(1), &guard));
    }

    #[test]
    fn test_clean_queue_splices_cancelled_nodes() {
        let queue = SyncQueue::new();
        let a = push(&queue, 1);
        let b = push(&queue, 2);
        let c = push(&queue, 3);

        let guard = crossbeam_epoch::pin();
        queue.arena().owned(b).set_status(NodeStatus::CANCELLED);
        queue.clean_queue(&guard);

        assert_eq!(queue.arena().owned(c).prev(), a);
        assert_eq!(queue.arena().owned(a).next(), c);
        assert!(!queue.is_enqueued(b, &guard));
        assert!(queue.is_enqueued(a, &guard));
        assert!(queue.is_enqueued(c, &guard));
    }

    #[test]
    fn test_clean_queue_splices_cancelled_tail() {
        let queue = SyncQueue::new();
        let a = push(&queue, 1);
        let b = push(&queue, 2);

        let guard = crossbeam_epoch::pin();
        queue.arena().owned(b).set_status(NodeStatus::CANCELLED);
        queue.clean_queue(&guard);

        assert_eq!(queue.tail(), a);
        assert!(queue.arena().owned(a).next().is_null());
        assert!(queue.has_queued_contexts(&guard));
    }

    #[test]
    fn test_clean_queue_repairs_lagging_next() {
        let queue = SyncQueue::new();
        let a = push(&queue, 1);
        let b = push(&queue, 2);

        let guard = crossbeam_epoch::pin();
        queue.arena().owned(a).set_next(NodeRef::new(999, 0));
        queue.clean_queue(&guard);
        assert_eq!(queue.arena().owned(a).next(), b);
    }

    #[test]
    fn test_signal_next_clears_waiting() {
        let queue = SyncQueue::new();
        let a = push(&queue, 1);

        let guard = crossbeam_epoch::pin();
        queue.arena().owned(a).set_status(NodeStatus::WAITING);
        queue.signal_next(queue.head(), &guard);
        assert!(queue.arena().owned(a).status().is_empty());
    }
}
