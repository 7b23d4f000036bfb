//! Generic queued acquire/release engine.
//!
//! A [`QueuedSynchronizer`] owns a [`LockState`] and a [`SyncQueue`] and delegates the
//! decision whether the lock can be taken or given back to an [`AcquireStrategy`]. The
//! engine implements everything around that decision: enqueueing, spinning, parking,
//! cancellation on interrupt, timeout or strategy failure, and waking the successor on
//! release.
//!
//! # Algorithm
//!
//! 1. Try the strategy. Barging is allowed: a context that never queued may win against
//!    queued ones.
//! 2. Allocate a node and try again.
//! 3. Enqueue: install `prev`, CAS `tail`, then link `next`.
//! 4. The first queued context spins a little after each wake-up before parking again;
//!    every other context parks right away.
//! 5. Before parking, publish `WAITING` in the node status and re-check, so that a
//!    release racing with the park cannot be lost.
//! 6. On success the node becomes the new head and the old head is retired.
//!
//! [`ConditionQueue`] builds wait/notify on top by transferring nodes into the same queue.

mod condition;

use std::{
    fmt, hint,
    sync::atomic::{AtomicU32, AtomicU64, Ordering},
    time::{Duration, Instant},
};

use crossbeam_epoch as epoch;

use crate::{
    context::{self, ContextId},
    queue::{NodeKind, NodeRef, NodeStatus, SyncQueue},
    Error, Result,
};

pub use condition::{Condition, ConditionQueue, WaitOutcome};

/// The shared lock word of a synchronizer.
///
/// `state` is `0` when the lock is free and positive while it is held. `owner` is written
/// only by the context holding the lock; other contexts may read a stale value but never
/// one that names themselves unless they own the lock.
#[derive(Debug, Default)]
pub struct LockState {
    state: AtomicU32,
    owner: AtomicU64,
    latest_owner: AtomicU64,
    previous_owner: AtomicU64,
}

impl LockState {
    /// Creates a free lock state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state value; `0` means free.
    pub fn state(&self) -> u32 {
        self.state.load(Ordering::SeqCst)
    }

    /// Unconditionally sets the state. Only the owner may call this.
    pub fn set_state(&self, state: u32) {
        self.state.store(state, Ordering::SeqCst);
    }

    /// Atomically replaces `expected` with `new`, returning `true` on success.
    pub fn compare_and_set_state(&self, expected: u32, new: u32) -> bool {
        self.state
            .compare_exchange(expected, new, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// The owning context, possibly stale when read by a non-owner.
    pub fn owner(&self) -> Option<ContextId> {
        ContextId::new(self.owner.load(Ordering::Relaxed))
    }

    /// Records the new owner, or clears it before the state is reset to free.
    pub fn set_owner(&self, owner: Option<ContextId>) {
        self.owner
            .store(owner.map_or(0, ContextId::get), Ordering::Relaxed);
        if let Some(owner) = owner {
            let latest = self.latest_owner.swap(owner.get(), Ordering::Relaxed);
            if latest != owner.get() {
                self.previous_owner.store(latest, Ordering::Relaxed);
            }
        }
    }

    /// The last context other than the most recent owner that held this lock.
    pub fn previous_owner(&self) -> Option<ContextId> {
        ContextId::new(self.previous_owner.load(Ordering::Relaxed))
    }
}

/// Decides whether a [`QueuedSynchronizer`] may be acquired or released.
///
/// Implementations see the shared [`LockState`] and an opaque argument passed through
/// from the caller (for a reentrant lock, the number of holds to take or give back).
pub trait AcquireStrategy: Send + Sync {
    /// Attempts to take the lock for the calling context.
    ///
    /// # Errors
    ///
    /// Any error is propagated to the caller of the acquire operation after the waiting
    /// node has been cancelled.
    fn try_acquire(&self, state: &LockState, arg: u32) -> Result<bool>;

    /// Gives back `arg` holds. Returns `true` when the lock became free.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IllegalState`] if the calling context does not hold the lock.
    fn try_release(&self, state: &LockState, arg: u32) -> Result<bool>;

    /// Returns `true` if the calling context holds the lock.
    fn is_held_exclusively(&self, state: &LockState) -> bool;

    /// Number of holds the calling context has, used to fully release and later restore
    /// the lock around a condition wait.
    fn held_count(&self, state: &LockState) -> u32;
}

/// A lock-free queued synchronizer parameterized by an [`AcquireStrategy`].
pub struct QueuedSynchronizer<S> {
    state: LockState,
    queue: SyncQueue,
    strategy: S,
    max_spins: u8,
}

impl<S: AcquireStrategy> QueuedSynchronizer<S> {
    /// Creates a synchronizer with a free lock and no queue.
    pub fn new(strategy: S) -> Self {
        QueuedSynchronizer {
            state: LockState::new(),
            queue: SyncQueue::new(),
            strategy,
            max_spins: u8::MAX,
        }
    }

    /// Caps the spin count of the first queued context.
    #[must_use]
    pub fn with_max_spins(mut self, max_spins: u8) -> Self {
        self.max_spins = max_spins;
        self
    }

    /// The shared lock state.
    pub fn state(&self) -> &LockState {
        &self.state
    }

    /// The acquisition strategy.
    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    pub(crate) fn queue(&self) -> &SyncQueue {
        &self.queue
    }

    /// Single attempt through the strategy, without queueing.
    ///
    /// # Errors
    ///
    /// Propagates strategy failures.
    pub fn try_acquire(&self, arg: u32) -> Result<bool> {
        self.strategy.try_acquire(&self.state, arg)
    }

    /// Acquires, blocking as long as necessary. Interrupts are recorded and handed back to
    /// the caller through the context's interrupt flag.
    ///
    /// # Errors
    ///
    /// Propagates strategy failures.
    pub fn acquire(&self, arg: u32) -> Result<()> {
        if !self.try_acquire(arg)? {
            self.acquire_queued(NodeRef::NULL, arg, false, None)?;
        }
        Ok(())
    }

    /// Acquires, giving up when the calling context is interrupted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Interrupted`] if the context was interrupted before or while
    /// waiting, or a strategy failure.
    pub fn acquire_interruptibly(&self, arg: u32) -> Result<()> {
        if context::interrupted() {
            return Err(Error::Interrupted);
        }
        if !self.try_acquire(arg)? {
            self.acquire_queued(NodeRef::NULL, arg, true, None)?;
        }
        Ok(())
    }

    /// Acquires, giving up after `timeout`. Returns `false` on timeout.
    ///
    /// # Errors
    ///
    /// Same as [`QueuedSynchronizer::acquire_interruptibly`].
    pub fn try_acquire_for(&self, arg: u32, timeout: Duration) -> Result<bool> {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.try_acquire_until(arg, deadline),
            None => self.acquire_interruptibly(arg).map(|()| true),
        }
    }

    /// Acquires, giving up at `deadline`. Returns `false` on timeout.
    ///
    /// # Errors
    ///
    /// Same as [`QueuedSynchronizer::acquire_interruptibly`].
    pub fn try_acquire_until(&self, arg: u32, deadline: Instant) -> Result<bool> {
        if context::interrupted() {
            return Err(Error::Interrupted);
        }
        if self.try_acquire(arg)? {
            return Ok(true);
        }
        self.acquire_queued(NodeRef::NULL, arg, true, Some(deadline))
    }

    /// Releases through the strategy and wakes the first queued context when the lock
    /// became free.
    ///
    /// # Errors
    ///
    /// Propagates strategy failures, typically [`Error::IllegalState`] for a non-owner.
    pub fn release(&self, arg: u32) -> Result<bool> {
        if self.strategy.try_release(&self.state, arg)? {
            let guard = epoch::pin();
            self.queue.signal_next(self.queue.head(), &guard);
            return Ok(true);
        }
        Ok(false)
    }

    /// Returns `true` if the calling context holds the lock.
    pub fn is_held_exclusively(&self) -> bool {
        self.strategy.is_held_exclusively(&self.state)
    }

    /// Returns `true` if any context is waiting to acquire.
    pub fn has_queued_contexts(&self) -> bool {
        self.queue.has_queued_contexts(&epoch::pin())
    }

    /// Returns `true` if some context ever had to queue for this synchronizer.
    pub fn has_contended(&self) -> bool {
        self.queue.is_initialized()
    }

    /// Returns `true` if a context other than the caller is first in line.
    pub fn has_queued_predecessors(&self) -> bool {
        self.queue
            .has_queued_predecessors(context::current_id(), &epoch::pin())
    }

    /// Estimated number of waiting contexts.
    pub fn queue_length(&self) -> usize {
        self.queue.queued_contexts(&epoch::pin()).len()
    }

    /// Snapshot of the waiting contexts, most recently queued first.
    pub fn queued_contexts(&self) -> Vec<ContextId> {
        self.queue.queued_contexts(&epoch::pin())
    }

    /// Returns `true` if `context` is currently waiting to acquire.
    pub fn is_queued(&self, context: ContextId) -> bool {
        self.queue.is_queued(context, &epoch::pin())
    }

    /// Main acquire loop.
    ///
    /// `node` is null for a plain acquire, in which case the loop allocates (and owns) its
    /// node. A condition waiter passes its own node; that node stays with the caller when
    /// it is not absorbed into the queue.
    ///
    /// Returns `Ok(true)` once acquired, `Ok(false)` when `deadline` passed, and
    /// [`Error::Interrupted`] when `interruptible` and the context was interrupted.
    pub(crate) fn acquire_queued(
        &self,
        mut node: NodeRef,
        arg: u32,
        interruptible: bool,
        deadline: Option<Instant>,
    ) -> Result<bool> {
        let arena = self.queue.arena();
        let owns_node = node.is_null();
        let me = context::current_id();

        let mut spins: u8 = 0;
        let mut post_spins: u8 = 0;
        let mut interrupted = false;
        let mut first = false;
        let mut pred = NodeRef::NULL;

        loop {
            let guard = epoch::pin();

            if !first {
                pred = if node.is_null() {
                    NodeRef::NULL
                } else {
                    arena.owned(node).prev()
                };
                if !pred.is_null() {
                    first = self.queue.head() == pred;
                    if !first {
                        match arena.get(pred) {
                            Some(p) if p.is_cancelled() => {
                                self.queue.clean_queue(&guard);
                                continue;
                            }
                            Some(p) if !p.prev().is_null() => {}
                            _ => {
                                hint::spin_loop();
                                continue;
                            }
                        }
                    }
                }
            }

            if first || pred.is_null() {
                let acquired = match self.strategy.try_acquire(&self.state, arg) {
                    Ok(acquired) => acquired,
                    Err(e) => {
                        drop(guard);
                        self.cancel_acquire(node, interrupted, false, owns_node)?;
                        return Err(e);
                    }
                };
                if acquired {
                    if first {
                        let n = arena.owned(node);
                        n.set_prev(NodeRef::NULL);
                        self.queue.set_head(node);
                        if let Some(p) = arena.get(pred) {
                            p.set_next(NodeRef::NULL);
                        }
                        n.set_waiter(None);
                        arena.retire(pred, &guard);
                    } else if owns_node {
                        arena.retire(node, &guard);
                    }
                    if interrupted {
                        context::reassert_interrupt();
                    }
                    return Ok(true);
                }
            }

            if node.is_null() {
                node = arena.allocate(NodeKind::Exclusive);
            } else if pred.is_null() {
                let n = arena.owned(node);
                n.set_waiter(Some(me));
                let t = self.queue.tail();
                n.set_prev_relaxed(t);
                if t.is_null() {
                    self.queue.try_initialize_head(&guard);
                } else if !self.queue.cas_tail(t, node) {
                    n.set_prev_relaxed(NodeRef::NULL);
                } else if let Some(tn) = arena.get(t) {
                    tn.set_next(node);
                }
            } else if first && spins != 0 {
                spins -= 1;
                hint::spin_loop();
            } else if arena.owned(node).status().is_empty() {
                arena.owned(node).set_status(NodeStatus::WAITING);
            } else {
                post_spins = ((post_spins << 1) | 1).min(self.max_spins);
                spins = post_spins;
                drop(guard);

                log::trace!("{} parking on {:?}", me, node);
                match deadline {
                    None => context::park(),
                    Some(deadline) if Instant::now() < deadline => context::park_until(deadline),
                    Some(_) => break,
                }
                arena.owned(node).clear_status();

                interrupted |= context::interrupted();
                if interrupted && interruptible {
                    break;
                }
            }
        }

        self.cancel_acquire(node, interrupted, interruptible, owns_node)
    }

    /// Marks `node` cancelled, unlinks it and settles the interrupt state.
    fn cancel_acquire(
        &self,
        node: NodeRef,
        interrupted: bool,
        interruptible: bool,
        owns_node: bool,
    ) -> Result<bool> {
        if !node.is_null() {
            let arena = self.queue.arena();
            let guard = epoch::pin();
            let n = arena.owned(node);
            n.set_waiter(None);
            n.set_status(NodeStatus::CANCELLED);
            if !n.prev().is_null() {
                self.queue.clean_queue(&guard);
            }
            if owns_node {
                arena.retire(node, &guard);
            }
        }

        if interrupted {
            if interruptible {
                return Err(Error::Interrupted);
            }
            context::reassert_interrupt();
        }
        Ok(false)
    }
}

impl<S> fmt::Debug for QueuedSynchronizer<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedSynchronizer")
            .field("state", &self.state)
            .field("queue", &self.queue)
            .field("max_spins", &self.max_spins)
            .finish_non_exhaustive()
    }
}
