//! Condition queues: wait/notify by transfer into the lock queue.
//!
//! A waiter appends a condition node to the singly linked list of its [`ConditionQueue`],
//! fully releases the lock and parks. A signaller pops nodes from the front of the list
//! and moves them into the wait queue of the lock; from there the waiter
//! reacquires the lock like any other queued context, restoring the hold count it had
//! before waiting.
//!
//! Whether a waiter was signalled, timed out or interrupted is decided by whoever clears
//! the `COND` status bit of its node first. A node can therefore never be delivered twice,
//! and a waiter that gave up never consumes a signal meant for another one.
//!
//! The list links (`first_waiter`, `last_waiter`, `next_waiter`) are only ever changed
//! while the lock is held.

use std::{
    hint,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use crossbeam_epoch::{self as epoch, Guard};

use crate::{
    context::{self, ContextId},
    queue::{NodeArena, NodeKind, NodeRef, NodeStatus},
    synchronizer::{AcquireStrategy, QueuedSynchronizer},
    Error, Result,
};

/// How a condition wait ended, for contexts that reacquired the lock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WaitOutcome {
    /// `true` if a signal ended the wait, `false` if the deadline passed first.
    pub signalled: bool,
    /// The context whose signal ended the wait.
    pub notifier: Option<ContextId>,
}

/// The wait list of one condition.
#[derive(Debug, Default)]
pub struct ConditionQueue {
    first_waiter: AtomicU64,
    last_waiter: AtomicU64,
}

impl ConditionQueue {
    /// Creates an empty condition queue.
    pub fn new() -> Self {
        Self::default()
    }

    fn first(&self) -> NodeRef {
        NodeRef::from_raw(self.first_waiter.load(Ordering::Relaxed))
    }

    fn set_first(&self, node: NodeRef) {
        self.first_waiter.store(node.raw(), Ordering::Relaxed);
    }

    fn last(&self) -> NodeRef {
        NodeRef::from_raw(self.last_waiter.load(Ordering::Relaxed))
    }

    fn set_last(&self, node: NodeRef) {
        self.last_waiter.store(node.raw(), Ordering::Relaxed);
    }

    /// Waits until signalled, interrupted (when `interruptible`) or `deadline` passes.
    ///
    /// The calling context must hold `sync`. The lock is always held again when this
    /// returns, except for [`Error::IllegalState`] raised before waiting started.
    ///
    /// # Errors
    ///
    /// - [`Error::IllegalState`] if `sync` is not held by the calling context
    /// - [`Error::Interrupted`] if the wait was cancelled by an interrupt
    /// - strategy failures while releasing or reacquiring
    pub fn block<S: AcquireStrategy>(
        &self,
        sync: &QueuedSynchronizer<S>,
        interruptible: bool,
        deadline: Option<Instant>,
    ) -> Result<WaitOutcome> {
        if interruptible && context::interrupted() {
            return Err(Error::Interrupted);
        }

        let arena = sync.queue().arena();
        let node = arena.allocate(NodeKind::Condition);
        let saved = self.enable_wait(sync, node)?;
        let n = arena.owned(node);

        let mut interrupted = false;
        let mut cancelled = false;
        loop {
            if self.can_reacquire(sync, node, &epoch::pin()) {
                break;
            }

            let observed = context::interrupted();
            interrupted |= observed;
            let expired = deadline.is_some_and(|deadline| Instant::now() >= deadline);

            if (interruptible && interrupted) || expired {
                if n
                    .get_and_unset_status(NodeStatus::COND)
                    .contains(NodeStatus::COND)
                {
                    cancelled = true;
                    break;
                }
                // A signal won the race; wait for the transfer to finish.
                hint::spin_loop();
            } else if observed {
                continue;
            } else if n.status().contains(NodeStatus::COND) {
                match deadline {
                    None => context::park(),
                    Some(deadline) => context::park_until(deadline),
                }
            } else {
                hint::spin_loop();
            }
        }

        n.clear_status();
        sync.acquire_queued(node, saved, false, None)?;
        let notifier = n.notifier();

        let guard = epoch::pin();
        if cancelled {
            self.unlink_cancelled_waiters(arena);
            if sync.queue().head() != node {
                arena.retire(node, &guard);
            }
            if interrupted && interruptible {
                return Err(Error::Interrupted);
            }
            if interrupted {
                context::reassert_interrupt();
            }
            return Ok(WaitOutcome {
                signalled: false,
                notifier: None,
            });
        }

        if interrupted {
            context::reassert_interrupt();
        }
        Ok(WaitOutcome {
            signalled: true,
            notifier,
        })
    }

    /// Links `node` into the wait list and fully releases the lock, returning the hold
    /// count to restore afterwards.
    fn enable_wait<S: AcquireStrategy>(
        &self,
        sync: &QueuedSynchronizer<S>,
        node: NodeRef,
    ) -> Result<u32> {
        let arena = sync.queue().arena();
        let n = arena.owned(node);

        if !sync.is_held_exclusively() {
            arena.retire(node, &epoch::pin());
            return Err(illegal_state!("wait on a condition without holding its lock"));
        }

        n.set_waiter(Some(context::current_id()));
        n.set_status_relaxed(NodeStatus::COND | NodeStatus::WAITING);
        match arena.get(self.last()) {
            Some(last) => last.set_next_waiter(node),
            None => self.set_first(node),
        }
        self.set_last(node);

        let saved = sync.strategy().held_count(sync.state());
        match sync.release(saved) {
            Ok(true) => Ok(saved),
            Ok(false) => {
                n.set_status(NodeStatus::CANCELLED);
                Err(illegal_state!(
                    "releasing {} holds did not free the lock",
                    saved
                ))
            }
            Err(e) => {
                n.set_status(NodeStatus::CANCELLED);
                Err(e)
            }
        }
    }

    /// Returns `true` once `node` has been transferred into the lock queue.
    fn can_reacquire<S: AcquireStrategy>(
        &self,
        sync: &QueuedSynchronizer<S>,
        node: NodeRef,
        guard: &Guard,
    ) -> bool {
        let arena = sync.queue().arena();
        let p = arena.owned(node).prev();
        match arena.get(p) {
            Some(pred) => pred.next() == node || sync.queue().is_enqueued(node, guard),
            None => false,
        }
    }

    /// Wakes the longest waiting context.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IllegalState`] if the calling context does not hold `sync`.
    pub fn signal<S: AcquireStrategy>(&self, sync: &QueuedSynchronizer<S>) -> Result<()> {
        self.do_signal(sync, false)
    }

    /// Wakes every waiting context.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IllegalState`] if the calling context does not hold `sync`.
    pub fn signal_all<S: AcquireStrategy>(&self, sync: &QueuedSynchronizer<S>) -> Result<()> {
        self.do_signal(sync, true)
    }

    fn do_signal<S: AcquireStrategy>(&self, sync: &QueuedSynchronizer<S>, all: bool) -> Result<()> {
        if !sync.is_held_exclusively() {
            return Err(illegal_state!("signal a condition without holding its lock"));
        }

        let arena = sync.queue().arena();
        let guard = epoch::pin();
        let me = context::current_id();

        let mut first = self.first();
        while let Some(node) = arena.get(first) {
            let next = node.next_waiter();
            self.set_first(next);
            if next.is_null() {
                self.set_last(NodeRef::NULL);
            }
            node.set_next_waiter(NodeRef::NULL);

            if node
                .get_and_unset_status(NodeStatus::COND)
                .contains(NodeStatus::COND)
            {
                node.set_notifier(Some(me));
                sync.queue().enqueue(first, &guard);
                if !all {
                    break;
                }
            }
            first = next;
        }
        Ok(())
    }

    /// Drops every node whose wait already ended from the list.
    fn unlink_cancelled_waiters(&self, arena: &NodeArena) {
        let mut trail = NodeRef::NULL;
        let mut w = self.first();
        while let Some(node) = arena.get(w) {
            let next = node.next_waiter();
            if node.status().contains(NodeStatus::COND) {
                trail = w;
            } else {
                node.set_next_waiter(NodeRef::NULL);
                match arena.get(trail) {
                    Some(t) => t.set_next_waiter(next),
                    None => self.set_first(next),
                }
                if next.is_null() {
                    self.set_last(trail);
                }
            }
            w = next;
        }
    }

    fn waiters<S: AcquireStrategy>(&self, sync: &QueuedSynchronizer<S>) -> Result<Vec<ContextId>> {
        if !sync.is_held_exclusively() {
            return Err(illegal_state!("inspect a condition without holding its lock"));
        }
        let arena = sync.queue().arena();
        let mut waiters = Vec::new();
        let mut w = self.first();
        while let Some(node) = arena.get(w) {
            if node.status().contains(NodeStatus::COND) {
                if let Some(waiter) = node.waiter() {
                    waiters.push(waiter);
                }
            }
            w = node.next_waiter();
        }
        Ok(waiters)
    }
}

/// A condition bound to the synchronizer it releases and reacquires.
///
/// # Example
///
/// ```rust
/// use objmonitor::ReentrantMonitor;
/// use std::time::Duration;
///
/// let monitor = ReentrantMonitor::new();
/// monitor.lock()?;
/// let condition = monitor.new_condition();
/// assert!(!condition.await_timeout(Duration::from_millis(10))?);
/// assert!(monitor.is_held_by_current_context());
/// monitor.unlock()?;
/// # Ok::<(), objmonitor::Error>(())
/// ```
pub struct Condition<'a, S> {
    sync: &'a QueuedSynchronizer<S>,
    queue: &'a ConditionQueue,
}

impl<'a, S: AcquireStrategy> Condition<'a, S> {
    /// Binds `queue` to `sync`.
    pub fn new(sync: &'a QueuedSynchronizer<S>, queue: &'a ConditionQueue) -> Self {
        Condition { sync, queue }
    }

    /// Waits until signalled or interrupted.
    ///
    /// # Errors
    ///
    /// - [`Error::IllegalState`] if the lock is not held by the calling context
    /// - [`Error::Interrupted`] if the context was interrupted before being signalled
    pub fn await_signal(&self) -> Result<()> {
        self.queue.block(self.sync, true, None).map(|_| ())
    }

    /// Waits until signalled, interrupted, or `timeout` elapsed.
    ///
    /// Returns `false` if the timeout elapsed before a signal arrived.
    ///
    /// # Errors
    ///
    /// Same as [`Condition::await_signal`].
    pub fn await_timeout(&self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now().checked_add(timeout);
        self.queue
            .block(self.sync, true, deadline)
            .map(|outcome| outcome.signalled)
    }

    /// Waits until signalled, interrupted, or `deadline` passed.
    ///
    /// # Errors
    ///
    /// Same as [`Condition::await_signal`].
    pub fn await_until(&self, deadline: Instant) -> Result<bool> {
        self.queue
            .block(self.sync, true, Some(deadline))
            .map(|outcome| outcome.signalled)
    }

    /// Waits until signalled; interrupts are remembered and re-asserted on return.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IllegalState`] if the lock is not held by the calling context.
    pub fn await_uninterruptibly(&self) -> Result<()> {
        self.queue.block(self.sync, false, None).map(|_| ())
    }

    /// Moves the longest waiting context to the lock queue.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IllegalState`] if the lock is not held by the calling context.
    pub fn signal(&self) -> Result<()> {
        self.queue.signal(self.sync)
    }

    /// Moves every waiting context to the lock queue.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IllegalState`] if the lock is not held by the calling context.
    pub fn signal_all(&self) -> Result<()> {
        self.queue.signal_all(self.sync)
    }

    /// Returns `true` if some context waits on this condition.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IllegalState`] if the lock is not held by the calling context.
    pub fn has_waiters(&self) -> Result<bool> {
        Ok(!self.queue.waiters(self.sync)?.is_empty())
    }

    /// Number of contexts waiting on this condition.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IllegalState`] if the lock is not held by the calling context.
    pub fn wait_queue_length(&self) -> Result<usize> {
        Ok(self.queue.waiters(self.sync)?.len())
    }

    /// Contexts waiting on this condition, longest waiting first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IllegalState`] if the lock is not held by the calling context.
    pub fn waiting_contexts(&self) -> Result<Vec<ContextId>> {
        self.queue.waiters(self.sync)
    }
}
