//! The inflated, reentrant monitor.
//!
//! A [`ReentrantMonitor`] is a [`QueuedSynchronizer`] driven by the [`Reentrancy`]
//! strategy plus a lazily created condition queue for wait/notify.
//!
//! # Access Disciplines
//!
//! The monitor mixes two kinds of fields:
//!
//! - `state` and `owner` in [`LockState`] are atomics shared by every context
//! - `acquisitions` (the reentrancy depth) is a plain integer that only the owning context
//!   reads or writes
//!
//! Ownership transfer goes through the `state` CAS, which orders the previous owner's last
//! write of `acquisitions` before the next owner's first read.

use std::{
    cell::UnsafeCell,
    fmt,
    marker::PhantomData,
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};

use crate::{
    config::MonitorConfig,
    context::{self, ContextId},
    hooks::MonitorHooks,
    synchronizer::{
        AcquireStrategy, Condition, ConditionQueue, LockState, QueuedSynchronizer, WaitOutcome,
    },
    Result,
};

/// Reentrant exclusive acquisition: the first hold takes `state` from 0 to 1, later holds
/// by the same context only bump `acquisitions`.
pub struct Reentrancy {
    acquisitions: UnsafeCell<u32>,
    max_recursion: u32,
}

// SAFETY: `acquisitions` is only accessed by the context that owns the lock (or, before
// the monitor is published, by the context creating it), and ownership changes are
// ordered by the SeqCst `state` CAS.
unsafe impl Sync for Reentrancy {}

impl Reentrancy {
    fn new(max_recursion: u32) -> Self {
        Reentrancy {
            acquisitions: UnsafeCell::new(0),
            max_recursion,
        }
    }

    fn assert_owner(state: &LockState) {
        debug_assert_eq!(
            state.owner(),
            Some(context::current_id()),
            "acquisitions accessed by a context that does not own the monitor"
        );
    }

    fn count(&self, state: &LockState) -> u32 {
        Self::assert_owner(state);
        // SAFETY: only the owner reaches this point.
        unsafe { *self.acquisitions.get() }
    }

    fn set_count(&self, state: &LockState, count: u32) {
        Self::assert_owner(state);
        // SAFETY: only the owner reaches this point.
        unsafe { *self.acquisitions.get() = count };
    }

    fn checked_depth(&self, current: u32, arg: u32) -> u32 {
        match current.checked_add(arg) {
            Some(depth) if depth <= self.max_recursion => depth,
            _ => panic!(
                "monitor recursion overflow: depth {} + {} exceeds {}",
                current, arg, self.max_recursion
            ),
        }
    }
}

impl AcquireStrategy for Reentrancy {
    fn try_acquire(&self, state: &LockState, arg: u32) -> Result<bool> {
        let me = context::current_id();
        if state.owner() == Some(me) && state.state() != 0 {
            let depth = self.checked_depth(self.count(state), arg);
            self.set_count(state, depth);
            return Ok(true);
        }
        self.checked_depth(0, arg);
        if state.compare_and_set_state(0, 1) {
            state.set_owner(Some(me));
            self.set_count(state, arg);
            return Ok(true);
        }
        Ok(false)
    }

    fn try_release(&self, state: &LockState, arg: u32) -> Result<bool> {
        let me = context::current_id();
        if state.owner() != Some(me) || state.state() == 0 {
            return Err(illegal_state!(
                "{} released a monitor owned by {:?}",
                me,
                state.owner()
            ));
        }

        let count = self.count(state);
        assert!(
            arg <= count,
            "monitor hold count corrupted: releasing {arg} of {count}"
        );
        self.set_count(state, count - arg);
        if count == arg {
            state.set_owner(None);
            state.set_state(0);
            return Ok(true);
        }
        Ok(false)
    }

    fn is_held_exclusively(&self, state: &LockState) -> bool {
        state.state() != 0 && state.owner() == Some(context::current_id())
    }

    fn held_count(&self, state: &LockState) -> u32 {
        if self.is_held_exclusively(state) {
            self.count(state)
        } else {
            0
        }
    }
}

/// A reentrant mutual-exclusion lock with one built-in condition.
///
/// # Example
///
/// ```rust
/// use objmonitor::ReentrantMonitor;
///
/// let monitor = ReentrantMonitor::new();
/// monitor.lock()?;
/// monitor.lock()?;
/// assert_eq!(monitor.acquisitions(), Some(2));
/// monitor.unlock()?;
/// monitor.unlock()?;
/// assert!(!monitor.is_locked());
/// # Ok::<(), objmonitor::Error>(())
/// ```
pub struct ReentrantMonitor {
    sync: QueuedSynchronizer<Reentrancy>,
    condition: OnceLock<ConditionQueue>,
    hooks: Option<Arc<dyn MonitorHooks>>,
}

impl ReentrantMonitor {
    /// Creates an unlocked monitor with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(&MonitorConfig::default())
    }

    /// Creates an unlocked monitor that honors the spin and recursion limits of `config`.
    #[must_use]
    pub fn with_config(config: &MonitorConfig) -> Self {
        ReentrantMonitor {
            sync: QueuedSynchronizer::new(Reentrancy::new(config.max_recursion))
                .with_max_spins(config.max_spins),
            condition: OnceLock::new(),
            hooks: None,
        }
    }

    /// Attaches telemetry hooks.
    #[must_use]
    pub fn with_hooks(mut self, hooks: Arc<dyn MonitorHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub(crate) fn set_hooks(&mut self, hooks: Option<Arc<dyn MonitorHooks>>) {
        self.hooks = hooks;
    }

    /// Puts an unpublished monitor into the state a thin lock word described.
    ///
    /// # Safety
    ///
    /// No other context may access this monitor until it is published, so that writing
    /// the owner's hold count from the calling context does not race with the owner.
    pub(crate) unsafe fn seed(&self, owner: Option<ContextId>, acquisitions: u32) {
        let state = self.sync.state();
        match owner {
            Some(owner) => {
                state.set_owner(Some(owner));
                state.set_state(1);
                *self.sync.strategy().acquisitions.get() = acquisitions;
            }
            None => {
                state.set_owner(None);
                state.set_state(0);
                *self.sync.strategy().acquisitions.get() = 0;
            }
        }
    }

    /// Acquires the monitor, blocking while another context holds it.
    ///
    /// # Errors
    ///
    /// Currently infallible; the `Result` covers strategy failures of the shared engine.
    ///
    /// # Panics
    ///
    /// Panics if the reentrancy depth would exceed the configured `max_recursion`.
    pub fn lock(&self) -> Result<()> {
        if self.sync.try_acquire(1)? {
            return Ok(());
        }
        self.contended(|| self.sync.acquire(1))
    }

    /// Acquires the monitor unless the calling context is interrupted first.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Interrupted`] if interrupted before or while waiting.
    pub fn lock_interruptibly(&self) -> Result<()> {
        if context::interrupted() {
            return Err(crate::Error::Interrupted);
        }
        if self.sync.try_acquire(1)? {
            return Ok(());
        }
        self.contended(|| self.sync.acquire_interruptibly(1))
    }

    /// Acquires the monitor only if that is possible without waiting.
    ///
    /// # Errors
    ///
    /// Currently infallible; see [`ReentrantMonitor::lock`].
    pub fn try_lock(&self) -> Result<bool> {
        self.sync.try_acquire(1)
    }

    /// Acquires the monitor, waiting at most `timeout`. Returns `false` on timeout.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Interrupted`] if interrupted before or while waiting.
    pub fn try_lock_for(&self, timeout: Duration) -> Result<bool> {
        if self.sync.try_acquire(1)? {
            return Ok(true);
        }
        self.contended(|| self.sync.try_acquire_for(1, timeout))
    }

    fn contended<T>(&self, acquire: impl FnOnce() -> Result<T>) -> Result<T> {
        if let Some(hooks) = &self.hooks {
            hooks.on_contended_enter();
        }
        let result = acquire()?;
        if let Some(hooks) = &self.hooks {
            if self.is_held_by_current_context() {
                hooks.on_contended_entered(self.previous_owner());
            }
        }
        Ok(result)
    }

    /// Releases one hold of the monitor.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::IllegalState`] if the calling context does not own the
    /// monitor.
    pub fn unlock(&self) -> Result<()> {
        self.sync.release(1).map(|_| ())
    }

    /// Acquires the monitor and returns a guard that releases it when dropped.
    ///
    /// # Errors
    ///
    /// Same as [`ReentrantMonitor::lock`].
    pub fn lock_guard(&self) -> Result<MonitorGuard<'_>> {
        self.lock()?;
        Ok(MonitorGuard {
            monitor: self,
            _not_send: PhantomData,
        })
    }

    /// Reentrancy depth of the calling context, or `None` if it does not own the monitor.
    pub fn acquisitions(&self) -> Option<u32> {
        self.is_held_by_current_context()
            .then(|| self.sync.strategy().count(self.sync.state()))
    }

    /// The owning context, as last observed. May be stale unless the caller is the owner.
    pub fn owner(&self) -> Option<ContextId> {
        let state = self.sync.state();
        if state.state() == 0 {
            return None;
        }
        state.owner()
    }

    /// The context that held the monitor before its most recent owner.
    pub fn previous_owner(&self) -> Option<ContextId> {
        self.sync.state().previous_owner()
    }

    /// Returns `true` if the calling context owns the monitor.
    pub fn is_held_by_current_context(&self) -> bool {
        self.sync.is_held_exclusively()
    }

    /// Returns `true` if any context owns the monitor.
    pub fn is_locked(&self) -> bool {
        self.sync.state().state() != 0
    }

    /// Returns `true` if any context waits to acquire the monitor.
    pub fn has_queued_contexts(&self) -> bool {
        self.sync.has_queued_contexts()
    }

    /// Estimated number of contexts waiting to acquire the monitor.
    pub fn queue_length(&self) -> usize {
        self.sync.queue_length()
    }

    /// Contexts waiting to acquire the monitor.
    pub fn queued_contexts(&self) -> Vec<ContextId> {
        self.sync.queued_contexts()
    }

    /// Returns `true` if `context` waits to acquire the monitor.
    pub fn is_queued(&self, context: ContextId) -> bool {
        self.sync.is_queued(context)
    }

    /// Returns the monitor's condition, installing it on first use.
    pub fn new_condition(&self) -> Condition<'_, Reentrancy> {
        Condition::new(&self.sync, self.condition.get_or_init(ConditionQueue::new))
    }

    /// Returns `true` once a condition has been installed.
    pub fn has_condition(&self) -> bool {
        self.condition.get().is_some()
    }

    /// Object-style wait: releases every hold, waits for a notification, the timeout or an
    /// interrupt, and reacquires with the original depth.
    ///
    /// # Errors
    ///
    /// - [`crate::Error::IllegalState`] if the calling context does not own the monitor
    /// - [`crate::Error::Interrupted`] if the wait was interrupted
    pub fn wait(&self, timeout: Option<Duration>) -> Result<WaitOutcome> {
        if !self.is_held_by_current_context() {
            return Err(illegal_state!("wait on a monitor not owned by the caller"));
        }

        if let Some(hooks) = &self.hooks {
            hooks.on_wait_begin(timeout);
        }
        let deadline = timeout.and_then(|timeout| Instant::now().checked_add(timeout));
        let queue = self.condition.get_or_init(ConditionQueue::new);
        let result = queue.block(&self.sync, true, deadline);

        if let Some(hooks) = &self.hooks {
            match &result {
                Ok(outcome) => hooks.on_wait_end(outcome.notifier, !outcome.signalled),
                Err(_) => hooks.on_wait_end(None, false),
            }
        }
        result
    }

    /// Wakes one context waiting on this monitor.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::IllegalState`] if the calling context does not own the
    /// monitor.
    pub fn notify(&self) -> Result<()> {
        self.new_condition().signal()
    }

    /// Wakes every context waiting on this monitor.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::IllegalState`] if the calling context does not own the
    /// monitor.
    pub fn notify_all(&self) -> Result<()> {
        self.new_condition().signal_all()
    }
}

impl Default for ReentrantMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ReentrantMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReentrantMonitor")
            .field("locked", &self.is_locked())
            .field("owner", &self.owner())
            .field("queue_length", &self.queue_length())
            .finish()
    }
}

/// Releases one hold of a [`ReentrantMonitor`] when dropped.
///
/// The guard cannot leave the context that acquired it.
#[must_use = "the monitor is released as soon as the guard is dropped"]
pub struct MonitorGuard<'a> {
    monitor: &'a ReentrantMonitor,
    _not_send: PhantomData<*const ()>,
}

impl MonitorGuard<'_> {
    /// The guarded monitor.
    pub fn monitor(&self) -> &ReentrantMonitor {
        self.monitor
    }
}

impl Drop for MonitorGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.monitor.unlock() {
            log::error!("failed to release monitor guard: {}", e);
        }
    }
}
