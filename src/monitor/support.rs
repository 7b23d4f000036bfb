//! Object monitors: the thin-lock fast path and inflation.
//!
//! [`MonitorSupport`] implements `enter` / `exit` / `wait` / `notify` for objects that
//! carry a [`LockWordStorage`]. Uncontended locking is a single CAS on the word. A word is
//! inflated to a [`ReentrantMonitor`] when:
//!
//! - another context tries to enter while the thin lock is held ([`InflateCause::Contention`])
//! - the thin recursion counter would overflow ([`InflateCause::RecursionOverflow`])
//! - the object is waited on or notified ([`InflateCause::Wait`], [`InflateCause::Notify`])
//! - thin locks are disabled ([`InflateCause::ConfigForced`])
//!
//! Inflation is irreversible. Monitors are owned by the support that created them and
//! live as long as it does; a lock word must only be used with one support.
//!
//! # Example
//!
//! ```rust
//! use objmonitor::{LockWordSlot, MonitorSupport};
//!
//! let support = MonitorSupport::new();
//! let object = LockWordSlot::new();
//!
//! support.enter(&object)?;
//! support.enter(&object)?;
//! assert!(support.holds_lock(&object));
//! assert!(!support.is_inflated(&object));
//!
//! support.exit(&object)?;
//! support.exit(&object)?;
//! assert!(!support.is_locked(&object));
//! # Ok::<(), objmonitor::Error>(())
//! ```

use std::{
    fmt,
    marker::PhantomData,
    sync::Arc,
    thread,
    time::Duration,
};

use crossbeam_queue::SegQueue;
use crossbeam_utils::Backoff;
use dashmap::DashMap;

use crate::{
    config::MonitorConfig,
    context::{self, ContextId},
    hooks::{InflateCause, MonitorHooks},
    monitor::{
        lockword::{LockShape, LockWord, LockWordSlot, LockWordStorage, THIN_COUNT_MAX},
        reentrant::ReentrantMonitor,
    },
    Error, Result,
};

/// Entry point for object locking.
pub struct MonitorSupport {
    config: MonitorConfig,
    hooks: Option<Arc<dyn MonitorHooks>>,
    monitors: boxcar::Vec<ReentrantMonitor>,
    spare: SegQueue<usize>,
    slots: DashMap<u64, Arc<LockWordSlot>>,
}

impl MonitorSupport {
    /// Creates a support with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(MonitorConfig::default())
    }

    /// Creates a support with the given configuration.
    #[must_use]
    pub fn with_config(config: MonitorConfig) -> Self {
        MonitorSupport {
            config,
            hooks: None,
            monitors: boxcar::Vec::new(),
            spare: SegQueue::new(),
            slots: DashMap::new(),
        }
    }

    /// Attaches telemetry hooks, passed on to every monitor this support inflates.
    #[must_use]
    pub fn with_hooks(mut self, hooks: Arc<dyn MonitorHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// The active configuration.
    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Number of monitors created so far, published or spare.
    pub fn monitor_count(&self) -> usize {
        self.monitors.count()
    }

    /// Enters the monitor of `object`, blocking while another context holds it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IllegalState`] if the word refers to a monitor of another support.
    ///
    /// # Panics
    ///
    /// Panics if the reentrancy depth would exceed `max_recursion`.
    pub fn enter<W: LockWordStorage + ?Sized>(&self, object: &W) -> Result<()> {
        self.enter_with(object, false)
    }

    /// Like [`MonitorSupport::enter`], but gives up when the calling context is
    /// interrupted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Interrupted`] if interrupted before or while waiting.
    pub fn enter_interruptibly<W: LockWordStorage + ?Sized>(&self, object: &W) -> Result<()> {
        if context::interrupted() {
            return Err(Error::Interrupted);
        }
        self.enter_with(object, true)
    }

    fn enter_with<W: LockWordStorage + ?Sized>(
        &self,
        object: &W,
        interruptible: bool,
    ) -> Result<()> {
        if self.config.is_single_threaded() {
            return Ok(());
        }

        let me = context::current_id();
        let backoff = Backoff::new();
        loop {
            let word = object.load();
            let monitor = match word.shape() {
                LockShape::Unlocked if self.config.thin_locks => {
                    if object
                        .compare_and_swap(word, LockWord::thin(me, 0))
                        .is_ok()
                    {
                        return Ok(());
                    }
                    backoff.spin();
                    continue;
                }
                LockShape::Unlocked => self.inflate(object, InflateCause::ConfigForced)?,
                LockShape::Thin { owner, count } if owner == me => {
                    if count == THIN_COUNT_MAX {
                        self.inflate(object, InflateCause::RecursionOverflow)?
                    } else {
                        self.check_depth(u32::from(count) + 2);
                        if object
                            .compare_and_swap(word, LockWord::thin(me, count + 1))
                            .is_ok()
                        {
                            return Ok(());
                        }
                        backoff.spin();
                        continue;
                    }
                }
                LockShape::Thin { .. } => self.inflate(object, InflateCause::Contention)?,
                LockShape::Inflated { monitor } => self.monitor(monitor)?,
            };

            return if interruptible {
                monitor.lock_interruptibly()
            } else {
                monitor.lock()
            };
        }
    }

    /// Enters the monitor of `object` only if that is possible without waiting.
    ///
    /// A thin lock held by another context is left alone; it is not inflated.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IllegalState`] if the word refers to a monitor of another support.
    pub fn try_enter<W: LockWordStorage + ?Sized>(&self, object: &W) -> Result<bool> {
        if self.config.is_single_threaded() {
            return Ok(true);
        }

        let me = context::current_id();
        loop {
            let word = object.load();
            let monitor = match word.shape() {
                LockShape::Unlocked if self.config.thin_locks => {
                    if object
                        .compare_and_swap(word, LockWord::thin(me, 0))
                        .is_ok()
                    {
                        return Ok(true);
                    }
                    continue;
                }
                LockShape::Unlocked => self.inflate(object, InflateCause::ConfigForced)?,
                LockShape::Thin { owner, count } if owner == me => {
                    if count == THIN_COUNT_MAX {
                        self.inflate(object, InflateCause::RecursionOverflow)?
                    } else {
                        self.check_depth(u32::from(count) + 2);
                        if object
                            .compare_and_swap(word, LockWord::thin(me, count + 1))
                            .is_ok()
                        {
                            return Ok(true);
                        }
                        continue;
                    }
                }
                LockShape::Thin { .. } => return Ok(false),
                LockShape::Inflated { monitor } => self.monitor(monitor)?,
            };
            return monitor.try_lock();
        }
    }

    /// Exits the monitor of `object` once.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IllegalState`] if the calling context does not hold the lock.
    pub fn exit<W: LockWordStorage + ?Sized>(&self, object: &W) -> Result<()> {
        if self.config.is_single_threaded() {
            return Ok(());
        }

        let me = context::current_id();
        let backoff = Backoff::new();
        loop {
            let word = object.load();
            let next = match word.shape() {
                LockShape::Unlocked => {
                    return Err(illegal_state!("{} exited an unlocked object", me));
                }
                LockShape::Thin { owner, .. } if owner != me => {
                    return Err(illegal_state!("{} exited an object locked by {}", me, owner));
                }
                LockShape::Thin { count: 0, .. } => LockWord::UNLOCKED,
                LockShape::Thin { count, .. } => LockWord::thin(me, count - 1),
                LockShape::Inflated { monitor } => return self.monitor(monitor)?.unlock(),
            };
            if object.compare_and_swap(word, next).is_ok() {
                return Ok(());
            }
            backoff.spin();
        }
    }

    /// Enters the monitor of `object` and returns a guard that exits on drop.
    ///
    /// # Errors
    ///
    /// Same as [`MonitorSupport::enter`].
    pub fn enter_guard<'a, W: LockWordStorage + ?Sized>(
        &'a self,
        object: &'a W,
    ) -> Result<ObjectGuard<'a, W>> {
        self.enter(object)?;
        Ok(ObjectGuard {
            support: self,
            object,
            _not_send: PhantomData,
        })
    }

    /// Waits on `object` until notified, interrupted, or `timeout` elapsed. Returns
    /// `false` if the timeout elapsed first.
    ///
    /// The calling context must hold the lock; it holds it again, with the same depth,
    /// when this returns.
    ///
    /// # Errors
    ///
    /// - [`Error::IllegalState`] if the lock is not held, or for an untimed wait in
    ///   single-threaded mode, where nobody could ever notify
    /// - [`Error::Interrupted`] if the wait was interrupted
    pub fn wait<W: LockWordStorage + ?Sized>(
        &self,
        object: &W,
        timeout: Option<Duration>,
    ) -> Result<bool> {
        if self.config.is_single_threaded() {
            return match timeout {
                Some(timeout) => {
                    thread::sleep(timeout);
                    Ok(false)
                }
                None => Err(illegal_state!(
                    "untimed wait in single-threaded mode can never be notified"
                )),
            };
        }
        if !self.holds_lock(object) {
            return Err(illegal_state!("wait on an object not locked by the caller"));
        }

        let monitor = self.inflated(object, InflateCause::Wait)?;
        monitor.wait(timeout).map(|outcome| outcome.signalled)
    }

    /// Wakes one context waiting on `object`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IllegalState`] if the calling context does not hold the lock.
    pub fn notify<W: LockWordStorage + ?Sized>(&self, object: &W) -> Result<()> {
        self.notify_with(object, false)
    }

    /// Wakes every context waiting on `object`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IllegalState`] if the calling context does not hold the lock.
    pub fn notify_all<W: LockWordStorage + ?Sized>(&self, object: &W) -> Result<()> {
        self.notify_with(object, true)
    }

    fn notify_with<W: LockWordStorage + ?Sized>(&self, object: &W, all: bool) -> Result<()> {
        if self.config.is_single_threaded() {
            return Ok(());
        }
        if !self.holds_lock(object) {
            return Err(illegal_state!("notify on an object not locked by the caller"));
        }

        let monitor = self.inflated(object, InflateCause::Notify)?;
        if all {
            monitor.notify_all()
        } else {
            monitor.notify()
        }
    }

    /// Returns `true` if the calling context holds the lock of `object`.
    ///
    /// Always `true` in single-threaded mode.
    pub fn holds_lock<W: LockWordStorage + ?Sized>(&self, object: &W) -> bool {
        if self.config.is_single_threaded() {
            return true;
        }
        match object.load().shape() {
            LockShape::Unlocked => false,
            LockShape::Thin { owner, .. } => owner == context::current_id(),
            LockShape::Inflated { monitor } => self
                .monitors
                .get(monitor)
                .is_some_and(ReentrantMonitor::is_held_by_current_context),
        }
    }

    /// Returns `true` if any context holds the lock of `object`.
    pub fn is_locked<W: LockWordStorage + ?Sized>(&self, object: &W) -> bool {
        match object.load().shape() {
            LockShape::Unlocked => false,
            LockShape::Thin { .. } => true,
            LockShape::Inflated { monitor } => self
                .monitors
                .get(monitor)
                .is_some_and(ReentrantMonitor::is_locked),
        }
    }

    /// Returns `true` if `object` has been inflated.
    pub fn is_inflated<W: LockWordStorage + ?Sized>(&self, object: &W) -> bool {
        object.load().is_inflated()
    }

    /// The context holding the lock of `object`, as last observed.
    pub fn owner<W: LockWordStorage + ?Sized>(&self, object: &W) -> Option<ContextId> {
        match object.load().shape() {
            LockShape::Unlocked => None,
            LockShape::Thin { owner, .. } => Some(owner),
            LockShape::Inflated { monitor } => {
                self.monitors.get(monitor).and_then(ReentrantMonitor::owner)
            }
        }
    }

    /// The inflated monitor of `object`, if there is one.
    pub fn monitor_of<W: LockWordStorage + ?Sized>(&self, object: &W) -> Option<&ReentrantMonitor> {
        match object.load().shape() {
            LockShape::Inflated { monitor } => self.monitors.get(monitor),
            _ => None,
        }
    }

    /// Returns the lock word for an object whose layout has none, creating it on first use.
    pub fn slot_for(&self, object_id: u64) -> Arc<LockWordSlot> {
        let entry = self
            .slots
            .entry(object_id)
            .or_insert_with(|| Arc::new(LockWordSlot::new()));
        Arc::clone(entry.value())
    }

    /// Forgets the lock word of `object_id` unless it is locked or a handle returned by
    /// [`MonitorSupport::slot_for`] is still alive.
    ///
    /// If the slot had been inflated, its monitor goes back to the spare pool and is
    /// reused by the next inflation. Returns `true` if a slot was removed.
    pub fn release_slot(&self, object_id: u64) -> bool {
        let removed = self.slots.remove_if(&object_id, |_, slot| {
            Arc::strong_count(slot) == 1 && !self.is_locked(slot.as_ref())
        });
        let Some((_, slot)) = removed else {
            return false;
        };

        if let LockShape::Inflated { monitor } = slot.load().shape() {
            if self.monitors.get(monitor).is_some() {
                log::debug!(
                    "monitor {} of released slot {} returned to spare pool",
                    monitor,
                    object_id
                );
                self.spare.push(monitor);
            }
        }
        true
    }

    /// Number of registered object slots.
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    fn monitor(&self, index: usize) -> Result<&ReentrantMonitor> {
        self.monitors.get(index).ok_or_else(|| {
            illegal_state!("lock word refers to monitor {} of another support", index)
        })
    }

    fn check_depth(&self, depth: u32) {
        if depth > self.config.max_recursion {
            panic!(
                "monitor recursion overflow: depth {} exceeds {}",
                depth, self.config.max_recursion
            );
        }
    }

    fn new_monitor(&self) -> ReentrantMonitor {
        let mut monitor = ReentrantMonitor::with_config(&self.config);
        monitor.set_hooks(self.hooks.clone());
        monitor
    }

    fn inflated<W: LockWordStorage + ?Sized>(
        &self,
        object: &W,
        cause: InflateCause,
    ) -> Result<&ReentrantMonitor> {
        match object.load().shape() {
            LockShape::Inflated { monitor } => self.monitor(monitor),
            _ => self.inflate(object, cause),
        }
    }

    /// Replaces the word of `object` with a freshly seeded monitor, or returns the monitor
    /// another context installed first.
    fn inflate<W: LockWordStorage + ?Sized>(
        &self,
        object: &W,
        cause: InflateCause,
    ) -> Result<&ReentrantMonitor> {
        let index = match self.spare.pop() {
            Some(index) => index,
            None => self.monitors.push(self.new_monitor()),
        };
        let candidate = &self.monitors[index];

        let backoff = Backoff::new();
        loop {
            let word = object.load();
            let (owner, depth) = match word.shape() {
                LockShape::Inflated { monitor } => {
                    self.spare.push(index);
                    return self.monitor(monitor);
                }
                LockShape::Unlocked => (None, 0),
                LockShape::Thin { owner, count } => (Some(owner), u32::from(count) + 1),
            };

            // SAFETY: `index` came from the spare pool or a fresh push and has not been
            // published in any lock word yet.
            unsafe { candidate.seed(owner, depth) };

            if object
                .compare_and_swap(word, LockWord::inflated(index))
                .is_ok()
            {
                log::debug!("inflated monitor {} ({}), owner {:?}", index, cause, owner);
                if let Some(hooks) = &self.hooks {
                    hooks.on_inflate(cause);
                }
                return Ok(candidate);
            }
            backoff.snooze();
        }
    }
}

impl Default for MonitorSupport {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MonitorSupport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonitorSupport")
            .field("config", &self.config)
            .field("monitors", &self.monitors.count())
            .field("spare", &self.spare.len())
            .field("slots", &self.slots.len())
            .finish()
    }
}

/// Exits an object monitor when dropped.
#[must_use = "the object is unlocked as soon as the guard is dropped"]
pub struct ObjectGuard<'a, W: LockWordStorage + ?Sized> {
    support: &'a MonitorSupport,
    object: &'a W,
    _not_send: PhantomData<*const ()>,
}

impl<W: LockWordStorage + ?Sized> Drop for ObjectGuard<'_, W> {
    fn drop(&mut self) {
        if let Err(e) = self.support.exit(self.object) {
            log::error!("failed to exit object monitor: {}", e);
        }
    }
}
