//! Optional telemetry callbacks.
//!
//! Monitors report contention, waits and inflation through the [`MonitorHooks`] trait.
//! All methods have empty default implementations, so an implementor only overrides the
//! events it cares about. Hooks are invoked on the context that experiences the event,
//! outside of any internal critical section, and must not call back into the monitor
//! that reported them.
//!
//! [`CountingHooks`] is a ready-made implementation that counts events with relaxed
//! atomics, useful for diagnostics and tests.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use strum::{Display, EnumIter};

use crate::context::ContextId;

/// Reason a thin lock word was replaced by an inflated monitor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumIter)]
pub enum InflateCause {
    /// Another context tried to enter while the thin lock was held.
    Contention,
    /// The thin lock recursion counter ran out of bits.
    RecursionOverflow,
    /// `wait` requires a condition queue.
    Wait,
    /// `notify` / `notify_all` require a condition queue.
    Notify,
    /// The configuration disables thin locks.
    ConfigForced,
}

/// Telemetry callbacks for monitor events.
pub trait MonitorHooks: Send + Sync {
    /// A lock word was inflated.
    fn on_inflate(&self, _cause: InflateCause) {}

    /// The calling context is about to block because the monitor is owned by someone else.
    fn on_contended_enter(&self) {}

    /// The calling context acquired a monitor it had to queue for.
    ///
    /// `previous_owner` is the context that held the monitor most recently before.
    fn on_contended_entered(&self, _previous_owner: Option<ContextId>) {}

    /// The calling context starts waiting on a monitor condition.
    fn on_wait_begin(&self, _timeout: Option<Duration>) {}

    /// The calling context finished waiting and holds the monitor again.
    ///
    /// `notifier` is the context whose signal ended the wait, if any.
    fn on_wait_end(&self, _notifier: Option<ContextId>, _timed_out: bool) {}
}

/// Hooks that count every event.
#[derive(Debug, Default)]
pub struct CountingHooks {
    inflations: AtomicU64,
    contended_enters: AtomicU64,
    contended_entered: AtomicU64,
    waits: AtomicU64,
    timed_out_waits: AtomicU64,
    notified_waits: AtomicU64,
}

impl CountingHooks {
    /// Creates a zeroed counter set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of inflations observed.
    pub fn inflations(&self) -> u64 {
        self.inflations.load(Ordering::Relaxed)
    }

    /// Number of contended enter attempts.
    pub fn contended_enters(&self) -> u64 {
        self.contended_enters.load(Ordering::Relaxed)
    }

    /// Number of contended enters that completed.
    pub fn contended_entered(&self) -> u64 {
        self.contended_entered.load(Ordering::Relaxed)
    }

    /// Number of waits started.
    pub fn waits(&self) -> u64 {
        self.waits.load(Ordering::Relaxed)
    }

    /// Number of waits that ended by timeout.
    pub fn timed_out_waits(&self) -> u64 {
        self.timed_out_waits.load(Ordering::Relaxed)
    }

    /// Number of waits that ended because of a signal.
    pub fn notified_waits(&self) -> u64 {
        self.notified_waits.load(Ordering::Relaxed)
    }
}

impl MonitorHooks for CountingHooks {
    fn on_inflate(&self, _cause: InflateCause) {
        self.inflations.fetch_add(1, Ordering::Relaxed);
    }

    fn on_contended_enter(&self) {
        self.contended_enters.fetch_add(1, Ordering::Relaxed);
    }

    fn on_contended_entered(&self, _previous_owner: Option<ContextId>) {
        self.contended_entered.fetch_add(1, Ordering::Relaxed);
    }

    fn on_wait_begin(&self, _timeout: Option<Duration>) {
        self.waits.fetch_add(1, Ordering::Relaxed);
    }

    fn on_wait_end(&self, notifier: Option<ContextId>, timed_out: bool) {
        if timed_out {
            self.timed_out_waits.fetch_add(1, Ordering::Relaxed);
        }
        if notifier.is_some() {
            self.notified_waits.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_inflate_cause_display() {
        let names: Vec<String> = InflateCause::iter().map(|c| c.to_string()).collect();
        assert_eq!(
            names,
            [
                "Contention",
                "RecursionOverflow",
                "Wait",
                "Notify",
                "ConfigForced"
            ]
        );
    }

    #[test]
    fn test_counting_hooks() {
        let hooks = CountingHooks::new();
        hooks.on_inflate(InflateCause::Wait);
        hooks.on_contended_enter();
        hooks.on_contended_entered(None);
        hooks.on_wait_begin(Some(Duration::from_millis(1)));
        hooks.on_wait_end(None, true);

        assert_eq!(hooks.inflations(), 1);
        assert_eq!(hooks.contended_enters(), 1);
        assert_eq!(hooks.contended_entered(), 1);
        assert_eq!(hooks.waits(), 1);
        assert_eq!(hooks.timed_out_waits(), 1);
        assert_eq!(hooks.notified_waits(), 0);
    }
}
