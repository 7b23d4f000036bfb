//! Execution context identity and the park/unpark primitive.
//!
//! Every thread that touches a monitor is registered as an execution context the first
//! time it asks for its identity. A context has:
//!
//! - a small, stable [`ContextId`] used as the owner value of lock words and monitors
//! - a parking token (a [`crossbeam_utils::sync::Parker`]) that blocked waiters sleep on
//! - an interrupt flag that wakes a parked context and is observed by interruptible waits
//!
//! Contexts are tracked in a process wide registry so that a waiter handle stored in a
//! queue node (a plain integer) can be turned back into something that can be unparked.
//! The registry entry is removed when the owning thread exits.
//!
//! # Example
//!
//! ```rust
//! use objmonitor::context;
//!
//! let me = context::current();
//! assert_eq!(me.id(), context::current_id());
//!
//! me.interrupt();
//! assert!(context::interrupted());
//! assert!(!context::interrupted());
//! ```

use std::{
    fmt,
    num::NonZeroU64,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, LazyLock,
    },
    time::Instant,
};

use crossbeam_utils::sync::{Parker, Unparker};
use dashmap::DashMap;

/// Largest context identifier that fits into the owner field of a thin lock word.
pub const MAX_CONTEXT_ID: u64 = (1 << 55) - 1;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

static REGISTRY: LazyLock<DashMap<ContextId, ContextHandle>> = LazyLock::new(DashMap::new);

thread_local! {
    static CURRENT: LocalContext = LocalContext::register();
}

/// Identity of an execution context.
///
/// Identifiers are never zero (zero encodes "no owner" in lock words and queue nodes),
/// are unique for the lifetime of the process and never exceed [`MAX_CONTEXT_ID`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(NonZeroU64);

impl ContextId {
    /// Creates a context id from its raw value.
    ///
    /// Returns `None` for `0` or for values above [`MAX_CONTEXT_ID`].
    #[must_use]
    pub fn new(raw: u64) -> Option<Self> {
        if raw > MAX_CONTEXT_ID {
            return None;
        }
        NonZeroU64::new(raw).map(ContextId)
    }

    /// Returns the raw integer value of this id.
    #[must_use]
    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}

struct ContextShared {
    id: ContextId,
    unparker: Unparker,
    interrupted: AtomicBool,
}

/// A shareable handle to an execution context.
///
/// Handles can be sent to other threads to interrupt or unpark the context they refer
/// to. They stay valid after the context's thread exits, but operations on them have no
/// effect anymore.
#[derive(Clone)]
pub struct ContextHandle(Arc<ContextShared>);

impl ContextHandle {
    /// Returns the identity of the referenced context.
    #[must_use]
    pub fn id(&self) -> ContextId {
        self.0.id
    }

    /// Interrupts the context.
    ///
    /// Sets the interrupt flag and wakes the context if it is parked. A context blocked
    /// in an interruptible acquisition or in a condition wait observes the flag and
    /// returns [`crate::Error::Interrupted`]; uninterruptible waits keep waiting and
    /// leave the flag set for the caller to inspect.
    pub fn interrupt(&self) {
        self.0.interrupted.store(true, Ordering::SeqCst);
        self.0.unparker.unpark();
    }

    /// Returns whether the interrupt flag is set, without clearing it.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.0.interrupted.load(Ordering::SeqCst)
    }

    /// Makes the parking token of this context available, waking it if parked.
    pub fn unpark(&self) {
        self.0.unparker.unpark();
    }
}

impl fmt::Debug for ContextHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextHandle")
            .field("id", &self.0.id)
            .field("interrupted", &self.is_interrupted())
            .finish()
    }
}

struct LocalContext {
    parker: Parker,
    handle: ContextHandle,
}

impl LocalContext {
    fn register() -> Self {
        let raw = NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed);
        let id = ContextId::new(raw).expect("execution context id space exhausted");

        let parker = Parker::new();
        let handle = ContextHandle(Arc::new(ContextShared {
            id,
            unparker: parker.unparker().clone(),
            interrupted: AtomicBool::new(false),
        }));
        REGISTRY.insert(id, handle.clone());
        log::trace!("registered execution context {}", id);

        LocalContext { parker, handle }
    }
}

impl Drop for LocalContext {
    fn drop(&mut self) {
        REGISTRY.remove(&self.handle.id());
    }
}

/// Returns a handle to the calling context, registering it on first use.
#[must_use]
pub fn current() -> ContextHandle {
    CURRENT.with(|local| local.handle.clone())
}

/// Returns the identity of the calling context.
#[must_use]
pub fn current_id() -> ContextId {
    CURRENT.with(|local| local.handle.id())
}

/// Tests and clears the interrupt flag of the calling context.
pub fn interrupted() -> bool {
    CURRENT.with(|local| local.handle.0.interrupted.swap(false, Ordering::SeqCst))
}

/// Sets the interrupt flag of the calling context without waking anyone.
///
/// Used by uninterruptible waits to hand an interrupt they observed back to the caller.
pub(crate) fn reassert_interrupt() {
    CURRENT.with(|local| local.handle.0.interrupted.store(true, Ordering::SeqCst));
}

/// Looks up a live context by id.
#[must_use]
pub fn lookup(id: ContextId) -> Option<ContextHandle> {
    REGISTRY.get(&id).map(|entry| entry.value().clone())
}

/// Wakes the context with the given id if it is still alive.
pub fn unpark(id: ContextId) {
    if let Some(entry) = REGISTRY.get(&id) {
        entry.value().unpark();
    }
}

/// Blocks the calling context until it is unparked or interrupted.
///
/// May return spuriously; callers re-check their wake condition.
pub(crate) fn park() {
    CURRENT.with(|local| {
        if !local.handle.is_interrupted() {
            local.parker.park();
        }
    });
}

/// Blocks the calling context until it is unparked, interrupted, or `deadline` passes.
pub(crate) fn park_until(deadline: Instant) {
    CURRENT.with(|local| {
        if !local.handle.is_interrupted() {
            local.parker.park_deadline(deadline);
        }
    });
}
