// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
//#![deny(unsafe_code)]
// - 'monitor/reentrant.rs' keeps the hold count in an UnsafeCell touched only by the owner

//! # objmonitor
//!
//! Object monitors for managed runtimes: reentrant locks with wait/notify, built on a
//! lock-free queued synchronizer, plus a thin-lock fast path that keeps uncontended
//! locking inside a single 64-bit word per object.
//!
//! ## Features
//!
//! - **Lock-free wait queue** - CLH-style queue with cancellation, timeouts and interrupts
//! - **Pluggable acquisition** - [`synchronizer::QueuedSynchronizer`] delegates the
//!   "may I take it" decision to an [`synchronizer::AcquireStrategy`]
//! - **Conditions** - wait/notify by transferring waiters into the lock queue
//! - **Thin locks** - owner and recursion count live in the object's lock word until
//!   contention, deep recursion or a wait forces inflation to a full monitor
//! - **Observable** - [`MonitorHooks`] report inflation, contention and waits
//!
//! ## Quick Start
//!
//! ```rust
//! use objmonitor::prelude::*;
//! use std::sync::atomic::AtomicU64;
//!
//! let support = MonitorSupport::new();
//! let object = AtomicU64::new(0);
//!
//! support.enter(&object)?;
//! support.enter(&object)?;
//! assert!(support.holds_lock(&object));
//! support.exit(&object)?;
//! support.exit(&object)?;
//! assert!(!support.is_locked(&object));
//! # Ok::<(), objmonitor::Error>(())
//! ```
//!
//! ### Using a Monitor Directly
//!
//! ```rust
//! use objmonitor::ReentrantMonitor;
//! use std::time::Duration;
//!
//! let monitor = ReentrantMonitor::new();
//! {
//!     let _guard = monitor.lock_guard()?;
//!     assert_eq!(monitor.acquisitions(), Some(1));
//!
//!     // Nobody notifies, so this times out and reacquires the lock.
//!     let outcome = monitor.wait(Some(Duration::from_millis(10)))?;
//!     assert!(!outcome.signalled);
//! }
//! assert!(!monitor.is_locked());
//! # Ok::<(), objmonitor::Error>(())
//! ```
//!
//! ## Architecture
//!
//! - [`context`] - execution context identity, parking and interrupts
//! - [`synchronizer`] - the queued acquire/release engine and condition queues
//! - [`monitor`] - reentrant monitors, lock words and the thin/inflated state machine
//! - [`config`] - threading mode and tuning knobs
//! - [`hooks`] - observation points for inflation, contention and waits
//! - [`Error`] and [`Result`] - error handling
//!
//! ## Error Handling
//!
//! Misuse (unlocking or waiting without ownership) is reported as
//! [`Error::IllegalState`], and cancelled blocking operations as [`Error::Interrupted`].
//! Broken internal invariants panic instead.

#[macro_use]
pub(crate) mod error;

pub(crate) mod queue;

/// Convenient re-exports of the most commonly used types.
pub mod prelude;

pub mod config;
pub mod context;
pub mod hooks;
pub mod monitor;
pub mod synchronizer;

/// `objmonitor` Result type
///
/// A type alias for `std::result::Result<T, Error>` where the error type is always [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// `objmonitor` Error type
///
/// The main error type for all operations in this crate.
pub use error::Error;

/// Monitor configuration.
pub use config::{MonitorConfig, ThreadingMode};

/// Execution context identity.
pub use context::{ContextHandle, ContextId};

/// Observation hooks.
pub use hooks::{CountingHooks, InflateCause, MonitorHooks};

/// Monitors and lock words.
pub use monitor::{
    LockShape, LockWord, LockWordSlot, LockWordStorage, MonitorGuard, MonitorSupport,
    ObjectGuard, ReentrantMonitor,
};

/// Conditions.
pub use synchronizer::{Condition, WaitOutcome};
