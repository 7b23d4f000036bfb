//! # objmonitor Prelude
//!
//! This module provides a convenient prelude for the most commonly used types and traits
//! from the objmonitor library. Import this module to get quick access to everything
//! needed to lock objects and wait on them.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all objmonitor operations
pub use crate::Error;

/// The result type used throughout objmonitor
pub use crate::Result;

/// Threading mode and tuning knobs
pub use crate::config::{MonitorConfig, ThreadingMode};

// ================================================================================================
// Object Locking
// ================================================================================================

/// Drives objects through their lock words
pub use crate::monitor::{MonitorSupport, ObjectGuard};

/// Lock word representation and storage
pub use crate::monitor::{LockShape, LockWord, LockWordSlot, LockWordStorage};

// ================================================================================================
// Monitors and Conditions
// ================================================================================================

/// Full reentrant monitor
pub use crate::monitor::{MonitorGuard, ReentrantMonitor};

/// Condition waiting
pub use crate::synchronizer::{Condition, WaitOutcome};

// ================================================================================================
// Execution Contexts and Observation
// ================================================================================================

/// Context identity and interrupts
pub use crate::context::{ContextHandle, ContextId};

/// Observation hooks
pub use crate::hooks::{CountingHooks, InflateCause, MonitorHooks};
