//! Wait queue building blocks.
//!
//! # Key Components
//!
//! - `Node` / [`NodeRef`] - Per-waiter record and the generation-tagged handle linking it
//! - [`NodeArena`] - Append-only node storage with epoch-deferred recycling
//! - [`SyncQueue`] - The lock-free CLH-style queue of contexts waiting for a lock
//!
//! Nothing in this module blocks; parking decisions are made by
//! [`crate::synchronizer::QueuedSynchronizer`].

mod arena;
mod node;
mod sync_queue;

pub use arena::NodeArena;
pub use node::{NodeKind, NodeRef, NodeStatus};
pub use sync_queue::SyncQueue;
