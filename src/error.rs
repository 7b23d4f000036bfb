use thiserror::Error;

macro_rules! illegal_state {
    // Single string version
    ($msg:expr) => {
        crate::Error::IllegalState {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::IllegalState {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// Monitor operations only fail for reasons a caller can act on: the lock was used by a
/// context that does not own it, or a blocking operation was interrupted. Conditions that
/// indicate a broken invariant inside the monitor itself (a corrupted wait queue, an
/// exhausted reentrancy counter) are never reported through this type - they panic, since
/// continuing would corrupt every later lock operation.
///
/// # Error Categories
///
/// ## Usage Errors
/// - [`Error::IllegalState`] - `unlock`, `await` or `signal` without holding the lock
///
/// ## Blocking Errors
/// - [`Error::Interrupted`] - A parked context was interrupted while waiting
///
/// ## Strategy Errors
/// - [`Error::Error`] - A custom [`crate::synchronizer::AcquireStrategy`] reported a fault
///
/// # Examples
///
/// ```rust
/// use objmonitor::{Error, ReentrantMonitor};
///
/// let monitor = ReentrantMonitor::new();
/// match monitor.unlock() {
///     Ok(()) => println!("released"),
///     Err(Error::IllegalState { message, file, line }) => {
///         eprintln!("illegal monitor state: {} ({}:{})", message, file, line);
///     }
///     Err(e) => eprintln!("other error: {}", e),
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// The calling context is not allowed to perform this operation in the current
    /// lock state.
    ///
    /// Raised by `unlock` from a context that does not own the monitor, and by
    /// condition operations (`await`, `signal`, `signal_all`) issued without holding
    /// the monitor. The error records the source location where the violation was
    /// detected.
    ///
    /// # Fields
    ///
    /// * `message` - Description of the violated precondition
    /// * `file` - Source file where the error was detected
    /// * `line` - Source line where the error was detected
    #[error("Illegal monitor state - {file}:{line}: {message}")]
    IllegalState {
        /// The message to be printed for the IllegalState error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// A waiting context was interrupted.
    ///
    /// Returned by interruptible acquisition and by condition waits when
    /// [`crate::context::ContextHandle::interrupt`] was called on the waiting context
    /// before it was granted the lock or signalled. The interrupt flag of the context
    /// is consumed when this error is produced.
    #[error("Interrupted while waiting")]
    Interrupted,

    /// Generic error for miscellaneous failures.
    ///
    /// Used by custom acquisition strategies to report faults from
    /// `try_acquire` / `try_release`. The synchronizer cancels the waiting node
    /// before propagating it.
    #[error("{0}")]
    Error(String),
}

impl Error {
    /// Returns `true` if this error is an [`Error::IllegalState`].
    #[must_use]
    pub fn is_illegal_state(&self) -> bool {
        matches!(self, Error::IllegalState { .. })
    }

    /// Returns `true` if this error is an [`Error::Interrupted`].
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Error::Interrupted)
    }
}
