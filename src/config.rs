//! Monitor configuration types.
//!
//! # Overview
//!
//! - [`MonitorConfig`] - Top-level configuration for a [`crate::MonitorSupport`] and the
//!   monitors it inflates
//! - [`ThreadingMode`] - Whether locking is real or a no-op for single-threaded runtimes
//!
//! # Configuration Presets
//!
//! - [`MonitorConfig::default()`] - Thin locks enabled, full multi-threaded locking
//! - [`MonitorConfig::single_threaded()`] - All locking becomes a no-op
//! - [`MonitorConfig::always_inflated()`] - Skip the thin-lock fast path entirely
//!
//! # Example
//!
//! ```rust
//! use objmonitor::MonitorConfig;
//!
//! let config = MonitorConfig::default()
//!     .with_max_spins(63)
//!     .with_max_recursion(10_000);
//! assert!(config.thin_locks);
//! ```

/// Threading mode of the runtime hosting the monitors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, strum::Display)]
pub enum ThreadingMode {
    /// Several execution contexts may run in parallel. Monitors provide real mutual
    /// exclusion.
    #[default]
    MultiThreaded,

    /// Exactly one execution context exists. Entering and exiting monitors is a no-op,
    /// notifications have nobody to wake, and a timed wait simply sleeps.
    SingleThreaded,
}

/// Configuration shared by a [`crate::MonitorSupport`] and every monitor it inflates.
///
/// # Default Values
///
/// | Setting | Default Value |
/// |---------|---------------|
/// | `threading` | `MultiThreaded` |
/// | `thin_locks` | `true` |
/// | `max_spins` | 255 |
/// | `max_recursion` | `u32::MAX` |
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MonitorConfig {
    /// Threading mode of the host runtime.
    pub threading: ThreadingMode,

    /// Whether uncontended locking uses the inline thin lock word.
    ///
    /// When disabled every first `enter` inflates the monitor. Behavior observable by
    /// callers is identical in both modes.
    pub thin_locks: bool,

    /// Upper bound for the number of spin iterations a first-in-line waiter performs
    /// after being woken before it parks again.
    ///
    /// The actual spin count grows as `1, 3, 7, 15, ...` with every park and is capped by
    /// this value. Zero disables spinning.
    pub max_spins: u8,

    /// Maximum reentrancy depth of an inflated monitor.
    ///
    /// Exceeding it is a fatal error: the acquiring call panics and leaves the monitor
    /// untouched.
    pub max_recursion: u32,
}

impl MonitorConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Preset for runtimes that only ever run one execution context.
    #[must_use]
    pub fn single_threaded() -> Self {
        Self {
            threading: ThreadingMode::SingleThreaded,
            ..Self::default()
        }
    }

    /// Preset that inflates every monitor on first use.
    #[must_use]
    pub fn always_inflated() -> Self {
        Self {
            thin_locks: false,
            ..Self::default()
        }
    }

    /// Sets the threading mode.
    #[must_use]
    pub fn with_threading(mut self, threading: ThreadingMode) -> Self {
        self.threading = threading;
        self
    }

    /// Enables or disables the thin lock fast path.
    #[must_use]
    pub fn with_thin_locks(mut self, enabled: bool) -> Self {
        self.thin_locks = enabled;
        self
    }

    /// Sets the first-in-line spin cap.
    #[must_use]
    pub fn with_max_spins(mut self, spins: u8) -> Self {
        self.max_spins = spins;
        self
    }

    /// Sets the maximum reentrancy depth.
    ///
    /// # Panics
    ///
    /// Panics if `depth` is 0, since such a monitor could never be acquired.
    #[must_use]
    pub fn with_max_recursion(mut self, depth: u32) -> Self {
        assert!(depth > 0, "max_recursion must be greater than 0");
        self.max_recursion = depth;
        self
    }

    /// Returns `true` if locking is a no-op under this configuration.
    #[must_use]
    pub fn is_single_threaded(&self) -> bool {
        self.threading == ThreadingMode::SingleThreaded
    }
}

impl Default for MonitorConfig {
    /// Creates the default monitor configuration.
    ///
    /// See the struct documentation for default values.
    fn default() -> Self {
        Self {
            threading: ThreadingMode::MultiThreaded,
            thin_locks: true,
            max_spins: u8::MAX,
            max_recursion: u32::MAX,
        }
    }
}
