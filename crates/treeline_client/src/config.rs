//! Client configuration.

use std::time::Duration;

/// Configuration for a [`crate::Client`] and the connections it creates.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Extra bytes allocated beyond a value's length when the value scratch buffer grows.
    pub value_overalloc: u32,

    /// Extra bytes reserved on the final subscript of a mutable node.
    pub subscript_prealloc: u32,

    /// How long a normal shutdown waits for engine rundown.
    pub normal_exit_wait: Duration,

    /// How long a signal-driven shutdown waits for engine rundown.
    pub signal_exit_wait: Duration,

    /// Capacity of the return buffer for call-in routines.
    pub call_in_return_capacity: u32,

    /// Capacity retries a single call may take before it is a protocol violation.
    pub max_retries: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            value_overalloc: 1024,
            subscript_prealloc: 40,
            normal_exit_wait: Duration::from_secs(60),
            signal_exit_wait: Duration::from_secs(3),
            call_in_return_capacity: 32 * 1024, // 32 KiB
            max_retries: 64,
        }
    }
}

impl ClientConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the value scratch over-allocation.
    #[must_use]
    pub const fn value_overalloc(mut self, bytes: u32) -> Self {
        self.value_overalloc = bytes;
        self
    }

    /// Sets the mutable-node subscript reserve.
    #[must_use]
    pub const fn subscript_prealloc(mut self, bytes: u32) -> Self {
        self.subscript_prealloc = bytes;
        self
    }

    /// Sets the normal shutdown wait.
    #[must_use]
    pub const fn normal_exit_wait(mut self, wait: Duration) -> Self {
        self.normal_exit_wait = wait;
        self
    }

    /// Sets the signal-driven shutdown wait.
    #[must_use]
    pub const fn signal_exit_wait(mut self, wait: Duration) -> Self {
        self.signal_exit_wait = wait;
        self
    }

    /// Sets the call-in return buffer capacity.
    #[must_use]
    pub const fn call_in_return_capacity(mut self, bytes: u32) -> Self {
        self.call_in_return_capacity = bytes;
        self
    }

    /// Sets the capacity retry bound.
    #[must_use]
    pub const fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }
}
