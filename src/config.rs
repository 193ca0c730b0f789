//! Session configuration.

use std::time::Duration;

/// Tunables applied when a [`DeviceSession`](crate::DeviceSession) is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Bounded wait for the device list refresh.
    pub enumeration_timeout: Duration,
    /// Bounded wait for each dequeue. This is also the worst-case delay
    /// before the acquisition loop observes `stop()`. Backends saturate
    /// values they cannot represent.
    pub dequeue_timeout: Duration,
    /// Number of driver-side acquisition buffers.
    pub buffer_count: u64,
    /// Streaming transfer block size in bytes, applied if the device has it.
    pub stream_transfer_size: i64,
    /// In-flight USB request blocks, applied if the device has it.
    pub stream_transfer_urb_count: i64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            enumeration_timeout: Duration::from_millis(1000),
            dequeue_timeout: Duration::from_millis(1000),
            buffer_count: 1,
            stream_transfer_size: 64 * 1024,
            stream_transfer_urb_count: 64,
        }
    }
}

impl SessionConfig {
    /// Set the device list refresh timeout.
    #[must_use]
    pub const fn with_enumeration_timeout(mut self, timeout: Duration) -> Self {
        self.enumeration_timeout = timeout;
        self
    }

    /// Set the per-dequeue timeout.
    #[must_use]
    pub const fn with_dequeue_timeout(mut self, timeout: Duration) -> Self {
        self.dequeue_timeout = timeout;
        self
    }

    /// Set the acquisition buffer count.
    #[must_use]
    pub const fn with_buffer_count(mut self, count: u64) -> Self {
        self.buffer_count = count;
        self
    }

    /// Set the streaming transfer block size.
    #[must_use]
    pub const fn with_stream_transfer_size(mut self, bytes: i64) -> Self {
        self.stream_transfer_size = bytes;
        self
    }

    /// Set the number of in-flight USB request blocks.
    #[must_use]
    pub const fn with_stream_transfer_urb_count(mut self, count: i64) -> Self {
        self.stream_transfer_urb_count = count;
        self
    }
}
