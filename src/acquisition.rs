//! Background acquisition loop.
//!
//! Each iteration dequeues one buffer, hands a [`FrameView`] over it to
//! the consumer callback, and returns the buffer to the driver. Any
//! driver failure or incomplete frame ends the loop; only a dequeue
//! timeout is retried.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{error, info, trace, warn};

use crate::status::describe_last_error;
use crate::traits::{
    CaptureDriver, DeviceHandle, DriverResult, FrameBuffer, FrameStatus, FrameView, Status,
};
use crate::validation::validate_frame;

/// Consumer of delivered frames.
///
/// Called on the acquisition thread, once per frame, in dequeue order.
/// The returned flag is reserved and currently ignored.
pub type FrameCallback = Box<dyn FnMut(&FrameView<'_>) -> bool + Send + 'static>;

/// Outcome of one bounded dequeue.
enum Dequeued<B> {
    Timeout,
    Failed(Status),
    Frame(B),
}

impl<B> From<DriverResult<B>> for Dequeued<B> {
    fn from(result: DriverResult<B>) -> Self {
        match result {
            Ok(buffer) => Self::Frame(buffer),
            Err(status) if status.is_timeout() => Self::Timeout,
            Err(status) => Self::Failed(status),
        }
    }
}

/// Why the acquisition loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopExit {
    /// The stop flag was observed.
    Stopped,
    /// Dequeue failed with something other than a timeout.
    DequeueFailed {
        /// Driver status.
        status: Status,
        /// Driver's last-error description.
        detail: String,
    },
    /// A dequeued frame carried a non-success status.
    BadFrame(FrameStatus),
    /// Returning a buffer to the driver failed.
    RequeueFailed {
        /// Driver status.
        status: Status,
        /// Driver's last-error description.
        detail: String,
    },
}

impl LoopExit {
    /// Whether the loop ended on a device failure rather than `stop()`.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !matches!(self, Self::Stopped)
    }
}

impl fmt::Display for LoopExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => f.write_str("stopped"),
            Self::DequeueFailed { status, detail } => {
                write!(f, "Can't get frame: {status}: {detail}")
            }
            Self::BadFrame(status) => write!(f, "Can't get frame: frame status {}", status.0),
            Self::RequeueFailed { status, detail } => {
                write!(f, "Can't free frame: {status}: {detail}")
            }
        }
    }
}

enum Step {
    Continue,
    Exit(LoopExit),
}

/// Acquisition loop state for one streaming period.
pub struct AcquisitionLoop<'a, D: CaptureDriver> {
    driver: &'a D,
    handle: DeviceHandle,
    stop: &'a AtomicBool,
    timeout: Duration,
    payload_size: i64,
    delivered: u64,
    payload_checked: bool,
}

impl<'a, D: CaptureDriver> AcquisitionLoop<'a, D> {
    /// Create a loop over an open, streaming device.
    ///
    /// `timeout` bounds each dequeue and therefore how long `stop` may go
    /// unnoticed.
    pub const fn new(
        driver: &'a D,
        handle: DeviceHandle,
        stop: &'a AtomicBool,
        timeout: Duration,
        payload_size: i64,
    ) -> Self {
        Self {
            driver,
            handle,
            stop,
            timeout,
            payload_size,
            delivered: 0,
            payload_checked: false,
        }
    }

    /// Number of frames handed to the callback so far.
    pub const fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Run until `stop` is set or the device fails.
    pub fn run<F>(&mut self, callback: &mut F) -> LoopExit
    where
        F: FnMut(&FrameView<'_>) -> bool + ?Sized,
    {
        info!(
            handle = self.handle.0,
            timeout_ms = self.timeout.as_millis(),
            "acquisition loop started"
        );

        let exit = loop {
            if self.stop.load(Ordering::Acquire) {
                break LoopExit::Stopped;
            }
            if let Step::Exit(exit) = self.step(callback) {
                break exit;
            }
        };

        if exit.is_fatal() {
            error!(delivered = self.delivered, "{exit}");
        } else {
            info!(delivered = self.delivered, "acquisition loop stopped");
        }
        exit
    }

    fn step<F>(&mut self, callback: &mut F) -> Step
    where
        F: FnMut(&FrameView<'_>) -> bool + ?Sized,
    {
        let buffer = match Dequeued::from(self.driver.dequeue_buffer(self.handle, self.timeout)) {
            Dequeued::Timeout => {
                trace!("dequeue timed out");
                return Step::Continue;
            }
            Dequeued::Failed(status) => {
                return Step::Exit(LoopExit::DequeueFailed {
                    status,
                    detail: describe_last_error(self.driver),
                });
            }
            Dequeued::Frame(buffer) => buffer,
        };

        let frame_status = buffer.status();
        if !frame_status.is_success() {
            return Step::Exit(LoopExit::BadFrame(frame_status));
        }

        {
            let view = FrameView::from_buffer(&buffer);
            self.check_payload(&view);
            let _reserved: bool = callback(&view);
        }
        self.delivered += 1;

        match self.driver.queue_buffer(self.handle, buffer) {
            Ok(()) => Step::Continue,
            Err(status) => Step::Exit(LoopExit::RequeueFailed {
                status,
                detail: describe_last_error(self.driver),
            }),
        }
    }

    /// Report the first frame that disagrees with the device payload size.
    fn check_payload(&mut self, view: &FrameView<'_>) {
        if self.payload_checked {
            return;
        }
        self.payload_checked = true;
        if let Err(err) = validate_frame(view, self.payload_size) {
            warn!(
                width = view.width(),
                height = view.height(),
                payload_size = self.payload_size,
                "{err}"
            );
        }
    }
}
