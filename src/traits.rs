//! Core traits and types for the capture driver boundary.

use std::fmt;
use std::time::Duration;

/// Non-success status code reported by the capture driver.
///
/// Success is never represented here: driver calls return `Ok(_)` on
/// success and `Err(Status)` otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// Unspecified driver failure.
    Error,
    /// No device matched the request.
    NotFoundDevice,
    /// The device went offline.
    Offline,
    /// A parameter passed to the driver was invalid.
    InvalidParameter,
    /// The device handle is unknown or already closed.
    InvalidHandle,
    /// The call is not valid in the current driver state.
    InvalidCall,
    /// The feature is not accessible (read-only, write-only, locked).
    InvalidAccess,
    /// The caller-supplied buffer is too small.
    NeedMoreBuffer,
    /// A value is outside the feature's range.
    OutOfRange,
    /// The feature or operation is not implemented by the device.
    NotImplemented,
    /// The driver library has not been initialized.
    NotInitApi,
    /// A bounded wait expired.
    Timeout,
}

impl Status {
    /// Numeric driver code for this status.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Error => -1,
            Self::NotFoundDevice => -3,
            Self::Offline => -4,
            Self::InvalidParameter => -5,
            Self::InvalidHandle => -6,
            Self::InvalidCall => -7,
            Self::InvalidAccess => -8,
            Self::NeedMoreBuffer => -9,
            Self::OutOfRange => -11,
            Self::NotImplemented => -12,
            Self::NotInitApi => -13,
            Self::Timeout => -14,
        }
    }

    /// Whether this status is the bounded-wait timeout.
    #[must_use]
    pub const fn is_timeout(self) -> bool {
        matches!(self, Self::Timeout)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?} ({})", self.code())
    }
}

/// Result of a single driver call.
pub type DriverResult<T> = std::result::Result<T, Status>;

/// Named identifier of a configurable or queryable device attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeatureId {
    /// Byte size of one full frame.
    PayloadSize,
    /// Frame width in pixels.
    Width,
    /// Frame height in pixels.
    Height,
    /// Acquisition mode (see [`AcquisitionMode`]).
    AcquisitionMode,
    /// Trigger mode (see [`TriggerMode`]).
    TriggerMode,
    /// Streaming transfer block size in bytes.
    StreamTransferSize,
    /// Number of in-flight USB request blocks.
    StreamTransferNumberUrb,
    /// Vendor name string.
    VendorName,
    /// Model name string.
    ModelName,
    /// Serial number string.
    SerialNumber,
    /// Device version string.
    DeviceVersion,
}

/// Values of [`FeatureId::AcquisitionMode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum AcquisitionMode {
    /// One frame per start command.
    SingleFrame = 0,
    /// A fixed number of frames per start command.
    MultiFrame = 1,
    /// Free-running acquisition.
    Continuous = 2,
}

/// Values of [`FeatureId::TriggerMode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum TriggerMode {
    /// Frames are produced without trigger signals.
    Off = 0,
    /// Frames wait for a trigger signal.
    On = 1,
}

impl From<AcquisitionMode> for i64 {
    fn from(mode: AcquisitionMode) -> Self {
        mode as Self
    }
}

impl From<TriggerMode> for i64 {
    fn from(mode: TriggerMode) -> Self {
        mode as Self
    }
}

/// Opaque handle to an open device, issued by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle(pub u64);

/// Raw per-frame status code embedded in a dequeued buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameStatus(pub i32);

impl FrameStatus {
    /// Frame is complete.
    pub const SUCCESS: Self = Self(0);
    /// Frame data is incomplete (lost packets).
    pub const INCOMPLETE: Self = Self(-1);
    /// Frame header is inconsistent with its data.
    pub const INVALID_IMAGE_INFO: Self = Self(-2);

    /// Whether the frame can be delivered.
    #[must_use]
    pub const fn is_success(self) -> bool {
        self.0 == Self::SUCCESS.0
    }
}

/// A driver-owned frame buffer between dequeue and return-to-pool.
pub trait FrameBuffer: Send {
    /// Frame width in pixels.
    fn width(&self) -> u32;
    /// Frame height in pixels.
    fn height(&self) -> u32;
    /// Per-frame status reported by the driver.
    fn status(&self) -> FrameStatus;
    /// Raw pixel data.
    fn data(&self) -> &[u8];
}

/// Read-only single-channel 8-bit image over borrowed pixel memory.
///
/// The view borrows the dequeued buffer, so it cannot outlive the
/// callback invocation that receives it.
#[derive(Debug, Clone, Copy)]
pub struct FrameView<'a> {
    width: u32,
    height: u32,
    data: &'a [u8],
}

impl<'a> FrameView<'a> {
    /// Create a view over `data` with the given dimensions.
    #[must_use]
    pub const fn new(width: u32, height: u32, data: &'a [u8]) -> Self {
        Self {
            width,
            height,
            data,
        }
    }

    /// View over a dequeued driver buffer.
    pub fn from_buffer<B: FrameBuffer + ?Sized>(buffer: &'a B) -> Self {
        Self::new(buffer.width(), buffer.height(), buffer.data())
    }

    /// Frame width in pixels.
    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    /// Frame height in pixels.
    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    /// Raw pixel data.
    #[must_use]
    pub const fn data(&self) -> &'a [u8] {
        self.data
    }

    /// Pointer to the first pixel.
    #[must_use]
    pub const fn as_ptr(&self) -> *const u8 {
        self.data.as_ptr()
    }

    /// Pixels of row `y`, or `None` past the last row or the end of data.
    #[must_use]
    pub fn row(&self, y: u32) -> Option<&'a [u8]> {
        if y >= self.height {
            return None;
        }
        let start = (y as usize).checked_mul(self.width as usize)?;
        self.data.get(start..start.checked_add(self.width as usize)?)
    }

    /// Intensity of the pixel at `(x, y)`.
    #[must_use]
    pub fn pixel_at(&self, x: u32, y: u32) -> Option<u8> {
        if x >= self.width {
            return None;
        }
        self.row(y)?.get(x as usize).copied()
    }
}

/// Driver operation named in construction and start-up errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Global library initialization.
    InitLib,
    /// Device list refresh.
    UpdateDeviceList,
    /// Opening the device by ordinal.
    OpenDevice,
    /// Reading the payload size.
    ReadPayloadSize,
    /// Switching to continuous acquisition.
    SetAcquisitionMode,
    /// Disabling the trigger.
    SetTriggerMode,
    /// Setting the acquisition buffer count.
    SetBufferCount,
    /// Checking whether a feature is implemented.
    QueryFeature(FeatureId),
    /// Enabling stream output.
    StreamOn,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InitLib => f.write_str("library initialization"),
            Self::UpdateDeviceList => f.write_str("device list update"),
            Self::OpenDevice => f.write_str("device open"),
            Self::ReadPayloadSize => f.write_str("payload size query"),
            Self::SetAcquisitionMode => f.write_str("acquisition mode setup"),
            Self::SetTriggerMode => f.write_str("trigger mode setup"),
            Self::SetBufferCount => f.write_str("acquisition buffer count setup"),
            Self::QueryFeature(feature) => write!(f, "feature query for {feature:?}"),
            Self::StreamOn => f.write_str("stream start"),
        }
    }
}

/// Error type for camera operations.
#[derive(Debug, thiserror::Error)]
pub enum CameraError {
    /// A driver call failed; `detail` is the driver's last-error description.
    #[error("{operation} failed with {status}: {detail}")]
    Driver {
        /// Which step failed.
        operation: Operation,
        /// Status returned by the driver.
        status: Status,
        /// Driver's last-error description.
        detail: String,
    },
    /// The device list refresh found nothing.
    #[error("No connected device found")]
    NoDevice,
    /// A runtime over a different driver type is already alive.
    #[error("a device runtime with a different driver is already active")]
    RuntimeConflict,
    /// `run()` was called while the acquisition loop is alive.
    #[error("acquisition is already running")]
    AlreadyStreaming,
    /// The frame callback was lost when the acquisition thread panicked.
    #[error("frame callback is unavailable after the acquisition thread panicked")]
    CallbackUnavailable,
    /// A delivered frame failed a consistency check.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
    /// The acquisition thread could not be spawned.
    #[error("failed to spawn acquisition thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Result type for camera operations.
pub type Result<T> = std::result::Result<T, CameraError>;

/// Capture driver subsystem.
///
/// Calls mirror a vendor C API: every call may fail with a [`Status`]
/// and a description retrievable through [`CaptureDriver::last_error`].
/// Variable-length strings follow a two-call protocol: pass `None` to
/// learn the required size, then a buffer of exactly that size to fill
/// it. Both calls return the number of bytes of the value.
pub trait CaptureDriver: Send + Sync + 'static {
    /// Buffer token handed out by `dequeue_buffer`.
    type Buffer: FrameBuffer;

    /// Initialize the driver library.
    fn init_lib(&self) -> DriverResult<()>;

    /// Shut the driver library down.
    fn close_lib(&self) -> DriverResult<()>;

    /// Two-call query of the last error description.
    fn last_error(&self, buf: Option<&mut [u8]>) -> DriverResult<usize>;

    /// Refresh the device list, waiting at most `timeout`. Returns the
    /// number of devices found.
    fn update_device_list(&self, timeout: Duration) -> DriverResult<u32>;

    /// Open a device by its 1-based ordinal in the last refreshed list.
    fn open_device_by_index(&self, index: u32) -> DriverResult<DeviceHandle>;

    /// Close an open device.
    fn close_device(&self, handle: DeviceHandle) -> DriverResult<()>;

    /// Read an integer feature.
    fn get_int(&self, handle: DeviceHandle, feature: FeatureId) -> DriverResult<i64>;

    /// Write an integer feature.
    fn set_int(&self, handle: DeviceHandle, feature: FeatureId, value: i64) -> DriverResult<()>;

    /// Write an enumerated feature.
    fn set_enum(&self, handle: DeviceHandle, feature: FeatureId, value: i64) -> DriverResult<()>;

    /// Whether the device implements `feature`.
    fn is_implemented(&self, handle: DeviceHandle, feature: FeatureId) -> DriverResult<bool>;

    /// Two-call query of a string feature.
    fn string_feature(
        &self,
        handle: DeviceHandle,
        feature: FeatureId,
        buf: Option<&mut [u8]>,
    ) -> DriverResult<usize>;

    /// Set the number of driver-side acquisition buffers.
    fn set_acquisition_buffer_number(&self, handle: DeviceHandle, count: u64) -> DriverResult<()>;

    /// Enable stream output.
    fn stream_on(&self, handle: DeviceHandle) -> DriverResult<()>;

    /// Disable stream output.
    fn stream_off(&self, handle: DeviceHandle) -> DriverResult<()>;

    /// Take the next filled buffer, waiting at most `timeout`.
    fn dequeue_buffer(&self, handle: DeviceHandle, timeout: Duration) -> DriverResult<Self::Buffer>;

    /// Return a buffer to the driver's free pool.
    fn queue_buffer(&self, handle: DeviceHandle, buffer: Self::Buffer) -> DriverResult<()>;
}

/// Driver-side half of the two-call string protocol.
///
/// Reports the size of `value` when `buf` is `None`, otherwise copies it
/// into `buf`, which must be large enough.
///
/// # Errors
///
/// Returns `NeedMoreBuffer` if `buf` is shorter than `value`.
pub fn write_sized(value: &[u8], buf: Option<&mut [u8]>) -> DriverResult<usize> {
    let Some(buf) = buf else {
        return Ok(value.len());
    };
    let dest = buf
        .get_mut(..value.len())
        .ok_or(Status::NeedMoreBuffer)?;
    dest.copy_from_slice(value);
    Ok(value.len())
}
