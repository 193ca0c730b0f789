//! Frame-Grabber: single-device capture sessions for frame-producing cameras
//!
//! This library drives one camera through a driver abstraction: it
//! initializes the driver library, opens and configures the first
//! connected device, and streams frames to a callback from a dedicated
//! acquisition thread. A V4L2 backend is included; tests run against a
//! scripted mock driver.

pub mod acquisition;
pub mod config;
pub mod device;
pub mod runtime;
pub mod session;
pub mod status;
pub mod traits;
pub mod validation;

#[cfg(test)]
pub mod mock;

pub use acquisition::{AcquisitionLoop, FrameCallback, LoopExit};
pub use config::SessionConfig;
pub use device::V4L2Driver;
pub use runtime::DeviceRuntime;
pub use session::DeviceSession;
pub use status::{describe_last_error, get_device_string, DeviceInfo};
pub use traits::{
    CameraError, CaptureDriver, DeviceHandle, FeatureId, FrameBuffer, FrameStatus, FrameView,
    Result, Status,
};
