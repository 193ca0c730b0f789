//! Human-readable driver diagnostics and device string queries.

use std::fmt;

use crate::traits::{CaptureDriver, DeviceHandle, FeatureId, Status};

/// Returned by [`describe_last_error`] when the fill call fails.
pub const LAST_ERROR_FALLBACK: &str = "Error when calling last_error";

/// Placeholder for device strings the device does not report.
pub const UNDEF: &str = "undef";

/// Which half of the two-call string protocol failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SizedReadError {
    Size(Status),
    Fill(Status),
}

/// Run the two-call size-then-fill protocol against `query`.
fn read_sized_string<F>(mut query: F) -> Result<String, SizedReadError>
where
    F: FnMut(Option<&mut [u8]>) -> Result<usize, Status>,
{
    let size = query(None).map_err(SizedReadError::Size)?;
    let mut buf = vec![0u8; size];
    let written = query(Some(&mut buf)).map_err(SizedReadError::Fill)?;
    buf.truncate(written);
    while buf.last() == Some(&0) {
        buf.pop();
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Describe the driver's last error.
///
/// Empty when the size query fails, [`LAST_ERROR_FALLBACK`] when the fill
/// query fails.
pub fn describe_last_error<D: CaptureDriver + ?Sized>(driver: &D) -> String {
    match read_sized_string(|buf| driver.last_error(buf)) {
        Ok(desc) => desc,
        Err(SizedReadError::Size(_)) => String::new(),
        Err(SizedReadError::Fill(_)) => LAST_ERROR_FALLBACK.to_owned(),
    }
}

/// Read a string feature, `None` if either query fails.
pub fn get_device_string<D: CaptureDriver + ?Sized>(
    driver: &D,
    handle: DeviceHandle,
    feature: FeatureId,
) -> Option<String> {
    read_sized_string(|buf| driver.string_feature(handle, feature, buf)).ok()
}

/// Identification strings of an open device, each optional.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Vendor name.
    pub vendor: Option<String>,
    /// Model name.
    pub model: Option<String>,
    /// Serial number.
    pub serial: Option<String>,
    /// Device version.
    pub version: Option<String>,
}

impl DeviceInfo {
    /// Query all identification strings of `handle`.
    pub fn query<D: CaptureDriver + ?Sized>(driver: &D, handle: DeviceHandle) -> Self {
        Self {
            vendor: get_device_string(driver, handle, FeatureId::VendorName),
            model: get_device_string(driver, handle, FeatureId::ModelName),
            serial: get_device_string(driver, handle, FeatureId::SerialNumber),
            version: get_device_string(driver, handle, FeatureId::DeviceVersion),
        }
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Vendor: {}", or_undef(self.vendor.as_deref()))?;
        writeln!(f, "Model: {}", or_undef(self.model.as_deref()))?;
        writeln!(f, "Serial: {}", or_undef(self.serial.as_deref()))?;
        writeln!(f, "Version: {}", or_undef(self.version.as_deref()))
    }
}

fn or_undef(value: Option<&str>) -> &str {
    value.unwrap_or(UNDEF)
}
