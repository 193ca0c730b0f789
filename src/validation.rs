//! Frame consistency checks.
//!
//! Used for diagnostics only: a frame failing these checks is still
//! delivered, the acquisition loop just reports the mismatch.

use crate::traits::{CameraError, FrameView, Result};

/// Validates that a mono8 frame has non-zero dimensions and enough data
/// to cover `width * height` pixels.
///
/// # Errors
///
/// Returns `InvalidFrame` if either dimension is zero or the data is
/// shorter than one byte per pixel.
pub fn validate_dimensions(view: &FrameView<'_>) -> Result<()> {
    let (width, height) = (view.width(), view.height());
    if width == 0 || height == 0 {
        return Err(CameraError::InvalidFrame(format!(
            "empty frame {width}x{height}"
        )));
    }

    let required = u64::from(width) * u64::from(height);
    let available = view.data().len() as u64;
    if available < required {
        return Err(CameraError::InvalidFrame(format!(
            "{width}x{height} mono8 frame needs {required} bytes, buffer has {available}"
        )));
    }

    Ok(())
}

/// Validates that the delivered data matches the payload size reported
/// by the device.
///
/// # Errors
///
/// Returns `InvalidFrame` if the byte counts differ or the payload size
/// is negative.
pub fn validate_payload_size(view: &FrameView<'_>, payload_size: i64) -> Result<()> {
    let expected = u64::try_from(payload_size).map_err(|_| {
        CameraError::InvalidFrame(format!("device reported payload size {payload_size}"))
    })?;
    let actual = view.data().len() as u64;
    if actual != expected {
        return Err(CameraError::InvalidFrame(format!(
            "frame carries {actual} bytes, device payload size is {expected}"
        )));
    }
    Ok(())
}

/// Run every check against a delivered frame.
///
/// # Errors
///
/// Returns the first failing check's `InvalidFrame`.
pub fn validate_frame(view: &FrameView<'_>, payload_size: i64) -> Result<()> {
    validate_dimensions(view)?;
    validate_payload_size(view, payload_size)
}
