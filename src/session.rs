//! Single-device capture session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info, warn};

use crate::acquisition::{AcquisitionLoop, FrameCallback, LoopExit};
use crate::config::SessionConfig;
use crate::runtime::DeviceRuntime;
use crate::status::{describe_last_error, DeviceInfo};
use crate::traits::{
    AcquisitionMode, CameraError, CaptureDriver, DeviceHandle, FeatureId, FrameView, Operation,
    Result, Status, TriggerMode,
};

/// Ordinal of the device a session opens. Device selection is not supported.
const DEVICE_INDEX: u32 = 1;

/// Acquisition thread result: the callback handed back, and why the loop ended.
type LoopOutcome = (FrameCallback, LoopExit);

/// One opened and configured device streaming frames to a callback.
///
/// The session is idle after [`open`](Self::open). [`run`](Self::run)
/// enables the stream and starts the acquisition thread; [`stop`](Self::stop)
/// joins it. Dropping the session stops acquisition and closes the device.
///
/// While streaming, the acquisition thread owns the device; the session
/// must not be used to change device configuration in that window.
pub struct DeviceSession<D: CaptureDriver> {
    runtime: Arc<DeviceRuntime<D>>,
    handle: Option<DeviceHandle>,
    payload_size: i64,
    config: SessionConfig,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<LoopOutcome>>,
    callback: Option<FrameCallback>,
}

impl<D: CaptureDriver> DeviceSession<D> {
    /// Open and configure the first connected device with default settings.
    ///
    /// # Errors
    ///
    /// See [`open_with_config`](Self::open_with_config).
    pub fn open<F>(runtime: &Arc<DeviceRuntime<D>>, callback: F) -> Result<Self>
    where
        F: FnMut(&FrameView<'_>) -> bool + Send + 'static,
    {
        Self::open_with_config(runtime, SessionConfig::default(), callback)
    }

    /// Open and configure the first connected device.
    ///
    /// Each configuration step must succeed before the next one runs. On
    /// failure the device, if already opened, is closed again.
    ///
    /// # Errors
    ///
    /// Returns `NoDevice` when enumeration finds nothing, or `Driver`
    /// naming the first configuration step that failed.
    pub fn open_with_config<F>(
        runtime: &Arc<DeviceRuntime<D>>,
        config: SessionConfig,
        callback: F,
    ) -> Result<Self>
    where
        F: FnMut(&FrameView<'_>) -> bool + Send + 'static,
    {
        let driver = runtime.driver();

        let count = driver
            .update_device_list(config.enumeration_timeout)
            .map_err(|status| driver_error(driver, Operation::UpdateDeviceList, status))?;
        if count == 0 {
            return Err(CameraError::NoDevice);
        }
        debug!(count, "device list updated");

        let handle = driver
            .open_device_by_index(DEVICE_INDEX)
            .map_err(|status| driver_error(driver, Operation::OpenDevice, status))?;

        let mut session = Self {
            runtime: Arc::clone(runtime),
            handle: Some(handle),
            payload_size: 0,
            config,
            stop: Arc::new(AtomicBool::new(false)),
            thread: None,
            callback: Some(Box::new(callback)),
        };
        session.configure(handle)?;

        info!(
            handle = handle.0,
            payload_size = session.payload_size,
            "device opened"
        );
        Ok(session)
    }

    fn configure(&mut self, handle: DeviceHandle) -> Result<()> {
        let driver = self.runtime.driver();

        self.payload_size = driver
            .get_int(handle, FeatureId::PayloadSize)
            .map_err(|status| driver_error(driver, Operation::ReadPayloadSize, status))?;

        driver
            .set_enum(
                handle,
                FeatureId::AcquisitionMode,
                AcquisitionMode::Continuous.into(),
            )
            .map_err(|status| driver_error(driver, Operation::SetAcquisitionMode, status))?;

        driver
            .set_enum(handle, FeatureId::TriggerMode, TriggerMode::Off.into())
            .map_err(|status| driver_error(driver, Operation::SetTriggerMode, status))?;

        driver
            .set_acquisition_buffer_number(handle, self.config.buffer_count)
            .map_err(|status| driver_error(driver, Operation::SetBufferCount, status))?;

        let tunables = [
            (FeatureId::StreamTransferSize, self.config.stream_transfer_size),
            (
                FeatureId::StreamTransferNumberUrb,
                self.config.stream_transfer_urb_count,
            ),
        ];
        for (feature, value) in tunables {
            let implemented = driver
                .is_implemented(handle, feature)
                .map_err(|status| driver_error(driver, Operation::QueryFeature(feature), status))?;
            if !implemented {
                continue;
            }
            if let Err(status) = driver.set_int(handle, feature, value) {
                debug!(?feature, value, %status, "optional tunable not applied");
            }
        }

        Ok(())
    }

    /// Enable the stream and start delivering frames on a background thread.
    ///
    /// A loop that already ended on a device failure is reaped first, so a
    /// session can be restarted without an explicit `stop()`.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyStreaming` while the loop is alive, `Driver` if the
    /// stream cannot be enabled, or `Spawn` if the thread cannot start.
    pub fn run(&mut self) -> Result<()> {
        if self.thread.as_ref().is_some_and(JoinHandle::is_finished) {
            self.stop();
        }
        if self.thread.is_some() {
            return Err(CameraError::AlreadyStreaming);
        }
        let Some(handle) = self.handle else {
            return Err(driver_error(
                self.runtime.driver(),
                Operation::StreamOn,
                Status::InvalidHandle,
            ));
        };
        let mut callback = self.callback.take().ok_or(CameraError::CallbackUnavailable)?;

        if let Err(status) = self.runtime.driver().stream_on(handle) {
            self.callback = Some(callback);
            return Err(driver_error(
                self.runtime.driver(),
                Operation::StreamOn,
                status,
            ));
        }

        self.stop.store(false, Ordering::Release);
        let runtime = Arc::clone(&self.runtime);
        let stop = Arc::clone(&self.stop);
        let timeout = self.config.dequeue_timeout;
        let payload_size = self.payload_size;

        let spawned = thread::Builder::new()
            .name("acquisition".to_owned())
            .spawn(move || {
                let exit = AcquisitionLoop::new(
                    runtime.driver(),
                    handle,
                    &stop,
                    timeout,
                    payload_size,
                )
                .run(callback.as_mut());
                (callback, exit)
            });

        match spawned {
            Ok(thread) => {
                self.thread = Some(thread);
                info!(handle = handle.0, "streaming started");
                Ok(())
            }
            Err(err) => {
                if let Err(status) = self.runtime.driver().stream_off(handle) {
                    warn!(%status, "stream disable failed");
                }
                Err(CameraError::Spawn(err))
            }
        }
    }

    /// Stop acquisition and wait for the background thread to exit.
    ///
    /// Blocks for up to one dequeue timeout plus one callback duration.
    /// Safe to call repeatedly or before [`run`](Self::run).
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        let Some(thread) = self.thread.take() else {
            return;
        };

        match thread.join() {
            Ok((callback, exit)) => {
                self.callback = Some(callback);
                debug!(%exit, "acquisition thread joined");
            }
            Err(_) => error!("acquisition thread panicked"),
        }

        if let Some(handle) = self.handle {
            if let Err(status) = self.runtime.driver().stream_off(handle) {
                warn!(%status, "stream disable failed");
            }
        }
    }

    /// Identification strings, queried from the device on each call.
    pub fn device_info(&self) -> DeviceInfo {
        self.handle
            .map(|handle| DeviceInfo::query(self.runtime.driver(), handle))
            .unwrap_or_default()
    }

    /// Payload size reported by the device when the session was opened.
    pub const fn payload_size(&self) -> i64 {
        self.payload_size
    }
}

impl<D: CaptureDriver> Drop for DeviceSession<D> {
    fn drop(&mut self) {
        self.stop();
        if let Some(handle) = self.handle.take() {
            if let Err(status) = self.runtime.driver().close_device(handle) {
                warn!(%status, "device close failed");
            }
        }
    }
}

fn driver_error<D: CaptureDriver + ?Sized>(
    driver: &D,
    operation: Operation,
    status: Status,
) -> CameraError {
    CameraError::Driver {
        operation,
        status,
        detail: describe_last_error(driver),
    }
}
