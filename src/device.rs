//! V4L2 driver implementation using the v4l crate.
//!
//! Maps the capture driver contract onto Video4Linux devices: the device
//! list is the set of capture-capable `/dev/video*` nodes, the payload
//! size is the negotiated format size, and streaming uses mmap buffers
//! with the stream started by `stream_on` itself.
//! V4L2 devices always free-run, so only continuous acquisition with the
//! trigger off is accepted.

use std::collections::HashMap;
use std::fmt::Display;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::debug;
use v4l::buffer::{Flags, Type};
use v4l::capability::Flags as CapabilityFlags;
use v4l::device::Handle;
use v4l::io::mmap::Stream;
use v4l::io::traits::{CaptureStream, Stream as _};
use v4l::video::Capture;
use v4l::Device;

use crate::traits::{
    write_sized, AcquisitionMode, CaptureDriver, DeviceHandle, DriverResult, FeatureId,
    FrameBuffer, FrameStatus, Status, TriggerMode,
};

/// Identification strings reported by `VIDIOC_QUERYCAP`.
#[derive(Debug, Clone, Default)]
struct DeviceCapabilities {
    driver: String,
    card: String,
    bus_info: String,
    version: String,
}

impl DeviceCapabilities {
    fn get(&self, feature: FeatureId) -> Option<&str> {
        match feature {
            FeatureId::VendorName => Some(&self.driver),
            FeatureId::ModelName => Some(&self.card),
            FeatureId::SerialNumber => Some(&self.bus_info),
            FeatureId::DeviceVersion => Some(&self.version),
            _ => None,
        }
    }
}

/// `POLLIN` from `<poll.h>`.
const POLLIN: i16 = 0x001;

/// `VIDEO_MAX_FRAME`: no queue holds more buffers than this.
const MAX_BUFFERS: u32 = 32;

/// Smallest mmap pool requested. One buffer stays dequeued between frames
/// and some drivers need two queued before capture begins.
const MIN_BUFFERS: u32 = 3;

/// Milliseconds for `poll(2)`, saturated at the largest value it accepts.
fn poll_timeout_ms(timeout: Duration) -> i32 {
    i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX)
}

/// Tracks the frame handed out by the last dequeue until it comes back.
#[derive(Debug, Default)]
struct FrameLedger {
    last_id: u64,
    outstanding: Option<u64>,
}

impl FrameLedger {
    const fn is_clear(&self) -> bool {
        self.outstanding.is_none()
    }

    fn issue(&mut self) -> u64 {
        self.last_id += 1;
        self.outstanding = Some(self.last_id);
        self.last_id
    }

    fn release(&mut self, id: u64) -> Result<(), &'static str> {
        match self.outstanding {
            Some(current) if current == id => {
                self.outstanding = None;
                Ok(())
            }
            Some(_) => Err("buffer does not belong to the last dequeue"),
            None => Err("no buffer is outstanding"),
        }
    }
}

type StreamResult<T> = std::result::Result<T, (Status, String)>;

/// Running mmap capture stream.
///
/// The v4l stream only exposes buffer memory through `next()`, which
/// queues the previously dequeued buffer again before taking the next
/// one. One kernel buffer is therefore always held between frames, and
/// `next()` is only called once `poll` reports a filled buffer, so a
/// timeout leaves the queue untouched.
struct ActiveStream {
    stream: Stream<'static>,
    handle: Arc<Handle>,
    width: u32,
    height: u32,
    ledger: FrameLedger,
}

impl ActiveStream {
    /// Allocate buffers, queue all but the first, and issue `VIDIOC_STREAMON`.
    fn start(device: &Device, buffer_count: u32) -> io::Result<Self> {
        let format = device.format()?;
        let requested = buffer_count.max(MIN_BUFFERS);
        let mut stream = Stream::with_buffers(device, Type::VideoCapture, requested)?;

        // Buffer 0 counts as held; the first `next()` queues it.
        for index in 1..MAX_BUFFERS {
            match CaptureStream::queue(&mut stream, index as usize) {
                Ok(()) => {}
                // The driver may grant more buffers than requested.
                Err(_) if index >= requested => break,
                Err(err) => return Err(err),
            }
        }
        stream.start()?;

        Ok(Self {
            handle: stream.handle(),
            stream,
            width: format.width,
            height: format.height,
            ledger: FrameLedger::default(),
        })
    }

    fn wait(&self, timeout: Duration) -> io::Result<bool> {
        match self.handle.poll(POLLIN, poll_timeout_ms(timeout)) {
            Ok(ready) => Ok(ready > 0),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Next filled frame, `None` on timeout.
    fn dequeue(&mut self, timeout: Duration) -> StreamResult<Option<V4L2Buffer>> {
        if !self.ledger.is_clear() {
            return Err((
                Status::InvalidCall,
                "previous buffer has not been queued".to_owned(),
            ));
        }
        let ready = self
            .wait(timeout)
            .map_err(|err| (Status::Error, format!("poll failed: {err}")))?;
        if !ready {
            return Ok(None);
        }

        let (buf, meta) = self
            .stream
            .next()
            .map_err(|err| (Status::Error, format!("dequeue failed: {err}")))?;
        let used = buf.get(..meta.bytesused as usize).unwrap_or(buf);
        let status = if meta.flags.contains(Flags::ERROR) {
            FrameStatus::INCOMPLETE
        } else {
            FrameStatus::SUCCESS
        };
        let data = used.to_vec();

        Ok(Some(V4L2Buffer {
            id: self.ledger.issue(),
            width: self.width,
            height: self.height,
            status,
            data,
        }))
    }

    fn release(&mut self, id: u64) -> StreamResult<()> {
        self.ledger
            .release(id)
            .map_err(|reason| (Status::InvalidCall, reason.to_owned()))
    }
}

struct OpenDevice {
    device: Device,
    capabilities: DeviceCapabilities,
    buffer_count: u32,
    stream: Option<ActiveStream>,
}

#[derive(Default)]
struct DriverState {
    initialized: bool,
    last_error: String,
    nodes: Vec<usize>,
    next_handle: u64,
    devices: HashMap<DeviceHandle, OpenDevice>,
}

impl DriverState {
    fn fail<E: Display>(&mut self, status: Status, err: E) -> Status {
        self.last_error = err.to_string();
        status
    }

    fn ensure_init(&mut self) -> DriverResult<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(self.fail(Status::NotInitApi, "driver library is not initialized"))
        }
    }

    fn device(&mut self, handle: DeviceHandle) -> DriverResult<&mut OpenDevice> {
        self.ensure_init()?;
        if !self.devices.contains_key(&handle) {
            return Err(self.fail(Status::InvalidHandle, format!("unknown handle {}", handle.0)));
        }
        self.devices.get_mut(&handle).ok_or(Status::InvalidHandle)
    }
}

/// Frame copied out of a V4L2 mmap buffer.
#[derive(Debug)]
pub struct V4L2Buffer {
    id: u64,
    width: u32,
    height: u32,
    status: FrameStatus,
    data: Vec<u8>,
}

impl FrameBuffer for V4L2Buffer {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn status(&self) -> FrameStatus {
        self.status
    }

    fn data(&self) -> &[u8] {
        &self.data
    }
}

/// Capture driver over Video4Linux devices.
#[derive(Default)]
pub struct V4L2Driver {
    state: Mutex<DriverState>,
}

impl V4L2Driver {
    /// Create an uninitialized driver.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, DriverState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Whether the node at `index` can capture video.
fn is_capture_node(index: usize) -> bool {
    Device::new(index)
        .and_then(|device| device.query_caps())
        .is_ok_and(|caps| caps.capabilities.contains(CapabilityFlags::VIDEO_CAPTURE))
}

impl CaptureDriver for V4L2Driver {
    type Buffer = V4L2Buffer;

    fn init_lib(&self) -> DriverResult<()> {
        self.state().initialized = true;
        Ok(())
    }

    fn close_lib(&self) -> DriverResult<()> {
        let mut state = self.state();
        state.devices.clear();
        state.nodes.clear();
        state.initialized = false;
        Ok(())
    }

    fn last_error(&self, buf: Option<&mut [u8]>) -> DriverResult<usize> {
        write_sized(self.state().last_error.as_bytes(), buf)
    }

    fn update_device_list(&self, _timeout: Duration) -> DriverResult<u32> {
        let mut state = self.state();
        state.ensure_init()?;

        // Enumeration reads sysfs synchronously; there is nothing to wait for.
        let mut nodes: Vec<usize> = v4l::context::enum_devices()
            .iter()
            .map(v4l::context::Node::index)
            .filter(|&index| is_capture_node(index))
            .collect();
        nodes.sort_unstable();
        debug!(?nodes, "V4L2 capture nodes");

        let count = u32::try_from(nodes.len()).unwrap_or(u32::MAX);
        state.nodes = nodes;
        Ok(count)
    }

    fn open_device_by_index(&self, index: u32) -> DriverResult<DeviceHandle> {
        let mut state = self.state();
        state.ensure_init()?;

        let node = index
            .checked_sub(1)
            .and_then(|position| state.nodes.get(position as usize).copied());
        let Some(node) = node else {
            return Err(state.fail(
                Status::NotFoundDevice,
                format!("no capture device at position {index}"),
            ));
        };

        let opened = Device::new(node).and_then(|device| {
            let caps = device.query_caps()?;
            Ok((device, caps))
        });
        let (device, caps) = match opened {
            Ok(opened) => opened,
            Err(err) => {
                return Err(state.fail(
                    Status::Error,
                    format!("failed to open /dev/video{node}: {err}"),
                ))
            }
        };

        let (major, minor, patch) = caps.version;
        let capabilities = DeviceCapabilities {
            driver: caps.driver,
            card: caps.card,
            bus_info: caps.bus,
            version: format!("{major}.{minor}.{patch}"),
        };

        state.next_handle += 1;
        let handle = DeviceHandle(state.next_handle);
        state.devices.insert(
            handle,
            OpenDevice {
                device,
                capabilities,
                buffer_count: 1,
                stream: None,
            },
        );
        Ok(handle)
    }

    fn close_device(&self, handle: DeviceHandle) -> DriverResult<()> {
        let mut state = self.state();
        state.device(handle)?;
        state.devices.remove(&handle);
        Ok(())
    }

    fn get_int(&self, handle: DeviceHandle, feature: FeatureId) -> DriverResult<i64> {
        let mut state = self.state();
        let format = state.device(handle)?.device.format();
        let format = format.map_err(|err| state.fail(Status::Error, err))?;

        match feature {
            FeatureId::PayloadSize => Ok(i64::from(format.size)),
            FeatureId::Width => Ok(i64::from(format.width)),
            FeatureId::Height => Ok(i64::from(format.height)),
            _ => Err(state.fail(
                Status::NotImplemented,
                format!("{feature:?} is not an integer feature"),
            )),
        }
    }

    fn set_int(&self, handle: DeviceHandle, feature: FeatureId, _value: i64) -> DriverResult<()> {
        let mut state = self.state();
        state.device(handle)?;
        Err(state.fail(
            Status::NotImplemented,
            format!("{feature:?} is not writable on V4L2 devices"),
        ))
    }

    fn set_enum(&self, handle: DeviceHandle, feature: FeatureId, value: i64) -> DriverResult<()> {
        let mut state = self.state();
        state.device(handle)?;

        let supported = match feature {
            FeatureId::AcquisitionMode => i64::from(AcquisitionMode::Continuous),
            FeatureId::TriggerMode => i64::from(TriggerMode::Off),
            _ => {
                return Err(state.fail(
                    Status::InvalidParameter,
                    format!("{feature:?} is not an enumerated feature"),
                ))
            }
        };
        if value == supported {
            Ok(())
        } else {
            Err(state.fail(
                Status::NotImplemented,
                format!("{feature:?} value {value} is not supported by V4L2 devices"),
            ))
        }
    }

    fn is_implemented(&self, handle: DeviceHandle, feature: FeatureId) -> DriverResult<bool> {
        self.state().device(handle)?;
        Ok(!matches!(
            feature,
            FeatureId::StreamTransferSize | FeatureId::StreamTransferNumberUrb
        ))
    }

    fn string_feature(
        &self,
        handle: DeviceHandle,
        feature: FeatureId,
        buf: Option<&mut [u8]>,
    ) -> DriverResult<usize> {
        let mut state = self.state();
        let value = state
            .device(handle)?
            .capabilities
            .get(feature)
            .map(str::to_owned);
        match value {
            Some(value) => write_sized(value.as_bytes(), buf),
            None => Err(state.fail(
                Status::NotImplemented,
                format!("{feature:?} is not a string feature"),
            )),
        }
    }

    fn set_acquisition_buffer_number(&self, handle: DeviceHandle, count: u64) -> DriverResult<()> {
        let mut state = self.state();
        state.device(handle)?;
        let count = match u32::try_from(count) {
            Ok(count) if count > 0 => count,
            _ => {
                return Err(state.fail(
                    Status::OutOfRange,
                    format!("buffer count {count} out of range"),
                ))
            }
        };
        state.device(handle)?.buffer_count = count;
        Ok(())
    }

    fn stream_on(&self, handle: DeviceHandle) -> DriverResult<()> {
        let mut state = self.state();
        let device = state.device(handle)?;
        if device.stream.is_some() {
            return Err(state.fail(Status::InvalidCall, "stream is already enabled"));
        }

        match ActiveStream::start(&device.device, device.buffer_count) {
            Ok(active) => {
                debug!(
                    handle = handle.0,
                    width = active.width,
                    height = active.height,
                    "V4L2 stream enabled"
                );
                device.stream = Some(active);
                Ok(())
            }
            Err(err) => Err(state.fail(Status::Error, format!("failed to start stream: {err}"))),
        }
    }

    fn stream_off(&self, handle: DeviceHandle) -> DriverResult<()> {
        // Dropping the stream issues VIDIOC_STREAMOFF and unmaps the buffers.
        self.state().device(handle)?.stream = None;
        Ok(())
    }

    fn dequeue_buffer(&self, handle: DeviceHandle, timeout: Duration) -> DriverResult<V4L2Buffer> {
        let mut state = self.state();
        let result = match state.device(handle)?.stream.as_mut() {
            Some(active) => active.dequeue(timeout),
            None => Err((Status::InvalidCall, "stream is not enabled".to_owned())),
        };

        match result {
            Ok(Some(buffer)) => Ok(buffer),
            Ok(None) => Err(Status::Timeout),
            Err((status, reason)) => Err(state.fail(status, reason)),
        }
    }

    /// Hand a frame back. Its kernel buffer is queued again by the next
    /// dequeue, which must not happen before the frame is returned.
    fn queue_buffer(&self, handle: DeviceHandle, buffer: V4L2Buffer) -> DriverResult<()> {
        let mut state = self.state();
        let result = match state.device(handle)?.stream.as_mut() {
            Some(active) => active.release(buffer.id),
            None => Err((Status::InvalidCall, "stream is not enabled".to_owned())),
        };
        result.map_err(|(status, reason)| state.fail(status, reason))
    }
}
