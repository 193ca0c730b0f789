//! Mock driver implementation for testing without hardware.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use crate::traits::{
    write_sized, CaptureDriver, DeviceHandle, DriverResult, FeatureId, FrameBuffer, FrameStatus,
    Status,
};

/// Upper bound on how long a scripted timeout actually sleeps.
const MAX_TIMEOUT_SLEEP: Duration = Duration::from_millis(2);

/// Driver call that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    /// Library initialization.
    InitLib,
    /// Library shutdown.
    CloseLib,
    /// Size half of the last-error query.
    LastErrorSize,
    /// Fill half of the last-error query.
    LastErrorFill,
    /// Device list refresh.
    UpdateDeviceList,
    /// Opening a device by index.
    OpenDevice,
    /// Closing the device.
    CloseDevice,
    /// Reading an integer feature.
    GetInt(FeatureId),
    /// Writing an integer feature.
    SetInt(FeatureId),
    /// Writing an enumerated feature.
    SetEnum(FeatureId),
    /// Feature-presence query.
    IsImplemented(FeatureId),
    /// Size half of a string feature query.
    StringSize(FeatureId),
    /// Fill half of a string feature query.
    StringFill(FeatureId),
    /// Setting the acquisition buffer count.
    SetBufferNumber,
    /// Enabling the stream.
    StreamOn,
    /// Disabling the stream.
    StreamOff,
    /// Returning a buffer to the driver.
    QueueBuffer,
}

/// Driver call as recorded in the journal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    /// `init_lib`.
    InitLib,
    /// `close_lib`.
    CloseLib,
    /// `update_device_list`.
    UpdateDeviceList,
    /// `open_device_by_index` with the requested index.
    OpenDevice(u32),
    /// `close_device`.
    CloseDevice(DeviceHandle),
    /// `get_int` on a feature.
    GetInt(FeatureId),
    /// `set_int` with the written value.
    SetInt(FeatureId, i64),
    /// `set_enum` with the written value.
    SetEnum(FeatureId, i64),
    /// `is_implemented` on a feature.
    IsImplemented(FeatureId),
    /// `set_acquisition_buffer_number` with the requested count.
    SetBufferNumber(u64),
    /// `stream_on`.
    StreamOn,
    /// `stream_off`.
    StreamOff,
    /// `dequeue_buffer`, whatever its outcome.
    Dequeue,
    /// `queue_buffer`.
    Queue,
}

/// Test pattern types for mock frame generation.
#[derive(Debug, Clone, Copy)]
pub enum TestPattern {
    /// Horizontal gradient from dark to light.
    Gradient,
    /// Every pixel has the same intensity.
    Solid(u8),
}

/// Frame handed out by a scripted dequeue.
#[derive(Debug, Clone)]
pub struct MockFrame {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Per-frame status reported with the buffer.
    pub status: FrameStatus,
    /// Mono8 pixel data.
    pub data: Vec<u8>,
}

impl MockFrame {
    /// Complete mono8 frame filled with `pattern`.
    pub fn new(width: u32, height: u32, pattern: TestPattern) -> Self {
        Self {
            width,
            height,
            status: FrameStatus::SUCCESS,
            data: generate_test_frame(width, height, pattern),
        }
    }

    /// Override the per-frame status.
    #[must_use]
    pub const fn with_status(mut self, status: FrameStatus) -> Self {
        self.status = status;
        self
    }
}

/// One scripted result of `dequeue_buffer`.
#[derive(Debug, Clone)]
pub enum Dequeue {
    /// Nothing arrived within the timeout.
    Timeout,
    /// The dequeue itself fails with this status.
    Fail(Status),
    /// A filled buffer.
    Frame(MockFrame),
}

/// Buffer token of the mock driver.
#[derive(Debug)]
pub struct MockBuffer(MockFrame);

impl FrameBuffer for MockBuffer {
    fn width(&self) -> u32 {
        self.0.width
    }

    fn height(&self) -> u32 {
        self.0.height
    }

    fn status(&self) -> FrameStatus {
        self.0.status
    }

    fn data(&self) -> &[u8] {
        &self.0.data
    }
}

#[derive(Debug, Default)]
struct JournalState {
    calls: Vec<Call>,
    data_ptrs: Vec<usize>,
}

/// Shared record of the calls a [`MockDriver`] received.
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<JournalState>>);

impl Journal {
    fn lock(&self) -> MutexGuard<'_, JournalState> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, call: Call) {
        self.lock().calls.push(call);
    }

    /// All recorded calls in order.
    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    /// Number of recorded calls equal to `call`.
    pub fn count(&self, call: &Call) -> usize {
        self.lock().calls.iter().filter(|c| *c == call).count()
    }

    /// Pixel data addresses of every buffer handed out, in order.
    pub fn data_ptrs(&self) -> Vec<usize> {
        self.lock().data_ptrs.clone()
    }
}

#[derive(Debug)]
struct MockState {
    device_count: u32,
    payload_size: i64,
    implemented: HashSet<FeatureId>,
    strings: HashMap<FeatureId, String>,
    faults: HashMap<Fault, Status>,
    script: VecDeque<Dequeue>,
    last_error: String,
    close_delay: Duration,
}

/// Scripted, fault-injecting driver for testing without hardware.
#[derive(Debug)]
pub struct MockDriver {
    state: Mutex<MockState>,
    journal: Journal,
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDriver {
    /// Handle issued for the only mock device.
    pub const HANDLE: DeviceHandle = DeviceHandle(1);

    /// One connected 640x480 mono8 device implementing both transfer tunables.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                device_count: 1,
                payload_size: 640 * 480,
                implemented: HashSet::from([
                    FeatureId::StreamTransferSize,
                    FeatureId::StreamTransferNumberUrb,
                ]),
                strings: HashMap::new(),
                faults: HashMap::new(),
                script: VecDeque::new(),
                last_error: String::new(),
                close_delay: Duration::ZERO,
            }),
            journal: Journal::default(),
        }
    }

    /// Handle to the call journal, valid after the driver is moved away.
    pub fn journal(&self) -> Journal {
        self.journal.clone()
    }

    /// Number of devices the list refresh reports.
    #[must_use]
    pub fn with_device_count(self, count: u32) -> Self {
        self.state().device_count = count;
        self
    }

    /// Payload size reported for the device.
    #[must_use]
    pub fn with_payload_size(self, size: i64) -> Self {
        self.state().payload_size = size;
        self
    }

    /// Report `feature` as not implemented.
    #[must_use]
    pub fn without_feature(self, feature: FeatureId) -> Self {
        self.state().implemented.remove(&feature);
        self
    }

    /// Value of a string feature.
    #[must_use]
    pub fn with_string(self, feature: FeatureId, value: &str) -> Self {
        self.state().strings.insert(feature, value.to_owned());
        self
    }

    /// Initial last-error description.
    #[must_use]
    pub fn with_last_error(self, desc: &str) -> Self {
        desc.clone_into(&mut self.state().last_error);
        self
    }

    /// Make the call named by `fault` fail with `status`.
    #[must_use]
    pub fn with_fault(self, fault: Fault, status: Status) -> Self {
        self.state().faults.insert(fault, status);
        self
    }

    /// Record calls into `journal` instead of a fresh one.
    #[must_use]
    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = journal;
        self
    }

    /// Make library shutdown take `delay`.
    #[must_use]
    pub fn with_close_delay(self, delay: Duration) -> Self {
        self.state().close_delay = delay;
        self
    }

    /// Append scripted dequeue results. Once exhausted, dequeue times out.
    #[must_use]
    pub fn with_script<I: IntoIterator<Item = Dequeue>>(self, script: I) -> Self {
        self.state().script.extend(script);
        self
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check(&self, fault: Fault) -> DriverResult<()> {
        let mut state = self.state();
        match state.faults.get(&fault).copied() {
            Some(status) => {
                state.last_error = format!("injected {status} on {fault:?}");
                Err(status)
            }
            None => Ok(()),
        }
    }
}

impl CaptureDriver for MockDriver {
    type Buffer = MockBuffer;

    fn init_lib(&self) -> DriverResult<()> {
        self.journal.record(Call::InitLib);
        self.check(Fault::InitLib)
    }

    fn close_lib(&self) -> DriverResult<()> {
        let delay = self.state().close_delay;
        thread::sleep(delay);
        self.journal.record(Call::CloseLib);
        self.check(Fault::CloseLib)
    }

    fn last_error(&self, buf: Option<&mut [u8]>) -> DriverResult<usize> {
        let fault = if buf.is_some() {
            Fault::LastErrorFill
        } else {
            Fault::LastErrorSize
        };
        self.check(fault)?;
        let desc = self.state().last_error.clone();
        write_sized(desc.as_bytes(), buf)
    }

    fn update_device_list(&self, _timeout: Duration) -> DriverResult<u32> {
        self.journal.record(Call::UpdateDeviceList);
        self.check(Fault::UpdateDeviceList)?;
        Ok(self.state().device_count)
    }

    fn open_device_by_index(&self, index: u32) -> DriverResult<DeviceHandle> {
        self.journal.record(Call::OpenDevice(index));
        self.check(Fault::OpenDevice)?;
        if index == 0 || index > self.state().device_count {
            return Err(Status::NotFoundDevice);
        }
        Ok(Self::HANDLE)
    }

    fn close_device(&self, handle: DeviceHandle) -> DriverResult<()> {
        self.journal.record(Call::CloseDevice(handle));
        self.check(Fault::CloseDevice)
    }

    fn get_int(&self, _handle: DeviceHandle, feature: FeatureId) -> DriverResult<i64> {
        self.journal.record(Call::GetInt(feature));
        self.check(Fault::GetInt(feature))?;
        match feature {
            FeatureId::PayloadSize => Ok(self.state().payload_size),
            _ => Err(Status::NotImplemented),
        }
    }

    fn set_int(&self, _handle: DeviceHandle, feature: FeatureId, value: i64) -> DriverResult<()> {
        self.journal.record(Call::SetInt(feature, value));
        self.check(Fault::SetInt(feature))
    }

    fn set_enum(&self, _handle: DeviceHandle, feature: FeatureId, value: i64) -> DriverResult<()> {
        self.journal.record(Call::SetEnum(feature, value));
        self.check(Fault::SetEnum(feature))
    }

    fn is_implemented(&self, _handle: DeviceHandle, feature: FeatureId) -> DriverResult<bool> {
        self.journal.record(Call::IsImplemented(feature));
        self.check(Fault::IsImplemented(feature))?;
        Ok(self.state().implemented.contains(&feature))
    }

    fn string_feature(
        &self,
        _handle: DeviceHandle,
        feature: FeatureId,
        buf: Option<&mut [u8]>,
    ) -> DriverResult<usize> {
        let fault = if buf.is_some() {
            Fault::StringFill(feature)
        } else {
            Fault::StringSize(feature)
        };
        self.check(fault)?;
        let value = self
            .state()
            .strings
            .get(&feature)
            .cloned()
            .ok_or(Status::NotImplemented)?;
        write_sized(value.as_bytes(), buf)
    }

    fn set_acquisition_buffer_number(&self, _handle: DeviceHandle, count: u64) -> DriverResult<()> {
        self.journal.record(Call::SetBufferNumber(count));
        self.check(Fault::SetBufferNumber)
    }

    fn stream_on(&self, _handle: DeviceHandle) -> DriverResult<()> {
        self.journal.record(Call::StreamOn);
        self.check(Fault::StreamOn)
    }

    fn stream_off(&self, _handle: DeviceHandle) -> DriverResult<()> {
        self.journal.record(Call::StreamOff);
        self.check(Fault::StreamOff)
    }

    fn dequeue_buffer(&self, _handle: DeviceHandle, timeout: Duration) -> DriverResult<MockBuffer> {
        self.journal.record(Call::Dequeue);
        let next = self.state().script.pop_front();
        match next {
            Some(Dequeue::Frame(frame)) => {
                self.journal.lock().data_ptrs.push(frame.data.as_ptr() as usize);
                Ok(MockBuffer(frame))
            }
            Some(Dequeue::Fail(status)) => {
                self.state().last_error = format!("scripted {status}");
                Err(status)
            }
            Some(Dequeue::Timeout) | None => {
                thread::sleep(timeout.min(MAX_TIMEOUT_SLEEP));
                Err(Status::Timeout)
            }
        }
    }

    fn queue_buffer(&self, _handle: DeviceHandle, _buffer: MockBuffer) -> DriverResult<()> {
        self.journal.record(Call::Queue);
        self.check(Fault::QueueBuffer)
    }
}

/// Generate mono8 test frame data based on pattern.
#[allow(clippy::cast_possible_truncation)]
fn generate_test_frame(width: u32, height: u32, pattern: TestPattern) -> Vec<u8> {
    let size = (width * height) as usize;
    match pattern {
        TestPattern::Gradient => (0..height)
            .flat_map(|_| (0..width).map(move |x| ((x * 255) / width.max(1)) as u8))
            .collect(),
        TestPattern::Solid(value) => vec![value; size],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gradient_pattern() {
        let data = generate_test_frame(640, 480, TestPattern::Gradient);
        assert_eq!(data.len(), 640 * 480);

        // Left edge dark, right edge bright
        assert_eq!(data[0], 0);
        assert!(data[639] > 250);
    }

    #[test]
    fn test_solid_pattern() {
        let data = generate_test_frame(8, 8, TestPattern::Solid(42));
        assert!(data.iter().all(|&px| px == 42));
    }

    #[test]
    fn test_script_then_timeout() {
        let driver = MockDriver::new().with_script([
            Dequeue::Fail(Status::Offline),
            Dequeue::Frame(MockFrame::new(4, 4, TestPattern::Solid(1))),
        ]);
        let timeout = Duration::from_millis(1);

        assert_eq!(
            driver.dequeue_buffer(MockDriver::HANDLE, timeout).err(),
            Some(Status::Offline)
        );
        let buffer = driver
            .dequeue_buffer(MockDriver::HANDLE, timeout)
            .expect("scripted frame");
        assert_eq!(buffer.width(), 4);
        assert_eq!(
            driver.dequeue_buffer(MockDriver::HANDLE, timeout).err(),
            Some(Status::Timeout)
        );
        assert_eq!(driver.journal().count(&Call::Dequeue), 3);
    }

    #[test]
    fn test_open_out_of_range() {
        let driver = MockDriver::new();
        assert_eq!(driver.open_device_by_index(2), Err(Status::NotFoundDevice));
        assert_eq!(driver.open_device_by_index(1), Ok(MockDriver::HANDLE));
    }
}
