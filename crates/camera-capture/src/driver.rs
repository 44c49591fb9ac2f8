//! Camera driver for line-scan and area-array cameras
//!
//! Owns the acquisition device, the buffer ring bound to its transfer
//! stream, and the line-scan overlap strip.

use crate::config::{CameraConfig, CameraKind, DEFAULT_READ_TIMEOUT_MS};
use crate::device::{feature, AcquisitionDevice, DeviceError, StreamSettings};
use crate::frame::{now_ns, Frame};
use crate::pixel::PixelFormat;
use crate::{Camera, CameraError};
use ring_buffer::{BufferRing, BufferState};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Default pause between teardown and start during `restart`
pub const DEFAULT_RESTART_BACKOFF: Duration = Duration::from_millis(1000);

/// Poll period while the current buffer is EMPTY
const POLL_INTERVAL: Duration = Duration::from_micros(200);

/// Device-facing state, guarded by the driver lock
struct DriverInner<D> {
    device: D,
    config: CameraConfig,
    runtime_up: bool,
    device_open: bool,
    /// Negotiated geometry and format, valid while `ring` is set
    width: u32,
    height: u32,
    format: PixelFormat,
    ring: Option<Arc<BufferRing>>,
    /// Last `overlap` converted rows of the previous frame
    overlap: Vec<u8>,
    sequence: u64,
}

/// Driver for one physical camera behind an [`AcquisitionDevice`]
pub struct CameraDriver<D: AcquisitionDevice> {
    name: String,
    kind: CameraKind,
    inner: Mutex<DriverInner<D>>,
    started: AtomicBool,
    opened: AtomicBool,
    total_frames: AtomicU64,
    last_error: Mutex<Option<String>>,
    restart_backoff: Duration,
}

impl<D: AcquisitionDevice> CameraDriver<D> {
    /// Create a driver; nothing touches the device until `start`
    pub fn new(config: CameraConfig, device: D) -> Self {
        info!("Creating {:?} camera driver {} ({})", config.kind, config.name, config.device_name);
        Self {
            name: config.name.clone(),
            kind: config.kind,
            inner: Mutex::new(DriverInner {
                device,
                config,
                runtime_up: false,
                device_open: false,
                width: 0,
                height: 0,
                format: PixelFormat::Mono8,
                ring: None,
                overlap: Vec::new(),
                sequence: 0,
            }),
            started: AtomicBool::new(false),
            opened: AtomicBool::new(false),
            total_frames: AtomicU64::new(0),
            last_error: Mutex::new(None),
            restart_backoff: DEFAULT_RESTART_BACKOFF,
        }
    }

    /// Override the restart backoff
    pub fn with_restart_backoff(mut self, backoff: Duration) -> Self {
        self.restart_backoff = backoff;
        self
    }

    /// Non-blocking read: the `&mut` borrow already guarantees exclusive access
    pub fn read_nonblocking(&mut self, timeout_ms: i64) -> Result<Frame, CameraError> {
        self.clear_error();
        let started = self.started.load(Ordering::SeqCst);
        let inner = self
            .inner
            .get_mut()
            .map_err(|e| CameraError::Lock(e.to_string()))?;
        let result = read_frame(inner, started, timeout_ms);
        if result.is_ok() {
            self.total_frames.fetch_add(1, Ordering::Relaxed);
        }
        self.track(result)
    }

    /// Negotiated frame size (width, height) while open
    pub fn geometry(&self) -> Option<(u32, u32)> {
        let inner = self.inner.lock().ok()?;
        inner.ring.as_ref().map(|_| (inner.width, inner.height))
    }

    fn lock(&self) -> Result<MutexGuard<'_, DriverInner<D>>, CameraError> {
        self.inner
            .lock()
            .map_err(|e| CameraError::Lock(e.to_string()))
    }

    fn clear_error(&self) {
        if let Ok(mut e) = self.last_error.lock() {
            *e = None;
        }
    }

    fn track<T>(&self, result: Result<T, CameraError>) -> Result<T, CameraError> {
        if let Err(e) = &result {
            if let Ok(mut last) = self.last_error.lock() {
                *last = Some(format!("{}: {}", self.name, e));
            }
        }
        result
    }

    fn start_locked(&self, inner: &mut DriverInner<D>) -> Result<(), CameraError> {
        inner
            .device
            .init_runtime()
            .map_err(|e| CameraError::DeviceOpen(e.to_string()))?;
        inner.runtime_up = true;

        let devices = match inner.device.enumerate() {
            Ok(d) => d,
            Err(e) => {
                shutdown_device(inner);
                return Err(CameraError::DeviceOpen(e.to_string()));
            }
        };
        debug!("{} sees {} device(s)", self.name, devices.len());

        let serial = inner.config.device_name.clone();
        if !devices.iter().any(|d| d.serial_number == serial) {
            shutdown_device(inner);
            return Err(CameraError::DeviceNotFound(serial));
        }

        if let Err(e) = inner.device.open_device(&serial) {
            shutdown_device(inner);
            return Err(CameraError::DeviceOpen(e.to_string()));
        }
        inner.device_open = true;

        self.open_locked(inner)?;
        self.started.store(true, Ordering::SeqCst);
        info!("Camera {} started", self.name);
        Ok(())
    }

    fn open_locked(&self, inner: &mut DriverInner<D>) -> Result<(), CameraError> {
        if inner.ring.is_some() {
            debug!("Camera {} already open", self.name);
            return Ok(());
        }
        if !inner.device_open {
            return Err(CameraError::NotStarted);
        }

        apply_features(inner, &self.name, true);

        let result = negotiate_and_stream(inner);
        match result {
            Ok(()) => {
                self.opened.store(true, Ordering::SeqCst);
                info!(
                    "Camera {} open: {}x{} {} with {} buffers",
                    self.name,
                    inner.width,
                    inner.height,
                    inner.format,
                    inner.ring.as_ref().map(|r| r.len()).unwrap_or(0)
                );
                Ok(())
            }
            Err(e) => {
                error!("Camera {} open failed: {}", self.name, e);
                shutdown_device(inner);
                self.started.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    fn release_locked(&self, inner: &mut DriverInner<D>) -> Result<(), CameraError> {
        let result = release_ring(inner);
        self.opened.store(false, Ordering::SeqCst);
        result
    }
}

/// Read geometry/format from the device, allocate the ring, start streaming
///
/// On error the ring is dropped and every buffer detached, so no partial
/// ring survives.
fn negotiate_and_stream<D: AcquisitionDevice>(inner: &mut DriverInner<D>) -> Result<(), CameraError> {
    let width = read_dimension(&inner.device, feature::WIDTH)?;
    let height = read_dimension(&inner.device, feature::HEIGHT)?;
    let format_name = inner
        .device
        .feature(feature::PIXEL_FORMAT)
        .map_err(|e| CameraError::DeviceOpen(e.to_string()))?;
    let format: PixelFormat = format_name
        .as_str()
        .unwrap_or_default()
        .parse()?;

    let channels = inner
        .device
        .stream_count()
        .map_err(|e| CameraError::DeviceOpen(e.to_string()))?;
    if channels == 0 {
        return Err(CameraError::NoStreamChannel);
    }

    let count = inner.config.buffer_count;
    let ring = Arc::new(BufferRing::new(count, format.buffer_size(width, height))?);

    let settings = StreamSettings::default();

    let bind = |device: &mut D| -> Result<(), DeviceError> {
        device.create_stream(ring.clone())?;
        for index in 1..ring.len() {
            device.attach_buffer(index)?;
        }
        device.configure_stream(&settings)?;
        device.start_stream()
    };

    if let Err(e) = bind(&mut inner.device) {
        let _ = inner.device.stop_stream();
        for index in 0..ring.len() {
            let _ = inner.device.detach_buffer(index);
        }
        let _ = inner.device.free_stream();
        return Err(CameraError::DeviceOpen(e.to_string()));
    }

    let overlap_rows = inner.config.effective_overlap() as usize;
    inner.overlap = vec![255u8; overlap_rows * width as usize * format.output_channels() as usize];
    inner.width = width;
    inner.height = height;
    inner.format = format;
    inner.ring = Some(ring);
    Ok(())
}

fn read_int<D: AcquisitionDevice>(device: &D, name: &str) -> Result<i64, CameraError> {
    device
        .feature(name)
        .map_err(|e| CameraError::DeviceOpen(e.to_string()))?
        .as_int()
        .ok_or_else(|| CameraError::DeviceOpen(format!("feature {} is not numeric", name)))
}

fn read_dimension<D: AcquisitionDevice>(device: &D, name: &str) -> Result<u32, CameraError> {
    let value = read_int(device, name)?;
    u32::try_from(value).map_err(|_| CameraError::Format(format!("{} out of range: {}", name, value)))
}

/// Write config features; failures are logged and skipped
fn apply_features<D: AcquisitionDevice>(inner: &mut DriverInner<D>, name: &str, include_static: bool) {
    let mut features = inner.config.runtime_features();
    if include_static {
        features.extend(inner.config.static_features());
    }
    for (feature, value) in features {
        if let Err(e) = inner.device.set_feature(feature, value) {
            warn!("Camera {}: failed to set {}: {}", name, feature, e);
        }
    }
}

/// Stop the stream, detach every buffer, free the stream
fn release_ring<D: AcquisitionDevice>(inner: &mut DriverInner<D>) -> Result<(), CameraError> {
    let Some(ring) = inner.ring.take() else {
        return Ok(());
    };

    let mut first_error: Option<DeviceError> = None;
    let mut note = |e: DeviceError| {
        if first_error.is_none() {
            first_error = Some(e);
        }
    };

    if let Err(e) = inner.device.stop_stream() {
        warn!("Stop stream failed: {}", e);
        note(e);
    }
    for index in 0..ring.len() {
        if let Err(e) = inner.device.detach_buffer(index) {
            warn!("Detach buffer {} failed: {}", index, e);
            note(e);
        }
    }
    if let Err(e) = inner.device.free_stream() {
        warn!("Free stream failed: {}", e);
        note(e);
    }
    drop(ring);
    inner.overlap.clear();

    match first_error {
        Some(e) => Err(CameraError::Release(e.to_string())),
        None => Ok(()),
    }
}

/// Close the device and terminate the runtime, ignoring close errors
fn shutdown_device<D: AcquisitionDevice>(inner: &mut DriverInner<D>) {
    if inner.device_open {
        if let Err(e) = inner.device.close_device() {
            warn!("Close device failed: {}", e);
        }
        inner.device_open = false;
    }
    if inner.runtime_up {
        inner.device.terminate_runtime();
        inner.runtime_up = false;
    }
}

/// Poll the current buffer until it is readable, then convert and stitch
fn read_frame<D: AcquisitionDevice>(
    inner: &mut DriverInner<D>,
    started: bool,
    timeout_ms: i64,
) -> Result<Frame, CameraError> {
    if !started {
        return Err(CameraError::NotStarted);
    }
    let ring = inner.ring.clone().ok_or(CameraError::NotOpened)?;
    let begin = Instant::now();

    loop {
        if !inner.device.is_online() {
            return Err(CameraError::DeviceOffline);
        }

        let (width, height, format) = (inner.width, inner.height, inner.format);
        let converted = ring.consume_current(|state, raw| {
            if state == BufferState::Incomplete {
                debug!("Reading incomplete buffer");
            }
            format.convert(raw, width, height)
        })?;

        if let Some(pixels) = converted {
            return Ok(stitch(inner, pixels?));
        }

        if timeout_ms >= 0 && begin.elapsed() >= Duration::from_millis(timeout_ms as u64) {
            warn!("get image timeout after {}ms", timeout_ms);
            return Err(CameraError::Timeout);
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

/// Prepend the overlap strip, save the new strip, apply transpose
fn stitch<D: AcquisitionDevice>(inner: &mut DriverInner<D>, pixels: Vec<u8>) -> Frame {
    let channels = inner.format.output_channels();
    let row_bytes = inner.width as usize * channels as usize;
    let overlap_rows = if row_bytes == 0 { 0 } else { inner.overlap.len() / row_bytes };

    let mut data = Vec::with_capacity(inner.overlap.len() + pixels.len());
    data.extend_from_slice(&inner.overlap);
    data.extend_from_slice(&pixels);

    if overlap_rows > 0 {
        let tail = data.len() - overlap_rows * row_bytes;
        inner.overlap.copy_from_slice(&data[tail..]);
    }

    inner.sequence += 1;
    let frame = Frame {
        data,
        width: inner.width,
        height: inner.height + overlap_rows as u32,
        channels,
        timestamp_ns: now_ns(),
        sequence: inner.sequence,
    };

    if inner.config.transpose {
        frame.transpose()
    } else {
        frame
    }
}

impl<D: AcquisitionDevice> Camera for CameraDriver<D> {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> CameraKind {
        self.kind
    }

    fn start(&self) -> Result<(), CameraError> {
        self.clear_error();
        let result = self.lock().and_then(|mut inner| {
            if self.started.load(Ordering::SeqCst) {
                return Ok(());
            }
            self.start_locked(&mut inner)
        });
        self.track(result)
    }

    fn open(&self) -> Result<(), CameraError> {
        self.clear_error();
        let result = self.lock().and_then(|mut inner| self.open_locked(&mut inner));
        self.track(result)
    }

    fn read(&self, timeout_ms: i64) -> Result<Frame, CameraError> {
        self.clear_error();
        let result = self.lock().and_then(|mut inner| {
            read_frame(&mut *inner, self.started.load(Ordering::SeqCst), timeout_ms)
        });
        if result.is_ok() {
            self.total_frames.fetch_add(1, Ordering::Relaxed);
        }
        self.track(result)
    }

    fn release(&self) -> Result<(), CameraError> {
        self.clear_error();
        let result = self.lock().and_then(|mut inner| self.release_locked(&mut inner));
        self.track(result)
    }

    fn restart(&self) -> Result<(), CameraError> {
        self.clear_error();
        warn!("Restarting camera {}", self.name);

        let teardown = self.lock().map(|mut inner| {
            if let Err(e) = self.release_locked(&mut inner) {
                warn!("Camera {} release during restart failed: {}", self.name, e);
            }
            shutdown_device(&mut *inner);
            self.started.store(false, Ordering::SeqCst);
        });
        if let Err(e) = teardown {
            return self.track(Err(e));
        }

        std::thread::sleep(self.restart_backoff);

        let result = self.lock().and_then(|mut inner| self.start_locked(&mut inner));
        match &result {
            Ok(()) => info!("Camera {} restarted", self.name),
            Err(e) => error!("Camera {} restart failed: {}", self.name, e),
        }
        self.track(result)
    }

    fn shutdown(&self) -> Result<(), CameraError> {
        self.clear_error();
        let result = self.lock().map(|mut inner| {
            let released = self.release_locked(&mut inner);
            shutdown_device(&mut *inner);
            self.started.store(false, Ordering::SeqCst);
            released
        });
        info!("Camera {} shut down", self.name);
        self.track(result.and_then(|released| released))
    }

    fn apply_config(&self) -> Result<(), CameraError> {
        self.clear_error();
        let result = self.lock().and_then(|mut inner| {
            if !inner.device_open {
                return Err(CameraError::NotStarted);
            }
            let include_static = inner.ring.is_none();
            apply_features(&mut *inner, &self.name, include_static);
            debug!("Camera {} config applied", self.name);
            Ok(())
        });
        self.track(result)
    }

    fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn is_opened(&self) -> bool {
        self.opened.load(Ordering::SeqCst)
    }

    fn config(&self) -> CameraConfig {
        self.inner
            .lock()
            .map(|i| i.config.clone())
            .unwrap_or_default()
    }

    fn read_timeout_ms(&self) -> i64 {
        self.inner
            .lock()
            .map(|i| i.config.read_timeout_ms)
            .unwrap_or(DEFAULT_READ_TIMEOUT_MS)
    }

    fn set_exposure(&self, exposure: f64) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.config.exposure = exposure;
        }
    }

    fn set_gain(&self, gain: f64) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.config.gain = gain;
        }
    }

    fn set_pixel_format(&self, format: &str) -> Result<(), CameraError> {
        if self.is_started() {
            return Err(CameraError::AlreadyStarted);
        }
        self.lock()?.config.pixel_format = format.to_string();
        Ok(())
    }

    fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|e| e.clone())
    }

    fn total_frames(&self) -> u64 {
        self.total_frames.load(Ordering::Relaxed)
    }

    fn buffer_states(&self) -> Vec<BufferState> {
        self.inner
            .lock()
            .ok()
            .and_then(|i| i.ring.as_ref().map(|r| r.states()))
            .unwrap_or_default()
    }
}

impl<D: AcquisitionDevice> Drop for CameraDriver<D> {
    fn drop(&mut self) {
        let name = self.name.clone();
        match self.inner.get_mut() {
            Ok(inner) => {
                if let Err(e) = release_ring(inner) {
                    warn!("Camera {} release on drop failed: {}", name, e);
                    if let Ok(last) = self.last_error.get_mut() {
                        *last = Some(e.to_string());
                    }
                }
                shutdown_device(inner);
            }
            Err(e) => error!("Camera {} poisoned on drop: {}", name, e),
        }
        self.started.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::FeatureValue;
    use crate::sim::{SimulatedDevice, SimulatedSensor};
    use proptest::prelude::*;

    fn mono_driver(buffers: usize, width: u32, height: u32) -> (CameraDriver<SimulatedDevice>, SimulatedSensor) {
        let sensor = SimulatedSensor::new("SN100");
        let mut config = CameraConfig::area_array("cam", "SN100");
        config.pixel_format = "Mono8".to_string();
        config.width = width;
        config.height = height;
        config.buffer_count = buffers;
        let driver = CameraDriver::new(config, SimulatedDevice::new(sensor.clone()))
            .with_restart_backoff(Duration::from_millis(1));
        (driver, sensor)
    }

    #[test]
    fn test_open_allocates_ring() {
        let (driver, sensor) = mono_driver(3, 100, 50);
        driver.start().unwrap();
        assert!(driver.is_started());
        assert!(driver.is_opened());
        assert_eq!(driver.buffer_states(), vec![BufferState::Empty; 3]);
        assert_eq!(driver.geometry(), Some((100, 50)));
        assert_eq!(sensor.attached_buffers(), 3);
        assert!(sensor.is_streaming());

        let settings = sensor.stream_settings().unwrap();
        assert!(!settings.auto_clear);
        assert_eq!(settings.packet_inter_timeout_ms, 3_600_000);

        sensor.trigger().unwrap();
        let frame = driver.read(100).unwrap();
        assert_eq!((frame.width, frame.height, frame.channels), (100, 50, 1));
        assert_eq!(frame.data.len(), 100 * 50);
    }

    #[test]
    fn test_unsupported_format_leaves_nothing_allocated() {
        let (driver, sensor) = mono_driver(2, 16, 8);
        driver.set_pixel_format("Unsupported9000").unwrap();
        let err = driver.start().unwrap_err();
        assert!(matches!(err, CameraError::UnsupportedPixelFormat(_)));
        assert!(driver.buffer_states().is_empty());
        assert!(!driver.is_started());
        assert!(!sensor.runtime_active());
        assert_eq!(sensor.attached_buffers(), 0);
        assert!(driver.last_error().unwrap().contains("Unsupported9000"));
    }

    #[test]
    fn test_no_stream_channel() {
        let (driver, sensor) = mono_driver(2, 16, 8);
        sensor.set_stream_channels(0);
        assert!(matches!(driver.start(), Err(CameraError::NoStreamChannel)));
        assert!(driver.buffer_states().is_empty());
        assert!(!sensor.runtime_active());
    }

    #[test]
    fn test_device_not_found() {
        let (driver, sensor) = mono_driver(1, 16, 8);
        sensor.set_present(false);
        assert!(matches!(driver.start(), Err(CameraError::DeviceNotFound(_))));
        assert!(!driver.is_started());
    }

    #[test]
    fn test_open_failure_is_device_open_error() {
        let (driver, sensor) = mono_driver(1, 16, 8);
        sensor.set_fail_open(true);
        assert!(matches!(driver.start(), Err(CameraError::DeviceOpen(_))));
    }

    #[test]
    fn test_rejected_feature_does_not_fail_open() {
        let (driver, sensor) = mono_driver(1, 16, 8);
        sensor.reject_feature(feature::EXPOSURE_TIME);
        driver.start().unwrap();
        driver.set_exposure(500.0);
        assert!(driver.apply_config().is_ok());
        assert!(driver.apply_config().is_ok());
    }

    #[test]
    fn test_exposure_reaches_device_on_apply() {
        let (driver, sensor) = mono_driver(1, 16, 8);
        driver.start().unwrap();
        driver.set_exposure(1234.0);
        driver.set_gain(2.5);
        driver.apply_config().unwrap();
        assert_eq!(sensor.feature(feature::EXPOSURE_TIME), Some(FeatureValue::Float(1234.0)));
        assert_eq!(sensor.feature(feature::GAIN), Some(FeatureValue::Float(2.5)));
    }

    #[test]
    fn test_read_timeout_is_recoverable() {
        let (driver, sensor) = mono_driver(2, 8, 4);
        driver.start().unwrap();
        assert!(matches!(driver.read(5), Err(CameraError::Timeout)));
        sensor.trigger().unwrap();
        assert!(driver.read(5).is_ok());
        assert_eq!(driver.total_frames(), 1);
    }

    #[test]
    fn test_index_advances_and_buffer_resets() {
        let (driver, sensor) = mono_driver(2, 8, 4);
        driver.start().unwrap();
        sensor.trigger().unwrap();
        sensor.trigger_incomplete().unwrap();
        assert_eq!(driver.buffer_states(), vec![BufferState::Full, BufferState::Incomplete]);

        let a = driver.read(10).unwrap();
        assert_eq!(driver.buffer_states(), vec![BufferState::Empty, BufferState::Incomplete]);
        let b = driver.read(10).unwrap();
        assert_eq!(driver.buffer_states(), vec![BufferState::Empty, BufferState::Empty]);
        assert_eq!(a.data[0], 0);
        assert_eq!(b.data[0], 4);
        assert!(b.sequence > a.sequence);
    }

    #[test]
    fn test_read_requires_start() {
        let (driver, _) = mono_driver(1, 8, 4);
        assert!(matches!(driver.read(1), Err(CameraError::NotStarted)));
    }

    #[test]
    fn test_offline_breaks_poll() {
        let (driver, sensor) = mono_driver(1, 8, 4);
        driver.start().unwrap();
        sensor.set_online(false);
        assert!(matches!(driver.read(-1), Err(CameraError::DeviceOffline)));
    }

    #[test]
    fn test_nonblocking_read() {
        let (mut driver, sensor) = mono_driver(1, 8, 4);
        driver.start().unwrap();
        sensor.trigger().unwrap();
        assert!(driver.read_nonblocking(10).is_ok());
        assert!(matches!(driver.read_nonblocking(1), Err(CameraError::Timeout)));
    }

    #[test]
    fn test_release_is_idempotent() {
        let (driver, sensor) = mono_driver(3, 8, 4);
        driver.start().unwrap();
        driver.release().unwrap();
        assert!(driver.buffer_states().is_empty());
        assert_eq!(sensor.attached_buffers(), 0);
        assert!(!sensor.is_streaming());
        driver.release().unwrap();
        assert!(!driver.is_opened());
    }

    #[test]
    fn test_open_after_release_reallocates() {
        let (driver, _) = mono_driver(2, 8, 4);
        driver.start().unwrap();
        driver.release().unwrap();
        driver.open().unwrap();
        assert_eq!(driver.buffer_states().len(), 2);
    }

    #[test]
    fn test_pixel_format_locked_while_started() {
        let (driver, _) = mono_driver(1, 8, 4);
        driver.start().unwrap();
        assert!(matches!(driver.set_pixel_format("RGB8"), Err(CameraError::AlreadyStarted)));
    }

    #[test]
    fn test_bayer_frames_are_bgr() {
        let sensor = SimulatedSensor::new("SNB");
        let mut config = CameraConfig::area_array("bayer", "SNB");
        config.width = 6;
        config.height = 4;
        config.pixel_format = "BayerGB8".to_string();
        let driver = CameraDriver::new(config, SimulatedDevice::new(sensor.clone()));
        driver.start().unwrap();
        sensor.trigger().unwrap();
        let frame = driver.read(10).unwrap();
        assert_eq!(frame.channels, 3);
        assert_eq!(frame.data.len(), 6 * 4 * 3);
    }

    #[test]
    fn test_restart_recovers_after_read_failure() {
        let (driver, sensor) = mono_driver(2, 8, 4);
        driver.start().unwrap();
        sensor.set_online(false);
        assert!(driver.read(5).is_err());

        sensor.set_online(true);
        driver.restart().unwrap();
        assert!(driver.is_started());
        sensor.trigger().unwrap();
        assert!(driver.read(10).is_ok());
    }

    #[test]
    fn test_failed_restart_leaves_camera_stopped() {
        let (driver, sensor) = mono_driver(2, 8, 4);
        driver.start().unwrap();
        sensor.set_present(false);
        assert!(driver.restart().is_err());
        assert!(!driver.is_started());
        assert!(driver.last_error().is_some());

        sensor.set_present(true);
        driver.restart().unwrap();
        assert!(driver.is_started());
    }

    #[test]
    fn test_shutdown_closes_device() {
        let (driver, sensor) = mono_driver(2, 8, 4);
        driver.start().unwrap();
        driver.shutdown().unwrap();
        assert!(!driver.is_started());
        assert!(!driver.is_opened());
        assert!(!sensor.is_open());
        assert!(!sensor.runtime_active());
        assert_eq!(sensor.attached_buffers(), 0);

        driver.start().unwrap();
        assert!(driver.is_started());
    }

    #[test]
    fn test_negative_dimension_rejected() {
        let (driver, sensor) = mono_driver(1, 16, 8);
        sensor.reject_feature(feature::WIDTH);
        sensor.force_feature(feature::WIDTH, FeatureValue::Int(-1));
        assert!(matches!(driver.start(), Err(CameraError::Format(_))));
        assert!(driver.buffer_states().is_empty());
        assert!(!driver.is_started());
    }

    #[test]
    fn test_read_timeout_follows_config() {
        let (driver, _sensor) = mono_driver(1, 16, 8);
        assert_eq!(driver.read_timeout_ms(), DEFAULT_READ_TIMEOUT_MS);
    }

    #[test]
    fn test_drop_tears_down_device() {
        let (driver, sensor) = mono_driver(2, 8, 4);
        driver.start().unwrap();
        drop(driver);
        assert!(!sensor.runtime_active());
        assert!(!sensor.is_open());
        assert_eq!(sensor.attached_buffers(), 0);
    }

    #[test]
    fn test_transpose_applied() {
        let sensor = SimulatedSensor::new("SNT");
        let mut config = CameraConfig::area_array("t", "SNT");
        config.pixel_format = "Mono8".to_string();
        config.width = 8;
        config.height = 4;
        config.transpose = true;
        let driver = CameraDriver::new(config, SimulatedDevice::new(sensor.clone()));
        driver.start().unwrap();
        sensor.trigger().unwrap();
        let frame = driver.read(10).unwrap();
        assert_eq!((frame.width, frame.height), (4, 8));
    }

    fn line_scan(overlap: u32, height: u32) -> (CameraDriver<SimulatedDevice>, SimulatedSensor) {
        let sensor = SimulatedSensor::new("SNL");
        let mut config = CameraConfig::line_scan("line", "SNL");
        config.pixel_format = "Mono8".to_string();
        config.width = 16;
        config.height = height;
        config.overlap = overlap;
        config.buffer_count = 2;
        let driver = CameraDriver::new(config, SimulatedDevice::new(sensor.clone()));
        (driver, sensor)
    }

    #[test]
    fn test_first_frame_overlap_is_white() {
        let (driver, sensor) = line_scan(3, 10);
        driver.start().unwrap();
        sensor.trigger().unwrap();
        let frame = driver.read(10).unwrap();
        assert_eq!(frame.height, 13);
        assert!(frame.rows(0, 3).unwrap().iter().all(|&v| v == 255));
    }

    #[test]
    fn test_area_array_ignores_overlap() {
        let sensor = SimulatedSensor::new("SNA");
        let mut config = CameraConfig::area_array("a", "SNA");
        config.pixel_format = "Mono8".to_string();
        config.width = 8;
        config.height = 4;
        config.overlap = 2;
        let driver = CameraDriver::new(config, SimulatedDevice::new(sensor.clone()));
        driver.start().unwrap();
        sensor.trigger().unwrap();
        assert_eq!(driver.read(10).unwrap().height, 4);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn prop_overlap_round_trip(overlap in 1u32..6, height in 2u32..12, frames in 2usize..6) {
            let (driver, sensor) = line_scan(overlap, height);
            driver.start().unwrap();
            let mut previous: Option<Frame> = None;
            for _ in 0..frames {
                sensor.trigger().unwrap();
                let frame = driver.read(50).unwrap();
                prop_assert_eq!(frame.height, height + overlap);
                if let Some(prev) = &previous {
                    let tail = prev.rows(prev.height - overlap, overlap).unwrap();
                    let head = frame.rows(0, overlap).unwrap();
                    prop_assert_eq!(tail, head);
                }
                previous = Some(frame);
            }
        }

        #[test]
        fn prop_ring_has_exactly_n_buffers(n in 1usize..8) {
            let (driver, sensor) = mono_driver(n, 4, 2);
            driver.start().unwrap();
            prop_assert_eq!(driver.buffer_states().len(), n);
            for _ in 0..n {
                sensor.trigger().unwrap();
            }
            prop_assert!(driver.buffer_states().iter().all(|s| *s == BufferState::Full));
            driver.release().unwrap();
            prop_assert!(driver.buffer_states().is_empty());
        }
    }
}
