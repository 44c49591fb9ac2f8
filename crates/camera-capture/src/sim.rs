//! Simulated acquisition device
//!
//! Stands in for the vendor SDK in tests and in hardware-free deployments.
//! [`SimulatedSensor`] is the shared control handle: it fires frames into
//! the bound buffer ring and injects faults (offline, missing device,
//! rejected features, zero stream channels).

use crate::device::{
    feature, AcquisitionDevice, DeviceError, DeviceInfo, FeatureValue, StreamSettings,
};
use crate::pixel::PixelFormat;
use ring_buffer::{BufferRing, RingError};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug)]
struct SensorState {
    devices: Vec<DeviceInfo>,
    present: bool,
    features: HashMap<String, FeatureValue>,
    stream_channels: u32,
    online: bool,
    fail_open: bool,
    rejected: HashSet<String>,
    runtime_up: bool,
    opened: Option<String>,
    ring: Option<Arc<BufferRing>>,
    attached: BTreeSet<usize>,
    stream_settings: Option<StreamSettings>,
    streaming: bool,
    next_line: u64,
    dropped: u64,
}

/// Shared control handle for a simulated camera
#[derive(Debug, Clone)]
pub struct SimulatedSensor(Arc<Mutex<SensorState>>);

impl SimulatedSensor {
    /// One reachable device with serial number `serial`
    pub fn new(serial: &str) -> Self {
        let mut features = HashMap::new();
        features.insert(feature::WIDTH.to_string(), FeatureValue::Int(640));
        features.insert(feature::HEIGHT.to_string(), FeatureValue::Int(480));
        features.insert(
            feature::PIXEL_FORMAT.to_string(),
            FeatureValue::Enum(PixelFormat::Mono8.as_str().to_string()),
        );

        Self(Arc::new(Mutex::new(SensorState {
            devices: vec![DeviceInfo {
                serial_number: serial.to_string(),
                model: "SIM-LINE".to_string(),
                device_class: "GigEVision".to_string(),
            }],
            present: true,
            features,
            stream_channels: 1,
            online: true,
            fail_open: false,
            rejected: HashSet::new(),
            runtime_up: false,
            opened: None,
            ring: None,
            attached: BTreeSet::new(),
            stream_settings: None,
            streaming: false,
            next_line: 0,
            dropped: 0,
        })))
    }

    fn lock(&self) -> Result<MutexGuard<'_, SensorState>, DeviceError> {
        self.0
            .lock()
            .map_err(|e| DeviceError::Runtime(format!("Lock error: {}", e)))
    }

    fn update(&self, f: impl FnOnce(&mut SensorState)) {
        if let Ok(mut s) = self.0.lock() {
            f(&mut s);
        }
    }

    fn read<R: Default>(&self, f: impl FnOnce(&SensorState) -> R) -> R {
        self.0.lock().map(|s| f(&s)).unwrap_or_default()
    }

    /// Simulate cable pull / reconnect
    pub fn set_online(&self, online: bool) {
        self.update(|s| s.online = online);
    }

    /// Hide the device from enumeration
    pub fn set_present(&self, present: bool) {
        self.update(|s| s.present = present);
    }

    /// Make `open_device` fail with a transport error
    pub fn set_fail_open(&self, fail: bool) {
        self.update(|s| s.fail_open = fail);
    }

    pub fn set_stream_channels(&self, channels: u32) {
        self.update(|s| s.stream_channels = channels);
    }

    /// Reject every write to `name`
    pub fn reject_feature(&self, name: &str) {
        self.update(|s| {
            s.rejected.insert(name.to_string());
        });
    }

    /// Force a feature value as if the device negotiated it
    pub fn force_feature(&self, name: &str, value: FeatureValue) {
        self.update(|s| {
            s.features.insert(name.to_string(), value);
        });
    }

    pub fn feature(&self, name: &str) -> Option<FeatureValue> {
        self.read(|s| s.features.get(name).cloned())
    }

    pub fn is_streaming(&self) -> bool {
        self.read(|s| s.streaming)
    }

    pub fn runtime_active(&self) -> bool {
        self.read(|s| s.runtime_up)
    }

    pub fn is_open(&self) -> bool {
        self.read(|s| s.opened.is_some())
    }

    /// Buffers currently attached to the stream
    pub fn attached_buffers(&self) -> usize {
        self.read(|s| s.attached.len())
    }

    pub fn stream_settings(&self) -> Option<StreamSettings> {
        self.read(|s| s.stream_settings.clone())
    }

    /// Frames lost because every buffer was still unread
    pub fn dropped_frames(&self) -> u64 {
        self.read(|s| s.dropped)
    }

    /// Transfer one complete frame into the ring
    pub fn trigger(&self) -> Result<usize, DeviceError> {
        self.transfer(true)
    }

    /// Transfer one frame with lost packets
    pub fn trigger_incomplete(&self) -> Result<usize, DeviceError> {
        self.transfer(false)
    }

    fn transfer(&self, complete: bool) -> Result<usize, DeviceError> {
        let mut s = self.lock()?;
        if !s.online {
            return Err(DeviceError::Offline);
        }
        if !s.streaming {
            return Err(DeviceError::Stream("stream not started".to_string()));
        }
        let ring = s
            .ring
            .clone()
            .ok_or_else(|| DeviceError::Stream("no stream".to_string()))?;

        let width = s.features.get(feature::WIDTH).and_then(FeatureValue::as_int).unwrap_or(0) as usize;
        let height = s.features.get(feature::HEIGHT).and_then(FeatureValue::as_int).unwrap_or(0) as usize;
        let bpp = s
            .features
            .get(feature::PIXEL_FORMAT)
            .and_then(FeatureValue::as_str)
            .and_then(|f| f.parse::<PixelFormat>().ok())
            .map(|f| f.source_bytes_per_pixel())
            .unwrap_or(1);

        let row = width * bpp;
        let mut payload = Vec::with_capacity(row * height);
        for r in 0..height as u64 {
            payload.extend(std::iter::repeat(((s.next_line + r) % 256) as u8).take(row));
        }

        match ring.write_next(&payload, complete) {
            Ok(index) => {
                s.next_line += height as u64;
                Ok(index)
            }
            Err(RingError::Overrun(index)) => {
                s.dropped += 1;
                Err(DeviceError::Stream(format!("buffer {} still unread", index)))
            }
            Err(e) => Err(DeviceError::Stream(e.to_string())),
        }
    }
}

struct Pump {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// [`AcquisitionDevice`] backed by a [`SimulatedSensor`]
pub struct SimulatedDevice {
    sensor: SimulatedSensor,
    frame_interval: Option<Duration>,
    pump: Option<Pump>,
}

impl SimulatedDevice {
    /// Device that only produces frames on [`SimulatedSensor::trigger`]
    pub fn new(sensor: SimulatedSensor) -> Self {
        Self {
            sensor,
            frame_interval: None,
            pump: None,
        }
    }

    /// Device that fires a frame every `interval` while streaming
    pub fn free_running(sensor: SimulatedSensor, interval: Duration) -> Self {
        Self {
            sensor,
            frame_interval: Some(interval),
            pump: None,
        }
    }

    pub fn sensor(&self) -> &SimulatedSensor {
        &self.sensor
    }

    fn stop_pump(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.stop.store(true, Ordering::SeqCst);
            let _ = pump.handle.join();
        }
    }

    fn require_open(s: &SensorState) -> Result<(), DeviceError> {
        if s.opened.is_none() {
            return Err(DeviceError::NotOpen);
        }
        Ok(())
    }
}

impl AcquisitionDevice for SimulatedDevice {
    fn init_runtime(&mut self) -> Result<(), DeviceError> {
        self.sensor.lock()?.runtime_up = true;
        Ok(())
    }

    fn terminate_runtime(&mut self) {
        self.stop_pump();
        self.sensor.update(|s| {
            s.runtime_up = false;
            s.opened = None;
            s.streaming = false;
        });
    }

    fn enumerate(&mut self) -> Result<Vec<DeviceInfo>, DeviceError> {
        let s = self.sensor.lock()?;
        if !s.runtime_up {
            return Err(DeviceError::Runtime("runtime not initialised".to_string()));
        }
        Ok(if s.present { s.devices.clone() } else { Vec::new() })
    }

    fn open_device(&mut self, serial: &str) -> Result<(), DeviceError> {
        let mut s = self.sensor.lock()?;
        if !s.runtime_up {
            return Err(DeviceError::Runtime("runtime not initialised".to_string()));
        }
        if s.fail_open || !s.present {
            return Err(DeviceError::Transport(format!("cannot open {}", serial)));
        }
        if !s.devices.iter().any(|d| d.serial_number == serial) {
            return Err(DeviceError::Transport(format!("no device {}", serial)));
        }
        s.opened = Some(serial.to_string());
        info!("Simulated device {} opened", serial);
        Ok(())
    }

    fn close_device(&mut self) -> Result<(), DeviceError> {
        let mut s = self.sensor.lock()?;
        if s.opened.take().is_none() {
            return Err(DeviceError::NotOpen);
        }
        Ok(())
    }

    fn is_online(&self) -> bool {
        self.sensor.read(|s| s.online && s.opened.is_some())
    }

    fn set_feature(&mut self, name: &str, value: FeatureValue) -> Result<(), DeviceError> {
        let mut s = self.sensor.lock()?;
        Self::require_open(&s)?;
        if s.rejected.contains(name) {
            return Err(DeviceError::Feature {
                name: name.to_string(),
                reason: "access denied".to_string(),
            });
        }
        let locked = [feature::WIDTH, feature::HEIGHT, feature::PIXEL_FORMAT];
        if s.streaming && locked.contains(&name) {
            return Err(DeviceError::Feature {
                name: name.to_string(),
                reason: "locked while streaming".to_string(),
            });
        }
        s.features.insert(name.to_string(), value);
        Ok(())
    }

    fn feature(&self, name: &str) -> Result<FeatureValue, DeviceError> {
        let s = self.sensor.lock()?;
        Self::require_open(&s)?;
        s.features.get(name).cloned().ok_or_else(|| DeviceError::Feature {
            name: name.to_string(),
            reason: "not implemented".to_string(),
        })
    }

    fn stream_count(&self) -> Result<u32, DeviceError> {
        let s = self.sensor.lock()?;
        Self::require_open(&s)?;
        Ok(s.stream_channels)
    }

    fn create_stream(&mut self, ring: Arc<BufferRing>) -> Result<(), DeviceError> {
        let mut s = self.sensor.lock()?;
        Self::require_open(&s)?;
        if s.ring.is_some() {
            return Err(DeviceError::Stream("stream already created".to_string()));
        }
        s.ring = Some(ring);
        s.attached.insert(0);
        Ok(())
    }

    fn attach_buffer(&mut self, index: usize) -> Result<(), DeviceError> {
        let mut s = self.sensor.lock()?;
        let len = s
            .ring
            .as_ref()
            .map(|r| r.len())
            .ok_or_else(|| DeviceError::Stream("no stream".to_string()))?;
        if index >= len {
            return Err(DeviceError::Stream(format!("buffer {} out of range", index)));
        }
        s.attached.insert(index);
        Ok(())
    }

    fn detach_buffer(&mut self, index: usize) -> Result<(), DeviceError> {
        let mut s = self.sensor.lock()?;
        if s.ring.is_none() {
            return Err(DeviceError::Stream("no stream".to_string()));
        }
        if !s.attached.remove(&index) {
            return Err(DeviceError::Stream(format!("buffer {} not attached", index)));
        }
        Ok(())
    }

    fn configure_stream(&mut self, settings: &StreamSettings) -> Result<(), DeviceError> {
        let mut s = self.sensor.lock()?;
        if s.ring.is_none() {
            return Err(DeviceError::Stream("no stream".to_string()));
        }
        s.stream_settings = Some(settings.clone());
        Ok(())
    }

    fn start_stream(&mut self) -> Result<(), DeviceError> {
        {
            let mut s = self.sensor.lock()?;
            if s.ring.is_none() {
                return Err(DeviceError::Stream("no stream".to_string()));
            }
            if !s.online {
                return Err(DeviceError::Offline);
            }
            s.streaming = true;
        }

        if let Some(interval) = self.frame_interval {
            self.stop_pump();
            let stop = Arc::new(AtomicBool::new(false));
            let stop_clone = stop.clone();
            let sensor = self.sensor.clone();
            let handle = std::thread::spawn(move || {
                while !stop_clone.load(Ordering::SeqCst) {
                    std::thread::sleep(interval);
                    if let Err(e) = sensor.trigger() {
                        debug!("Simulated frame not delivered: {}", e);
                    }
                }
            });
            self.pump = Some(Pump { stop, handle });
        }
        Ok(())
    }

    fn stop_stream(&mut self) -> Result<(), DeviceError> {
        self.stop_pump();
        self.sensor.lock()?.streaming = false;
        Ok(())
    }

    fn free_stream(&mut self) -> Result<(), DeviceError> {
        let mut s = self.sensor.lock()?;
        if !s.attached.is_empty() {
            return Err(DeviceError::Stream(format!(
                "{} buffers still attached",
                s.attached.len()
            )));
        }
        s.ring = None;
        s.stream_settings = None;
        Ok(())
    }
}

impl Drop for SimulatedDevice {
    fn drop(&mut self) {
        self.stop_pump();
    }
}
