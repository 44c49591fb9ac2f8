//! Mock camera
//!
//! Replays image files from a directory in a loop, or renders a moving
//! synthetic pattern when no directory is configured.

use crate::config::{CameraConfig, CameraKind, DEFAULT_READ_TIMEOUT_MS};
use crate::frame::Frame;
use crate::{Camera, CameraError};
use ring_buffer::BufferState;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::{debug, info, warn};

const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

struct MockInner {
    config: CameraConfig,
    images: Vec<PathBuf>,
    next: usize,
    sequence: u64,
}

/// Hardware-free camera
pub struct MockCamera {
    name: String,
    inner: Mutex<MockInner>,
    started: AtomicBool,
    opened: AtomicBool,
    total_frames: AtomicU64,
    pending_failures: AtomicU32,
    last_error: Mutex<Option<String>>,
}

impl MockCamera {
    pub fn new(mut config: CameraConfig) -> Self {
        if !config.device_name.starts_with("Mock") {
            config.device_name = format!("Mock-{}", config.device_name);
        }
        info!("Creating mock camera {} ({})", config.name, config.device_name);
        Self {
            name: config.name.clone(),
            inner: Mutex::new(MockInner {
                config,
                images: Vec::new(),
                next: 0,
                sequence: 0,
            }),
            started: AtomicBool::new(false),
            opened: AtomicBool::new(false),
            total_frames: AtomicU64::new(0),
            pending_failures: AtomicU32::new(0),
            last_error: Mutex::new(None),
        }
    }

    /// Fail the next `count` reads with `DeviceOffline`
    pub fn inject_read_failures(&self, count: u32) {
        self.pending_failures.store(count, Ordering::SeqCst);
    }

    /// Number of replay images found on open
    pub fn image_count(&self) -> usize {
        self.inner.lock().map(|i| i.images.len()).unwrap_or(0)
    }

    fn track<T>(&self, result: Result<T, CameraError>) -> Result<T, CameraError> {
        if let Ok(mut last) = self.last_error.lock() {
            *last = result.as_ref().err().map(|e| format!("{}: {}", self.name, e));
        }
        result
    }

    fn open_inner(&self) -> Result<(), CameraError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|e| CameraError::Lock(e.to_string()))?;
        if let Some(dir) = inner.config.mock_path.clone() {
            inner.images = list_images(Path::new(&dir))?;
            if inner.images.is_empty() {
                warn!("Mock camera {}: no images in {}, using pattern", self.name, dir);
            }
        }
        inner.next = 0;
        self.opened.store(true, Ordering::SeqCst);
        debug!("Mock camera {} open with {} images", self.name, inner.images.len());
        Ok(())
    }

    fn next_frame(&self) -> Result<Frame, CameraError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|e| CameraError::Lock(e.to_string()))?;
        inner.sequence += 1;
        let sequence = inner.sequence;

        let frame = if inner.images.is_empty() {
            pattern(inner.config.width, inner.config.height, sequence)
        } else {
            let path = inner.images[inner.next % inner.images.len()].clone();
            inner.next = (inner.next + 1) % inner.images.len();
            Frame::load(&path)?
        };

        let frame = frame.with_sequence(sequence);
        Ok(if inner.config.transpose {
            frame.transpose()
        } else {
            frame
        })
    }
}

/// Sorted image files in `dir`
fn list_images(dir: &Path) -> Result<Vec<PathBuf>, CameraError> {
    let mut images: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
                .unwrap_or(false)
        })
        .collect();
    images.sort();
    Ok(images)
}

/// Diagonal BGR gradient shifted by the sequence number
fn pattern(width: u32, height: u32, sequence: u64) -> Frame {
    let (w, h) = (width.max(1), height.max(1));
    let shift = (sequence * 8) as u32;
    let mut data = Vec::with_capacity(w as usize * h as usize * 3);
    for y in 0..h {
        for x in 0..w {
            let v = ((x + y + shift) % 256) as u8;
            data.extend_from_slice(&[v, v / 2, 255 - v]);
        }
    }
    let mut frame = Frame::filled(w, h, 3, 0);
    frame.data = data;
    frame
}

impl Camera for MockCamera {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> CameraKind {
        CameraKind::Mock
    }

    fn start(&self) -> Result<(), CameraError> {
        if self.started.load(Ordering::SeqCst) {
            return self.track(Ok(()));
        }
        let result = self.open_inner();
        if result.is_ok() {
            self.started.store(true, Ordering::SeqCst);
            info!("Mock camera {} started", self.name);
        }
        self.track(result)
    }

    fn open(&self) -> Result<(), CameraError> {
        let result = self.open_inner();
        self.track(result)
    }

    fn read(&self, _timeout_ms: i64) -> Result<Frame, CameraError> {
        if !self.started.load(Ordering::SeqCst) {
            return self.track(Err(CameraError::NotStarted));
        }
        let injected = self
            .pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return self.track(Err(CameraError::DeviceOffline));
        }
        let result = self.next_frame();
        if result.is_ok() {
            self.total_frames.fetch_add(1, Ordering::Relaxed);
        }
        self.track(result)
    }

    fn release(&self) -> Result<(), CameraError> {
        self.opened.store(false, Ordering::SeqCst);
        self.track(Ok(()))
    }

    fn restart(&self) -> Result<(), CameraError> {
        warn!("Restarting mock camera {}", self.name);
        self.started.store(false, Ordering::SeqCst);
        self.opened.store(false, Ordering::SeqCst);
        self.start()
    }

    fn shutdown(&self) -> Result<(), CameraError> {
        self.started.store(false, Ordering::SeqCst);
        self.opened.store(false, Ordering::SeqCst);
        info!("Mock camera {} shut down", self.name);
        self.track(Ok(()))
    }

    fn apply_config(&self) -> Result<(), CameraError> {
        debug!("Mock camera {} ignores config apply", self.name);
        self.track(Ok(()))
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
        let _: crate::pixel::PixelFormat = format.parse()?;
        let mut inner = self
            .inner
            .lock()
            .map_err(|e| CameraError::Lock(e.to_string()))?;
        inner.config.pixel_format = format.to_string();
        Ok(())
    }

    fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|e| e.clone())
    }

    fn total_frames(&self) -> u64 {
        self.total_frames.load(Ordering::Relaxed)
    }

    fn is_mock(&self) -> bool {
        true
    }

    fn buffer_states(&self) -> Vec<BufferState> {
        Vec::new()
    }
}
