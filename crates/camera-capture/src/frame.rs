//! Frame type shared by drivers, workflows and the result cache

use crate::CameraError;
use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, Rgb, RgbImage};
use std::path::Path;

/// Interleaved 8-bit image, either mono (1 channel) or BGR (3 channels)
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Pixel data, row-major, `width * height * channels` bytes
    pub data: Vec<u8>,
    /// Frame width
    pub width: u32,
    /// Frame height
    pub height: u32,
    /// 1 = mono, 3 = BGR
    pub channels: u8,
    /// Capture timestamp (nanoseconds since the epoch)
    pub timestamp_ns: u64,
    /// Per-camera sequence number
    pub sequence: u64,
}

impl Frame {
    /// Create a frame from raw interleaved data
    pub fn new(data: Vec<u8>, width: u32, height: u32, channels: u8) -> Result<Self, CameraError> {
        let expected = width as usize * height as usize * channels as usize;
        if data.len() != expected || !(channels == 1 || channels == 3) {
            return Err(CameraError::Format(format!(
                "{}x{}x{} frame needs {} bytes, got {}",
                width,
                height,
                channels,
                expected,
                data.len()
            )));
        }
        Ok(Self {
            data,
            width,
            height,
            channels,
            timestamp_ns: now_ns(),
            sequence: 0,
        })
    }

    /// Frame filled with a single value
    pub fn filled(width: u32, height: u32, channels: u8, value: u8) -> Self {
        Self {
            data: vec![value; width as usize * height as usize * channels as usize],
            width,
            height,
            channels,
            timestamp_ns: now_ns(),
            sequence: 0,
        }
    }

    /// Attach a sequence number
    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    /// Whether the frame has no pixels
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Bytes per row
    pub fn row_bytes(&self) -> usize {
        self.width as usize * self.channels as usize
    }

    /// Bytes of `count` rows starting at `start`
    pub fn rows(&self, start: u32, count: u32) -> Option<&[u8]> {
        if start.checked_add(count)? > self.height {
            return None;
        }
        let rb = self.row_bytes();
        let from = start as usize * rb;
        Some(&self.data[from..from + count as usize * rb])
    }

    /// Pixel at (x, y)
    pub fn pixel(&self, x: u32, y: u32) -> Option<&[u8]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let c = self.channels as usize;
        let idx = (y as usize * self.width as usize + x as usize) * c;
        Some(&self.data[idx..idx + c])
    }

    /// Expand a mono frame to BGR; BGR frames are returned as-is
    pub fn to_bgr(&self) -> Frame {
        if self.channels == 3 {
            return self.clone();
        }
        let mut data = Vec::with_capacity(self.data.len() * 3);
        for &v in &self.data {
            data.extend_from_slice(&[v, v, v]);
        }
        Frame {
            data,
            channels: 3,
            ..*self
        }
    }

    /// Raw pixel view for `image` operations; BGR bytes ride in an RGB buffer
    fn to_dynamic(&self) -> Option<DynamicImage> {
        match self.channels {
            1 => GrayImage::from_raw(self.width, self.height, self.data.clone()).map(DynamicImage::ImageLuma8),
            3 => RgbImage::from_raw(self.width, self.height, self.data.clone()).map(DynamicImage::ImageRgb8),
            _ => None,
        }
    }

    fn with_pixels(&self, img: DynamicImage, width: u32, height: u32) -> Frame {
        Frame {
            data: img.into_bytes(),
            width,
            height,
            ..*self
        }
    }

    /// Swap rows and columns; malformed frames are returned unchanged
    pub fn transpose(&self) -> Frame {
        match self.to_dynamic() {
            Some(img) => self.with_pixels(img.rotate90().fliph(), self.height, self.width),
            None => self.clone(),
        }
    }

    /// Nearest-neighbour rescale by `scale` (at least 1x1)
    pub fn scaled(&self, scale: f64) -> Frame {
        if (scale - 1.0).abs() < f64::EPSILON || self.is_empty() {
            return self.clone();
        }
        let new_w = ((self.width as f64 * scale).round() as u32).max(1);
        let new_h = ((self.height as f64 * scale).round() as u32).max(1);
        match self.to_dynamic() {
            Some(img) => self.with_pixels(img.resize_exact(new_w, new_h, FilterType::Nearest), new_w, new_h),
            None => self.clone(),
        }
    }

    /// Mean intensity over all channels
    pub fn mean_intensity(&self) -> f64 {
        if self.data.is_empty() {
            return 0.0;
        }
        let sum: u64 = self.data.iter().map(|&v| v as u64).sum();
        sum as f64 / self.data.len() as f64
    }

    /// Convert to an `image` RGB buffer
    pub fn to_rgb_image(&self) -> RgbImage {
        let bgr = self.to_bgr();
        RgbImage::from_fn(bgr.width, bgr.height, |x, y| {
            let i = (y as usize * bgr.width as usize + x as usize) * 3;
            Rgb([bgr.data[i + 2], bgr.data[i + 1], bgr.data[i]])
        })
    }

    /// Build a BGR frame from an `image` RGB buffer
    pub fn from_rgb_image(img: &RgbImage) -> Frame {
        let mut data = Vec::with_capacity(img.as_raw().len());
        for px in img.pixels() {
            data.extend_from_slice(&[px[2], px[1], px[0]]);
        }
        Frame {
            data,
            width: img.width(),
            height: img.height(),
            channels: 3,
            timestamp_ns: now_ns(),
            sequence: 0,
        }
    }

    /// Load any image file the `image` crate understands
    pub fn load(path: &Path) -> Result<Frame, CameraError> {
        let img = image::open(path)
            .map_err(|e| CameraError::Image(format!("{}: {}", path.display(), e)))?;
        Ok(Frame::from_rgb_image(&img.to_rgb8()))
    }

    /// Save as an image file; format follows the extension
    pub fn save(&self, path: &Path) -> Result<(), CameraError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.to_rgb_image()
            .save(path)
            .map_err(|e| CameraError::Image(format!("{}: {}", path.display(), e)))
    }
}

/// Wall-clock timestamp in nanoseconds
pub(crate) fn now_ns() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
