//! Sensor pixel formats and conversion to the pipeline layout
//!
//! Mono sensors stay single-channel. Bayer and RGB sensors are converted to
//! interleaved BGR888, the layout every downstream stage expects.

use crate::CameraError;
use std::fmt;
use std::str::FromStr;

/// Supported sensor pixel formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Mono8,
    BayerGR8,
    BayerRG8,
    BayerGB8,
    BayerBG8,
    Rgb8,
}

/// Colour plane index in a Bayer mosaic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Plane {
    R = 0,
    G = 1,
    B = 2,
}

impl PixelFormat {
    /// Every format the driver accepts
    pub const ALL: [PixelFormat; 6] = [
        PixelFormat::Mono8,
        PixelFormat::BayerGR8,
        PixelFormat::BayerRG8,
        PixelFormat::BayerGB8,
        PixelFormat::BayerBG8,
        PixelFormat::Rgb8,
    ];

    /// GenICam feature string
    pub fn as_str(&self) -> &'static str {
        match self {
            PixelFormat::Mono8 => "Mono8",
            PixelFormat::BayerGR8 => "BayerGR8",
            PixelFormat::BayerRG8 => "BayerRG8",
            PixelFormat::BayerGB8 => "BayerGB8",
            PixelFormat::BayerBG8 => "BayerBG8",
            PixelFormat::Rgb8 => "RGB8",
        }
    }

    /// Bytes per pixel as transferred by the device
    pub fn source_bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Rgb8 => 3,
            _ => 1,
        }
    }

    /// Channels per pixel after conversion
    pub fn output_channels(&self) -> u8 {
        match self {
            PixelFormat::Mono8 => 1,
            _ => 3,
        }
    }

    /// Whether this is a colour-filter-array format
    pub fn is_bayer(&self) -> bool {
        self.mosaic().is_some()
    }

    /// 2x2 colour layout, row-major, starting at the top-left pixel
    fn mosaic(&self) -> Option<[[Plane; 2]; 2]> {
        use Plane::*;
        match self {
            PixelFormat::BayerRG8 => Some([[R, G], [G, B]]),
            PixelFormat::BayerGR8 => Some([[G, R], [B, G]]),
            PixelFormat::BayerGB8 => Some([[G, B], [R, G]]),
            PixelFormat::BayerBG8 => Some([[B, G], [G, R]]),
            _ => None,
        }
    }

    /// Raw buffer size for a `width x height` frame
    pub fn buffer_size(&self, width: u32, height: u32) -> usize {
        width as usize * height as usize * self.source_bytes_per_pixel()
    }

    /// Convert one raw buffer into the pipeline layout (mono or BGR888)
    pub fn convert(&self, raw: &[u8], width: u32, height: u32) -> Result<Vec<u8>, CameraError> {
        let expected = self.buffer_size(width, height);
        if raw.len() < expected {
            return Err(CameraError::Format(format!(
                "{} buffer holds {} bytes, need {}",
                self.as_str(),
                raw.len(),
                expected
            )));
        }
        let raw = &raw[..expected];

        Ok(match self {
            PixelFormat::Mono8 => raw.to_vec(),
            PixelFormat::Rgb8 => rgb_to_bgr(raw),
            bayer => match bayer.mosaic() {
                Some(mosaic) => demosaic(raw, width as usize, height as usize, mosaic),
                None => raw.to_vec(),
            },
        })
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PixelFormat {
    type Err = CameraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PixelFormat::ALL
            .iter()
            .copied()
            .find(|f| f.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| CameraError::UnsupportedPixelFormat(s.to_string()))
    }
}

fn rgb_to_bgr(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    for px in raw.chunks_exact(3) {
        out.extend_from_slice(&[px[2], px[1], px[0]]);
    }
    out
}

/// Bilinear demosaic into BGR888
///
/// Each missing colour is the mean of the same-colour pixels inside the
/// 3x3 neighbourhood (clipped at the borders).
fn demosaic(raw: &[u8], width: usize, height: usize, mosaic: [[Plane; 2]; 2]) -> Vec<u8> {
    let plane_at = |x: usize, y: usize| mosaic[y & 1][x & 1];
    let mut out = vec![0u8; width * height * 3];

    for y in 0..height {
        for x in 0..width {
            let own = plane_at(x, y);
            let mut sum = [0u32; 3];
            let mut count = [0u32; 3];

            for ny in y.saturating_sub(1)..=(y + 1).min(height - 1) {
                for nx in x.saturating_sub(1)..=(x + 1).min(width - 1) {
                    let p = plane_at(nx, ny) as usize;
                    sum[p] += raw[ny * width + nx] as u32;
                    count[p] += 1;
                }
            }

            let mut rgb = [0u8; 3];
            for plane in 0..3 {
                rgb[plane] = if plane == own as usize {
                    raw[y * width + x]
                } else if count[plane] > 0 {
                    ((sum[plane] + count[plane] / 2) / count[plane]) as u8
                } else {
                    0
                };
            }

            let o = (y * width + x) * 3;
            out[o] = rgb[Plane::B as usize];
            out[o + 1] = rgb[Plane::G as usize];
            out[o + 2] = rgb[Plane::R as usize];
        }
    }
    out
}
