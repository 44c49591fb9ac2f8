//! Camera configuration
//!
//! One `CameraConfig` per physical camera. Values are only pushed to the
//! device when the driver applies them.

use crate::device::{feature, FeatureValue};
use crate::CameraError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::warn;

/// Camera family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraKind {
    /// Continuous line-scan sensor (supports overlap stitching)
    LineScan,
    /// Area-array sensor
    AreaArray,
    /// File/pattern replay, no hardware
    Mock,
}

/// Hardware trigger mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerMode {
    Off,
    On,
}

impl TriggerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerMode::Off => "Off",
            TriggerMode::On => "On",
        }
    }
}

/// Camera configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Logical name used by the camera manager and workflows
    pub name: String,
    /// Device serial number matched during enumeration
    pub device_name: String,
    /// Transport class (e.g. "GigEVision")
    pub device_class: String,
    /// Camera family
    pub kind: CameraKind,
    /// Image width (pixels)
    pub width: u32,
    /// Image height (pixels, lines per frame for line-scan)
    pub height: u32,
    /// Frame or line rate
    pub fps: f64,
    pub offset_x: u32,
    pub offset_y: u32,
    /// Exposure time (microseconds)
    pub exposure: f64,
    /// Analog gain
    pub gain: f64,
    pub gamma_enable: bool,
    /// Gamma value, ignored unless `gamma_enable`
    pub gamma: f64,
    pub trigger_mode: TriggerMode,
    pub trigger_source: String,
    /// Line debouncing period (microseconds)
    pub debouncer: f64,
    /// Sensor pixel format name, validated when the camera opens
    pub pixel_format: String,
    /// GigE packet size (bytes)
    pub packet_size: u32,
    /// GigE inter-packet delay (ticks)
    pub inter_packet_delay: u32,
    /// Acquisition thread priority
    pub priority: u32,
    pub soft_trigger: bool,
    pub soft_trigger_wait_ms: u64,
    /// Number of acquisition buffers in the ring
    pub buffer_count: usize,
    /// Rows carried over between line-scan frames
    pub overlap: u32,
    /// Swap rows and columns after conversion
    pub transpose: bool,
    /// Read timeout in milliseconds, -1 waits forever
    pub read_timeout_ms: i64,
    /// Image directory replayed by mock cameras
    pub mock_path: Option<String>,
}

/// Read timeout used when none is configured
pub const DEFAULT_READ_TIMEOUT_MS: i64 = 1000;

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            name: "camera0".to_string(),
            device_name: String::new(),
            device_class: "GigEVision".to_string(),
            kind: CameraKind::AreaArray,
            width: 2048,
            height: 1024,
            fps: 10.0,
            offset_x: 0,
            offset_y: 0,
            exposure: 10000.0,
            gain: 1.0,
            gamma_enable: false,
            gamma: -1.0,
            trigger_mode: TriggerMode::Off,
            trigger_source: "Line3".to_string(),
            debouncer: 10.0,
            pixel_format: "BayerRG8".to_string(),
            packet_size: 8192,
            inter_packet_delay: 20000,
            priority: 50,
            soft_trigger: false,
            soft_trigger_wait_ms: 5,
            buffer_count: 1,
            overlap: 0,
            transpose: false,
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            mock_path: None,
        }
    }
}

impl CameraConfig {
    /// Line-scan camera with the given logical name and serial number
    pub fn line_scan(name: &str, device_name: &str) -> Self {
        Self {
            name: name.to_string(),
            device_name: device_name.to_string(),
            kind: CameraKind::LineScan,
            width: 4096,
            height: 1000,
            buffer_count: 4,
            ..Default::default()
        }
    }

    /// Area-array camera with the given logical name and serial number
    pub fn area_array(name: &str, device_name: &str) -> Self {
        Self {
            name: name.to_string(),
            device_name: device_name.to_string(),
            kind: CameraKind::AreaArray,
            buffer_count: 2,
            ..Default::default()
        }
    }

    /// Mock camera, optionally replaying images from `path`
    pub fn mock(name: &str, path: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            device_name: format!("Mock-{}", name),
            kind: CameraKind::Mock,
            width: 640,
            height: 480,
            pixel_format: "RGB8".to_string(),
            mock_path: path.map(str::to_string),
            ..Default::default()
        }
    }

    /// Overlap rows actually used (line-scan only)
    pub fn effective_overlap(&self) -> u32 {
        match self.kind {
            CameraKind::LineScan => self.overlap,
            _ => 0,
        }
    }

    /// Whether this describes a mock camera
    pub fn is_mock(&self) -> bool {
        self.kind == CameraKind::Mock || self.device_name.starts_with("Mock")
    }

    /// Features fixed while the stream runs: geometry, format, transport
    pub(crate) fn static_features(&self) -> Vec<(&'static str, FeatureValue)> {
        vec![
            (feature::WIDTH, FeatureValue::Int(self.width as i64)),
            (feature::HEIGHT, FeatureValue::Int(self.height as i64)),
            (feature::OFFSET_X, FeatureValue::Int(self.offset_x as i64)),
            (feature::OFFSET_Y, FeatureValue::Int(self.offset_y as i64)),
            (feature::PIXEL_FORMAT, FeatureValue::Enum(self.pixel_format.clone())),
            (feature::PACKET_SIZE, FeatureValue::Int(self.packet_size as i64)),
            (feature::INTER_PACKET_DELAY, FeatureValue::Int(self.inter_packet_delay as i64)),
        ]
    }

    /// Features that may change between frames
    pub(crate) fn runtime_features(&self) -> Vec<(&'static str, FeatureValue)> {
        let mut features = vec![
            (feature::EXPOSURE_TIME, FeatureValue::Float(self.exposure)),
            (feature::GAIN, FeatureValue::Float(self.gain)),
            (feature::TRIGGER_SELECTOR, FeatureValue::Enum("FrameStart".to_string())),
            (feature::TRIGGER_MODE, FeatureValue::Enum(self.trigger_mode.as_str().to_string())),
            (feature::TRIGGER_SOURCE, FeatureValue::Enum(self.trigger_source.clone())),
            (feature::LINE_DEBOUNCING_PERIOD, FeatureValue::Float(self.debouncer)),
            (feature::GAMMA_ENABLE, FeatureValue::Bool(self.gamma_enable)),
        ];
        if self.gamma_enable {
            features.push((feature::GAMMA, FeatureValue::Float(self.gamma)));
        }
        features
    }

    /// Flatten into string key/value parameters
    pub fn to_parameters(&self) -> Result<BTreeMap<String, String>, CameraError> {
        let value = serde_json::to_value(self).map_err(|e| CameraError::Config(e.to_string()))?;
        let Value::Object(map) = value else {
            return Err(CameraError::Config("camera config is not an object".to_string()));
        };

        Ok(map
            .into_iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, v)| {
                let s = match v {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                (k, s)
            })
            .collect())
    }

    /// Rebuild from string key/value parameters on top of the defaults
    ///
    /// Unknown keys are skipped with a warning.
    pub fn from_parameters(params: &BTreeMap<String, String>) -> Result<Self, CameraError> {
        let base = serde_json::to_value(Self::default()).map_err(|e| CameraError::Config(e.to_string()))?;
        let Value::Object(mut map) = base else {
            return Err(CameraError::Config("camera config is not an object".to_string()));
        };

        for (key, raw) in params {
            let Some(current) = map.get(key) else {
                warn!("Ignoring unknown camera parameter: {}", key);
                continue;
            };
            let parsed = match current {
                Value::String(_) => Value::String(raw.clone()),
                _ => serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone())),
            };
            map.insert(key.clone(), parsed);
        }

        serde_json::from_value(Value::Object(map))
            .map_err(|e| CameraError::Config(format!("Invalid camera parameters: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = CameraConfig::default();
        assert_eq!(c.device_class, "GigEVision");
        assert_eq!(c.exposure, 10000.0);
        assert_eq!(c.packet_size, 8192);
        assert_eq!(c.inter_packet_delay, 20000);
        assert_eq!(c.pixel_format, "BayerRG8");
        assert_eq!(c.buffer_count, 1);
        assert_eq!(c.soft_trigger_wait_ms, 5);
        assert!(!c.gamma_enable);
    }

    #[test]
    fn test_overlap_only_for_line_scan() {
        let mut c = CameraConfig::area_array("a", "SN1");
        c.overlap = 8;
        assert_eq!(c.effective_overlap(), 0);
        let mut l = CameraConfig::line_scan("l", "SN2");
        l.overlap = 8;
        assert_eq!(l.effective_overlap(), 8);
    }

    #[test]
    fn test_parameters_round_trip() {
        let mut c = CameraConfig::line_scan("top", "SN42");
        c.exposure = 250.5;
        c.transpose = true;
        let params = c.to_parameters().unwrap();
        assert_eq!(params["exposure"], "250.5");
        assert_eq!(params["kind"], "line_scan");
        assert_eq!(params["device_name"], "SN42");
        assert_eq!(CameraConfig::from_parameters(&params).unwrap(), c);
    }

    #[test]
    fn test_parameters_partial_and_unknown() {
        let mut params = BTreeMap::new();
        params.insert("buffer_count".to_string(), "3".to_string());
        params.insert("pixel_format".to_string(), "Mono8".to_string());
        params.insert("bogus".to_string(), "1".to_string());
        let c = CameraConfig::from_parameters(&params).unwrap();
        assert_eq!(c.buffer_count, 3);
        assert_eq!(c.pixel_format, "Mono8");
        assert_eq!(c.exposure, 10000.0);
    }

    #[test]
    fn test_bad_parameter_value() {
        let mut params = BTreeMap::new();
        params.insert("buffer_count".to_string(), "many".to_string());
        assert!(CameraConfig::from_parameters(&params).is_err());
    }

    #[test]
    fn test_runtime_features_gamma() {
        let mut c = CameraConfig::default();
        assert!(!c.runtime_features().iter().any(|(n, _)| *n == feature::GAMMA));
        c.gamma_enable = true;
        c.gamma = 0.8;
        assert!(c.runtime_features().iter().any(|(n, _)| *n == feature::GAMMA));
    }
}
