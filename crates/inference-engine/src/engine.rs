//! Rule-based detection engine
//!
//! Splits the frame into vertical strips, one per target, and grades each
//! strip on per-pixel brightness. Thresholds come from the defaults or from
//! a JSON parameter file standing in for a trained model.

use crate::catalog::GOOD;
use crate::{DetectionEngine, InferenceError};
use camera_capture::Frame;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info, warn};

/// Code reported for a strip that is too dark
const DARK: i32 = GOOD + 1;
/// Code reported for a strip that is too bright
const BRIGHT: i32 = GOOD + 2;
/// Code reported for a strip with too many dark spots
const STAIN: i32 = GOOD + 3;

/// Grading thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Targets per frame
    pub targets: usize,
    /// Strip mean below this is Dark
    pub dark_mean: f64,
    /// Strip mean above this is Bright
    pub bright_mean: f64,
    /// Pixel below this counts as a spot
    pub spot_level: u8,
    /// Spot fraction above this is a Stain
    pub stain_ratio: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            targets: 1,
            dark_mean: 30.0,
            bright_mean: 225.0,
            spot_level: 20,
            stain_ratio: 0.2,
        }
    }
}

/// Detection engine (rule-based)
pub struct InferenceEngine {
    /// Parameter file
    model_path: Option<String>,
    config: EngineConfig,
    loaded: bool,
}

impl InferenceEngine {
    /// Engine reading thresholds from `model_path` on [`load`](Self::load)
    pub fn new(model_path: &str) -> Self {
        info!("Creating inference engine with model: {}", model_path);
        Self {
            model_path: Some(model_path.to_string()),
            config: EngineConfig::default(),
            loaded: false,
        }
    }

    /// Engine with default thresholds, ready to use
    pub fn mock(targets: usize) -> Self {
        info!("Creating mock inference engine with {} targets", targets);
        Self {
            model_path: None,
            config: EngineConfig {
                targets: targets.max(1),
                ..Default::default()
            },
            loaded: true,
        }
    }

    /// Engine with explicit thresholds
    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            model_path: None,
            config,
            loaded: true,
        }
    }

    /// Read the parameter file
    pub fn load(&mut self) -> Result<(), InferenceError> {
        let Some(path) = self.model_path.clone() else {
            debug!("Mock mode: skipping model load");
            self.loaded = true;
            return Ok(());
        };

        let text = std::fs::read_to_string(Path::new(&path))
            .map_err(|e| InferenceError::ModelLoadError(format!("{}: {}", path, e)))?;
        let config: EngineConfig = serde_json::from_str(&text)
            .map_err(|e| InferenceError::ModelLoadError(format!("{}: {}", path, e)))?;
        if config.targets == 0 {
            return Err(InferenceError::ModelLoadError(format!("{}: zero targets", path)));
        }

        info!("Model loaded successfully from {} ({} targets)", path, config.targets);
        self.config = config;
        self.loaded = true;
        Ok(())
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn model_path(&self) -> Option<&str> {
        self.model_path.as_deref()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn grade_strip(&self, frame: &Frame, x0: u32, x1: u32) -> Vec<i32> {
        let c = frame.channels as usize;
        let mut sum = 0u64;
        let mut spots = 0u64;
        let mut count = 0u64;
        for y in 0..frame.height {
            let row = (y as usize * frame.width as usize) * c;
            for x in x0..x1 {
                let i = row + x as usize * c;
                let px = &frame.data[i..i + c];
                let level = (px.iter().map(|&v| v as u32).sum::<u32>() / c as u32) as u8;
                sum += level as u64;
                if level < self.config.spot_level {
                    spots += 1;
                }
                count += 1;
            }
        }
        if count == 0 {
            return Vec::new();
        }

        let mean = sum as f64 / count as f64;
        let mut defects = Vec::new();
        if mean < self.config.dark_mean {
            defects.push(DARK);
        } else if mean > self.config.bright_mean {
            defects.push(BRIGHT);
        } else if spots as f64 / count as f64 > self.config.stain_ratio {
            defects.push(STAIN);
        }
        defects
    }
}

impl DetectionEngine for InferenceEngine {
    fn detect_analyze(
        &mut self,
        frame: &Frame,
        product_count: u64,
        shot: u32,
    ) -> Result<Vec<Vec<i32>>, InferenceError> {
        let start = std::time::Instant::now();
        if !self.loaded {
            return Err(InferenceError::ModelLoadError("Model not loaded".to_string()));
        }

        let targets = self.config.targets;
        if frame.is_empty() || (frame.width as usize) < targets {
            return Err(InferenceError::InvalidInputShape {
                expected: format!("at least {} columns", targets),
                actual: format!("{}x{}", frame.width, frame.height),
            });
        }

        let strip = frame.width / targets as u32;
        let results: Vec<Vec<i32>> = (0..targets as u32)
            .map(|t| {
                let x0 = t * strip;
                let x1 = if t + 1 == targets as u32 { frame.width } else { x0 + strip };
                self.grade_strip(frame, x0, x1)
            })
            .collect();

        debug!(
            "Detect product {} shot {}: {:?} in {}ms",
            product_count,
            shot,
            results,
            start.elapsed().as_millis()
        );
        Ok(results)
    }

    fn target_count(&self) -> usize {
        self.config.targets
    }

    fn reconfig(&mut self, product: &str) -> Result<(), InferenceError> {
        if self.model_path.is_none() {
            return Ok(());
        }
        info!("Reloading detection parameters for product {}", product);
        if let Err(e) = self.load() {
            warn!("Keeping previous parameters: {}", e);
            return Err(e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_good_frame() {
        let mut engine = InferenceEngine::mock(2);
        let frame = Frame::filled(40, 10, 3, 128);
        let result = engine.detect_analyze(&frame, 1, 1).unwrap();
        assert_eq!(result, vec![Vec::<i32>::new(), Vec::new()]);
    }

    #[test]
    fn test_dark_and_bright_targets() {
        let mut engine = InferenceEngine::mock(2);
        let mut frame = Frame::filled(4, 2, 1, 0);
        for y in 0..2 {
            frame.data[y * 4 + 2] = 255;
            frame.data[y * 4 + 3] = 255;
        }
        let result = engine.detect_analyze(&frame, 5, 2).unwrap();
        assert_eq!(result, vec![vec![DARK], vec![BRIGHT]]);
    }

    #[test]
    fn test_stain() {
        let mut engine = InferenceEngine::mock(1);
        let mut frame = Frame::filled(10, 10, 1, 150);
        for v in frame.data.iter_mut().take(30) {
            *v = 0;
        }
        assert_eq!(engine.detect_analyze(&frame, 1, 1).unwrap(), vec![vec![STAIN]]);
    }

    #[test]
    fn test_narrow_frame_rejected() {
        let mut engine = InferenceEngine::mock(4);
        let frame = Frame::filled(3, 3, 1, 100);
        assert!(matches!(
            engine.detect_analyze(&frame, 1, 1),
            Err(InferenceError::InvalidInputShape { .. })
        ));
    }

    #[test]
    fn test_not_loaded() {
        let mut engine = InferenceEngine::new("/nonexistent/model.json");
        assert!(!engine.is_loaded());
        assert!(engine.detect_analyze(&Frame::filled(4, 4, 1, 100), 1, 1).is_err());
        assert!(matches!(engine.load(), Err(InferenceError::ModelLoadError(_))));
    }

    #[test]
    fn test_load_parameter_file() {
        let path = std::env::temp_dir().join(format!("engine-params-{}.json", std::process::id()));
        std::fs::write(&path, r#"{"targets": 3, "dark_mean": 10.0}"#).unwrap();

        let mut engine = InferenceEngine::new(path.to_str().unwrap());
        engine.load().unwrap();
        assert_eq!(engine.target_count(), 3);
        assert_eq!(engine.config().dark_mean, 10.0);
        assert_eq!(engine.config().bright_mean, 225.0);

        std::fs::write(&path, r#"{"targets": 0}"#).unwrap();
        assert!(engine.reconfig("P1").is_err());
        assert_eq!(engine.target_count(), 3);
        std::fs::remove_file(&path).unwrap();
    }
}
