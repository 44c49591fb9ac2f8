//! Workflow: one camera view of a board
//!
//! Reads frames from its camera, hands them to the detection engine and
//! reduces the per-target output to one result code per target.

use crate::capture::CaptureTimes;
use crate::context::RunMode;
use crate::InspectionError;
use camera_capture::{Camera, Frame};
use image::Rgb;
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;
use inference_engine::{DefectCatalog, DetectionEngine, GOOD};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const GOOD_COLOR: Rgb<u8> = Rgb([0, 200, 0]);
const NG_COLOR: Rgb<u8> = Rgb([230, 0, 0]);

pub struct Workflow {
    index: usize,
    board: usize,
    camera: Arc<dyn Camera>,
    engine: Box<dyn DetectionEngine>,
    catalog: DefectCatalog,
    capture_times: CaptureTimes,
    product_count: u64,
    run_mode: RunMode,
    multi_defect: bool,
    frame: Option<Frame>,
    /// Engine output awaiting classification
    raw: Option<Vec<Vec<i32>>>,
    results: Vec<i32>,
    histogram: BTreeMap<String, u64>,
    result_image: Option<Frame>,
}

impl Workflow {
    pub fn new(
        index: usize,
        board: usize,
        camera: Arc<dyn Camera>,
        engine: Box<dyn DetectionEngine>,
        catalog: DefectCatalog,
    ) -> Self {
        info!(
            "Workflow {} on board {} uses camera {}",
            index,
            board,
            camera.name()
        );
        Self {
            index,
            board,
            camera,
            engine,
            catalog,
            capture_times: CaptureTimes::UNKNOWN,
            product_count: 0,
            run_mode: RunMode::Detect,
            multi_defect: false,
            frame: None,
            raw: None,
            results: Vec::new(),
            histogram: BTreeMap::new(),
            result_image: None,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn camera(&self) -> &Arc<dyn Camera> {
        &self.camera
    }

    pub fn camera_name(&self) -> &str {
        self.camera.name()
    }

    pub fn capture_times(&self) -> CaptureTimes {
        self.capture_times
    }

    pub fn set_capture_times(&mut self, times: CaptureTimes) {
        self.capture_times = times;
    }

    pub fn product_count(&self) -> u64 {
        self.product_count
    }

    pub fn set_product_count(&mut self, count: u64) {
        self.product_count = count;
    }

    pub fn set_run_mode(&mut self, mode: RunMode) {
        self.run_mode = mode;
    }

    pub fn set_multi_defect(&mut self, enabled: bool) {
        self.multi_defect = enabled;
    }

    pub fn current_frame(&self) -> Option<&Frame> {
        self.frame.as_ref()
    }

    /// Per-target result codes of the last classification
    pub fn results(&self) -> &[i32] {
        &self.results
    }

    /// Defect counts since the first shot of the cycle
    pub fn histogram(&self) -> &BTreeMap<String, u64> {
        &self.histogram
    }

    pub fn result_image(&self) -> Option<&Frame> {
        self.result_image.as_ref()
    }

    /// UI label of the current shot
    pub fn label(&self, ok: bool) -> String {
        format!("pic{}-{}", self.capture_times.shot(), if ok { "OK" } else { "NG" })
    }

    /// Read the next frame from the camera
    pub fn get_next_frame(&mut self, timeout_ms: i64) -> Result<(), InspectionError> {
        self.frame = None;
        let frame = self.camera.read(timeout_ms)?;
        debug!(
            "Workflow {} board {} frame {} ({}x{})",
            self.index, self.board, frame.sequence, frame.width, frame.height
        );
        self.frame = Some(frame);
        Ok(())
    }

    /// Use an image file as the current frame
    pub fn read_frame_from_file(&mut self, path: &Path) -> Result<(), InspectionError> {
        self.frame = Some(Frame::load(path)?);
        Ok(())
    }

    /// Write the current frame to `<dir>/<name>.png`
    pub fn save_frame_to_file(&self, dir: &Path, name: &str) -> Result<PathBuf, InspectionError> {
        let frame = self.frame.as_ref().ok_or(InspectionError::NoFrame(self.index))?;
        let path = dir.join(format!("{}.png", name));
        frame.save(&path)?;
        Ok(path)
    }

    /// Set exposure and gain, then push them to the device
    pub fn apply_shot_parameters(&self, exposure: f64, gain: f64) -> Result<(), InspectionError> {
        self.camera.set_exposure(exposure);
        self.camera.set_gain(gain);
        self.camera.apply_config()?;
        Ok(())
    }

    pub fn restart_camera(&self) -> Result<(), InspectionError> {
        self.camera.restart()?;
        Ok(())
    }

    /// Run the detection engine on the current frame
    pub fn pre_process(&mut self) -> Result<(), InspectionError> {
        let frame = self.frame.as_ref().ok_or(InspectionError::NoFrame(self.index))?;
        if self.multi_defect && self.capture_times == CaptureTimes::FIRST {
            self.histogram.clear();
        }
        let raw = match self.run_mode {
            RunMode::Empty => vec![Vec::new(); self.engine.target_count()],
            RunMode::Detect => self
                .engine
                .detect_analyze(frame, self.product_count, self.capture_times.shot())
                .map_err(|e| InspectionError::Classification(e.to_string()))?,
        };
        self.raw = Some(raw);
        Ok(())
    }

    /// One result per target: the first non-Good code, or Good
    pub fn classify(&mut self) -> Result<&[i32], InspectionError> {
        let raw = self.raw.take().ok_or_else(|| {
            InspectionError::Classification(format!("workflow {} was not pre-processed", self.index))
        })?;

        let mut results = Vec::with_capacity(raw.len());
        for codes in &raw {
            if self.multi_defect {
                for name in self.catalog.defect_names(codes) {
                    *self.histogram.entry(name).or_insert(0) += 1;
                }
            }
            results.push(codes.iter().copied().find(|c| *c != GOOD).unwrap_or(GOOD));
        }
        self.results = results;
        Ok(&self.results)
    }

    /// Drop per-cycle engine state
    pub fn cleanup(&mut self) -> Result<(), InspectionError> {
        if self.frame.is_none() {
            return Err(InspectionError::NoFrame(self.index));
        }
        self.raw = None;
        Ok(())
    }

    /// Outline every target and the status bar, then scale
    pub fn draw(&mut self, scale: f64, thickness: u32, ok: bool) -> Result<Frame, InspectionError> {
        let frame = self.frame.as_ref().ok_or(InspectionError::NoFrame(self.index))?;
        if scale.is_nan() || scale <= 0.0 {
            return Err(InspectionError::Draw(format!("invalid scale {}", scale)));
        }

        let mut img = frame.to_rgb_image();
        let (width, height) = img.dimensions();
        let targets = self.results.len().max(1) as u32;
        let strip = width / targets;
        if strip == 0 || height == 0 {
            return Err(InspectionError::Draw(format!(
                "{}x{} frame too small for {} targets",
                width, height, targets
            )));
        }

        for t in 0..targets {
            let code = self.results.get(t as usize).copied().unwrap_or(GOOD);
            let color = if code == GOOD { GOOD_COLOR } else { NG_COLOR };
            let x0 = t * strip;
            let w = if t + 1 == targets { width - x0 } else { strip };
            for k in 0..thickness {
                if w <= 2 * k || height <= 2 * k {
                    break;
                }
                let rect = Rect::at((x0 + k) as i32, k as i32).of_size(w - 2 * k, height - 2 * k);
                draw_hollow_rect_mut(&mut img, rect, color);
            }
        }

        let bar = (height / 40).max(4).min(height);
        let status = if ok { GOOD_COLOR } else { NG_COLOR };
        draw_filled_rect_mut(&mut img, Rect::at(0, 0).of_size(width, bar), status);

        let mut drawn = Frame::from_rgb_image(&img).scaled(scale);
        drawn.sequence = frame.sequence;
        self.result_image = Some(drawn.clone());
        Ok(drawn)
    }

    /// Reload product parameters and restart the capture cycle
    pub fn reconfig(&mut self, product: &str) -> Result<(), InspectionError> {
        self.engine.reconfig(product)?;
        self.capture_times = CaptureTimes::UNKNOWN;
        self.histogram.clear();
        self.raw = None;
        info!("Workflow {} on board {} reconfigured for {}", self.index, self.board, product);
        Ok(())
    }
}
