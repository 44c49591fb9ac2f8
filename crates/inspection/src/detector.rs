//! Per-board detector
//!
//! Owns the board's workflows and capture-times state and runs one
//! capture → pre-process → classify → purge → cleanup → draw cycle per call.

use crate::capture::{CaptureTimes, CaptureTimesController};
use crate::config::BoardConfig;
use crate::context::{AppContext, CachedResult, ProductSettings, RunStatus, SaveImageType, TestPhase, NOT_AVAILABLE};
use crate::purge::{decide, histogram_results, merge_results, PlcSignal, PurgeDecision, PurgeMode};
use crate::save::{ImageKind, ImageSaveWorker, SaveRequest};
use crate::workflow::Workflow;
use crate::InspectionError;
use inference_engine::DefectCatalog;
use metrics::{counter, histogram};
use plc_io::{GatewayKind, IoGateway};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use storage::RecordKey;
use tracing::{debug, error, info, warn};

/// IO card channel carrying the result lines
const RESULT_CHANNEL: u8 = 0;
/// Draw scale of parameter test images
const TEST_DRAW_SCALE: f64 = 0.1;
const TEST_IMAGE_NAME: &str = "TestImage";

pub struct Detector {
    board: usize,
    label: String,
    config: BoardConfig,
    ctx: Arc<AppContext>,
    gateway: Option<Arc<dyn IoGateway>>,
    workflows: Vec<Workflow>,
    capture: CaptureTimesController,
    /// Framework count, advanced on every read
    product_count: u64,
    /// Last value of the PLC count register
    plc_product_number: u64,
    purge_mode: PurgeMode,
    save_type: SaveImageType,
    save_scale: f64,
    saver: Option<Arc<ImageSaveWorker>>,
    catalog: DefectCatalog,
}

impl Detector {
    pub fn new(
        board: usize,
        ctx: Arc<AppContext>,
        gateway: Option<Arc<dyn IoGateway>>,
        workflows: Vec<Workflow>,
        saver: Option<Arc<ImageSaveWorker>>,
    ) -> Result<Self, InspectionError> {
        let config = ctx
            .config
            .boards
            .get(board)
            .cloned()
            .ok_or(InspectionError::InvalidBoard(board))?;
        if workflows.is_empty() {
            return Err(InspectionError::Config(format!("board {} has no workflow", board)));
        }
        let capture = CaptureTimesController::new(board, config.total_capture_times, config.trigger_register);
        let catalog = ctx.config.catalog();
        info!(
            "Detector for board {} with {} workflows, {} shots per product",
            board,
            workflows.len(),
            config.total_capture_times
        );
        Ok(Self {
            board,
            label: board.to_string(),
            config,
            ctx,
            gateway,
            workflows,
            capture,
            product_count: 0,
            plc_product_number: 0,
            purge_mode: PurgeMode::Normal,
            save_type: SaveImageType::No,
            save_scale: 1.0,
            saver,
            catalog,
        })
    }

    pub fn board(&self) -> usize {
        self.board
    }

    pub fn workflows(&self) -> &[Workflow] {
        &self.workflows
    }

    pub fn capture_times(&self) -> CaptureTimes {
        self.capture.current()
    }

    pub fn product_count(&self) -> u64 {
        self.product_count
    }

    pub fn reset_product_count(&mut self, count: u64) {
        self.product_count = count;
    }

    pub fn purge_mode(&self) -> PurgeMode {
        self.purge_mode
    }

    /// Board runs on replayed images
    pub fn is_mock(&self) -> bool {
        self.workflows.first().map(|w| w.camera().is_mock()).unwrap_or(true)
    }

    /// At least one camera of the board is started
    pub fn cameras_ready(&self) -> bool {
        self.workflows.iter().any(|w| w.camera().is_started())
    }

    fn plc(&self) -> Option<&dyn IoGateway> {
        self.gateway
            .as_deref()
            .filter(|g| g.kind() == GatewayKind::Plc)
    }

    /// Count used for records: PLC counter on real PLC lines, else the framework count
    pub fn real_product_count(&self) -> u64 {
        if self.is_mock() || self.plc().is_none() {
            self.product_count
        } else {
            self.plc_product_number
        }
    }

    /// Set the shot on the controller and every workflow
    pub fn set_capture_times(&mut self, times: CaptureTimes) {
        self.capture.set(times);
        for wf in &mut self.workflows {
            wf.set_capture_times(times);
        }
    }

    fn update_capture_times(&mut self) -> Result<CaptureTimes, InspectionError> {
        let times = self.capture.by_signal(self.gateway.as_deref())?;
        self.set_capture_times(times);
        Ok(times)
    }

    fn update_product_count_of_workflows(&mut self) {
        for wf in &mut self.workflows {
            wf.set_product_count(self.product_count);
        }
    }

    fn apply_shot_parameters(&self, times: CaptureTimes) {
        let Some(params) = self.ctx.config.shot_parameters(self.board, times.shot()) else {
            return;
        };
        for wf in &self.workflows {
            if let Err(e) = wf.apply_shot_parameters(params.exposure, params.gain) {
                warn!(
                    "Board {} failed to apply shot {} parameters to {}: {}",
                    self.board,
                    times,
                    wf.camera_name(),
                    e
                );
            }
        }
    }

    /// Read one frame per workflow; on failure restart the board's cameras
    fn get_next_frame(&mut self) -> Result<(), InspectionError> {
        for i in 0..self.workflows.len() {
            let timeout = self.workflows[i].camera().read_timeout_ms();
            if let Err(e) = self.workflows[i].get_next_frame(timeout) {
                error!("Board {} get next image failed: {}", self.board, e);
                self.restart_cameras();
                return Err(e);
            }
        }
        counter!("inspection_frames_total", "board" => self.label.clone()).increment(1);
        Ok(())
    }

    /// Restart workflow cameras in order until one comes back
    fn restart_cameras(&self) {
        for wf in &self.workflows {
            error!(
                "Board {} camera {} crashed, trying to restart",
                self.board,
                wf.camera_name()
            );
            match wf.restart_camera() {
                Ok(()) => {
                    counter!("inspection_camera_restarts_total", "board" => self.label.clone()).increment(1);
                    info!("Board {} finished camera {} restart", self.board, wf.camera_name());
                    break;
                }
                Err(e) => error!(
                    "Board {} failed to restart camera {}: {}",
                    self.board,
                    wf.camera_name(),
                    e
                ),
            }
        }
    }

    fn read_plc_product_number(&mut self) {
        let address = self.config.count_register;
        match self.plc().map(|plc| plc.read_register(address)) {
            Some(Ok(value)) => self.plc_product_number = value as u64,
            Some(Err(e)) => warn!(
                "Board {} failed to read product count register {}: {}",
                self.board, address, e
            ),
            None => {}
        }
    }

    /// Keep one count per product across the shots of a cycle
    fn reconcile_product_count(&mut self) {
        let forced = self.ctx.config.capture_times_override;
        if forced == 1 || forced == 2 {
            self.set_capture_times(CaptureTimes(forced));
        } else if !self.capture.is_final_shot() && self.product_count != 1 {
            self.product_count = self.product_count.saturating_sub(1);
        }
        self.update_product_count_of_workflows();
    }

    /// One production cycle
    ///
    /// Returns `Ok(())` when no shot is due. Recoverable failures return
    /// their error after the cycle has been cleaned up; fatal ones are
    /// reported by [`InspectionError::is_fatal`].
    pub fn run_detector(&mut self) -> Result<(), InspectionError> {
        let started = Instant::now();
        if self.is_mock() {
            std::thread::sleep(Duration::from_millis(self.ctx.config.mock_frame_interval_ms));
            self.get_next_frame()?;
            let times = self.update_capture_times()?;
            if times.is_unknown() {
                return Ok(());
            }
        } else {
            let times = self.update_capture_times()?;
            if times.is_unknown() {
                return Ok(());
            }
            self.apply_shot_parameters(times);
            debug!("Board {} shot {}: set config {:?}", self.board, times, started.elapsed());
            self.get_next_frame()?;
            self.read_plc_product_number();
        }
        self.product_count += 1;
        debug!(
            "Board {} shot {}: get image {:?}, product count {}",
            self.board,
            self.capture.current(),
            started.elapsed(),
            self.product_count
        );
        self.reconcile_product_count();

        if self.ctx.config.save.hang_up_during_detect {
            if let Some(saver) = &self.saver {
                saver.hang_up();
            }
        }
        let result = self.process_cycle();
        if let Some(saver) = &self.saver {
            saver.wake_up();
        }
        histogram!("inspection_cycle_seconds", "board" => self.label.clone()).record(started.elapsed().as_secs_f64());
        result
    }

    fn process_cycle(&mut self) -> Result<(), InspectionError> {
        let shot = self.capture.current();

        let t = Instant::now();
        if let Err(e) = self.image_pre_process() {
            return Err(self.abort_cycle("pre-process", e));
        }
        let t_pre = t.elapsed();
        debug!("Board {} shot {}: pre-process {:?}", self.board, shot, t_pre);

        let t = Instant::now();
        let decision = match self.classify_board() {
            Ok(d) => d,
            Err(e) => return Err(self.abort_cycle("classify", e)),
        };
        let t_classify = t.elapsed();
        debug!("Board {} shot {}: classify {:?}", self.board, shot, t_classify);

        let t = Instant::now();
        if let Err(e) = self.cleanup_board() {
            error!("Board {} cleanup failed: {}", self.board, e);
            self.set_capture_times(CaptureTimes::UNKNOWN);
        }
        let t_cleanup = t.elapsed();

        let t = Instant::now();
        self.draw_board(self.config.draw_scale, decision.is_ok)?;
        let t_draw = t.elapsed();
        self.save_images(decision.is_ok);

        info!(
            "Board {} shot {} product {} {}: detect time {:?}",
            self.board,
            shot,
            self.product_count,
            if decision.is_ok { "OK" } else { "NG" },
            t_pre + t_classify + t_cleanup + t_draw
        );
        Ok(())
    }

    /// Send NG, drop the cycle and hand the error back
    fn abort_cycle(&mut self, stage: &str, e: InspectionError) -> InspectionError {
        error!("Board {} {} failed: {}", self.board, stage, e);
        counter!("inspection_classification_failures_total", "board" => self.label.clone()).increment(1);
        if let Err(se) = self.send_result_signal(PlcSignal::Ng, None) {
            error!("Board {} failed to send NG after {} failure: {}", self.board, stage, se);
        }
        self.set_capture_times(CaptureTimes::UNKNOWN);
        e
    }

    pub fn image_pre_process(&mut self) -> Result<(), InspectionError> {
        for wf in &mut self.workflows {
            wf.pre_process()?;
        }
        Ok(())
    }

    fn classify_workflows(&mut self) -> Result<(), InspectionError> {
        for wf in &mut self.workflows {
            wf.classify()?;
        }
        Ok(())
    }

    /// Classify every workflow, then purge
    pub fn classify_board(&mut self) -> Result<PurgeDecision, InspectionError> {
        self.classify_workflows()?;
        self.purge_board_result()
    }

    pub fn cleanup_board(&mut self) -> Result<(), InspectionError> {
        for wf in &mut self.workflows {
            wf.cleanup()?;
        }
        Ok(())
    }

    /// Merge the board results, count them, record them and signal the PLC
    ///
    /// Signal and persistence failures are logged and do not fail the cycle.
    pub fn purge_board_result(&mut self) -> Result<PurgeDecision, InspectionError> {
        let results = if self.ctx.config.multi_defect {
            let mut merged: BTreeMap<String, u64> = BTreeMap::new();
            for wf in &self.workflows {
                for (name, count) in wf.histogram() {
                    *merged.entry(name.clone()).or_insert(0) += count;
                }
            }
            histogram_results(&merged, &self.catalog)
        } else {
            merge_results(self.workflows.iter().map(|w| w.results()))
        };

        let product_no = self.real_product_count();
        let names = self.catalog.defect_names(&results);
        self.ctx.record_running(self.board, product_no, &names)?;

        let decision = decide(self.purge_mode, &results, self.product_count);
        if let Err(e) = self.record_product_result(&decision) {
            warn!("Board {} failed to record product result: {}", self.board, e);
        }
        if let Err(e) = self.send_result_signal(decision.signal, decision.highest_defect()) {
            counter!("inspection_signal_failures_total", "board" => self.label.clone()).increment(1);
            error!("Board {} {}", self.board, e);
        }
        Ok(decision)
    }

    /// Drive the result output for one product
    ///
    /// IO card: pulse the board's line on OK only. PLC: write the OK/NG
    /// value, or the highest defect code in defect-class mode.
    pub fn send_result_signal(&self, signal: PlcSignal, defect: Option<i32>) -> Result<(), InspectionError> {
        let gw_config = &self.ctx.config.gateway;
        if self.is_mock() && !gw_config.send_signal_in_mock {
            return Ok(());
        }
        let Some(gateway) = &self.gateway else {
            return Ok(());
        };

        match gateway.kind() {
            GatewayKind::IoCard => {
                if signal.is_ok() {
                    let address = self.config.result_bit;
                    gateway
                        .pulse_bit(RESULT_CHANNEL, address, Duration::from_millis(gw_config.signal_hold_ms))
                        .map_err(|e| {
                            InspectionError::SignalWrite(format!("IO bit {}: {}", address, e))
                        })?;
                    debug!("Board {} sent ok result signal to IO bit {}", self.board, address);
                }
            }
            GatewayKind::Plc => {
                let address = self.config.result_register;
                let data = match (gw_config.plc_defect_mode, signal, defect) {
                    (true, PlcSignal::Ng, Some(code)) if code > 0 => code as u16,
                    (_, PlcSignal::Ok, _) => gw_config.ok_value,
                    _ => gw_config.ng_value,
                };
                gateway.write_register(address, data).map_err(|e| {
                    InspectionError::SignalWrite(format!(
                        "result data {} to PLC register {}: {}",
                        data, address, e
                    ))
                })?;
                info!(
                    "Board {} sent {} result data {} to PLC register {}",
                    self.board,
                    signal.as_str(),
                    data,
                    address
                );
            }
        }
        counter!("inspection_signals_total", "board" => self.label.clone(), "signal" => signal.as_str()).increment(1);
        Ok(())
    }

    /// Persist one product: defect record when defective, MES record when enabled
    pub fn record_product_result(&self, decision: &PurgeDecision) -> Result<(), InspectionError> {
        let mes_enabled = self.ctx.config.mes_enabled;
        if !mes_enabled && decision.defects.is_empty() {
            return Ok(());
        }

        let is_mock = self.is_mock();
        let (total, total_defect) = match self.plc() {
            Some(plc) if !is_mock => {
                let address = self.ctx.config.gateway.total_defect_register;
                let defects = plc.read_register(address)?;
                (self.real_product_count(), defects as u64)
            }
            _ => {
                let running = self.ctx.running_data()?;
                (running.total, running.total_defect)
            }
        };

        let product = self.ctx.product_settings()?;
        let key = RecordKey::new(&product.product, self.board, &product.lot);
        let names = self.catalog.defect_names(&decision.defects);
        let repository = self.ctx.repository();
        if !decision.defects.is_empty() {
            repository.record_defect_data(&key, total, &names)?;
            self.ctx.results()?.push_defect_index(total);
        }
        if mes_enabled && !is_mock {
            repository.record_mes_data(&key, total, total, total_defect, &names)?;
        }
        Ok(())
    }

    /// Render every workflow and publish the images to the result cache
    pub fn draw_board(&mut self, scale: f64, ok: bool) -> Result<(), InspectionError> {
        let thickness = self.config.draw_thickness;
        let product_no = self.real_product_count();
        for wf in &mut self.workflows {
            let drawn = wf.draw(scale, thickness, ok)?;
            let label = wf.label(ok);
            debug!("Board {} {} {}", self.board, wf.camera_name(), label);
            self.ctx.results()?.set_current_result(
                wf.camera_name(),
                wf.capture_times().shot(),
                CachedResult {
                    frame: drawn,
                    ok,
                    label,
                    product_no,
                },
            );
        }
        Ok(())
    }

    fn save_images(&self, ok: bool) {
        let Some(saver) = &self.saver else {
            return;
        };
        if !self.save_type.saves(ok, self.board) {
            return;
        }
        let product_count = self.real_product_count();
        for wf in &self.workflows {
            let shot = wf.capture_times().shot();
            if let Some(frame) = wf.current_frame() {
                saver.push(SaveRequest {
                    frame: frame.scaled(self.save_scale),
                    kind: ImageKind::Origin,
                    ok,
                    product_count,
                    shot,
                });
            }
            if let Some(frame) = wf.result_image() {
                saver.push(SaveRequest {
                    frame: frame.clone(),
                    kind: ImageKind::Result,
                    ok,
                    product_count,
                    shot,
                });
            }
        }
    }

    /// Load save policy and purge mode for a (re)start
    pub fn init_board_parameters(&mut self) -> Result<(), InspectionError> {
        let settings = self.ctx.product_settings()?;
        self.save_type = settings.save_image_type();
        self.save_scale = settings.image_save_scale();
        self.reconfig_parameters(self.ctx.run_status(), &settings)
    }

    pub fn reconfig_parameters(&mut self, status: RunStatus, settings: &ProductSettings) -> Result<(), InspectionError> {
        let signalling = !self.is_mock() || self.ctx.config.gateway.send_signal_in_mock;
        if status == RunStatus::ProductRun && self.board == 0 && signalling {
            if let Some(plc) = self.plc() {
                for (address, value) in &settings.plc_parameters {
                    if let Err(e) = plc.write_register(*address, *value) {
                        warn!("Failed to write PLC parameter {} = {}: {}", address, value, e);
                    }
                }
            }
        }

        self.purge_mode = PurgeMode::from_code(settings.purge_code());
        let multi_defect = self.ctx.config.multi_defect;
        for wf in &mut self.workflows {
            wf.set_run_mode(settings.run_mode());
            wf.set_multi_defect(multi_defect);
            wf.reconfig(&settings.product)?;
        }
        self.set_capture_times(CaptureTimes::UNKNOWN);
        info!(
            "Board {} configured for {} lot {}: purge {:?}, save {:?}",
            self.board, settings.product, settings.lot, self.purge_mode, self.save_type
        );
        Ok(())
    }

    /// Run the test image through the pipeline without signalling
    pub fn parameters_test(&mut self) -> Result<(), InspectionError> {
        let test = self.ctx.test_settings()?;
        if test.product == NOT_AVAILABLE {
            return Err(InspectionError::TestUnavailable("test product is unavailable".to_string()));
        }
        if test.image_path == NOT_AVAILABLE {
            return Err(InspectionError::TestUnavailable(format!(
                "invalid processed image name {}",
                test.image_path
            )));
        }
        info!("Parameter test under {} start", test.product);

        self.set_capture_times(CaptureTimes::FIRST);
        for wf in &mut self.workflows {
            wf.read_frame_from_file(Path::new(&test.image_path))?;
        }

        if test.phase != TestPhase::NoProcess {
            if self.plc().is_some() {
                self.read_plc_product_number();
                let count = self.plc_product_number;
                for wf in &mut self.workflows {
                    wf.set_product_count(count);
                }
            }
            self.image_pre_process()?;
        }

        let ok = if test.phase == TestPhase::PreProcessAndClassify {
            self.classify_workflows()?;
            self.workflows
                .iter()
                .all(|w| w.results().iter().all(|r| *r == inference_engine::GOOD))
        } else {
            true
        };

        self.draw_board(TEST_DRAW_SCALE, ok)?;
        info!("Parameter test under {} end", test.product);
        Ok(())
    }

    /// Grab one frame per camera and store it as the test image
    pub fn save_test_frames(&mut self) -> Result<(), InspectionError> {
        let test = self.ctx.test_settings()?;
        if test.product == NOT_AVAILABLE {
            return Err(InspectionError::TestUnavailable("test product is unavailable".to_string()));
        }
        info!("Save camera triggered images under {} start", test.product);

        let dir = self.ctx.config.save.products_dir.clone();
        let single = self.workflows.len() == 1;
        for wf in &mut self.workflows {
            let timeout = wf.camera().read_timeout_ms();
            wf.get_next_frame(timeout)?;
            let name = if single {
                TEST_IMAGE_NAME.to_string()
            } else {
                format!("{}{}", TEST_IMAGE_NAME, wf.index())
            };
            let path = wf.save_frame_to_file(&dir, &name)?;
            debug!("Board {} saved test image {}", self.board, path.display());
        }
        info!("Save camera triggered images under {} end", test.product);
        Ok(())
    }

    /// Flush the board's running totals as a report
    pub fn update_database_report(&self) -> Result<(), InspectionError> {
        let settings = self.ctx.product_settings()?;
        let counters = self.ctx.running_data()?.board(self.board);
        self.ctx.repository().save_report(
            &RecordKey::new(&settings.product, self.board, &settings.lot),
            counters.total,
            counters.total_defect,
            counters.histogram,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InspectionConfig;
    use crate::context::{TestSettings, PURGE_SIGNAL_TYPE};
    use camera_capture::{Camera, CameraConfig, Frame, MockCamera};
    use inference_engine::{ScriptedEngine, GOOD};
    use plc_io::{GatewayWrite, MockGateway};
    use storage::Repository;

    struct Rig {
        detector: Detector,
        ctx: Arc<AppContext>,
        camera: Arc<MockCamera>,
        engine: ScriptedEngine,
    }

    fn rig(mut config: InspectionConfig, gateway: Option<Arc<dyn IoGateway>>) -> Rig {
        config.mock_frame_interval_ms = 0;
        config.gateway.signal_hold_ms = 1;
        let mut camera_config = CameraConfig::mock("CAM0", None);
        camera_config.width = 32;
        camera_config.height = 16;
        let camera = Arc::new(MockCamera::new(camera_config));
        camera.start().unwrap();

        let ctx = Arc::new(AppContext::new(config, Arc::new(Repository::new())));
        let engine = ScriptedEngine::new(1);
        let wf = Workflow::new(0, 0, camera.clone(), Box::new(engine.clone()), ctx.config.catalog());
        let detector = Detector::new(0, ctx.clone(), gateway, vec![wf], None).unwrap();
        Rig {
            detector,
            ctx,
            camera,
            engine,
        }
    }

    fn signalling_config(shots: u32) -> InspectionConfig {
        let mut config = InspectionConfig::mock(1);
        config.boards[0].total_capture_times = shots;
        config.gateway.enabled = true;
        config.gateway.send_signal_in_mock = true;
        config
    }

    fn result_writes(gateway: &MockGateway, address: u16) -> Vec<u16> {
        gateway
            .writes()
            .into_iter()
            .filter_map(|w| match w {
                GatewayWrite::Register { address: a, value } if a == address => Some(value),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_classification_failure_on_final_shot() {
        let plc = Arc::new(MockGateway::plc());
        plc.push_register_values(10, &[1, 2, 1]);
        let mut rig = rig(signalling_config(2), Some(plc.clone()));
        rig.engine.push_result(vec![vec![]]);
        rig.engine.push_failure("classifier crashed");

        rig.detector.run_detector().unwrap();
        assert_eq!(rig.detector.capture_times(), CaptureTimes::FIRST);
        assert_eq!(rig.detector.product_count(), 1);

        let err = rig.detector.run_detector().unwrap_err();
        assert!(matches!(err, InspectionError::Classification(_)));
        assert!(!err.is_fatal());
        assert_eq!(rig.detector.capture_times(), CaptureTimes::UNKNOWN);
        assert_eq!(rig.detector.workflows()[0].capture_times(), CaptureTimes::UNKNOWN);
        assert_eq!(result_writes(&plc, 20), vec![1, 2]);
        let count = rig.detector.product_count();

        rig.detector.run_detector().unwrap();
        assert_eq!(rig.detector.capture_times(), CaptureTimes::FIRST);
        assert_eq!(rig.detector.product_count(), count);
    }

    #[test]
    fn test_ok_ng_purge_sequence() {
        let plc = Arc::new(MockGateway::plc());
        let mut rig = rig(signalling_config(1), Some(plc.clone()));
        let mut settings = rig.ctx.product_settings().unwrap();
        settings.parameters[PURGE_SIGNAL_TYPE] = 3;
        rig.ctx.set_product_settings(settings).unwrap();
        rig.detector.init_board_parameters().unwrap();
        assert_eq!(rig.detector.purge_mode(), PurgeMode::OkNg);

        rig.engine.push_result(vec![vec![2]]);
        for _ in 0..4 {
            rig.detector.run_detector().unwrap();
        }
        assert_eq!(result_writes(&plc, 20), vec![1, 2, 1, 2]);
    }

    #[test]
    fn test_io_card_pulses_only_on_ok() {
        let card = Arc::new(MockGateway::io_card());
        let mut rig = rig(signalling_config(1), Some(card.clone()));
        rig.engine.push_result(vec![vec![]]);
        rig.engine.push_result(vec![vec![3]]);
        rig.engine.push_result(vec![vec![]]);
        for _ in 0..3 {
            rig.detector.run_detector().unwrap();
        }
        let pulses: Vec<bool> = card
            .writes()
            .into_iter()
            .filter_map(|w| match w {
                GatewayWrite::Bit { address: 0, value, .. } => Some(value),
                _ => None,
            })
            .collect();
        assert_eq!(pulses, vec![true, false, true, false]);
        assert!(!card.bit(0, 0));
    }

    #[test]
    fn test_mock_cameras_do_not_signal_by_default() {
        let plc = Arc::new(MockGateway::plc());
        let mut config = signalling_config(1);
        config.gateway.send_signal_in_mock = false;
        let mut rig = rig(config, Some(plc.clone()));
        rig.detector.run_detector().unwrap();
        assert!(result_writes(&plc, 20).is_empty());
    }

    #[test]
    fn test_signal_failure_does_not_stop_recording() {
        let plc = Arc::new(MockGateway::plc());
        plc.set_fail_writes(true);
        let mut rig = rig(signalling_config(1), Some(plc.clone()));
        rig.engine.push_result(vec![vec![GOOD, 4, 2]]);

        rig.detector.run_detector().unwrap();
        let records = rig.ctx.repository().defect_records(10).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].product_no, 1);
        assert!(records[0].defects.contains_key("Stain"));
        assert!(!records[0].defects.contains_key("Dark"));
        assert_eq!(rig.ctx.repository().mes_count(), 0);
        assert_eq!(rig.ctx.results().unwrap().defect_indices(), &[1]);
        assert_eq!(rig.ctx.running_data().unwrap().total_defect, 1);
    }

    #[test]
    fn test_good_product_without_mes_is_not_recorded() {
        let mut rig = rig(InspectionConfig::mock(1), None);
        rig.detector.run_detector().unwrap();
        assert_eq!(rig.ctx.repository().defect_count(), 0);
        assert_eq!(rig.ctx.running_data().unwrap().total, 1);
        let cache = rig.ctx.results().unwrap();
        let cached = cache.current_result("CAM0", 1).unwrap();
        assert!(cached.ok);
        assert_eq!(cached.label, "pic1-OK");
    }

    #[test]
    fn test_read_failure_restarts_camera() {
        let mut rig = rig(InspectionConfig::mock(1), None);
        rig.camera.inject_read_failures(1);
        assert!(matches!(rig.detector.run_detector(), Err(InspectionError::Camera(_))));
        assert!(rig.camera.is_started());
        assert!(rig.detector.cameras_ready());
        rig.detector.run_detector().unwrap();
        assert_eq!(rig.detector.product_count(), 1);
    }

    #[test]
    fn test_unknown_shot_is_a_no_op() {
        let plc = Arc::new(MockGateway::plc());
        let mut rig = rig(signalling_config(2), Some(plc.clone()));
        plc.set_register(10, 0);
        let frames = rig.camera.total_frames();
        rig.detector.run_detector().unwrap();
        assert_eq!(rig.detector.capture_times(), CaptureTimes::UNKNOWN);
        assert_eq!(rig.detector.product_count(), 0);
        assert!(rig.engine.calls().is_empty());
        assert_eq!(rig.camera.total_frames(), frames + 1);
    }

    #[test]
    fn test_parameters_test() {
        let mut rig = rig(InspectionConfig::mock(1), None);
        assert!(matches!(
            rig.detector.parameters_test(),
            Err(InspectionError::TestUnavailable(_))
        ));

        let path = std::env::temp_dir().join(format!("inspect-test-image-{}.png", std::process::id()));
        Frame::filled(40, 20, 3, 128).save(&path).unwrap();
        rig.ctx
            .set_test_settings(TestSettings {
                product: "P1".to_string(),
                image_path: path.to_string_lossy().into_owned(),
                phase: TestPhase::PreProcessAndClassify,
                board: 0,
            })
            .unwrap();
        rig.engine.push_result(vec![vec![GOOD]]);
        rig.detector.parameters_test().unwrap();

        let cache = rig.ctx.results().unwrap();
        let cached = cache.current_result("CAM0", 1).unwrap();
        assert_eq!((cached.frame.width, cached.frame.height), (4, 2));
        assert!(cached.ok);
        assert_eq!(rig.engine.calls().len(), 1);
        assert_eq!(rig.ctx.repository().defect_count(), 0);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_save_test_frames() {
        let dir = std::env::temp_dir().join(format!("inspect-products-{}", std::process::id()));
        let mut config = InspectionConfig::mock(1);
        config.save.products_dir = dir.clone();
        let mut rig = rig(config, None);
        assert!(rig.detector.save_test_frames().is_err());

        rig.ctx
            .set_test_settings(TestSettings {
                product: "P1".to_string(),
                ..TestSettings::default()
            })
            .unwrap();
        rig.detector.save_test_frames().unwrap();
        assert!(dir.join("TestImage.png").exists());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_update_database_report() {
        let mut rig = rig(InspectionConfig::mock(1), None);
        rig.engine.push_result(vec![vec![3]]);
        rig.detector.run_detector().unwrap();
        rig.detector.run_detector().unwrap();
        rig.detector.update_database_report().unwrap();

        let report = rig.ctx.repository().latest_report(0).unwrap();
        assert_eq!((report.total, report.total_defect), (2, 1));
        assert_eq!(report.histogram.get("Bright"), Some(&1));
    }

    #[test]
    fn test_invalid_board() {
        let ctx = Arc::new(AppContext::new(InspectionConfig::mock(1), Arc::new(Repository::new())));
        assert!(matches!(
            Detector::new(3, ctx, None, Vec::new(), None),
            Err(InspectionError::InvalidBoard(3))
        ));
    }
}
