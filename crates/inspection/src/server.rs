//! Server orchestrator
//!
//! One OS thread per board plus the heartbeat and merge-total threads. All
//! of them poll the shared run status and the stop flag of [`AppContext`].

use crate::context::{AppContext, RunStatus};
use crate::detector::Detector;
use crate::save::ImageSaveWorker;
use crate::workflow::Workflow;
use crate::InspectionError;
use camera_capture::{CameraConfig, CameraManager};
use inference_engine::{DetectionEngine, EngineConfig, InferenceEngine};
use plc_io::{GatewayKind, IoGateway};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Idle poll interval of every loop
const IDLE_POLL: Duration = Duration::from_millis(5);
/// Backoff after a failed board initialisation
const INIT_RETRY: Duration = Duration::from_millis(500);
/// High time of the IO card heartbeat pulse
const HEARTBEAT_PULSE: Duration = Duration::from_millis(20);

/// Builds the detection engine of one workflow
pub type EngineFactory =
    dyn Fn(usize, &CameraConfig) -> Result<Box<dyn DetectionEngine>, InspectionError> + Send + Sync;

/// Factory handing every workflow a rule-based engine with `config`
pub fn rule_engine_factory(config: EngineConfig) -> Box<EngineFactory> {
    Box::new(move |_board: usize, _camera: &CameraConfig| {
        Ok(Box::new(InferenceEngine::with_config(config.clone())) as Box<dyn DetectionEngine>)
    })
}

fn sleep_unless_stopped(ctx: &AppContext, duration: Duration) {
    let deadline = Instant::now() + duration;
    while !ctx.is_stopped() {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep((deadline - now).min(IDLE_POLL));
    }
}

pub struct Server {
    ctx: Arc<AppContext>,
    cameras: Arc<CameraManager>,
    gateway: Option<Arc<dyn IoGateway>>,
    savers: Mutex<Vec<Arc<ImageSaveWorker>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    last_product: Arc<Mutex<String>>,
}

impl Server {
    pub fn new(ctx: Arc<AppContext>, cameras: CameraManager, gateway: Option<Arc<dyn IoGateway>>) -> Self {
        Self {
            ctx,
            cameras: Arc::new(cameras),
            gateway,
            savers: Mutex::new(Vec::new()),
            handles: Mutex::new(Vec::new()),
            last_product: Arc::new(Mutex::new(String::new())),
        }
    }

    pub fn context(&self) -> &Arc<AppContext> {
        &self.ctx
    }

    pub fn cameras(&self) -> &Arc<CameraManager> {
        &self.cameras
    }

    /// Threads spawned and not yet joined
    pub fn thread_count(&self) -> usize {
        self.handles.lock().map(|h| h.len()).unwrap_or(0)
    }

    fn start_savers(&self) -> Result<Vec<Option<Arc<ImageSaveWorker>>>, InspectionError> {
        let save = &self.ctx.config.save;
        let boards = self.ctx.config.boards.len();
        let mut savers = self
            .savers
            .lock()
            .map_err(|e| InspectionError::Lock(format!("Lock error: {}", e)))?;

        let per_board = if save.worker_per_board {
            let mut workers = Vec::with_capacity(boards);
            for board in 0..boards {
                let worker = Arc::new(ImageSaveWorker::start(
                    &format!("board{}", board),
                    &save.history_dir,
                    save.queue_size,
                )?);
                savers.push(worker.clone());
                workers.push(Some(worker));
            }
            workers
        } else {
            let worker = Arc::new(ImageSaveWorker::start("history", &save.history_dir, save.queue_size)?);
            savers.push(worker.clone());
            vec![Some(worker); boards]
        };
        Ok(per_board)
    }

    /// Wire every board's workflows to its cameras and engines
    pub fn build_detectors(&self, factory: &EngineFactory) -> Result<Vec<Detector>, InspectionError> {
        let savers = self.start_savers()?;
        let catalog = self.ctx.config.catalog();
        let mut detectors = Vec::with_capacity(self.ctx.config.boards.len());
        for (board, saver) in savers.into_iter().enumerate() {
            let mut workflows = Vec::new();
            for (index, camera_config) in self.ctx.config.cameras_for_board(board).iter().enumerate() {
                let camera = self.cameras.get(&camera_config.name).ok_or_else(|| {
                    InspectionError::Config(format!("camera {} is not registered", camera_config.name))
                })?;
                let engine = factory(board, camera_config)?;
                workflows.push(Workflow::new(index, board, camera, engine, catalog.clone()));
            }
            detectors.push(Detector::new(
                board,
                self.ctx.clone(),
                self.gateway.clone(),
                workflows,
                saver,
            )?);
        }
        Ok(detectors)
    }

    /// Start cameras and every thread
    pub fn start(&self, factory: &EngineFactory) -> Result<(), InspectionError> {
        let detectors = self.build_detectors(factory)?;
        self.start_with(detectors)
    }

    /// Start cameras and run the given detectors
    pub fn start_with(&self, detectors: Vec<Detector>) -> Result<(), InspectionError> {
        let started = self.cameras.start_all();
        if started < self.cameras.len() {
            warn!("Only {}/{} cameras started", started, self.cameras.len());
        }

        let mut handles = self
            .handles
            .lock()
            .map_err(|e| InspectionError::Lock(format!("Lock error: {}", e)))?;

        for detector in detectors {
            let board = detector.board();
            let runner = BoardRunner {
                ctx: self.ctx.clone(),
                detector,
                last_product: self.last_product.clone(),
            };
            let handle = thread::Builder::new()
                .name(format!("board-{}", board))
                .spawn(move || runner.run())?;
            handles.push(handle);
        }

        if let Some(gateway) = &self.gateway {
            let ctx = self.ctx.clone();
            let gateway = gateway.clone();
            handles.push(
                thread::Builder::new()
                    .name("heartbeat".into())
                    .spawn(move || heartbeat_loop(&ctx, gateway.as_ref()))?,
            );
        }

        if self.ctx.config.merge_total {
            let ctx = self.ctx.clone();
            let gateway = self.gateway.clone();
            handles.push(
                thread::Builder::new()
                    .name("merge-total".into())
                    .spawn(move || merge_total_loop(&ctx, gateway.as_deref()))?,
            );
        }

        info!("Server started with {} threads", handles.len());
        Ok(())
    }

    /// Raise the stop flag; threads exit at their next loop top
    pub fn stop(&self) {
        info!("Stopping server");
        self.ctx.stop();
    }

    /// Wait for every thread, then release savers and cameras
    pub fn join(&self) {
        let handles: Vec<JoinHandle<()>> = match self.handles.lock() {
            Ok(mut h) => h.drain(..).collect(),
            Err(e) => {
                error!("Server thread list poisoned: {}", e);
                return;
            }
        };
        for handle in handles {
            let name = handle.thread().name().unwrap_or("unnamed").to_string();
            if handle.join().is_err() {
                error!("Thread {} panicked", name);
            }
        }
        if let Ok(mut savers) = self.savers.lock() {
            for saver in savers.drain(..) {
                saver.stop();
            }
        }
        self.cameras.stop_all();
        info!("Server stopped");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}

/// Per-board thread state
struct BoardRunner {
    ctx: Arc<AppContext>,
    detector: Detector,
    last_product: Arc<Mutex<String>>,
}

impl BoardRunner {
    fn run(mut self) {
        let board = self.detector.board();
        info!("Board {} thread started", board);

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.run_loop()));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Board {} detector stopped: {}", board, e),
            Err(_) => error!("Board {} detector panicked", board),
        }

        if let Err(e) = self.detector.update_database_report() {
            error!("Board {} final report flush failed: {}", board, e);
        }
        info!("Board {} thread exited", board);
    }

    fn run_loop(&mut self) -> Result<(), InspectionError> {
        let board = self.detector.board();
        let report_interval = Duration::from_secs(self.ctx.config.report_interval_minutes.max(1) * 60);
        let mut last_report = Instant::now();
        let mut first_start = true;
        // Latched once; later outages go through the read-failure restart path
        let mut cameras_ready = false;

        while !self.ctx.is_stopped() {
            let status = self.ctx.run_status();
            if status == RunStatus::NotRun {
                thread::sleep(IDLE_POLL);
                self.check_product_switch()?;
                first_start = true;
                continue;
            }

            if status.needs_cameras() && !cameras_ready {
                if !self.detector.cameras_ready() {
                    thread::sleep(IDLE_POLL);
                    continue;
                }
                info!("Board {} cameras ready", board);
                cameras_ready = true;
            }

            if first_start {
                if let Err(e) = self.detector.init_board_parameters() {
                    error!("Board {} initialisation failed, retrying: {}", board, e);
                    thread::sleep(INIT_RETRY);
                    continue;
                }
                first_start = false;
            }

            if last_report.elapsed() >= report_interval {
                last_report = Instant::now();
                if let Err(e) = self.detector.update_database_report() {
                    warn!("Board {} report flush failed: {}", board, e);
                }
            }

            match status {
                RunStatus::ProductRun => {
                    if let Err(e) = self.detector.run_detector() {
                        if e.is_fatal() {
                            return Err(e);
                        }
                        debug!("Board {} cycle skipped: {}", board, e);
                    }
                }
                RunStatus::TestRun => self.run_parameters_test()?,
                RunStatus::TestRunWithCamera => self.run_camera_test()?,
                RunStatus::NotRun => {}
            }
        }
        Ok(())
    }

    fn run_parameters_test(&mut self) -> Result<(), InspectionError> {
        let board = self.detector.board();
        if self.ctx.test_settings()?.board != board {
            thread::sleep(IDLE_POLL);
            return Ok(());
        }
        match self.detector.parameters_test() {
            Ok(()) => info!("Board {} parameter test done", board),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => error!("Board {} parameter test failed: {}", board, e),
        }
        self.ctx.finish_test();
        Ok(())
    }

    fn run_camera_test(&mut self) -> Result<(), InspectionError> {
        let board = self.detector.board();
        if self.ctx.test_settings()?.board != board {
            thread::sleep(IDLE_POLL);
            return Ok(());
        }
        match self.detector.save_test_frames() {
            Ok(()) => {}
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => error!("Board {} saving test images failed: {}", board, e),
        }
        if self.detector.is_mock() {
            thread::sleep(Duration::from_millis(self.ctx.config.mock_frame_interval_ms));
        }
        Ok(())
    }

    /// Reset the board state once per product change
    fn check_product_switch(&mut self) -> Result<(), InspectionError> {
        let product = self.ctx.product_settings()?.product;
        let mut last = self
            .last_product
            .lock()
            .map_err(|e| InspectionError::Lock(format!("Lock error: {}", e)))?;
        if *last != product {
            if !last.is_empty() {
                info!("Product switched from {} to {}", last, product);
                self.ctx.results()?.update_display_totals(0, 0);
            }
            *last = product;
        }
        Ok(())
    }
}

/// Toggle the PLC heartbeat register or pulse the IO card heartbeat bit
fn heartbeat_loop(ctx: &AppContext, gateway: &dyn IoGateway) {
    let config = &ctx.config.gateway;
    let interval = Duration::from_millis(config.heartbeat_interval_ms.max(1));
    let mut counter: u16 = 0;
    info!("Heartbeat thread started ({:?} interval)", interval);

    while !ctx.is_stopped() {
        sleep_unless_stopped(ctx, interval);
        if ctx.is_stopped() {
            break;
        }
        counter = counter.wrapping_add(1);
        let result = match gateway.kind() {
            GatewayKind::IoCard => gateway.pulse_bit(0, config.heartbeat_bit, HEARTBEAT_PULSE),
            GatewayKind::Plc => gateway.write_register(config.heartbeat_register, counter % 2),
        };
        if let Err(e) = result {
            warn!("Heartbeat write failed: {}", e);
        }
    }
    info!("Heartbeat thread exited");
}

/// Refresh the display totals while a run is active
fn merge_total_loop(ctx: &AppContext, gateway: Option<&dyn IoGateway>) {
    let interval = Duration::from_millis(ctx.config.merge_interval_ms.max(1));
    let all_mock = (0..ctx.config.boards.len()).all(|b| ctx.config.board_is_mock(b));
    let plc = gateway.filter(|g| g.kind() == GatewayKind::Plc && !all_mock);
    let mut last = Instant::now();
    info!("Merge-total thread started ({:?} interval)", interval);

    while !ctx.is_stopped() {
        thread::sleep(IDLE_POLL);
        if ctx.run_status() == RunStatus::NotRun {
            last = Instant::now();
            continue;
        }
        if last.elapsed() < interval {
            continue;
        }
        last = Instant::now();

        let totals = match plc {
            Some(plc) => read_plc_totals(ctx, plc),
            None => ctx.running_data().map(|r| (r.total, r.total_defect)),
        };
        match totals {
            Ok((total, total_defect)) => match ctx.results() {
                Ok(mut cache) => cache.update_display_totals(total, total_defect),
                Err(e) => warn!("Merge-total update failed: {}", e),
            },
            Err(e) => warn!("Merge-total read failed: {}", e),
        }
    }
    info!("Merge-total thread exited");
}

fn read_plc_totals(ctx: &AppContext, plc: &dyn IoGateway) -> Result<(u64, u64), InspectionError> {
    let registers = &ctx.config.gateway;
    let total = plc.read_register(registers.total_num_register)?;
    let total_defect = plc.read_register(registers.total_defect_register)?;
    Ok((total as u64, total_defect as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InspectionConfig;
    use crate::context::{TestSettings, SAVE_IMAGE_TYPE};
    use crate::config::CameraType;
    use camera_capture::{Frame, SimulatedDeviceFactory};
    use inference_engine::{InferenceError, ScriptedEngine};
    use plc_io::{GatewayWrite, MockGateway};
    use storage::Repository;

    fn wait_for(pred: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if pred() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    fn scripted_factory() -> Box<EngineFactory> {
        Box::new(|_board: usize, _camera: &CameraConfig| {
            Ok(Box::new(ScriptedEngine::new(1)) as Box<dyn DetectionEngine>)
        })
    }

    struct PanickingEngine;

    impl DetectionEngine for PanickingEngine {
        fn detect_analyze(&mut self, _frame: &Frame, _count: u64, _shot: u32) -> Result<Vec<Vec<i32>>, InferenceError> {
            panic!("engine crashed");
        }

        fn target_count(&self) -> usize {
            1
        }
    }

    fn test_config(boards: usize) -> InspectionConfig {
        let mut config = InspectionConfig::mock(boards);
        config.mock_frame_interval_ms = 1;
        config.merge_interval_ms = 10;
        config.gateway.heartbeat_interval_ms = 10;
        config.save.history_dir = std::env::temp_dir().join(format!("inspect-server-{}", std::process::id()));
        config
    }

    fn server(boards: usize, gateway: Option<Arc<dyn IoGateway>>) -> Server {
        server_with(test_config(boards), &SimulatedDeviceFactory::new(), gateway)
    }

    fn server_with(config: InspectionConfig, devices: &SimulatedDeviceFactory, gateway: Option<Arc<dyn IoGateway>>) -> Server {
        let cameras = CameraManager::from_configs(&config.cameras, devices, Duration::from_millis(1)).unwrap();
        let ctx = Arc::new(AppContext::new(config, Arc::new(Repository::new())));
        let mut settings = ctx.product_settings().unwrap();
        settings.parameters[SAVE_IMAGE_TYPE] = 2;
        ctx.set_product_settings(settings).unwrap();
        Server::new(ctx, cameras, gateway)
    }

    #[test]
    fn test_product_run_on_every_board() {
        let server = server(2, None);
        server.start(&*scripted_factory()).unwrap();
        let ctx = server.context().clone();
        assert_eq!(server.thread_count(), 3);

        thread::sleep(Duration::from_millis(30));
        assert_eq!(ctx.running_data().unwrap().total, 0);

        ctx.set_run_status(RunStatus::ProductRun);
        assert!(wait_for(|| {
            let running = ctx.running_data().unwrap();
            running.board(0).total >= 2 && running.board(1).total >= 2
        }));
        assert!(wait_for(|| ctx.results().unwrap().display_totals().total > 0));

        server.stop();
        server.join();
        assert_eq!(server.thread_count(), 0);
        assert!(ctx.repository().latest_report(0).is_ok());
        assert!(ctx.repository().latest_report(1).is_ok());
    }

    #[test]
    fn test_parameter_test_targets_one_board() {
        let server = server(2, None);
        let ctx = server.context().clone();
        let path = std::env::temp_dir().join(format!("inspect-server-test-{}.png", std::process::id()));
        Frame::filled(60, 30, 3, 90).save(&path).unwrap();
        ctx.set_test_settings(TestSettings {
            product: "P1".to_string(),
            image_path: path.to_string_lossy().into_owned(),
            board: 1,
            ..TestSettings::default()
        })
        .unwrap();

        server.start(&*scripted_factory()).unwrap();
        ctx.set_run_status(RunStatus::TestRun);
        assert!(wait_for(|| ctx.run_status() == RunStatus::NotRun));
        {
            let cache = ctx.results().unwrap();
            assert!(cache.current_result("CAM1", 1).is_some());
            assert!(cache.current_result("CAM0", 1).is_none());
        }
        server.stop();
        server.join();
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_plc_heartbeat_toggles() {
        let plc = Arc::new(MockGateway::plc());
        let server = server(1, Some(plc.clone()));
        server.start(&*scripted_factory()).unwrap();
        let heartbeat = server.context().config.gateway.heartbeat_register;
        let beats = || -> Vec<u16> {
            plc.writes()
                .into_iter()
                .filter_map(|w| match w {
                    GatewayWrite::Register { address, value } if address == heartbeat => Some(value),
                    _ => None,
                })
                .collect()
        };
        assert!(wait_for(|| beats().len() >= 3));
        server.stop();
        server.join();
        let beats = beats();
        assert_eq!(&beats[..3], &[1, 0, 1]);
    }

    #[test]
    fn test_io_card_heartbeat_pulses() {
        let card = Arc::new(MockGateway::io_card());
        let server = server(1, Some(card.clone()));
        server.start(&*scripted_factory()).unwrap();
        let bit = server.context().config.gateway.heartbeat_bit;
        assert!(wait_for(|| {
            card.writes()
                .iter()
                .any(|w| matches!(w, GatewayWrite::Bit { address, value: false, .. } if *address == bit))
        }));
        server.stop();
        server.join();
    }

    #[test]
    fn test_product_switch_clears_display() {
        let server = server(1, None);
        let ctx = server.context().clone();
        server.start(&*scripted_factory()).unwrap();
        thread::sleep(Duration::from_millis(50));
        ctx.results().unwrap().update_display_totals(5, 1);

        let mut settings = ctx.product_settings().unwrap();
        settings.product = "Other".to_string();
        ctx.set_product_settings(settings).unwrap();
        assert!(wait_for(|| ctx.results().unwrap().display_totals().total == 0));
        server.stop();
        server.join();
    }

    #[test]
    fn test_board_recovers_after_failed_restart() {
        let mut config = test_config(1);
        config.camera_type = CameraType::Haikang;
        let mut camera = CameraConfig::area_array("CAM0", "SN-R0");
        camera.pixel_format = "Mono8".to_string();
        camera.width = 32;
        camera.height = 16;
        camera.fps = 200.0;
        camera.read_timeout_ms = 50;
        config.cameras = vec![camera];

        let devices = SimulatedDeviceFactory::new();
        let server = server_with(config, &devices, None);
        let ctx = server.context().clone();
        let camera = server.cameras().get("CAM0").unwrap();
        let sensor = devices.sensor("SN-R0").unwrap();
        server.start(&*scripted_factory()).unwrap();

        ctx.set_run_status(RunStatus::ProductRun);
        assert!(wait_for(|| ctx.running_data().unwrap().board(0).total >= 2));

        sensor.set_present(false);
        sensor.set_online(false);
        assert!(wait_for(|| !camera.is_started()));
        thread::sleep(Duration::from_millis(100));
        assert!(!camera.is_started());
        let before = ctx.running_data().unwrap().board(0).total;

        sensor.set_present(true);
        sensor.set_online(true);
        assert!(wait_for(|| camera.is_started()));
        assert!(wait_for(|| ctx.running_data().unwrap().board(0).total > before));

        server.stop();
        server.join();
    }

    #[test]
    fn test_panicking_board_flushes_report() {
        let server = server(1, None);
        let ctx = server.context().clone();
        let factory: Box<EngineFactory> = Box::new(|_board: usize, _camera: &CameraConfig| {
            Ok(Box::new(PanickingEngine) as Box<dyn DetectionEngine>)
        });
        server.start(&*factory).unwrap();
        thread::sleep(Duration::from_millis(20));
        assert!(ctx.repository().latest_report(0).is_err());

        ctx.set_run_status(RunStatus::ProductRun);
        assert!(wait_for(|| server.handles.lock().unwrap()[0].is_finished()));
        assert!(ctx.repository().latest_report(0).is_ok());
        assert!(!ctx.is_stopped());

        server.stop();
        server.join();
    }
}
