//! Shared application context
//!
//! Run status, product and test settings, running totals and the UI result
//! cache, shared by the board threads, the background threads and the HTTP
//! surface. Each piece has its own lock.

use crate::config::InspectionConfig;
use crate::InspectionError;
use camera_capture::Frame;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use storage::Repository;
use tracing::{debug, info};

/// Product parameter indices
pub const SAVE_IMAGE_TYPE: usize = 0;
pub const IMAGE_SAVE_SIZE: usize = 1;
pub const PURGE_SIGNAL_TYPE: usize = 6;
pub const RUN_MODE: usize = 7;

/// Placeholder for an unset test product or image
pub const NOT_AVAILABLE: &str = "N/A";

/// Process-wide run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    NotRun,
    ProductRun,
    TestRun,
    TestRunWithCamera,
}

impl RunStatus {
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(RunStatus::NotRun),
            1 => Some(RunStatus::ProductRun),
            2 => Some(RunStatus::TestRun),
            3 => Some(RunStatus::TestRunWithCamera),
            _ => None,
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            RunStatus::NotRun => 0,
            RunStatus::ProductRun => 1,
            RunStatus::TestRun => 2,
            RunStatus::TestRunWithCamera => 3,
        }
    }

    /// Whether the board threads need started cameras
    pub fn needs_cameras(&self) -> bool {
        matches!(self, RunStatus::ProductRun | RunStatus::TestRunWithCamera)
    }
}

/// Which images go to the history directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveImageType {
    All,
    NgOnly,
    No,
    /// Every image of one board
    Board(usize),
}

impl SaveImageType {
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => SaveImageType::All,
            1 => SaveImageType::NgOnly,
            c if c >= 3 => SaveImageType::Board((c - 3) as usize),
            _ => SaveImageType::No,
        }
    }

    pub fn saves(&self, is_ok: bool, board: usize) -> bool {
        match self {
            SaveImageType::All => true,
            SaveImageType::NgOnly => !is_ok,
            SaveImageType::No => false,
            SaveImageType::Board(b) => *b == board,
        }
    }
}

/// Detect, or report every target Good without classifying
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Detect,
    Empty,
}

impl RunMode {
    pub fn from_code(code: i32) -> Self {
        if code == 1 {
            RunMode::Empty
        } else {
            RunMode::Detect
        }
    }
}

/// How far a parameter test goes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestPhase {
    NoProcess,
    PreProcess,
    PreProcessAndClassify,
}

/// Settings of the running product
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProductSettings {
    pub product: String,
    pub lot: String,
    /// Indexed product parameters
    pub parameters: Vec<i32>,
    /// Register/value pairs written to the PLC on start
    pub plc_parameters: Vec<(u16, u16)>,
}

impl Default for ProductSettings {
    fn default() -> Self {
        Self {
            product: "Default".to_string(),
            lot: "0".to_string(),
            parameters: vec![0; 8],
            plc_parameters: Vec::new(),
        }
    }
}

impl ProductSettings {
    /// Parameter at `index`, 0 when unset
    pub fn parameter(&self, index: usize) -> i32 {
        self.parameters.get(index).copied().unwrap_or(0)
    }

    pub fn save_image_type(&self) -> SaveImageType {
        SaveImageType::from_code(self.parameter(SAVE_IMAGE_TYPE))
    }

    /// Saved image scale, percent of the frame (100 when unset)
    pub fn image_save_scale(&self) -> f64 {
        match self.parameter(IMAGE_SAVE_SIZE) {
            p if p > 0 && p <= 100 => p as f64 / 100.0,
            _ => 1.0,
        }
    }

    pub fn purge_code(&self) -> i32 {
        self.parameter(PURGE_SIGNAL_TYPE)
    }

    pub fn run_mode(&self) -> RunMode {
        RunMode::from_code(self.parameter(RUN_MODE))
    }
}

/// Parameter test request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestSettings {
    pub product: String,
    pub image_path: String,
    pub phase: TestPhase,
    pub board: usize,
}

impl Default for TestSettings {
    fn default() -> Self {
        Self {
            product: NOT_AVAILABLE.to_string(),
            image_path: NOT_AVAILABLE.to_string(),
            phase: TestPhase::PreProcessAndClassify,
            board: 0,
        }
    }
}

/// Counters of one board
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BoardCounters {
    pub total: u64,
    pub total_defect: u64,
    pub histogram: BTreeMap<String, u64>,
    /// Product number of the last counted product and whether it failed
    pub last_product: Option<(u64, bool)>,
}

/// Totals of the running product
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunningData {
    pub total: u64,
    pub total_defect: u64,
    pub boards: Vec<BoardCounters>,
}

impl RunningData {
    pub fn new(boards: usize) -> Self {
        Self {
            total: 0,
            total_defect: 0,
            boards: vec![BoardCounters::default(); boards],
        }
    }

    /// Count one shot of `board`
    ///
    /// Further shots of the same product number only add defects; the
    /// product is counted defective at most once.
    pub fn record(&mut self, board: usize, product_no: u64, defects: &[String]) {
        if self.boards.len() <= board {
            self.boards.resize(board + 1, BoardCounters::default());
        }
        let counters = &mut self.boards[board];
        let already_defective = match counters.last_product {
            Some((no, defective)) if no == product_no => defective,
            _ => {
                counters.total += 1;
                self.total += 1;
                false
            }
        };
        let defective = already_defective || !defects.is_empty();
        if defective && !already_defective {
            counters.total_defect += 1;
            self.total_defect += 1;
        }
        for name in defects {
            *counters.histogram.entry(name.clone()).or_insert(0) += 1;
        }
        counters.last_product = Some((product_no, defective));
    }

    pub fn board(&self, board: usize) -> BoardCounters {
        self.boards.get(board).cloned().unwrap_or_default()
    }
}

/// Result image kept for the UI
#[derive(Debug, Clone)]
pub struct CachedResult {
    pub frame: Frame,
    pub ok: bool,
    pub label: String,
    pub product_no: u64,
}

/// Totals shown on the dashboard
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayTotals {
    pub total: u64,
    pub total_defect: u64,
}

/// Latest result per camera and shot, plus the NG carousel
#[derive(Debug)]
pub struct ResultCache {
    current: BTreeMap<(String, u32), CachedResult>,
    ng_history: VecDeque<CachedResult>,
    history_num: usize,
    defect_indices: Vec<u64>,
    display: DisplayTotals,
}

impl ResultCache {
    pub fn new(history_num: usize) -> Self {
        Self {
            current: BTreeMap::new(),
            ng_history: VecDeque::new(),
            history_num: history_num.max(1),
            defect_indices: Vec::new(),
            display: DisplayTotals::default(),
        }
    }

    /// Store the result image of `camera_id` / `shot`
    pub fn set_current_result(&mut self, camera_id: &str, shot: u32, result: CachedResult) {
        if !result.ok {
            while self.ng_history.len() >= self.history_num {
                self.ng_history.pop_front();
            }
            self.ng_history.push_back(result.clone());
        }
        self.current.insert((camera_id.to_string(), shot), result);
    }

    pub fn current_result(&self, camera_id: &str, shot: u32) -> Option<&CachedResult> {
        self.current.get(&(camera_id.to_string(), shot))
    }

    /// NG results, oldest first
    pub fn ng_history(&self) -> impl Iterator<Item = &CachedResult> {
        self.ng_history.iter()
    }

    pub fn push_defect_index(&mut self, product_no: u64) {
        self.defect_indices.push(product_no);
    }

    pub fn defect_indices(&self) -> &[u64] {
        &self.defect_indices
    }

    /// Zero totals also clear the defect index list
    pub fn update_display_totals(&mut self, total: u64, total_defect: u64) {
        if total == 0 && total_defect == 0 {
            self.defect_indices.clear();
        }
        self.display = DisplayTotals { total, total_defect };
    }

    pub fn display_totals(&self) -> DisplayTotals {
        self.display
    }
}

/// State shared by every component of the server
pub struct AppContext {
    pub config: InspectionConfig,
    status: AtomicI32,
    stop: AtomicBool,
    product: RwLock<ProductSettings>,
    test: RwLock<TestSettings>,
    running: Mutex<RunningData>,
    results: Mutex<ResultCache>,
    repository: Arc<Repository>,
}

fn lock_error<E: std::fmt::Display>(e: E) -> InspectionError {
    InspectionError::Lock(e.to_string())
}

impl AppContext {
    pub fn new(config: InspectionConfig, repository: Arc<Repository>) -> Self {
        let boards = config.boards.len();
        let history_num = config.save.history_num;
        Self {
            config,
            status: AtomicI32::new(RunStatus::NotRun.code()),
            stop: AtomicBool::new(false),
            product: RwLock::new(ProductSettings::default()),
            test: RwLock::new(TestSettings::default()),
            running: Mutex::new(RunningData::new(boards)),
            results: Mutex::new(ResultCache::new(history_num)),
            repository,
        }
    }

    pub fn run_status(&self) -> RunStatus {
        RunStatus::from_code(self.status.load(Ordering::SeqCst)).unwrap_or(RunStatus::NotRun)
    }

    pub fn set_run_status(&self, status: RunStatus) {
        let previous = self.status.swap(status.code(), Ordering::SeqCst);
        if previous != status.code() {
            info!("Run status {:?} -> {:?}", RunStatus::from_code(previous), status);
        }
    }

    /// Leave a finished parameter test; other states are kept
    pub fn finish_test(&self) {
        if self
            .status
            .compare_exchange(
                RunStatus::TestRun.code(),
                RunStatus::NotRun.code(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
        {
            info!("Parameter test finished");
        }
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn product_settings(&self) -> Result<ProductSettings, InspectionError> {
        Ok(self.product.read().map_err(lock_error)?.clone())
    }

    /// Replace the product settings; a new product name resets the totals
    pub fn set_product_settings(&self, settings: ProductSettings) -> Result<(), InspectionError> {
        let mut product = self.product.write().map_err(lock_error)?;
        if product.product != settings.product {
            info!("Product {} -> {}", product.product, settings.product);
            *self.running.lock().map_err(lock_error)? = RunningData::new(self.config.boards.len());
        }
        *product = settings;
        Ok(())
    }

    pub fn test_settings(&self) -> Result<TestSettings, InspectionError> {
        Ok(self.test.read().map_err(lock_error)?.clone())
    }

    pub fn set_test_settings(&self, settings: TestSettings) -> Result<(), InspectionError> {
        *self.test.write().map_err(lock_error)? = settings;
        Ok(())
    }

    /// Count one shot and return the updated totals of its board
    pub fn record_running(
        &self,
        board: usize,
        product_no: u64,
        defects: &[String],
    ) -> Result<BoardCounters, InspectionError> {
        let mut running = self.running.lock().map_err(lock_error)?;
        running.record(board, product_no, defects);
        debug!("Board {} running totals {}/{}", board, running.total_defect, running.total);
        Ok(running.board(board))
    }

    pub fn running_data(&self) -> Result<RunningData, InspectionError> {
        Ok(self.running.lock().map_err(lock_error)?.clone())
    }

    pub fn results(&self) -> Result<MutexGuard<'_, ResultCache>, InspectionError> {
        self.results.lock().map_err(lock_error)
    }

    pub fn repository(&self) -> &Arc<Repository> {
        &self.repository
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> AppContext {
        AppContext::new(InspectionConfig::mock(2), Arc::new(Repository::new()))
    }

    #[test]
    fn test_run_status_codes() {
        for code in 0..4 {
            assert_eq!(RunStatus::from_code(code).unwrap().code(), code);
        }
        assert!(RunStatus::from_code(4).is_none());
        assert!(RunStatus::ProductRun.needs_cameras());
        assert!(!RunStatus::TestRun.needs_cameras());
    }

    #[test]
    fn test_save_image_type() {
        assert!(SaveImageType::from_code(0).saves(true, 1));
        assert!(!SaveImageType::from_code(1).saves(true, 0));
        assert!(SaveImageType::from_code(1).saves(false, 0));
        assert!(!SaveImageType::from_code(2).saves(false, 0));
        let board1 = SaveImageType::from_code(4);
        assert_eq!(board1, SaveImageType::Board(1));
        assert!(board1.saves(true, 1));
        assert!(!board1.saves(false, 0));
    }

    #[test]
    fn test_product_parameters() {
        let mut settings = ProductSettings::default();
        settings.parameters[IMAGE_SAVE_SIZE] = 50;
        settings.parameters[RUN_MODE] = 1;
        settings.parameters[PURGE_SIGNAL_TYPE] = 3;
        assert_eq!(settings.image_save_scale(), 0.5);
        assert_eq!(settings.run_mode(), RunMode::Empty);
        assert_eq!(settings.purge_code(), 3);
        assert_eq!(settings.parameter(42), 0);
    }

    #[test]
    fn test_running_totals_reset_on_product_switch() {
        let ctx = context();
        ctx.record_running(0, 1, &[]).unwrap();
        let counters = ctx.record_running(1, 1, &["Dark".to_string()]).unwrap();
        assert_eq!(counters.total_defect, 1);
        assert_eq!(counters.histogram.get("Dark"), Some(&1));
        assert_eq!(ctx.running_data().unwrap().total, 2);

        let mut settings = ctx.product_settings().unwrap();
        settings.lot = "L2".to_string();
        ctx.set_product_settings(settings.clone()).unwrap();
        assert_eq!(ctx.running_data().unwrap().total, 2);

        settings.product = "Other".to_string();
        ctx.set_product_settings(settings).unwrap();
        assert_eq!(ctx.running_data().unwrap().total, 0);
    }

    #[test]
    fn test_shots_of_one_product_count_once() {
        let mut running = RunningData::new(1);
        running.record(0, 5, &[]);
        running.record(0, 5, &["Stain".to_string()]);
        running.record(0, 5, &["Dark".to_string()]);
        assert_eq!((running.total, running.total_defect), (1, 1));
        assert_eq!(running.board(0).histogram.len(), 2);

        running.record(0, 6, &[]);
        assert_eq!((running.total, running.total_defect), (2, 1));
    }

    #[test]
    fn test_finish_test_only_leaves_test_runs() {
        let ctx = context();
        ctx.set_run_status(RunStatus::TestRun);
        ctx.finish_test();
        assert_eq!(ctx.run_status(), RunStatus::NotRun);

        ctx.set_run_status(RunStatus::ProductRun);
        ctx.finish_test();
        assert_eq!(ctx.run_status(), RunStatus::ProductRun);

        ctx.set_run_status(RunStatus::TestRunWithCamera);
        ctx.finish_test();
        assert_eq!(ctx.run_status(), RunStatus::TestRunWithCamera);
    }

    #[test]
    fn test_result_cache() {
        let mut cache = ResultCache::new(2);
        for n in 0..3 {
            cache.set_current_result(
                "CAM0",
                1,
                CachedResult {
                    frame: Frame::filled(4, 4, 3, 0),
                    ok: false,
                    label: format!("pic{}-NG", n),
                    product_no: n,
                },
            );
            cache.push_defect_index(n);
        }
        assert_eq!(cache.current_result("CAM0", 1).unwrap().product_no, 2);
        assert!(cache.current_result("CAM0", 2).is_none());
        let history: Vec<u64> = cache.ng_history().map(|r| r.product_no).collect();
        assert_eq!(history, vec![1, 2]);

        cache.update_display_totals(10, 3);
        assert_eq!(cache.defect_indices().len(), 3);
        cache.update_display_totals(0, 0);
        assert!(cache.defect_indices().is_empty());
    }
}
