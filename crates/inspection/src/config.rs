//! Inspection configuration
//!
//! Layered: built-in defaults, an optional TOML/JSON file, then environment
//! variables prefixed `INSPECT_` with `__` between nested keys
//! (e.g. `INSPECT_GATEWAY__PLC__HOST`).

use crate::InspectionError;
use camera_capture::{CameraConfig, CameraKind};
use inference_engine::{DefectCatalog, EngineConfig};
use plc_io::{GatewayKind, PlcConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::info;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "INSPECT";

/// Camera family used by the whole line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraType {
    Haikang,
    Mock,
}

impl FromStr for CameraType {
    type Err = InspectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "haikang" => Ok(CameraType::Haikang),
            "mock" => Ok(CameraType::Mock),
            other => Err(InspectionError::Config(format!("unknown camera type {}", other))),
        }
    }
}

/// Exposure and gain for one shot
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ShotParameters {
    pub exposure: f64,
    pub gain: f64,
}

/// One inspection board
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoardConfig {
    /// Camera names, one workflow each
    pub cameras: Vec<String>,
    /// Shots per product
    pub total_capture_times: u32,
    /// Per-shot camera parameters, index 0 is the first shot
    pub shots: Vec<ShotParameters>,
    /// Scale of the cached result image
    pub draw_scale: f64,
    /// Target outline width (pixels)
    pub draw_thickness: u32,
    /// PLC register announcing which shot to take
    pub trigger_register: u16,
    /// PLC register receiving the OK/NG value
    pub result_register: u16,
    /// IO card line pulsed on OK
    pub result_bit: u16,
    /// PLC register holding the board's product counter
    pub count_register: u16,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            cameras: vec!["CAM0".to_string()],
            total_capture_times: 1,
            shots: vec![ShotParameters {
                exposure: 10000.0,
                gain: 0.0,
            }],
            draw_scale: 0.5,
            draw_thickness: 3,
            trigger_register: 10,
            result_register: 20,
            result_bit: 0,
            count_register: 30,
        }
    }
}

/// PLC or IO card wiring
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Run without any gateway when false
    pub enabled: bool,
    pub kind: GatewayKind,
    pub plc: PlcConfig,
    pub io_card_channels: u8,
    pub io_card_lines: u16,
    /// IO card result pulse width
    pub signal_hold_ms: u64,
    pub ok_value: u16,
    pub ng_value: u16,
    /// Signal even when the cameras are mocks
    pub send_signal_in_mock: bool,
    /// Send the highest defect code instead of NG
    pub plc_defect_mode: bool,
    pub heartbeat_register: u16,
    pub heartbeat_bit: u16,
    pub heartbeat_interval_ms: u64,
    pub total_num_register: u16,
    pub total_defect_register: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            kind: GatewayKind::Plc,
            plc: PlcConfig::default(),
            io_card_channels: 1,
            io_card_lines: 16,
            signal_hold_ms: 50,
            ok_value: 1,
            ng_value: 2,
            send_signal_in_mock: false,
            plc_defect_mode: false,
            heartbeat_register: 100,
            heartbeat_bit: 15,
            heartbeat_interval_ms: 1000,
            total_num_register: 110,
            total_defect_register: 112,
        }
    }
}

/// Image saving
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SaveConfig {
    /// Root of origin/ and resultImage/
    pub history_dir: PathBuf,
    /// Test image output
    pub products_dir: PathBuf,
    /// Save queue bound; extra images are dropped
    pub queue_size: usize,
    /// NG history carousel length
    pub history_num: usize,
    /// Pause saving while a frame is being classified
    pub hang_up_during_detect: bool,
    /// One save worker per board instead of a shared one
    pub worker_per_board: bool,
}

impl Default for SaveConfig {
    fn default() -> Self {
        Self {
            history_dir: PathBuf::from("/opt/history"),
            products_dir: PathBuf::from("/opt/products"),
            queue_size: 100,
            history_num: 20,
            hang_up_during_detect: false,
            worker_per_board: false,
        }
    }
}

/// Inspection server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InspectionConfig {
    pub camera_type: CameraType,
    pub cameras: Vec<CameraConfig>,
    pub boards: Vec<BoardConfig>,
    pub gateway: GatewayConfig,
    pub save: SaveConfig,
    pub engine: EngineConfig,
    pub defect_categories: Vec<String>,
    /// Directory with one replay sub-directory per mock camera
    pub mock_path: Option<String>,
    /// Sleep before each mock read
    pub mock_frame_interval_ms: u64,
    /// Force every read to shot 1 or 2 (0 = off)
    pub capture_times_override: u32,
    /// Count every defect of a target instead of the first
    pub multi_defect: bool,
    pub mes_enabled: bool,
    /// Run the display-total refresh thread
    pub merge_total: bool,
    pub merge_interval_ms: u64,
    pub report_interval_minutes: u64,
    pub restart_backoff_ms: u64,
}

impl Default for InspectionConfig {
    fn default() -> Self {
        Self {
            camera_type: CameraType::Haikang,
            cameras: vec![CameraConfig::area_array("CAM0", "00000000")],
            boards: vec![BoardConfig::default()],
            gateway: GatewayConfig::default(),
            save: SaveConfig::default(),
            engine: EngineConfig::default(),
            defect_categories: DefectCatalog::default().categories().to_vec(),
            mock_path: None,
            mock_frame_interval_ms: 100,
            capture_times_override: 0,
            multi_defect: false,
            mes_enabled: false,
            merge_total: true,
            merge_interval_ms: 1000,
            report_interval_minutes: 60,
            restart_backoff_ms: 1000,
        }
    }
}

impl InspectionConfig {
    /// Mock cameras, one per board, no gateway
    pub fn mock(boards: usize) -> Self {
        let boards = boards.max(1);
        let mut gateway = GatewayConfig {
            enabled: false,
            ..Default::default()
        };
        gateway.heartbeat_interval_ms = 500;
        Self {
            camera_type: CameraType::Mock,
            cameras: (0..boards)
                .map(|b| CameraConfig::mock(&format!("CAM{}", b), None))
                .collect(),
            boards: (0..boards)
                .map(|b| BoardConfig {
                    cameras: vec![format!("CAM{}", b)],
                    trigger_register: 10 + b as u16,
                    result_register: 20 + b as u16,
                    result_bit: b as u16,
                    count_register: 30 + b as u16,
                    ..Default::default()
                })
                .collect(),
            gateway,
            mock_frame_interval_ms: 50,
            ..Default::default()
        }
    }

    /// Defaults, then `path`, then `INSPECT_*` variables
    pub fn load(path: Option<&Path>) -> Result<Self, InspectionError> {
        Self::load_with_prefix(path, ENV_PREFIX)
    }

    pub(crate) fn load_with_prefix(path: Option<&Path>, prefix: &str) -> Result<Self, InspectionError> {
        let defaults = config::Config::try_from(&InspectionConfig::default())?;
        let mut builder = config::Config::builder().add_source(defaults);
        if let Some(path) = path {
            info!("Loading configuration from {}", path.display());
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(prefix)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: InspectionConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check board wiring and address disjointness
    pub fn validate(&self) -> Result<(), InspectionError> {
        if self.boards.is_empty() {
            return Err(InspectionError::Config("no boards configured".to_string()));
        }

        let mut names = BTreeSet::new();
        for camera in &self.cameras {
            if !names.insert(camera.name.as_str()) {
                return Err(InspectionError::Config(format!("duplicate camera {}", camera.name)));
            }
        }

        let mut claimed = BTreeSet::new();
        for (b, board) in self.boards.iter().enumerate() {
            if board.cameras.is_empty() {
                return Err(InspectionError::Config(format!("board {} has no camera", b)));
            }
            if board.total_capture_times == 0 {
                return Err(InspectionError::Config(format!("board {} takes zero shots", b)));
            }
            if board.draw_scale <= 0.0 {
                return Err(InspectionError::Config(format!("board {} draw scale must be positive", b)));
            }
            for name in &board.cameras {
                if !names.contains(name.as_str()) {
                    return Err(InspectionError::Config(format!(
                        "board {} uses unknown camera {}",
                        b, name
                    )));
                }
                if !claimed.insert(name.as_str()) {
                    return Err(InspectionError::Config(format!("camera {} on two boards", name)));
                }
            }
        }

        if self.gateway.enabled {
            self.check_disjoint_addresses()?;
        }
        Ok(())
    }

    /// Boards must not share any register or bit they write or consume
    fn check_disjoint_addresses(&self) -> Result<(), InspectionError> {
        let mut used = BTreeSet::new();
        for (b, board) in self.boards.iter().enumerate() {
            let addresses: Vec<(&str, u16)> = match self.gateway.kind {
                GatewayKind::Plc => vec![
                    ("register", board.trigger_register),
                    ("register", board.result_register),
                    ("register", board.count_register),
                ],
                GatewayKind::IoCard => vec![("bit", board.result_bit)],
            };
            for (space, address) in addresses {
                if !used.insert((space, address)) {
                    return Err(InspectionError::Config(format!(
                        "board {} reuses {} {}",
                        b, space, address
                    )));
                }
            }
        }
        Ok(())
    }

    /// Camera configs of a board in workflow order
    pub fn cameras_for_board(&self, board: usize) -> Vec<CameraConfig> {
        let Some(b) = self.boards.get(board) else {
            return Vec::new();
        };
        b.cameras
            .iter()
            .filter_map(|name| self.cameras.iter().find(|c| &c.name == name).cloned())
            .collect()
    }

    /// Exposure/gain of `shot` (1-based) on `board`
    pub fn shot_parameters(&self, board: usize, shot: u32) -> Option<ShotParameters> {
        let index = shot.checked_sub(1)? as usize;
        self.boards.get(board)?.shots.get(index).copied()
    }

    /// Turn every camera into a mock replaying `<mock_path>/<camera>`
    pub fn into_mock_cameras(mut self) -> Self {
        self.camera_type = CameraType::Mock;
        let root = self.mock_path.clone();
        for camera in &mut self.cameras {
            let dir = root
                .as_ref()
                .map(|r| Path::new(r).join(&camera.name).to_string_lossy().into_owned());
            let mut mock = CameraConfig::mock(&camera.name, dir.as_deref());
            mock.width = camera.width;
            mock.height = camera.height;
            mock.transpose = camera.transpose;
            *camera = mock;
        }
        self
    }

    /// Whether the cameras of `board` are all mocks
    pub fn board_is_mock(&self, board: usize) -> bool {
        self.camera_type == CameraType::Mock
            || self
                .cameras_for_board(board)
                .iter()
                .all(|c| c.kind == CameraKind::Mock || c.is_mock())
    }

    pub fn catalog(&self) -> DefectCatalog {
        DefectCatalog::new(self.defect_categories.clone())
    }
}
