//! Command line options

use clap::Parser;
use inspection::{CameraType, InspectionConfig, InspectionError};
use plc_io::GatewayKind;
use std::path::PathBuf;

/// Machine-vision inspection server
#[derive(Debug, Parser)]
#[command(name = "inspection-server", version, about)]
pub struct Cli {
    /// HTTP bind address
    #[arg(short = 'a', long, default_value = "0.0.0.0")]
    pub address: String,

    /// HTTP port
    #[arg(short = 'p', long, default_value_t = 8080)]
    pub port: u16,

    /// PLC address as host or host:port; enables the PLC gateway
    #[arg(short = 'd', long = "plc-address")]
    pub plc_address: Option<String>,

    /// Camera type: haikang or mock
    #[arg(short = 'c', long = "camera-type")]
    pub camera_type: Option<CameraType>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long = "log-level", default_value = "info")]
    pub log_level: String,

    /// Log file instead of stdout
    #[arg(short = 'o', long = "log-output")]
    pub log_output: Option<PathBuf>,

    /// Log as JSON lines
    #[arg(long)]
    pub log_json: bool,

    /// Directory of mock camera images
    #[arg(short = 'f', long = "mock-path")]
    pub mock_path: Option<String>,

    /// Configuration file (TOML or JSON)
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Cli {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Apply the command line overrides on top of the loaded configuration
    pub fn apply(&self, mut config: InspectionConfig) -> Result<InspectionConfig, InspectionError> {
        if let Some(address) = &self.plc_address {
            let (host, port) = match address.rsplit_once(':') {
                Some((host, port)) => {
                    let port = port
                        .parse()
                        .map_err(|_| InspectionError::Config(format!("invalid PLC port in {}", address)))?;
                    (host.to_string(), port)
                }
                None => (address.clone(), config.gateway.plc.port),
            };
            config.gateway.enabled = true;
            config.gateway.kind = GatewayKind::Plc;
            config.gateway.plc.host = host;
            config.gateway.plc.port = port;
        }
        if let Some(path) = &self.mock_path {
            config.mock_path = Some(path.clone());
        }
        match self.camera_type {
            Some(CameraType::Mock) => config = config.into_mock_cameras(),
            Some(camera_type) => config.camera_type = camera_type,
            None => {}
        }
        config.validate()?;
        Ok(config)
    }
}
