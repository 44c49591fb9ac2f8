//! PLC / IO Signal Gateway
//!
//! Register and discrete-bit access used by the inspection boards to read
//! capture triggers and product counters and to write result and heartbeat
//! signals. Supports:
//! - Modbus-TCP PLCs (holding registers and coils)
//! - Discrete IO cards (output lines)
//! - An in-memory mock for tests
//!
//! One gateway is shared by every board thread. Boards must use disjoint
//! addresses; the gateway does not arbitrate between them.

mod card;
mod client;
mod error;
pub mod frame;
mod mock;

pub use card::{DioBackend, IoCard, MemoryDio};
pub use client::ModbusClient;
pub use error::IoError;
pub use mock::{GatewayWrite, MockGateway};

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Gateway family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayKind {
    /// Register-addressed PLC
    Plc,
    /// Discrete IO card
    IoCard,
}

/// PLC connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlcConfig {
    pub host: String,
    /// Modbus-TCP port
    pub port: u16,
    pub unit_id: u8,
    /// Connect/read/write timeout
    pub timeout_ms: u64,
}

impl Default for PlcConfig {
    fn default() -> Self {
        Self {
            host: "192.168.1.10".to_string(),
            port: 502,
            unit_id: 1,
            timeout_ms: 1000,
        }
    }
}

/// Register and bit access shared by all board threads
pub trait IoGateway: Send + Sync {
    fn kind(&self) -> GatewayKind;

    fn read_register(&self, address: u16) -> Result<u16, IoError>;
    fn write_register(&self, address: u16, value: u16) -> Result<(), IoError>;

    fn write_bit(&self, channel: u8, address: u16, value: bool) -> Result<(), IoError>;
    fn read_bit(&self, channel: u8, address: u16) -> Result<bool, IoError>;

    /// Write 1, hold, write 0
    fn pulse_bit(&self, channel: u8, address: u16, hold: Duration) -> Result<(), IoError> {
        self.write_bit(channel, address, true)?;
        std::thread::sleep(hold);
        self.write_bit(channel, address, false)
    }

    /// Reset every output
    fn clear_all(&self) -> Result<(), IoError> {
        Ok(())
    }

    fn is_connected(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plc_config_defaults() {
        let c = PlcConfig::default();
        assert_eq!(c.port, 502);
        assert_eq!(c.unit_id, 1);
    }

    #[test]
    fn test_pulse_on_mock() {
        let gw = MockGateway::io_card();
        gw.pulse_bit(0, 4, Duration::from_millis(1)).unwrap();
        assert_eq!(
            gw.writes(),
            vec![
                GatewayWrite::Bit { channel: 0, address: 4, value: true },
                GatewayWrite::Bit { channel: 0, address: 4, value: false },
            ]
        );
        assert!(!gw.bit(0, 4));
    }

    #[test]
    fn test_pulse_stops_on_failed_write() {
        let gw = MockGateway::io_card();
        gw.set_fail_writes(true);
        assert!(gw.pulse_bit(0, 4, Duration::from_millis(1)).is_err());
    }
}
