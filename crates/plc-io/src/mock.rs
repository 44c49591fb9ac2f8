//! In-memory gateway for tests and hardware-free runs

use crate::error::IoError;
use crate::{GatewayKind, IoGateway};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tracing::{debug, info};

/// One write seen by the mock gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayWrite {
    Register { address: u16, value: u16 },
    Bit { channel: u8, address: u16, value: bool },
}

#[derive(Debug, Default)]
struct MockState {
    registers: HashMap<u16, u16>,
    /// Values returned by the next reads, ahead of the stored register
    scripted: HashMap<u16, VecDeque<u16>>,
    bits: HashMap<(u8, u16), bool>,
    writes: Vec<GatewayWrite>,
    fail_writes: bool,
    fail_reads: bool,
}

/// Mock PLC or IO card
pub struct MockGateway {
    kind: GatewayKind,
    state: Mutex<MockState>,
}

impl MockGateway {
    /// Mock PLC with register access
    pub fn plc() -> Self {
        info!("Creating mock PLC gateway");
        Self {
            kind: GatewayKind::Plc,
            state: Mutex::new(MockState::default()),
        }
    }

    /// Mock IO card
    pub fn io_card() -> Self {
        info!("Creating mock IO card gateway");
        Self {
            kind: GatewayKind::IoCard,
            state: Mutex::new(MockState::default()),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> Result<R, IoError> {
        let mut s = self
            .state
            .lock()
            .map_err(|e| IoError::Lock(e.to_string()))?;
        Ok(f(&mut s))
    }

    /// Set a register as the PLC would
    pub fn set_register(&self, address: u16, value: u16) {
        let _ = self.with(|s| s.registers.insert(address, value));
    }

    /// Current register value (0 if never written)
    pub fn register(&self, address: u16) -> u16 {
        self.with(|s| s.registers.get(&address).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Queue values returned by the next reads of `address`
    pub fn push_register_values(&self, address: u16, values: &[u16]) {
        let _ = self.with(|s| s.scripted.entry(address).or_default().extend(values.iter().copied()));
    }

    pub fn bit(&self, channel: u8, address: u16) -> bool {
        self.with(|s| s.bits.get(&(channel, address)).copied().unwrap_or(false))
            .unwrap_or(false)
    }

    /// Every write in order
    pub fn writes(&self) -> Vec<GatewayWrite> {
        self.with(|s| s.writes.clone()).unwrap_or_default()
    }

    pub fn clear_writes(&self) {
        let _ = self.with(|s| s.writes.clear());
    }

    /// Make every write fail
    pub fn set_fail_writes(&self, fail: bool) {
        let _ = self.with(|s| s.fail_writes = fail);
    }

    /// Make every read fail
    pub fn set_fail_reads(&self, fail: bool) {
        let _ = self.with(|s| s.fail_reads = fail);
    }
}

impl IoGateway for MockGateway {
    fn kind(&self) -> GatewayKind {
        self.kind
    }

    fn read_register(&self, address: u16) -> Result<u16, IoError> {
        self.with(|s| {
            if s.fail_reads {
                return Err(IoError::Connection("mock read failure".to_string()));
            }
            if let Some(value) = s.scripted.get_mut(&address).and_then(VecDeque::pop_front) {
                s.registers.insert(address, value);
                return Ok(value);
            }
            Ok(s.registers.get(&address).copied().unwrap_or(0))
        })?
    }

    fn write_register(&self, address: u16, value: u16) -> Result<(), IoError> {
        self.with(|s| {
            if s.fail_writes {
                return Err(IoError::WriteRejected(format!("mock register {}", address)));
            }
            debug!("Mock register {} = {}", address, value);
            s.registers.insert(address, value);
            s.writes.push(GatewayWrite::Register { address, value });
            Ok(())
        })?
    }

    fn write_bit(&self, channel: u8, address: u16, value: bool) -> Result<(), IoError> {
        self.with(|s| {
            if s.fail_writes {
                return Err(IoError::WriteRejected(format!("mock bit {}:{}", channel, address)));
            }
            s.bits.insert((channel, address), value);
            s.writes.push(GatewayWrite::Bit { channel, address, value });
            Ok(())
        })?
    }

    fn read_bit(&self, channel: u8, address: u16) -> Result<bool, IoError> {
        self.with(|s| {
            if s.fail_reads {
                return Err(IoError::Connection("mock read failure".to_string()));
            }
            Ok(s.bits.get(&(channel, address)).copied().unwrap_or(false))
        })?
    }

    fn clear_all(&self) -> Result<(), IoError> {
        self.with(|s| {
            s.bits.clear();
            s.registers.clear();
        })
    }

    fn is_connected(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripted_reads_then_stored_value() {
        let gw = MockGateway::plc();
        gw.push_register_values(10, &[1, 2]);
        assert_eq!(gw.read_register(10).unwrap(), 1);
        assert_eq!(gw.read_register(10).unwrap(), 2);
        assert_eq!(gw.read_register(10).unwrap(), 2);
        gw.write_register(10, 0).unwrap();
        assert_eq!(gw.read_register(10).unwrap(), 0);
    }

    #[test]
    fn test_write_log() {
        let gw = MockGateway::io_card();
        gw.write_bit(0, 1, true).unwrap();
        gw.write_register(5, 2).unwrap();
        assert_eq!(
            gw.writes(),
            vec![
                GatewayWrite::Bit { channel: 0, address: 1, value: true },
                GatewayWrite::Register { address: 5, value: 2 },
            ]
        );
        assert_eq!(gw.kind(), GatewayKind::IoCard);
    }

    #[test]
    fn test_injected_failures() {
        let gw = MockGateway::plc();
        gw.set_fail_writes(true);
        assert!(gw.write_register(1, 1).is_err());
        assert!(gw.writes().is_empty());
        gw.set_fail_reads(true);
        assert!(gw.read_register(1).is_err());
    }
}
