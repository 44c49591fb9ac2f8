//! Discrete IO card gateway
//!
//! Output lines are addressed by (channel, line). Register access is not
//! available on a DIO card.

use crate::error::IoError;
use crate::{GatewayKind, IoGateway};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Line-level access to a DIO card driver
pub trait DioBackend: Send {
    fn write_line(&mut self, channel: u8, line: u16, level: bool) -> Result<(), IoError>;
    fn read_line(&self, channel: u8, line: u16) -> Result<bool, IoError>;
    /// Lines per channel
    fn line_count(&self) -> u16;
}

#[derive(Debug, Default)]
struct DioState {
    levels: HashMap<(u8, u16), bool>,
    history: Vec<(u8, u16, bool)>,
}

/// In-memory DIO backend; clones share the same lines
#[derive(Debug, Clone)]
pub struct MemoryDio {
    state: Arc<Mutex<DioState>>,
    lines: u16,
}

impl MemoryDio {
    pub fn new(lines: u16) -> Self {
        Self {
            state: Arc::new(Mutex::new(DioState::default())),
            lines,
        }
    }

    /// Every level change written so far
    pub fn history(&self) -> Vec<(u8, u16, bool)> {
        self.state
            .lock()
            .map(|s| s.history.clone())
            .unwrap_or_default()
    }

    fn check(&self, line: u16) -> Result<(), IoError> {
        if line >= self.lines {
            return Err(IoError::AddressOutOfRange(line));
        }
        Ok(())
    }
}

impl DioBackend for MemoryDio {
    fn write_line(&mut self, channel: u8, line: u16, level: bool) -> Result<(), IoError> {
        self.check(line)?;
        let mut s = self
            .state
            .lock()
            .map_err(|e| IoError::Lock(e.to_string()))?;
        s.levels.insert((channel, line), level);
        s.history.push((channel, line, level));
        Ok(())
    }

    fn read_line(&self, channel: u8, line: u16) -> Result<bool, IoError> {
        self.check(line)?;
        let s = self
            .state
            .lock()
            .map_err(|e| IoError::Lock(e.to_string()))?;
        Ok(s.levels.get(&(channel, line)).copied().unwrap_or(false))
    }

    fn line_count(&self) -> u16 {
        self.lines
    }
}

/// IO card gateway over a [`DioBackend`]
pub struct IoCard<B: DioBackend> {
    backend: Mutex<B>,
    channels: u8,
}

impl<B: DioBackend> IoCard<B> {
    pub fn new(backend: B, channels: u8) -> Self {
        info!(
            "Creating IO card gateway: {} channels x {} lines",
            channels,
            backend.line_count()
        );
        Self {
            backend: Mutex::new(backend),
            channels,
        }
    }

    fn check_channel(&self, channel: u8) -> Result<(), IoError> {
        if channel >= self.channels {
            return Err(IoError::AddressOutOfRange(channel as u16));
        }
        Ok(())
    }
}

impl<B: DioBackend> IoGateway for IoCard<B> {
    fn kind(&self) -> GatewayKind {
        GatewayKind::IoCard
    }

    fn read_register(&self, address: u16) -> Result<u16, IoError> {
        Err(IoError::Unsupported(format!("register {} read on IO card", address)))
    }

    fn write_register(&self, address: u16, _value: u16) -> Result<(), IoError> {
        Err(IoError::Unsupported(format!("register {} write on IO card", address)))
    }

    fn write_bit(&self, channel: u8, address: u16, value: bool) -> Result<(), IoError> {
        self.check_channel(channel)?;
        debug!("IO card write ch{} line{} = {}", channel, address, value);
        self.backend
            .lock()
            .map_err(|e| IoError::Lock(e.to_string()))?
            .write_line(channel, address, value)
    }

    fn read_bit(&self, channel: u8, address: u16) -> Result<bool, IoError> {
        self.check_channel(channel)?;
        self.backend
            .lock()
            .map_err(|e| IoError::Lock(e.to_string()))?
            .read_line(channel, address)
    }

    fn clear_all(&self) -> Result<(), IoError> {
        let mut backend = self
            .backend
            .lock()
            .map_err(|e| IoError::Lock(e.to_string()))?;
        let lines = backend.line_count();
        for channel in 0..self.channels {
            for line in 0..lines {
                backend.write_line(channel, line, false)?;
            }
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_write_and_read_bit() {
        let card = IoCard::new(MemoryDio::new(8), 2);
        card.write_bit(1, 3, true).unwrap();
        assert!(card.read_bit(1, 3).unwrap());
        assert!(!card.read_bit(0, 3).unwrap());
    }

    #[test]
    fn test_out_of_range() {
        let card = IoCard::new(MemoryDio::new(4), 1);
        assert!(matches!(card.write_bit(0, 4, true), Err(IoError::AddressOutOfRange(4))));
        assert!(matches!(card.write_bit(1, 0, true), Err(IoError::AddressOutOfRange(1))));
    }

    #[test]
    fn test_registers_unsupported() {
        let card = IoCard::new(MemoryDio::new(4), 1);
        assert!(matches!(card.read_register(0), Err(IoError::Unsupported(_))));
        assert!(matches!(card.write_register(0, 1), Err(IoError::Unsupported(_))));
    }

    #[test]
    fn test_pulse_writes_high_then_low() {
        let dio = MemoryDio::new(4);
        let card = IoCard::new(dio.clone(), 1);
        card.pulse_bit(0, 2, Duration::from_millis(1)).unwrap();
        assert_eq!(dio.history(), vec![(0, 2, true), (0, 2, false)]);
    }

    #[test]
    fn test_clear_all() {
        let dio = MemoryDio::new(2);
        let card = IoCard::new(dio.clone(), 2);
        card.write_bit(1, 1, true).unwrap();
        card.clear_all().unwrap();
        assert!(!card.read_bit(1, 1).unwrap());
        assert_eq!(dio.history().len(), 5);
    }
}
