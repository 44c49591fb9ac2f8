//! Capture-times controller
//!
//! Decides which shot of a multi-shot cycle the next frame belongs to, either
//! from the board's PLC trigger register or from a local counter.

use crate::InspectionError;
use plc_io::{GatewayKind, IoGateway};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

/// Shot index of a capture cycle, 0 when no shot is due
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CaptureTimes(pub u32);

impl CaptureTimes {
    pub const UNKNOWN: CaptureTimes = CaptureTimes(0);
    pub const FIRST: CaptureTimes = CaptureTimes(1);
    pub const SECOND: CaptureTimes = CaptureTimes(2);
    pub const THIRD: CaptureTimes = CaptureTimes(3);

    pub fn is_unknown(&self) -> bool {
        self.0 == 0
    }

    pub fn shot(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for CaptureTimes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            0 => write!(f, "UNKNOWN"),
            1 => write!(f, "FIRST"),
            2 => write!(f, "SECOND"),
            3 => write!(f, "THIRD"),
            n => write!(f, "SHOT{}", n),
        }
    }
}

/// Per-board shot state
#[derive(Debug, Clone)]
pub struct CaptureTimesController {
    board: usize,
    total: u32,
    current: CaptureTimes,
    trigger_register: u16,
}

impl CaptureTimesController {
    pub fn new(board: usize, total: u32, trigger_register: u16) -> Self {
        Self {
            board,
            total: total.max(1),
            current: CaptureTimes::UNKNOWN,
            trigger_register,
        }
    }

    pub fn current(&self) -> CaptureTimes {
        self.current
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    /// Whether the current shot closes the cycle
    pub fn is_final_shot(&self) -> bool {
        self.current.0 == self.total
    }

    pub fn set(&mut self, times: CaptureTimes) {
        if times != self.current {
            debug!("Board {} capture times {} -> {}", self.board, self.current, times);
        }
        self.current = times;
    }

    pub fn reset(&mut self) {
        self.set(CaptureTimes::UNKNOWN);
    }

    /// Next shot from the local counter, wrapping to FIRST after the last
    pub fn by_counter(&mut self) -> CaptureTimes {
        let next = if self.total <= 1 || self.current.0 >= self.total {
            CaptureTimes::FIRST
        } else {
            CaptureTimes(self.current.0 + 1)
        };
        self.set(next);
        next
    }

    /// Shot requested by the trigger register
    ///
    /// Value 1 or 2 selects that shot and is written back to 0; anything
    /// else means no shot is due. Without a register-addressed gateway the
    /// counter is used instead.
    pub fn by_signal(&mut self, gateway: Option<&dyn IoGateway>) -> Result<CaptureTimes, InspectionError> {
        if self.total <= 1 {
            self.set(CaptureTimes::FIRST);
            return Ok(CaptureTimes::FIRST);
        }

        let gateway = match gateway {
            Some(g) if g.kind() == GatewayKind::Plc => g,
            _ => return Ok(self.by_counter()),
        };

        let value = match gateway.read_register(self.trigger_register) {
            Ok(v) => v,
            Err(e) => {
                self.reset();
                return Err(e.into());
            }
        };

        let next = match value {
            1 => CaptureTimes::FIRST,
            2 => CaptureTimes::SECOND,
            _ => {
                self.reset();
                return Ok(CaptureTimes::UNKNOWN);
            }
        };

        // Level-triggered: a failed write-back leaves the request pending
        if let Err(e) = gateway.write_register(self.trigger_register, 0) {
            warn!(
                "Board {} failed to consume trigger register {}: {}",
                self.board, self.trigger_register, e
            );
        }
        self.set(next);
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plc_io::MockGateway;
    use proptest::prelude::*;

    #[test]
    fn test_single_shot_always_first() {
        let mut controller = CaptureTimesController::new(0, 1, 10);
        let plc = MockGateway::plc();
        plc.set_register(10, 0);
        assert_eq!(controller.by_signal(Some(&plc)).unwrap(), CaptureTimes::FIRST);
        assert_eq!(controller.by_counter(), CaptureTimes::FIRST);
        assert!(controller.is_final_shot());
    }

    #[test]
    fn test_trigger_register_sequence() {
        let plc = MockGateway::plc();
        plc.push_register_values(10, &[1, 0, 2, 0]);
        let mut controller = CaptureTimesController::new(0, 2, 10);

        let states: Vec<CaptureTimes> = (0..4)
            .map(|_| controller.by_signal(Some(&plc)).unwrap())
            .collect();
        assert_eq!(
            states,
            vec![
                CaptureTimes::FIRST,
                CaptureTimes::UNKNOWN,
                CaptureTimes::SECOND,
                CaptureTimes::UNKNOWN
            ]
        );
        assert_eq!(plc.register(10), 0);
    }

    #[test]
    fn test_trigger_consumed_once() {
        let plc = MockGateway::plc();
        plc.set_register(10, 2);
        let mut controller = CaptureTimesController::new(1, 2, 10);
        assert_eq!(controller.by_signal(Some(&plc)).unwrap(), CaptureTimes::SECOND);
        assert_eq!(controller.by_signal(Some(&plc)).unwrap(), CaptureTimes::UNKNOWN);
    }

    #[test]
    fn test_counter_wraps() {
        let mut controller = CaptureTimesController::new(0, 3, 10);
        let shots: Vec<u32> = (0..7).map(|_| controller.by_counter().shot()).collect();
        assert_eq!(shots, vec![1, 2, 3, 1, 2, 3, 1]);
    }

    #[test]
    fn test_io_card_falls_back_to_counter() {
        let card = MockGateway::io_card();
        let mut controller = CaptureTimesController::new(0, 2, 10);
        assert_eq!(controller.by_signal(Some(&card)).unwrap(), CaptureTimes::FIRST);
        assert_eq!(controller.by_signal(None).unwrap(), CaptureTimes::SECOND);
        assert!(controller.is_final_shot());
    }

    #[test]
    fn test_read_failure_resets() {
        let plc = MockGateway::plc();
        plc.set_fail_reads(true);
        let mut controller = CaptureTimesController::new(0, 2, 10);
        controller.set(CaptureTimes::FIRST);
        assert!(controller.by_signal(Some(&plc)).is_err());
        assert_eq!(controller.current(), CaptureTimes::UNKNOWN);
    }

    proptest! {
        #[test]
        fn prop_unconsumed_trigger_never_advances(value in 0u16..6, reads in 1usize..10) {
            let plc = MockGateway::plc();
            plc.set_register(10, value);
            plc.set_fail_writes(true);
            let mut controller = CaptureTimesController::new(0, 2, 10);

            let first = controller.by_signal(Some(&plc)).unwrap();
            for _ in 0..reads {
                prop_assert_eq!(controller.by_signal(Some(&plc)).unwrap(), first);
            }
            let expected = match value {
                1 => CaptureTimes::FIRST,
                2 => CaptureTimes::SECOND,
                _ => CaptureTimes::UNKNOWN,
            };
            prop_assert_eq!(first, expected);
        }
    }
}
