//! Register bus: the vendor-request proxy protocols used to reach the chips.
//!
//! Three shapes of control traffic are spoken by the firmware:
//!
//! - serial-register writes, a 3-byte `[addr, lo, hi]` payload (transceiver
//!   on 0xE5, synthesizer on 0xE6), plus 16-bit reads on 0xE6 IN and the raw
//!   0xE2 OUT-then-IN exchange;
//! - addressed-bus (I2C) transfers on 0xE7, `wValue` carrying the 7-bit
//!   device address;
//! - bare commands (0xE1, 0xE3, 0xE4) whose argument travels in `wValue`.
//!
//! Chip programming is fire-and-forget: a failed register write is logged,
//! kept in a bounded fault log and otherwise ignored so that one bad write
//! does not abort a whole programming sequence.

use crate::error::{Error, Result};
use crate::transport::UsbTransport;
use std::collections::VecDeque;

/// Start (1) or stop (0) the ADC stream.
pub const REQ_STREAM: u8 = 0xE1;
/// Raw serial-register exchange.
pub const REQ_SPI: u8 = 0xE2;
/// User GPO byte.
pub const REQ_USER_GPO: u8 = 0xE3;
/// Device GPO word.
pub const REQ_DEV_GPO: u8 = 0xE4;
/// Transceiver register write.
pub const REQ_MAX2830: u8 = 0xE5;
/// Synthesizer register write/read.
pub const REQ_RFFC507X: u8 = 0xE6;
/// Addressed-bus write/read.
pub const REQ_I2C: u8 = 0xE7;

/// Oldest faults are dropped once the log holds this many entries.
pub const MAX_BUS_FAULTS: usize = 64;

/// A register-bus transfer that did not move the expected byte count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusFault {
    pub request: u8,
    pub expected: usize,
    pub actual: usize,
}

pub struct RegisterBus {
    transport: Box<dyn UsbTransport>,
    faults: VecDeque<BusFault>,
}

impl RegisterBus {
    pub fn new(transport: Box<dyn UsbTransport>) -> Self {
        RegisterBus {
            transport,
            faults: VecDeque::new(),
        }
    }

    pub fn transport(&self) -> &dyn UsbTransport {
        self.transport.as_ref()
    }

    pub fn transport_mut(&mut self) -> &mut dyn UsbTransport {
        self.transport.as_mut()
    }

    /// Compare a transfer outcome against the expected byte count, recording
    /// a fault on mismatch.
    fn check(&mut self, request: u8, expected: usize, outcome: Result<usize>) -> Result<()> {
        let (err, actual) = match outcome {
            Ok(n) if n == expected => return Ok(()),
            Ok(n) => (Error::TransferSizeMismatch { expected, actual: n }, n),
            Err(e) => (e, 0),
        };

        tracing::warn!("Register bus request 0x{:02X} failed: {}", request, err);
        if self.faults.len() == MAX_BUS_FAULTS {
            self.faults.pop_front();
        }
        self.faults.push_back(BusFault {
            request,
            expected,
            actual,
        });
        Err(err)
    }

    /// Write a 16-bit register through a serial-register request.
    /// Returns whether the device accepted the write.
    pub fn write_register(&mut self, request: u8, addr: u8, value: u16) -> bool {
        let [lo, hi] = value.to_le_bytes();
        let tx = [addr, lo, hi];
        let outcome = self.transport.control_out(request, 1, 0, &tx);
        self.check(request, tx.len(), outcome).is_ok()
    }

    /// Read a 16-bit register, the address travelling in `wValue`.
    pub fn read_register(&mut self, request: u8, addr: u8) -> Result<u16> {
        let mut rx = [0u8; 2];
        let outcome = self
            .transport
            .control_in(request, u16::from(addr), 0, &mut rx);
        self.check(request, rx.len(), outcome)?;
        Ok(u16::from_le_bytes(rx))
    }

    /// Raw serial-register exchange: `tx` goes out, the same number of
    /// bytes comes back into `rx`.
    pub fn spi_transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<()> {
        let size = tx.len().min(rx.len());
        let sent = self.transport.control_out(REQ_SPI, 1, 0, &tx[..size]);
        let received = self.transport.control_in(REQ_SPI, 1, 0, &mut rx[..size]);
        let total = match (sent, received) {
            (Ok(a), Ok(b)) => Ok(a + b),
            (Err(e), _) | (_, Err(e)) => Err(e),
        };
        self.check(REQ_SPI, size * 2, total)
    }

    /// Addressed-bus write. Returns whether the device accepted it.
    pub fn i2c_write(&mut self, address: u8, data: &[u8]) -> bool {
        if data.is_empty() {
            return true;
        }
        let outcome = self
            .transport
            .control_out(REQ_I2C, u16::from(address), 0, data);
        self.check(REQ_I2C, data.len(), outcome).is_ok()
    }

    /// Addressed-bus read into `data`.
    pub fn i2c_read(&mut self, address: u8, data: &mut [u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let expected = data.len();
        let outcome = self
            .transport
            .control_in(REQ_I2C, u16::from(address), 0, data);
        self.check(REQ_I2C, expected, outcome)
    }

    /// Data-less command with its argument in `wValue`.
    pub fn command(&mut self, code: u8, value: u16) -> Result<()> {
        let outcome = self.transport.control_out(code, value, 0, &[]);
        self.check(code, 0, outcome)
    }

    /// Drain the fault log.
    pub fn take_faults(&mut self) -> Vec<BusFault> {
        self.faults.drain(..).collect()
    }

    pub fn fault_count(&self) -> usize {
        self.faults.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{ControlDirection, SimulatedTransport};

    #[test]
    fn test_write_register_payload() {
        let sim = SimulatedTransport::new();
        let mut bus = RegisterBus::new(Box::new(sim.clone()));

        assert!(bus.write_register(REQ_MAX2830, 5, 0x00A0));

        let log = sim.control_log();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].direction, ControlDirection::Out);
        assert_eq!(log[0].request, REQ_MAX2830);
        assert_eq!(log[0].value, 1);
        assert_eq!(log[0].data, vec![5, 0xA0, 0x00]);
        assert_eq!(sim.max2830_register(5), 0x00A0);
    }

    #[test]
    fn test_read_register_uses_value_as_address() {
        let sim = SimulatedTransport::new();
        let mut bus = RegisterBus::new(Box::new(sim.clone()));

        assert!(bus.write_register(REQ_RFFC507X, 0x0B, 0x1234));
        assert_eq!(bus.read_register(REQ_RFFC507X, 0x0B).unwrap(), 0x1234);

        let log = sim.control_log();
        assert_eq!(log[1].direction, ControlDirection::In);
        assert_eq!(log[1].value, 0x0B);
    }

    #[test]
    fn test_failed_write_is_recorded_not_fatal() {
        let sim = SimulatedTransport::new();
        sim.fail_request(REQ_MAX2830);
        let mut bus = RegisterBus::new(Box::new(sim.clone()));

        assert!(!bus.write_register(REQ_MAX2830, 1, 0x119A));
        assert!(!bus.write_register(REQ_MAX2830, 2, 0x1003));
        assert_eq!(bus.fault_count(), 2);

        let faults = bus.take_faults();
        assert_eq!(
            faults[0],
            BusFault {
                request: REQ_MAX2830,
                expected: 3,
                actual: 0
            }
        );
        assert_eq!(bus.fault_count(), 0);
    }

    #[test]
    fn test_fault_log_is_bounded() {
        let sim = SimulatedTransport::new();
        sim.fail_request(REQ_I2C);
        let mut bus = RegisterBus::new(Box::new(sim));

        for _ in 0..MAX_BUS_FAULTS + 10 {
            bus.i2c_write(0x60, &[3, 0xFF]);
        }
        assert_eq!(bus.fault_count(), MAX_BUS_FAULTS);
    }

    #[test]
    fn test_spi_requires_both_directions() {
        let sim = SimulatedTransport::new();
        let mut bus = RegisterBus::new(Box::new(sim.clone()));

        let mut rx = [0u8; 4];
        bus.spi_transfer(&[1, 2, 3, 4], &mut rx).unwrap();
        assert_eq!(rx, [1, 2, 3, 4]);

        sim.fail_request(REQ_SPI);
        let err = bus.spi_transfer(&[1, 2], &mut rx[..2]).unwrap_err();
        assert!(matches!(err, Error::Usb(rusb::Error::Pipe)));
        assert_eq!(
            bus.take_faults(),
            vec![BusFault {
                request: REQ_SPI,
                expected: 4,
                actual: 0
            }]
        );
    }

    #[test]
    fn test_i2c_write_then_read() {
        let sim = SimulatedTransport::new();
        let mut bus = RegisterBus::new(Box::new(sim.clone()));

        assert!(bus.i2c_write(0x60, &[177, 0xA0]));
        assert!(bus.i2c_write(0x60, &[177]));
        let mut value = [0u8; 1];
        bus.i2c_read(0x60, &mut value).unwrap();
        assert_eq!(value[0], 0xA0);
    }
}
