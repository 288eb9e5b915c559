//! In-memory Fobos SDR used in place of USB hardware.
//!
//! [`SimulatedTransport`] records every control transfer, keeps the register
//! files the firmware would forward to the three chips, tracks the GPO words
//! and the ADC stream switch, and completes bulk transfers from a script of
//! [`BulkFrame`]s (optionally followed by an endlessly repeated pattern).
//! Clones share the same device, so a test keeps one clone for inspection
//! while the driver owns the other.

use crate::bus::{REQ_DEV_GPO, REQ_I2C, REQ_MAX2830, REQ_RFFC507X, REQ_SPI, REQ_STREAM, REQ_USER_GPO};
use crate::convert::encode_sample;
use crate::error::{Error, Result};
use crate::gpo::DevGpo;
use crate::transport::{Completion, DeviceStrings, SubmitError, TransferStatus, UsbTransport};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Longest a poll sleeps when nothing is ready, whatever timeout is asked.
const IDLE_POLL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlDirection {
    Out,
    In,
}

/// One recorded control transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRecord {
    pub direction: ControlDirection,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    /// Payload sent (OUT) or returned (IN).
    pub data: Vec<u8>,
}

/// Scripted outcome of the next bulk transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BulkFrame {
    /// Complete with these bytes (truncated to the buffer size).
    Data(Vec<u8>),
    /// Complete with only this many bytes.
    Short(usize),
    /// Fail with a transfer error.
    Error,
    /// Report the device as gone; every later transfer does the same.
    NoDevice,
}

struct SimState {
    log: Vec<ControlRecord>,
    rffc507x: [u16; 31],
    max2830: [u16; 16],
    si5351c: [u8; 256],
    si5351c_ptr: u8,
    spi: Vec<u8>,
    dev_gpo: u16,
    user_gpo: u8,
    streaming: bool,
    frames: VecDeque<BulkFrame>,
    pattern: Vec<u8>,
    pattern_pos: usize,
    in_flight: VecDeque<(usize, Vec<u8>)>,
    canceling: bool,
    unplugged: bool,
    failing: Vec<u8>,
    strings: DeviceStrings,
    completed: usize,
    released: bool,
}

#[derive(Clone)]
pub struct SimulatedTransport {
    state: Arc<Mutex<SimState>>,
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedTransport {
    pub fn new() -> Self {
        let state = SimState {
            log: Vec::new(),
            rffc507x: [0; 31],
            max2830: [0; 16],
            si5351c: [0; 256],
            si5351c_ptr: 0,
            spi: Vec::new(),
            dev_gpo: 0,
            user_gpo: 0,
            streaming: false,
            frames: VecDeque::new(),
            pattern: Vec::new(),
            pattern_pos: 0,
            in_flight: VecDeque::new(),
            canceling: false,
            unplugged: false,
            failing: Vec::new(),
            strings: DeviceStrings {
                manufacturer: "RigExpert".to_string(),
                product: "Fobos SDR (simulated)".to_string(),
                serial: "SIM00000001".to_string(),
            },
            completed: 0,
            released: false,
        };
        SimulatedTransport {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue the outcome of the next bulk transfer.
    pub fn push_frame(&self, frame: BulkFrame) {
        self.state().frames.push_back(frame);
    }

    pub fn push_frames<I: IntoIterator<Item = BulkFrame>>(&self, frames: I) {
        self.state().frames.extend(frames);
    }

    /// Bytes repeated forever once the frame script is exhausted.
    pub fn set_pattern(&self, bytes: Vec<u8>) {
        let mut s = self.state();
        s.pattern = bytes;
        s.pattern_pos = 0;
    }

    /// Make every transfer with this request code fail.
    pub fn fail_request(&self, request: u8) {
        self.state().failing.push(request);
    }

    pub fn clear_failures(&self) {
        self.state().failing.clear();
    }

    /// Simulate an unplug: control and bulk traffic report no device.
    pub fn unplug(&self) {
        self.state().unplugged = true;
    }

    pub fn control_log(&self) -> Vec<ControlRecord> {
        self.state().log.clone()
    }

    pub fn clear_log(&self) {
        self.state().log.clear();
    }

    /// Number of logged transfers with this request code.
    pub fn count_requests(&self, request: u8) -> usize {
        self.state()
            .log
            .iter()
            .filter(|r| r.request == request)
            .count()
    }

    pub fn max2830_register(&self, addr: u8) -> u16 {
        self.state().max2830[usize::from(addr & 0x0F)]
    }

    pub fn rffc507x_register(&self, addr: u8) -> u16 {
        self.state()
            .rffc507x
            .get(usize::from(addr))
            .copied()
            .unwrap_or(0)
    }

    pub fn si5351c_register(&self, reg: u8) -> u8 {
        self.state().si5351c[usize::from(reg)]
    }

    pub fn dev_gpo(&self) -> DevGpo {
        DevGpo::from_bits_retain(self.state().dev_gpo)
    }

    pub fn user_gpo(&self) -> u8 {
        self.state().user_gpo
    }

    /// Whether the ADC stream has been switched on with 0xE1.
    pub fn is_streaming(&self) -> bool {
        self.state().streaming
    }

    pub fn in_flight(&self) -> usize {
        self.state().in_flight.len()
    }

    /// Bulk transfers completed with data so far.
    pub fn completed_transfers(&self) -> usize {
        self.state().completed
    }

    pub fn is_released(&self) -> bool {
        self.state().released
    }
}

impl UsbTransport for SimulatedTransport {
    fn control_out(&mut self, request: u8, value: u16, index: u16, data: &[u8]) -> Result<usize> {
        let mut s = self.state();
        s.log.push(ControlRecord {
            direction: ControlDirection::Out,
            request,
            value,
            index,
            data: data.to_vec(),
        });
        if s.unplugged {
            return Err(Error::Usb(rusb::Error::NoDevice));
        }
        if s.failing.contains(&request) {
            return Err(Error::Usb(rusb::Error::Pipe));
        }

        match request {
            REQ_STREAM => s.streaming = value != 0,
            REQ_SPI => s.spi = data.to_vec(),
            REQ_USER_GPO => s.user_gpo = value as u8,
            REQ_DEV_GPO => s.dev_gpo = value,
            REQ_MAX2830 if data.len() == 3 => {
                s.max2830[usize::from(data[0] & 0x0F)] = u16::from_le_bytes([data[1], data[2]]);
            }
            REQ_RFFC507X if data.len() == 3 => {
                let value = u16::from_le_bytes([data[1], data[2]]);
                if let Some(reg) = s.rffc507x.get_mut(usize::from(data[0])) {
                    *reg = value;
                }
            }
            REQ_I2C if !data.is_empty() => {
                let start = data[0];
                s.si5351c_ptr = start;
                for (i, byte) in data[1..].iter().enumerate() {
                    s.si5351c[usize::from(start.wrapping_add(i as u8))] = *byte;
                }
            }
            _ => {}
        }
        Ok(data.len())
    }

    fn control_in(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
    ) -> Result<usize> {
        let mut s = self.state();
        let outcome = if s.unplugged {
            Err(Error::Usb(rusb::Error::NoDevice))
        } else if s.failing.contains(&request) {
            Err(Error::Usb(rusb::Error::Pipe))
        } else {
            let n = match request {
                REQ_RFFC507X => {
                    let reg = s.rffc507x.get(usize::from(value)).copied().unwrap_or(0);
                    let bytes = reg.to_le_bytes();
                    let n = buf.len().min(2);
                    buf[..n].copy_from_slice(&bytes[..n]);
                    n
                }
                REQ_I2C => {
                    let start = s.si5351c_ptr;
                    for (i, byte) in buf.iter_mut().enumerate() {
                        *byte = s.si5351c[usize::from(start.wrapping_add(i as u8))];
                    }
                    buf.len()
                }
                REQ_SPI => {
                    let n = buf.len().min(s.spi.len());
                    buf[..n].copy_from_slice(&s.spi[..n]);
                    n
                }
                _ => 0,
            };
            Ok(n)
        };

        let returned = match &outcome {
            Ok(n) => buf[..*n].to_vec(),
            Err(_) => Vec::new(),
        };
        s.log.push(ControlRecord {
            direction: ControlDirection::In,
            request,
            value,
            index,
            data: returned,
        });
        outcome
    }

    fn submit_bulk(
        &mut self,
        _endpoint: u8,
        slot: usize,
        buffer: Vec<u8>,
    ) -> std::result::Result<(), SubmitError> {
        let mut s = self.state();
        if s.unplugged {
            return Err(SubmitError {
                error: Error::Usb(rusb::Error::NoDevice),
                slot,
                buffer,
            });
        }
        s.in_flight.push_back((slot, buffer));
        Ok(())
    }

    fn poll_bulk(&mut self, timeout: Duration) -> Result<Option<Completion>> {
        let mut guard = self.state();
        let s = &mut *guard;

        let Some((slot, mut buffer)) = s.in_flight.pop_front() else {
            s.canceling = false;
            drop(guard);
            std::thread::sleep(timeout.min(IDLE_POLL));
            return Ok(None);
        };

        let completion = |status, actual_length, buffer| {
            Ok(Some(Completion {
                slot,
                status,
                actual_length,
                buffer,
            }))
        };

        if s.canceling {
            if s.in_flight.is_empty() {
                s.canceling = false;
            }
            return completion(TransferStatus::Cancelled, 0, buffer);
        }
        if s.unplugged {
            return completion(TransferStatus::NoDevice, 0, buffer);
        }

        let frame = if !s.streaming {
            None
        } else if let Some(frame) = s.frames.pop_front() {
            Some(frame)
        } else if !s.pattern.is_empty() {
            for byte in buffer.iter_mut() {
                *byte = s.pattern[s.pattern_pos];
                s.pattern_pos = (s.pattern_pos + 1) % s.pattern.len();
            }
            let len = buffer.len();
            s.completed += 1;
            return completion(TransferStatus::Completed, len, buffer);
        } else {
            None
        };

        match frame {
            None => {
                s.in_flight.push_front((slot, buffer));
                drop(guard);
                std::thread::sleep(timeout.min(IDLE_POLL));
                Ok(None)
            }
            Some(BulkFrame::Data(bytes)) => {
                let n = bytes.len().min(buffer.len());
                buffer[..n].copy_from_slice(&bytes[..n]);
                s.completed += 1;
                completion(TransferStatus::Completed, n, buffer)
            }
            Some(BulkFrame::Short(n)) => {
                let n = n.min(buffer.len());
                completion(TransferStatus::Completed, n, buffer)
            }
            Some(BulkFrame::Error) => completion(TransferStatus::Error, 0, buffer),
            Some(BulkFrame::NoDevice) => {
                s.unplugged = true;
                completion(TransferStatus::NoDevice, 0, buffer)
            }
        }
    }

    fn cancel_bulk(&mut self) {
        let mut s = self.state();
        if !s.in_flight.is_empty() {
            s.canceling = true;
        }
    }

    fn pending_bulk(&self) -> usize {
        self.state().in_flight.len()
    }

    fn strings(&self) -> DeviceStrings {
        self.state().strings.clone()
    }

    fn release(&mut self) {
        self.state().released = true;
    }
}

/// Interleaved ADC words of a complex tone, `period` samples per cycle,
/// in the raw bulk format.
pub fn tone_pattern(period: usize, amplitude: i16) -> Vec<u8> {
    let period = period.max(1);
    let mut bytes = Vec::with_capacity(period * 4);
    for n in 0..period {
        let phase = 2.0 * std::f32::consts::PI * n as f32 / period as f32;
        let re = (phase.cos() * f32::from(amplitude)) as i16;
        let im = (phase.sin() * f32::from(amplitude)) as i16;
        bytes.extend_from_slice(&encode_sample(re).to_le_bytes());
        bytes.extend_from_slice(&encode_sample(im).to_le_bytes());
    }
    bytes
}
