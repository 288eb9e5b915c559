//! RFFC507x dual-path LO synthesizer and mixer.
//!
//! The driver keeps two shadows of the 31-register file: `local` holds the
//! desired values, `remote` the values last written to the chip. A commit
//! only writes registers that differ between the two.

use super::register_modify;
use crate::bus::{REQ_RFFC507X, RegisterBus};
use crate::error::Result;

pub const RFFC507X_REGS_COUNT: usize = 31;

/// Highest LO the divider search is anchored to, in MHz.
pub const LO_MAX_MHZ: u32 = 5400;

const REF_MHZ: u64 = 25;

const REG_LF: usize = 0x00;
const REG_MIX_CONT: usize = 0x0B;
const REG_P1_FREQ1: usize = 0x0C;
const REG_P2_FREQ1: usize = 0x0F;
const REG_SDI_CTRL: usize = 0x15;

/// Power-on register file.
pub const DEFAULT_REGISTERS: [u16; RFFC507X_REGS_COUNT] = [
    0xbefa, 0x4064, 0x9055, 0x2d02, 0xacbf, 0xacbf, 0x0028, 0x0028, 0xff00, 0x8220, 0x0202,
    0x4800, 0x1a94, 0xd89d, 0x8900, 0x1e84, 0x89d8, 0x9d00, 0x2a20, 0x0000, 0x0000, 0x0000,
    0x0001, 0x4900, 0x0281, 0xf00f, 0x0000, 0x0000, 0xc840, 0x1000, 0x0005,
];

/// Divider settings for one LO frequency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoDividers {
    /// LO divider exponent, `lodiv = 2^n_lo`.
    pub n_lo: u8,
    pub lodiv: u32,
    pub fvco_mhz: u32,
    /// Feedback prescaler, 2 or 4.
    pub fbkdiv: u32,
    /// Charge pump leakage code.
    pub pllcpl: u32,
    pub n: u32,
    pub nmsb: u32,
    pub nlsb: u32,
    /// LO frequency the quantized N value produces.
    pub freq_hz: u64,
}

/// Compute the divider chain for an LO of `lo_mhz` (1..=5400).
pub fn lo_dividers(lo_mhz: u32) -> LoDividers {
    let lo_mhz = lo_mhz.clamp(1, LO_MAX_MHZ);
    let mut n_lo = 0u8;
    let mut x = LO_MAX_MHZ / lo_mhz;
    while x > 1 && n_lo < 5 {
        n_lo += 1;
        x >>= 1;
    }

    let lodiv = 1u32 << n_lo;
    let fvco_mhz = lodiv * lo_mhz;
    let (fbkdiv, pllcpl) = if fvco_mhz > 3200 { (4, 3) } else { (2, 2) };

    // N in 29-bit fixed point
    let tmp_n = (u64::from(fvco_mhz) << 29) / (u64::from(fbkdiv) * REF_MHZ);
    let freq_hz = (REF_MHZ * (tmp_n >> 5) * u64::from(fbkdiv) * 1_000_000)
        / (u64::from(lodiv) * (1 << 24));

    LoDividers {
        n_lo,
        lodiv,
        fvco_mhz,
        fbkdiv,
        pllcpl,
        n: (tmp_n >> 29) as u32,
        nmsb: ((tmp_n >> 13) & 0xffff) as u32,
        nlsb: ((tmp_n >> 5) & 0xff) as u32,
        freq_hz,
    }
}

#[derive(Debug, Clone)]
pub struct Rffc507x {
    local: [u16; RFFC507X_REGS_COUNT],
    remote: [u16; RFFC507X_REGS_COUNT],
}

impl Default for Rffc507x {
    fn default() -> Self {
        Self::new()
    }
}

impl Rffc507x {
    pub fn new() -> Self {
        Rffc507x {
            local: DEFAULT_REGISTERS,
            remote: DEFAULT_REGISTERS,
        }
    }

    pub fn write_reg(&self, bus: &mut RegisterBus, addr: u8, value: u16) -> bool {
        bus.write_register(REQ_RFFC507X, addr, value)
    }

    pub fn read_reg(&self, bus: &mut RegisterBus, addr: u8) -> Result<u16> {
        bus.read_register(REQ_RFFC507X, addr)
    }

    /// Change bits `to..=from` of the local copy of register `addr`.
    pub fn modify(&mut self, addr: usize, to: u8, from: u8, value: u32) {
        self.local[addr] = register_modify(self.local[addr], to, from, value);
    }

    /// Push local changes to the chip, every register when `force` is set.
    /// Returns the number of registers written.
    pub fn commit(&mut self, bus: &mut RegisterBus, force: bool) -> usize {
        let mut written = 0;
        for i in 0..RFFC507X_REGS_COUNT {
            let local = self.local[i];
            if self.remote[i] != local || force {
                // A failed write leaves the register marked dirty.
                if self.write_reg(bus, i as u8, local) {
                    self.remote[i] = local;
                }
                written += 1;
            }
        }
        written
    }

    pub fn init(&mut self, bus: &mut RegisterBus) {
        for (i, value) in DEFAULT_REGISTERS.iter().enumerate() {
            self.write_reg(bus, i as u8, *value);
        }
        self.local = DEFAULT_REGISTERS;
        self.remote = DEFAULT_REGISTERS;

        // ENBL and MODE pins ignored, control through SDI
        self.modify(REG_SDI_CTRL, 15, 15, 1);
        // half duplex
        self.modify(REG_MIX_CONT, 15, 15, 0);
        // MIX1_IDD = MIX2_IDD = 1
        self.modify(REG_MIX_CONT, 14, 9, (1 << 3) | 1);
        // MODE = 1: PLL bank 2, mixer 2
        self.modify(REG_SDI_CTRL, 13, 13, 1);
        self.commit(bus, false);
        tracing::debug!("RFFC507x initialized");
    }

    /// Toggle the synthesizer enable bit and commit.
    pub fn set_enabled(&mut self, bus: &mut RegisterBus, enabled: bool) {
        self.modify(REG_SDI_CTRL, 14, 14, u32::from(enabled));
        self.commit(bus, false);
    }

    pub fn is_enabled(&self) -> bool {
        self.local[REG_SDI_CTRL] & (1 << 14) != 0
    }

    /// Tune both LO paths to `lo_mhz`, returning the programmed LO in Hz.
    pub fn set_lo_frequency(&mut self, bus: &mut RegisterBus, lo_mhz: u32) -> u64 {
        let div = lo_dividers(lo_mhz);

        self.set_enabled(bus, false);
        self.modify(REG_LF, 2, 0, div.pllcpl);

        for base in [REG_P1_FREQ1, REG_P2_FREQ1] {
            self.modify(base, 6, 4, u32::from(div.n_lo));
            self.modify(base, 15, 7, div.n);
            self.modify(base, 3, 2, div.fbkdiv >> 1);
            self.modify(base + 1, 15, 0, div.nmsb);
            self.modify(base + 2, 15, 8, div.nlsb);
        }
        self.commit(bus, false);
        self.set_enabled(bus, true);

        tracing::trace!(
            "RFFC507x LO {} MHz: n_lo={} n={} fbkdiv={} actual {} Hz",
            lo_mhz,
            div.n_lo,
            div.n,
            div.fbkdiv,
            div.freq_hz
        );
        div.freq_hz
    }

    pub fn local(&self) -> &[u16; RFFC507X_REGS_COUNT] {
        &self.local
    }

    pub fn remote(&self) -> &[u16; RFFC507X_REGS_COUNT] {
        &self.remote
    }
}
