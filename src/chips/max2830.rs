//! MAX2830 zero-IF transceiver (receive side only).

use crate::bus::{REQ_MAX2830, RegisterBus};

/// Comparison frequency of the transceiver PLL (reference divider 1).
pub const MAX2830_REF_HZ: f64 = 25_000_000.0;

const FRAC_SCALE: f64 = 1_048_575.0;

const REG_INT_DIV: u8 = 3;
const REG_FRAC_DIV: u8 = 4;
const REG_REF_DIV: u8 = 5;
const REG_RX_BANDWIDTH: u8 = 8;
const REG_RX_GAIN: u8 = 11;

const REF_DIV_ONE: u16 = 0x00A0;
const RX_BANDWIDTH_BASE: u16 = 0x3420;

pub const MAX_LNA_GAIN: u8 = 3;
pub const MAX_VGA_GAIN: u8 = 15;

/// Register values loaded at init, addresses 0 through 15.
pub const INIT_REGISTERS: [u16; 16] = [
    0x1740, 0x119A, 0x1003, 0x0079, 0x3666, 0x00A0, 0x0060, 0x0022, 0x3420, 0x03B5, 0x1DA4,
    0x0000, 0x0140, 0x0E92, 0x033B, 0x0145,
];

/// Integer (8-bit) and fractional (20-bit) PLL divider for `hz`.
pub fn pll_divider(hz: f64) -> (u32, u32) {
    let div = hz / MAX2830_REF_HZ;
    let int = (div as u32) & 0xFF;
    let frac = ((div - f64::from(int)) * FRAC_SCALE + 0.5) as u32;
    (int, frac)
}

/// Frequency produced by a quantized divider.
pub fn divider_frequency(int: u32, frac: u32) -> f64 {
    (f64::from(int) + f64::from(frac) / FRAC_SCALE) * MAX2830_REF_HZ
}

/// Gain register value for the given LNA and VGA codes.
pub fn gain_word(lna: u8, vga: u8) -> u16 {
    (u16::from(lna & 0x03) << 5) | u16::from(vga & 0x1F)
}

#[derive(Debug, Clone, Default)]
pub struct Max2830 {
    lna_gain: u8,
    vga_gain: u8,
    bandwidth_idx: u8,
}

impl Max2830 {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_reg(&self, bus: &mut RegisterBus, addr: u8, value: u16) {
        bus.write_register(REQ_MAX2830, addr, value);
    }

    pub fn init(&mut self, bus: &mut RegisterBus) {
        for (addr, value) in INIT_REGISTERS.iter().enumerate() {
            self.write_reg(bus, addr as u8, *value);
        }
        self.bandwidth_idx = 0;
        tracing::debug!("MAX2830 initialized");
    }

    /// Tune the receive PLL, returning the frequency actually programmed.
    pub fn set_frequency(&mut self, bus: &mut RegisterBus, hz: f64) -> f64 {
        let (int, frac) = pll_divider(hz);
        self.write_reg(bus, REG_REF_DIV, REF_DIV_ONE);
        self.write_reg(bus, REG_INT_DIV, (((frac << 8) | int) & 0x3FFF) as u16);
        self.write_reg(bus, REG_FRAC_DIV, ((frac >> 6) & 0x3FFF) as u16);

        let actual = divider_frequency(int, frac);
        tracing::trace!("MAX2830 tuned to {:.0} Hz (requested {:.0})", actual, hz);
        actual
    }

    /// Set the LNA gain code (clamped to 0..=3), returning the applied value.
    pub fn set_lna_gain(&mut self, bus: &mut RegisterBus, value: u8) -> u8 {
        let value = value.min(MAX_LNA_GAIN);
        if value != self.lna_gain {
            self.lna_gain = value;
            self.write_gain(bus);
        }
        value
    }

    /// Set the VGA gain code (clamped to 0..=15), returning the applied value.
    pub fn set_vga_gain(&mut self, bus: &mut RegisterBus, value: u8) -> u8 {
        let value = value.min(MAX_VGA_GAIN);
        if value != self.vga_gain {
            self.vga_gain = value;
            self.write_gain(bus);
        }
        value
    }

    fn write_gain(&self, bus: &mut RegisterBus) {
        self.write_reg(bus, REG_RX_GAIN, gain_word(self.lna_gain, self.vga_gain));
    }

    /// Select one of the four receive channel filters.
    pub fn set_bandwidth(&mut self, bus: &mut RegisterBus, idx: u8) {
        let idx = idx & 0x03;
        if idx != self.bandwidth_idx {
            self.bandwidth_idx = idx;
            self.write_reg(bus, REG_RX_BANDWIDTH, RX_BANDWIDTH_BASE | u16::from(idx));
        }
    }

    pub fn lna_gain(&self) -> u8 {
        self.lna_gain
    }

    pub fn vga_gain(&self) -> u8 {
        self.vga_gain
    }

    pub fn bandwidth_idx(&self) -> u8 {
        self.bandwidth_idx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedTransport;
    use approx::assert_relative_eq;

    fn setup() -> (SimulatedTransport, RegisterBus, Max2830) {
        let sim = SimulatedTransport::new();
        let mut bus = RegisterBus::new(Box::new(sim.clone()));
        let mut max = Max2830::new();
        max.init(&mut bus);
        sim.clear_log();
        (sim, bus, max)
    }

    #[test]
    fn test_init_loads_defaults() {
        let (sim, _bus, _max) = setup();
        for (addr, value) in INIT_REGISTERS.iter().enumerate() {
            assert_eq!(sim.max2830_register(addr as u8), *value);
        }
    }

    #[test]
    fn test_integer_frequency() {
        let (sim, mut bus, mut max) = setup();
        let actual = max.set_frequency(&mut bus, 2_400_000_000.0);
        assert_relative_eq!(actual, 2_400_000_000.0);
        assert_eq!(sim.max2830_register(3), 96);
        assert_eq!(sim.max2830_register(4), 0);
        assert_eq!(sim.count_requests(REQ_MAX2830), 3);
    }

    #[test]
    fn test_fractional_frequency() {
        let (sim, mut bus, mut max) = setup();
        let (int, frac) = pll_divider(2_401_000_000.0);
        assert_eq!(int, 96);
        assert_eq!(frac, 41943);

        let actual = max.set_frequency(&mut bus, 2_401_000_000.0);
        assert_relative_eq!(actual, 2_401_000_000.0, epsilon = 1.0);
        assert_eq!(sim.max2830_register(3), 0x1760);
        assert_eq!(sim.max2830_register(4), 655);
    }

    #[test]
    fn test_reported_frequency_is_quantized() {
        let (_sim, mut bus, mut max) = setup();
        let actual = max.set_frequency(&mut bus, 2_412_345_678.0);
        let step = MAX2830_REF_HZ / FRAC_SCALE;
        assert!((actual - 2_412_345_678.0).abs() <= step / 2.0 + 1e-3);
    }

    #[test]
    fn test_gain_clamped_and_coalesced() {
        let (sim, mut bus, mut max) = setup();

        assert_eq!(max.set_lna_gain(&mut bus, 7), 3);
        assert_eq!(sim.max2830_register(11), 0x60);
        assert_eq!(max.set_vga_gain(&mut bus, 20), 15);
        assert_eq!(sim.max2830_register(11), 0x6F);
        assert_eq!(sim.count_requests(REQ_MAX2830), 2);

        max.set_vga_gain(&mut bus, 15);
        max.set_lna_gain(&mut bus, 3);
        assert_eq!(sim.count_requests(REQ_MAX2830), 2);
    }

    #[test]
    fn test_bandwidth_written_on_change() {
        let (sim, mut bus, mut max) = setup();
        max.set_bandwidth(&mut bus, 0);
        assert_eq!(sim.count_requests(REQ_MAX2830), 0);

        max.set_bandwidth(&mut bus, 3);
        assert_eq!(sim.max2830_register(8), 0x3423);
        assert_eq!(max.bandwidth_idx(), 3);
    }
}
