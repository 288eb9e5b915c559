//! Si5351C clock generator.
//!
//! Generates the 25 MHz references of the synthesizer (CLK0) and the
//! transceiver (CLK4) from PLLA, and the ADC sample clock pair (CLK2/CLK3).

use crate::bus::RegisterBus;
use crate::error::Result;
use bitflags::bitflags;

/// 7-bit bus address of the clock generator.
pub const SI5351C_ADDRESS: u8 = 0x60;

const REG_OUTPUT_ENABLE: u8 = 3;
const REG_OEB_PIN_ENABLE: u8 = 9;
const REG_PLL_INPUT_SOURCE: u8 = 15;
const REG_CLK0_CONTROL: u8 = 16;
const REG_CLK4_CONTROL: u8 = 20;
const REG_PLL_RESET: u8 = 177;
const REG_FANOUT_ENABLE: u8 = 187;

bitflags! {
    /// CLKx control register fields.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ClockControl: u8 {
        const CLK_PDN = 0b1000_0000;
        const MS_INT = 0b0100_0000;
        /// Multisynth fed from PLLB instead of PLLA.
        const MS_SRC = 0b0010_0000;
        const CLK_INV = 0b0001_0000;
        const CLK_SRC_MASK = 0b0000_1100;
        const CLK_DRV_MASK = 0b0000_0011;
    }
}

/// Compose a CLKx control byte.
///
/// `source` selects the output mux (3 = own multisynth) and `drive` the
/// output strength code, two bits each.
pub fn compose_clk_ctrl(
    power_down: bool,
    int_mode: bool,
    pll_b: bool,
    invert: bool,
    source: u8,
    drive: u8,
) -> u8 {
    let mut ctrl = ClockControl::from_bits_retain(((source & 3) << 2) | (drive & 3));
    ctrl.set(ClockControl::CLK_PDN, power_down);
    ctrl.set(ClockControl::MS_INT, int_mode);
    ctrl.set(ClockControl::MS_SRC, pll_b);
    ctrl.set(ClockControl::CLK_INV, invert);
    ctrl.bits()
}

/// Pack the `P1`/`P2`/`P3` divider parameters into the 9-byte burst that
/// starts at register `addr`. `prefix` lands in the upper bits of the
/// fourth byte (R divider for multisynths).
pub fn pack_divider(addr: u8, prefix: u8, p1: u32, p2: u32, p3: u32) -> [u8; 9] {
    [
        addr,
        (p3 >> 8) as u8,
        p3 as u8,
        prefix | ((p1 >> 16) & 0x3) as u8,
        (p1 >> 8) as u8,
        p1 as u8,
        ((((p3 >> 16) & 0xF) << 4) | ((p2 >> 16) & 0xF)) as u8,
        (p2 >> 8) as u8,
        p2 as u8,
    ]
}

/// Gated RF-chip reference outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockOutput {
    /// CLK0, synthesizer reference.
    Rffc507x,
    /// CLK4, transceiver reference.
    Max2830,
}

impl ClockOutput {
    fn control_register(self) -> u8 {
        match self {
            ClockOutput::Rffc507x => REG_CLK0_CONTROL,
            ClockOutput::Max2830 => REG_CLK4_CONTROL,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Si5351c;

impl Si5351c {
    pub fn new() -> Self {
        Si5351c
    }

    pub fn write_reg(&self, bus: &mut RegisterBus, reg: u8, value: u8) {
        bus.i2c_write(SI5351C_ADDRESS, &[reg, value]);
    }

    pub fn read_reg(&self, bus: &mut RegisterBus, reg: u8) -> Result<u8> {
        bus.i2c_write(SI5351C_ADDRESS, &[reg]);
        let mut data = [0u8; 1];
        bus.i2c_read(SI5351C_ADDRESS, &mut data)?;
        Ok(data[0])
    }

    /// Program feedback multisynth `ms` (0 = PLLA, 1 = PLLB).
    pub fn config_pll(&self, bus: &mut RegisterBus, ms: u8, p1: u32, p2: u32, p3: u32) {
        let addr = 26 + (ms & 0x03) * 8;
        bus.i2c_write(SI5351C_ADDRESS, &pack_divider(addr, 0, p1, p2, p3));
    }

    /// Program output multisynth `ms` with output divider code `r_div`.
    pub fn config_msynth(
        &self,
        bus: &mut RegisterBus,
        ms: u8,
        p1: u32,
        p2: u32,
        p3: u32,
        r_div: u8,
    ) {
        let addr = 42 + ms * 8;
        bus.i2c_write(SI5351C_ADDRESS, &pack_divider(addr, r_div << 4, p1, p2, p3));
    }

    /// Bring the generator up: outputs on, PLLs reset, 25 MHz references on
    /// CLK0 and CLK4 from an 800 MHz PLLA.
    pub fn init(&self, bus: &mut RegisterBus) {
        self.write_reg(bus, REG_OUTPUT_ENABLE, 0xFF);
        self.write_reg(bus, REG_OEB_PIN_ENABLE, 0xFF);
        self.write_reg(bus, REG_OUTPUT_ENABLE, 0x00);
        // PLL input from CLKIN.
        self.write_reg(bus, REG_PLL_INPUT_SOURCE, 0x0C);
        self.write_reg(bus, REG_FANOUT_ENABLE, 0xC0);
        self.write_reg(bus, REG_PLL_RESET, 0xA0);

        let ctrl = [
            REG_CLK0_CONTROL,
            compose_clk_ctrl(false, true, false, false, 3, 1),
            compose_clk_ctrl(true, true, false, false, 2, 0),
            // ADC clock pair
            compose_clk_ctrl(false, true, false, false, 3, 0),
            compose_clk_ctrl(true, true, false, false, 3, 0),
            compose_clk_ctrl(false, true, false, false, 3, 1),
            compose_clk_ctrl(true, true, false, false, 2, 0),
            compose_clk_ctrl(true, true, false, false, 2, 0),
            compose_clk_ctrl(true, true, false, false, 2, 0),
        ];
        bus.i2c_write(SI5351C_ADDRESS, &ctrl);

        self.config_pll(bus, 0, 80 * 128 - 512, 0, 1);
        self.config_msynth(bus, 0, 32 * 128 - 512, 0, 1, 0);
        self.config_msynth(bus, 4, 32 * 128 - 512, 0, 1, 0);
        tracing::debug!("Si5351C initialized");
    }

    /// Gate one of the RF-chip reference clocks.
    pub fn set_clock_enabled(&self, bus: &mut RegisterBus, output: ClockOutput, enabled: bool) {
        let ctrl = compose_clk_ctrl(!enabled, true, false, false, 3, 1);
        self.write_reg(bus, output.control_register(), ctrl);
    }

    /// Program the ADC clock pair (MS2/MS3) for the integer divider `p1s`.
    pub fn set_adc_divider(&self, bus: &mut RegisterBus, p1s: u32) {
        let p1 = p1s * 128 - 512;
        self.config_msynth(bus, 2, p1, 0, 1, 0);
        self.config_msynth(bus, 3, p1, 0, 1, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedTransport;

    #[test]
    fn test_compose_clk_ctrl() {
        assert_eq!(compose_clk_ctrl(false, true, false, false, 3, 1), 0x4D);
        assert_eq!(compose_clk_ctrl(true, true, false, false, 2, 0), 0xC8);
        assert_eq!(compose_clk_ctrl(true, false, true, true, 0, 3), 0xB3);
    }

    #[test]
    fn test_pack_divider_layout() {
        let p1 = 32 * 128 - 512;
        assert_eq!(
            pack_divider(42, 0, p1, 0, 1),
            [42, 0x00, 0x01, 0x00, 0x0E, 0x00, 0x00, 0x00, 0x00]
        );
        let packed = pack_divider(26, 0x30, 0x2ABCD, 0x51234, 0xF5678);
        assert_eq!(packed[1], 0x56);
        assert_eq!(packed[2], 0x78);
        assert_eq!(packed[3], 0x32);
        assert_eq!(packed[4], 0xAB);
        assert_eq!(packed[5], 0xCD);
        assert_eq!(packed[6], 0xF5);
        assert_eq!(packed[7], 0x12);
        assert_eq!(packed[8], 0x34);
    }

    #[test]
    fn test_init_programs_references() {
        let sim = SimulatedTransport::new();
        let mut bus = RegisterBus::new(Box::new(sim.clone()));
        Si5351c::new().init(&mut bus);

        assert_eq!(sim.si5351c_register(REG_OUTPUT_ENABLE), 0x00);
        assert_eq!(sim.si5351c_register(REG_PLL_RESET), 0xA0);
        assert_eq!(sim.si5351c_register(REG_CLK0_CONTROL), 0x4D);
        assert_eq!(sim.si5351c_register(REG_CLK4_CONTROL), 0x4D);
        // PLLA P1 = 80 * 128 - 512 = 0x2600
        assert_eq!(sim.si5351c_register(29), 0x26);
        assert_eq!(sim.si5351c_register(30), 0x00);
        // MS4 P1 = 0x0E00
        assert_eq!(sim.si5351c_register(42 + 32 + 3), 0x0E);
    }

    #[test]
    fn test_clock_gate_and_read_back() {
        let sim = SimulatedTransport::new();
        let mut bus = RegisterBus::new(Box::new(sim.clone()));
        let si = Si5351c::new();

        si.set_clock_enabled(&mut bus, ClockOutput::Max2830, false);
        assert_eq!(sim.si5351c_register(REG_CLK4_CONTROL), 0xCD);
        assert_eq!(si.read_reg(&mut bus, REG_CLK4_CONTROL).unwrap(), 0xCD);

        si.set_clock_enabled(&mut bus, ClockOutput::Max2830, true);
        assert_eq!(si.read_reg(&mut bus, REG_CLK4_CONTROL).unwrap(), 0x4D);
    }

    #[test]
    fn test_adc_divider() {
        let sim = SimulatedTransport::new();
        let mut bus = RegisterBus::new(Box::new(sim.clone()));
        Si5351c::new().set_adc_divider(&mut bus, 80);

        // p1 = 80 * 128 - 512 = 0x2600 for both MS2 and MS3
        for base in [42 + 16, 42 + 24] {
            assert_eq!(sim.si5351c_register(base + 3), 0x26);
            assert_eq!(sim.si5351c_register(base + 4), 0x00);
            assert_eq!(sim.si5351c_register(base + 1), 0x01);
        }
    }
}
