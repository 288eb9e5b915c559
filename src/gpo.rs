//! Device GPO word: the control lines of the analog path.

use bitflags::bitflags;

bitflags! {
    /// Bits of the 16-bit word sent with the 0xE4 request.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DevGpo: u16 {
        const PRESEL_V1 = 1 << 0;
        const PRESEL_V2 = 1 << 1;
        /// Low-pass path LNA shutdown.
        const LNA_LP_SHD = 1 << 2;
        /// High-pass path LNA shutdown.
        const LNA_HP_SHD = 1 << 3;
        const IF_V1 = 1 << 4;
        const IF_V2 = 1 << 5;
        const LPF_A0 = 1 << 6;
        const LPF_A1 = 1 << 7;
        /// Active-low enable of the HF (direct sampling) input.
        const NENBL_HF = 1 << 8;
        /// Set for the internal reference clock.
        const CLKSEL = 1 << 9;
        const ADC_NCS = 1 << 10;
        const ADC_SCK = 1 << 11;
        const ADC_SDI = 1 << 12;
        /// Transceiver antenna input select.
        const MAX2830_ANTSEL = 1 << 13;
    }
}

/// Preselector filter in front of the LNAs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preselector {
    LowPass,
    HighPass,
    None,
}

/// IF filter between the synthesizer mixer and the transceiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IfFilter {
    /// Upper IF filter (2450 MHz region).
    High,
    /// Lower IF filter (2350 MHz region).
    Low,
    None,
}

impl DevGpo {
    /// Word written right after the device is opened.
    pub fn power_on() -> Self {
        DevGpo::CLKSEL
            | DevGpo::LNA_LP_SHD
            | DevGpo::LNA_HP_SHD
            | DevGpo::ADC_NCS
            | DevGpo::ADC_SCK
            | DevGpo::ADC_SDI
            | DevGpo::NENBL_HF
    }

    pub fn select_preselector(&mut self, preselector: Preselector) {
        let (v1, v2) = match preselector {
            Preselector::LowPass => (true, false),
            Preselector::HighPass => (false, true),
            Preselector::None => (false, false),
        };
        self.set(DevGpo::PRESEL_V1, v1);
        self.set(DevGpo::PRESEL_V2, v2);
    }

    pub fn preselector(&self) -> Preselector {
        match (
            self.contains(DevGpo::PRESEL_V1),
            self.contains(DevGpo::PRESEL_V2),
        ) {
            (true, false) => Preselector::LowPass,
            (false, true) => Preselector::HighPass,
            _ => Preselector::None,
        }
    }

    /// Drive the two LNA shutdown lines.
    pub fn set_lna_shutdown(&mut self, low_pass: bool, high_pass: bool) {
        self.set(DevGpo::LNA_LP_SHD, low_pass);
        self.set(DevGpo::LNA_HP_SHD, high_pass);
    }

    pub fn select_if_filter(&mut self, filter: IfFilter) {
        let (v1, v2) = match filter {
            IfFilter::High => (false, true),
            IfFilter::Low => (true, false),
            IfFilter::None => (false, false),
        };
        self.set(DevGpo::IF_V1, v1);
        self.set(DevGpo::IF_V2, v2);
    }

    pub fn if_filter(&self) -> IfFilter {
        match (self.contains(DevGpo::IF_V1), self.contains(DevGpo::IF_V2)) {
            (false, true) => IfFilter::High,
            (true, false) => IfFilter::Low,
            _ => IfFilter::None,
        }
    }

    /// Select the transceiver's auxiliary antenna input (bypass path).
    pub fn set_antenna_aux(&mut self, aux: bool) {
        self.set(DevGpo::MAX2830_ANTSEL, aux);
    }

    /// Low-pass filter bank select. Bit 0 of the index drives A1 and bit 1
    /// drives A0.
    pub fn set_lpf(&mut self, idx: u8) {
        self.set(DevGpo::LPF_A1, idx & 1 != 0);
        self.set(DevGpo::LPF_A0, idx & 2 != 0);
    }

    /// Route the HF input straight to the ADC (or back to the RF path).
    pub fn set_direct_sampling(&mut self, enabled: bool, lpf_idx: u8) {
        if enabled {
            self.insert(DevGpo::LPF_A0 | DevGpo::LPF_A1);
            self.remove(DevGpo::NENBL_HF);
        } else {
            self.set_lpf(lpf_idx);
            self.insert(DevGpo::NENBL_HF);
        }
    }

    /// Reference clock select: `true` for the external clock input.
    pub fn set_external_clock(&mut self, external: bool) {
        self.set(DevGpo::CLKSEL, !external);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_on_word() {
        assert_eq!(DevGpo::power_on().bits(), 0x1F0C);
    }

    #[test]
    fn test_preselector_lines() {
        let mut gpo = DevGpo::empty();
        gpo.select_preselector(Preselector::LowPass);
        assert_eq!(gpo.bits() & 0b11, 0b01);
        gpo.select_preselector(Preselector::HighPass);
        assert_eq!(gpo.bits() & 0b11, 0b10);
        assert_eq!(gpo.preselector(), Preselector::HighPass);
        gpo.select_preselector(Preselector::None);
        assert_eq!(gpo.bits() & 0b11, 0);
    }

    #[test]
    fn test_if_filter_lines() {
        let mut gpo = DevGpo::empty();
        gpo.select_if_filter(IfFilter::High);
        assert_eq!(gpo, DevGpo::IF_V2);
        gpo.select_if_filter(IfFilter::Low);
        assert_eq!(gpo, DevGpo::IF_V1);
        assert_eq!(gpo.if_filter(), IfFilter::Low);
    }

    #[test]
    fn test_lpf_bit_order() {
        let mut gpo = DevGpo::empty();
        gpo.set_lpf(1);
        assert_eq!(gpo, DevGpo::LPF_A1);
        gpo.set_lpf(2);
        assert_eq!(gpo, DevGpo::LPF_A0);
        gpo.set_lpf(0);
        assert!(gpo.is_empty());
    }

    #[test]
    fn test_direct_sampling_lines() {
        let mut gpo = DevGpo::power_on();
        gpo.set_direct_sampling(true, 0);
        assert!(gpo.contains(DevGpo::LPF_A0 | DevGpo::LPF_A1));
        assert!(!gpo.contains(DevGpo::NENBL_HF));

        gpo.set_direct_sampling(false, 1);
        assert!(gpo.contains(DevGpo::LPF_A1));
        assert!(!gpo.contains(DevGpo::LPF_A0));
        assert!(gpo.contains(DevGpo::NENBL_HF));
    }

    #[test]
    fn test_clock_select() {
        let mut gpo = DevGpo::power_on();
        gpo.set_external_clock(true);
        assert!(!gpo.contains(DevGpo::CLKSEL));
        gpo.set_external_clock(false);
        assert!(gpo.contains(DevGpo::CLKSEL));
    }
}
