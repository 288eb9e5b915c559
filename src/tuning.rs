//! Frequency planning: RF path selection and the synthesizer/transceiver
//! frequency split.
//!
//! Three paths cover 40 MHz to 6.55 GHz:
//!
//! | band      | MHz          | how                                         |
//! |-----------|--------------|---------------------------------------------|
//! | low-pass  | [40, 2300)   | mixed up to ~2400 MHz, RX = MAX2830 - LO    |
//! | bypass    | [2300, 2550] | straight into the MAX2830, synthesizer off  |
//! | high-pass | (2550, 6550] | mixed down to 2350/2450 MHz, RX = MAX + LO  |
//!
//! [`plan`] is pure; the device applies the plan to the chips.

use crate::error::{Error, Result};
use crate::gpo::{DevGpo, IfFilter, Preselector};

pub const MIN_FREQ_MHZ: u32 = 40;
pub const MAX_LP_FREQ_MHZ: u32 = 2300;
pub const MAX_BP_FREQ_MHZ: u32 = 2550;
pub const MAX_HP_FREQ_MHZ: u32 = 6550;

/// Transceiver frequency the low-pass path mixes to.
pub const LP_IF_MHZ: u32 = 2400;
/// Transceiver frequencies of the high-pass path, per IF filter.
pub const HP_IF_LOW_MHZ: u32 = 2350;
pub const HP_IF_HIGH_MHZ: u32 = 2450;
/// High-pass sub-band served through the upper IF filter.
pub const HP_HIGH_IF_RANGE_MHZ: (u32, u32) = (4550, 4750);

/// Synthesizer LO is kept on a 5 MHz grid on the low-pass path.
const SPUR_GRID_MHZ: u32 = 5;

/// RF path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Band {
    LowPass,
    Bypass,
    HighPass,
}

impl Band {
    /// Numeric band id (0 is reserved for "unset").
    pub fn id(self) -> u8 {
        match self {
            Band::LowPass => 1,
            Band::Bypass => 2,
            Band::HighPass => 3,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Band::LowPass => "low-pass",
            Band::Bypass => "bypass",
            Band::HighPass => "high-pass",
        }
    }
}

/// Band serving `freq_mhz`, if any.
pub fn band_for_mhz(freq_mhz: u32) -> Option<Band> {
    match freq_mhz {
        f if f < MIN_FREQ_MHZ => None,
        f if f < MAX_LP_FREQ_MHZ => Some(Band::LowPass),
        f if f <= MAX_BP_FREQ_MHZ => Some(Band::Bypass),
        f if f <= MAX_HP_FREQ_MHZ => Some(Band::HighPass),
        _ => None,
    }
}

/// Everything decided for one tuning request before touching the chips.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TunePlan {
    pub band: Band,
    /// Requested frequency in Hz.
    pub requested_hz: f64,
    /// Requested frequency truncated to whole Hz.
    pub freq_hz: u64,
    pub freq_mhz: u32,
    /// Synthesizer LO, `None` on the bypass path.
    pub synth_mhz: Option<u32>,
    pub if_filter: IfFilter,
    /// Whether the path inverts the spectrum.
    pub swap_iq: bool,
}

pub fn plan(freq_hz: f64) -> Result<TunePlan> {
    if !freq_hz.is_finite() || freq_hz < 0.0 {
        return Err(Error::OutOfRange(freq_hz));
    }
    let freq = freq_hz as u64;
    let freq_mhz = u32::try_from(freq / 1_000_000).map_err(|_| Error::OutOfRange(freq_hz))?;
    let band = band_for_mhz(freq_mhz).ok_or(Error::OutOfRange(freq_hz))?;

    let (synth_mhz, if_filter, swap_iq) = match band {
        Band::LowPass => {
            let lo = (LP_IF_MHZ - freq_mhz) / SPUR_GRID_MHZ * SPUR_GRID_MHZ;
            (Some(lo), IfFilter::High, false)
        }
        Band::Bypass => (None, IfFilter::None, false),
        Band::HighPass => {
            let (lo, hi) = HP_HIGH_IF_RANGE_MHZ;
            let (if_mhz, filter) = if (lo..=hi).contains(&freq_mhz) {
                (HP_IF_HIGH_MHZ, IfFilter::High)
            } else {
                (HP_IF_LOW_MHZ, IfFilter::Low)
            };
            // no grid rounding on this path
            (Some(freq_mhz - if_mhz), filter, true)
        }
    };

    Ok(TunePlan {
        band,
        requested_hz: freq_hz,
        freq_hz: freq,
        freq_mhz,
        synth_mhz,
        if_filter,
        swap_iq,
    })
}

impl TunePlan {
    /// Transceiver frequency, given the LO the synthesizer actually produces.
    pub fn transceiver_hz(&self, synth_hz: u64) -> f64 {
        match self.band {
            Band::LowPass => (synth_hz + self.freq_hz) as f64,
            Band::Bypass => self.requested_hz,
            Band::HighPass => self.freq_hz.saturating_sub(synth_hz) as f64,
        }
    }

    /// Received RF frequency from the two programmed frequencies.
    pub fn rx_hz(&self, transceiver_hz: f64, synth_hz: u64) -> f64 {
        match self.band {
            Band::LowPass => transceiver_hz - synth_hz as f64,
            Band::Bypass => transceiver_hz,
            Band::HighPass => transceiver_hz + synth_hz as f64,
        }
    }

    /// Set the analog path lines for this plan, leaving the other bits.
    pub fn route(&self, gpo: &mut DevGpo) {
        match self.band {
            Band::LowPass => {
                gpo.select_preselector(Preselector::LowPass);
                gpo.set_lna_shutdown(false, true);
                gpo.set_antenna_aux(false);
            }
            Band::Bypass => {
                gpo.select_preselector(Preselector::None);
                gpo.set_lna_shutdown(false, false);
                gpo.set_antenna_aux(true);
            }
            Band::HighPass => {
                gpo.select_preselector(Preselector::HighPass);
                gpo.set_lna_shutdown(false, true);
                gpo.set_antenna_aux(false);
            }
        }
        gpo.select_if_filter(self.if_filter);
    }
}
