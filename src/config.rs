//! In-memory receiver configuration.

use crate::device::{ClockSource, Fobos};
use crate::error::Result;

/// Everything needed to bring a receiver up in one go.
#[derive(Debug, Clone, PartialEq)]
pub struct FobosConfig {
    /// Zero-based device index.
    pub index: u32,
    /// Center frequency in Hz (40 MHz to 6.55 GHz).
    pub frequency: f64,
    /// Requested sample rate in Hz, snapped to the nearest supported rate.
    pub sample_rate: f64,
    /// LNA gain code (0-3).
    pub lna_gain: u8,
    /// VGA gain code (0-15).
    pub vga_gain: u8,
    /// Low-pass filter override, `None` to follow the sample rate.
    pub lpf: Option<u8>,
    pub direct_sampling: bool,
    pub clock_source: ClockSource,
    /// Transfers in flight, 0 for the default.
    pub buf_count: u32,
    /// Complex samples per transfer, 0 for the default.
    pub buf_length: u32,
}

impl FobosConfig {
    pub fn new(index: u32, frequency: f64, sample_rate: f64) -> Self {
        Self {
            index,
            frequency,
            sample_rate,
            lna_gain: 0,
            vga_gain: 0,
            lpf: None,
            direct_sampling: false,
            clock_source: ClockSource::Internal,
            buf_count: 0,
            buf_length: 0,
        }
    }

    pub fn with_gains(mut self, lna_gain: u8, vga_gain: u8) -> Self {
        self.lna_gain = lna_gain;
        self.vga_gain = vga_gain;
        self
    }

    pub fn with_lpf(mut self, lpf: u8) -> Self {
        self.lpf = Some(lpf);
        self
    }

    pub fn with_direct_sampling(mut self, enabled: bool) -> Self {
        self.direct_sampling = enabled;
        self
    }

    pub fn with_clock_source(mut self, source: ClockSource) -> Self {
        self.clock_source = source;
        self
    }

    pub fn with_buffers(mut self, buf_count: u32, buf_length: u32) -> Self {
        self.buf_count = buf_count;
        self.buf_length = buf_length;
        self
    }

    /// Program an open device. Stops at the first failing setting.
    pub fn apply(&self, dev: &mut Fobos) -> Result<()> {
        let actual = dev.set_frequency(self.frequency)?;
        let rate = dev.set_samplerate(self.sample_rate)?;
        if let Some(lpf) = self.lpf {
            dev.set_lpf(i32::from(lpf))?;
        }
        let lna = dev.set_lna_gain(self.lna_gain)?;
        let vga = dev.set_vga_gain(self.vga_gain)?;
        dev.set_direct_sampling(self.direct_sampling)?;
        dev.set_clk_source(self.clock_source)?;
        tracing::info!(
            "Configured: {:.0} Hz, {:.0} S/s, LNA {}, VGA {}{}",
            actual,
            rate,
            lna,
            vga,
            if self.direct_sampling { ", direct sampling" } else { "" }
        );
        Ok(())
    }

    /// Open the configured device and apply the configuration.
    pub fn open(&self) -> Result<Fobos> {
        let mut dev = Fobos::open(self.index)?;
        self.apply(&mut dev)?;
        Ok(dev)
    }
}
