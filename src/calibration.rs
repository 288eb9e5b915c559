//! Start-of-stream I/Q calibration.
//!
//! Before samples are delivered, a few buffers are captured with the
//! transceiver looking at a fixed leakage tone. Their DC offset and mean
//! absolute amplitude per channel give a gain-balancing scale for the
//! second channel and an initial DC estimate for the converter.

use crate::convert::{BYTES_PER_SAMPLE, SAMPLE_NORM, decode_pair};

/// Buffers captured before calibration is finished.
pub const CALIBRATION_BUFFERS: usize = 4;

/// Weight of a new buffer's estimate against the running one.
pub const ESTIMATE_BLEND: f32 = 0.1;

/// Transceiver frequency used while calibrating.
pub const CALIBRATION_MAX2830_HZ: f64 = 2_400_000_000.0;
/// Synthesizer LO used while calibrating, 1 MHz away from the transceiver.
pub const CALIBRATION_LO_MHZ: u32 = 2401;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CalibrationState {
    /// No calibration has run on this stream.
    #[default]
    Off,
    /// Capturing calibration buffers; nothing is delivered.
    Armed,
    /// Done, the receive path has been restored.
    Finished,
}

/// Statistics of one raw buffer, in ADC units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferEstimate {
    pub dc_re: f32,
    pub dc_im: f32,
    pub mean_abs_re: f32,
    pub mean_abs_im: f32,
}

/// Per-channel DC and mean absolute deviation of a raw bulk buffer.
pub fn estimate(raw: &[u8]) -> Option<BufferEstimate> {
    let n = raw.len() / BYTES_PER_SAMPLE;
    if n == 0 {
        return None;
    }
    let pairs = || raw.chunks_exact(BYTES_PER_SAMPLE).map(decode_pair);

    let (sum_re, sum_im) = pairs().fold((0i64, 0i64), |(sr, si), (a, b)| {
        (sr + i64::from(a), si + i64::from(b))
    });
    let dc_re = sum_re as f64 / n as f64;
    let dc_im = sum_im as f64 / n as f64;

    let (abs_re, abs_im) = pairs().fold((0f64, 0f64), |(sr, si), (a, b)| {
        (
            sr + (f64::from(a) - dc_re).abs(),
            si + (f64::from(b) - dc_im).abs(),
        )
    });

    Some(BufferEstimate {
        dc_re: dc_re as f32,
        dc_im: dc_im as f32,
        mean_abs_re: (abs_re / n as f64) as f32,
        mean_abs_im: (abs_im / n as f64) as f32,
    })
}

#[derive(Debug, Clone)]
pub struct Calibration {
    state: CalibrationState,
    pos: usize,
    scale_re: f32,
    scale_im: f32,
    dc_re: f32,
    dc_im: f32,
}

impl Default for Calibration {
    fn default() -> Self {
        Self::new()
    }
}

impl Calibration {
    pub fn new() -> Self {
        Calibration {
            state: CalibrationState::Off,
            pos: 0,
            scale_re: SAMPLE_NORM,
            scale_im: SAMPLE_NORM,
            dc_re: 0.0,
            dc_im: 0.0,
        }
    }

    pub fn state(&self) -> CalibrationState {
        self.state
    }

    /// Buffers consumed since the calibration was armed.
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn arm(&mut self) {
        self.state = CalibrationState::Armed;
        self.pos = 0;
    }

    pub fn finish(&mut self) {
        self.state = CalibrationState::Finished;
    }

    /// Enough buffers have been captured.
    pub fn is_complete(&self) -> bool {
        self.state == CalibrationState::Armed && self.pos >= CALIBRATION_BUFFERS
    }

    /// Fold one captured buffer into the estimates.
    pub fn process(&mut self, raw: &[u8]) {
        if let Some(est) = estimate(raw) {
            if self.pos == 0 {
                self.dc_re = est.dc_re;
                self.dc_im = est.dc_im;
            } else {
                self.dc_re += ESTIMATE_BLEND * (est.dc_re - self.dc_re);
                self.dc_im += ESTIMATE_BLEND * (est.dc_im - self.dc_im);
            }

            // a dead channel leaves the scale alone
            if est.mean_abs_re > 0.0 && est.mean_abs_im > 0.0 {
                let scale_re = SAMPLE_NORM;
                let scale_im = SAMPLE_NORM * est.mean_abs_re / est.mean_abs_im;
                if self.pos == 0 {
                    self.scale_re = scale_re;
                    self.scale_im = scale_im;
                } else {
                    self.scale_re += ESTIMATE_BLEND * (scale_re - self.scale_re);
                    self.scale_im += ESTIMATE_BLEND * (scale_im - self.scale_im);
                }
            }
            tracing::trace!(
                "Calibration buffer {}: dc=({:.1}, {:.1}) |x|=({:.1}, {:.1})",
                self.pos,
                est.dc_re,
                est.dc_im,
                est.mean_abs_re,
                est.mean_abs_im
            );
        }
        self.pos += 1;
    }

    /// Per-channel scale (first word, second word).
    pub fn scale(&self) -> (f32, f32) {
        (self.scale_re, self.scale_im)
    }

    /// DC estimate in ADC units.
    pub fn dc(&self) -> (f32, f32) {
        (self.dc_re, self.dc_im)
    }

    /// DC estimate in the converter's scaled units.
    pub fn scaled_dc(&self) -> (f32, f32) {
        (self.dc_re * self.scale_re, self.dc_im * self.scale_im)
    }
}
