//! Raw ADC words to calibrated complex samples.
//!
//! The bulk stream carries interleaved 16-bit little-endian words, one per
//! channel. Only the low 14 bits are significant and they hold the sample in
//! offset binary; [`sign_extend`] turns a word into a signed 14-bit value.

use num_complex::Complex;

/// Full-scale normalization of a 14-bit sample.
pub const SAMPLE_NORM: f32 = 1.0 / 8191.0;

/// Smoothing constant of the running DC estimate.
pub const DC_SMOOTHING: f32 = 0.001;

/// The DC estimate is updated once per this many complex samples.
pub const DC_UPDATE_INTERVAL: usize = 8;

/// The board wires the ADC channels in swapped order.
pub const HW_SWAP_IQ: bool = true;

/// Bytes per complex sample in the bulk stream.
pub const BYTES_PER_SAMPLE: usize = 4;

/// Decode one ADC word into a signed value in [-8192, 8191].
#[inline]
pub fn sign_extend(word: u16) -> i16 {
    ((((word & 0x3FFF) ^ 0x2000) << 2) as i16) >> 2
}

/// Encode a signed 14-bit value as the ADC would deliver it.
#[inline]
pub fn encode_sample(value: i16) -> u16 {
    ((value as u16) & 0x3FFF) ^ 0x2000
}

/// Decode the two channel words of complex sample `raw[0..4]`.
#[inline]
pub fn decode_pair(raw: &[u8]) -> (i16, i16) {
    (
        sign_extend(u16::from_le_bytes([raw[0], raw[1]])),
        sign_extend(u16::from_le_bytes([raw[2], raw[3]])),
    )
}

/// Per-channel scale and running DC removal.
///
/// Channel "re" is the first word of each pair as it comes off the wire;
/// the output ordering is decided per call by the swap flag.
#[derive(Debug, Clone)]
pub struct SampleConverter {
    scale_re: f32,
    scale_im: f32,
    dc_re: f32,
    dc_im: f32,
}

impl Default for SampleConverter {
    fn default() -> Self {
        Self::new()
    }
}

impl SampleConverter {
    pub fn new() -> Self {
        SampleConverter {
            scale_re: SAMPLE_NORM,
            scale_im: SAMPLE_NORM,
            dc_re: 0.0,
            dc_im: 0.0,
        }
    }

    pub fn scale(&self) -> (f32, f32) {
        (self.scale_re, self.scale_im)
    }

    pub fn set_scale(&mut self, scale_re: f32, scale_im: f32) {
        self.scale_re = scale_re;
        self.scale_im = scale_im;
    }

    pub fn dc(&self) -> (f32, f32) {
        (self.dc_re, self.dc_im)
    }

    pub fn set_dc(&mut self, dc_re: f32, dc_im: f32) {
        self.dc_re = dc_re;
        self.dc_im = dc_im;
    }

    /// Convert one bulk buffer into `out` (cleared first).
    ///
    /// In direct sampling mode both channels use the plain normalization
    /// instead of the calibrated scale. `swap_iq` is the spectrum inversion
    /// of the RF path; it is combined with the board's own channel swap.
    pub fn convert(
        &mut self,
        raw: &[u8],
        out: &mut Vec<Complex<f32>>,
        direct_sampling: bool,
        swap_iq: bool,
    ) {
        let (scale_re, scale_im) = if direct_sampling {
            (SAMPLE_NORM, SAMPLE_NORM)
        } else {
            (self.scale_re, self.scale_im)
        };
        let swap = swap_iq ^ HW_SWAP_IQ;
        let mut dc_re = self.dc_re;
        let mut dc_im = self.dc_im;

        out.clear();
        out.reserve(raw.len() / BYTES_PER_SAMPLE);

        for (n, pair) in raw.chunks_exact(BYTES_PER_SAMPLE).enumerate() {
            let (a, b) = decode_pair(pair);
            let re = f32::from(a) * scale_re;
            let im = f32::from(b) * scale_im;
            if n % DC_UPDATE_INTERVAL == 0 {
                dc_re += DC_SMOOTHING * (re - dc_re);
                dc_im += DC_SMOOTHING * (im - dc_im);
            }
            let (re, im) = (re - dc_re, im - dc_im);
            out.push(if swap {
                Complex::new(im, re)
            } else {
                Complex::new(re, im)
            });
        }

        self.dc_re = dc_re;
        self.dc_im = dc_im;
    }
}
