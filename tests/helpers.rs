//! Test helper utilities for generating raw Fobos ADC buffers

#![allow(dead_code)]

use fobos::Fobos;
use fobos::convert::{BYTES_PER_SAMPLE, encode_sample};
use fobos::sim::{BulkFrame, SimulatedTransport};
use std::f32::consts::PI;

fn push_pair(buffer: &mut Vec<u8>, re: i16, im: i16) {
    buffer.extend_from_slice(&encode_sample(re).to_le_bytes());
    buffer.extend_from_slice(&encode_sample(im).to_le_bytes());
}

/// Generate a square wave on both ADC channels
///
/// # Arguments
/// * `num_samples` - Number of complex samples
/// * `dc` - Offset of the (re, im) channels in ADC counts
/// * `amplitude` - Peak deviation of the (re, im) channels from `dc`
///
/// # Returns
/// Raw bulk bytes: interleaved 14-bit words, little-endian
pub fn square_wave_raw(num_samples: usize, dc: (i16, i16), amplitude: (i16, i16)) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(num_samples * BYTES_PER_SAMPLE);
    for n in 0..num_samples {
        let sign = if n % 2 == 0 { 1 } else { -1 };
        push_pair(
            &mut buffer,
            dc.0 + sign * amplitude.0,
            dc.1 + sign * amplitude.1,
        );
    }
    buffer
}

/// Generate a complex tone
///
/// # Arguments
/// * `num_samples` - Number of complex samples
/// * `period` - Samples per cycle
/// * `amplitude` - Peak value in ADC counts
///
/// # Returns
/// Raw bulk bytes: interleaved 14-bit words, little-endian
pub fn tone_raw(num_samples: usize, period: usize, amplitude: i16) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(num_samples * BYTES_PER_SAMPLE);
    for n in 0..num_samples {
        let phase = 2.0 * PI * n as f32 / period as f32;
        push_pair(
            &mut buffer,
            (phase.cos() * f32::from(amplitude)) as i16,
            (phase.sin() * f32::from(amplitude)) as i16,
        );
    }
    buffer
}

/// Generate a constant level on both channels
pub fn constant_raw(num_samples: usize, re: i16, im: i16) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(num_samples * BYTES_PER_SAMPLE);
    for _ in 0..num_samples {
        push_pair(&mut buffer, re, im);
    }
    buffer
}

/// Calibration buffers followed by `data` buffers, as scripted bulk frames
pub fn calibration_then(num_samples: usize, data: Vec<Vec<u8>>) -> Vec<BulkFrame> {
    let mut frames: Vec<BulkFrame> = (0..fobos::calibration::CALIBRATION_BUFFERS)
        .map(|_| BulkFrame::Data(square_wave_raw(num_samples, (100, -50), (1000, 500))))
        .collect();
    frames.extend(data.into_iter().map(BulkFrame::Data));
    frames
}

/// Open a device on a fresh simulated transport
///
/// # Returns
/// The inspection clone of the transport and the opened device
pub fn open_simulated() -> (SimulatedTransport, Fobos) {
    init_tracing();
    let sim = SimulatedTransport::new();
    let dev = Fobos::with_transport(Box::new(sim.clone()));
    (sim, dev)
}

/// Route driver logs to the test output (`RUST_LOG`-free, debug level)
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}
