//! Integration tests for the streaming engine on a simulated device

mod helpers;

use approx::assert_abs_diff_eq;
use fobos::convert::SAMPLE_NORM;
use fobos::sim::{BulkFrame, tone_pattern};
use fobos::{AsyncStatus, Band, CalibrationState, DevGpo, Error, Fobos};
use num_complex::Complex;
use std::time::Duration;

const SAMPLES: usize = 128;

/// Run one stream that cancels itself after `deliveries` buffers.
fn capture(
    dev: &mut Fobos,
    deliveries: usize,
    buf_count: u32,
) -> (fobos::Result<()>, Vec<Vec<Complex<f32>>>) {
    let cancel = dev.cancel_handle();
    let mut received = Vec::new();
    let result = dev.read_async(
        |samples| {
            received.push(samples.to_vec());
            if received.len() >= deliveries {
                cancel.cancel().unwrap();
            }
        },
        buf_count,
        SAMPLES as u32,
    );
    (result, received)
}

#[test]
fn test_calibration_balances_channels() {
    let (sim, mut dev) = helpers::open_simulated();
    dev.set_frequency(100e6).unwrap();
    sim.push_frames(helpers::calibration_then(
        SAMPLES,
        vec![helpers::constant_raw(SAMPLES, 100, -50)],
    ));

    let (result, received) = capture(&mut dev, 1, 4);
    result.unwrap();

    assert_eq!(dev.calibration_state().unwrap(), CalibrationState::Finished);
    let (scale_re, scale_im) = dev.iq_scale().unwrap();
    assert_abs_diff_eq!(scale_re, SAMPLE_NORM, epsilon = 1e-9);
    assert_abs_diff_eq!(scale_im, 2.0 * SAMPLE_NORM, epsilon = 1e-9);

    // a constant at the calibrated DC level comes out as silence
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].len(), SAMPLES);
    for s in &received[0] {
        assert_abs_diff_eq!(s.norm(), 0.0, epsilon = 1e-4);
    }

    let stats = dev.stream_stats();
    assert_eq!(stats.buffers, 5);
    assert_eq!(stats.delivered, 1);
}

#[test]
fn test_tuning_restored_after_calibration() {
    let (sim, mut dev) = helpers::open_simulated();
    let before = dev.set_frequency(433.92e6).unwrap();
    let gpo_before = sim.dev_gpo();
    sim.set_pattern(tone_pattern(32, 2000));

    let (result, _) = capture(&mut dev, 2, 4);
    result.unwrap();

    assert_eq!(dev.band().unwrap(), Some(Band::LowPass));
    assert_eq!(dev.frequency().unwrap(), before);
    assert_eq!(sim.dev_gpo(), gpo_before);
}

#[test]
fn test_power_on_tuning_restored_when_never_tuned() {
    let (sim, mut dev) = helpers::open_simulated();
    let gpo_before = sim.dev_gpo();
    sim.set_pattern(tone_pattern(32, 2000));

    let (result, _) = capture(&mut dev, 1, 4);
    result.unwrap();

    assert_eq!(dev.band().unwrap(), None);
    assert_eq!(sim.dev_gpo(), gpo_before);
    // LO back at 2375 MHz
    assert_eq!(sim.rffc507x_register(0x0C), 0x1798);
}

#[test]
fn test_spectrum_orientation_follows_band() {
    // 0.1 of full scale on the first ADC channel only
    let offset = helpers::constant_raw(SAMPLES, 100 + 819, -50);

    let (sim, mut dev) = helpers::open_simulated();
    dev.set_frequency(100e6).unwrap();
    sim.push_frames(helpers::calibration_then(SAMPLES, vec![offset.clone()]));
    let (result, received) = capture(&mut dev, 1, 4);
    result.unwrap();
    // the board swaps the channels, the low-pass path does not
    let s = received[0][SAMPLES - 1];
    assert_abs_diff_eq!(s.re, 0.0, epsilon = 2e-3);
    assert_abs_diff_eq!(s.im, 0.1, epsilon = 2e-3);

    dev.set_frequency(5_800e6).unwrap();
    sim.push_frames(helpers::calibration_then(SAMPLES, vec![offset]));
    let (result, received) = capture(&mut dev, 1, 4);
    result.unwrap();
    // the high-pass mixer inverts the spectrum back
    let s = received[0][SAMPLES - 1];
    assert_abs_diff_eq!(s.re, 0.1, epsilon = 2e-3);
    assert_abs_diff_eq!(s.im, 0.0, epsilon = 2e-3);
}

#[test]
fn test_cancel_from_callback() {
    let (sim, mut dev) = helpers::open_simulated();
    sim.set_pattern(tone_pattern(64, 4000));

    let (result, received) = capture(&mut dev, 3, 8);
    result.unwrap();

    assert_eq!(received.len(), 3);
    assert_eq!(dev.status(), AsyncStatus::Idle);
    assert_eq!(dev.allocated_buffers(), 0);
    assert_eq!(sim.in_flight(), 0);
    assert!(!sim.is_streaming());
    assert!(sim.dev_gpo().contains(DevGpo::ADC_SDI));

    let stats = dev.stream_stats();
    assert_eq!(stats.delivered, 3);
    assert!(!stats.device_lost);
}

#[test]
fn test_cancel_from_another_thread() {
    let (sim, mut dev) = helpers::open_simulated();
    sim.set_pattern(tone_pattern(64, 4000));

    let handle = dev.cancel_handle();
    let canceller = std::thread::spawn(move || {
        while handle.status().unwrap() != AsyncStatus::Running {
            std::thread::sleep(Duration::from_millis(1));
        }
        std::thread::sleep(Duration::from_millis(20));
        handle.cancel().unwrap();
        handle.wait_idle(Some(Duration::from_secs(5))).unwrap()
    });

    let mut delivered = 0usize;
    dev.read_async(|_| delivered += 1, 4, SAMPLES as u32).unwrap();

    assert!(canceller.join().unwrap());
    assert_eq!(dev.status(), AsyncStatus::Idle);
    assert_eq!(dev.stream_stats().delivered, delivered as u64);
    assert_eq!(sim.in_flight(), 0);
}

#[test]
fn test_stream_can_be_restarted() {
    let (sim, mut dev) = helpers::open_simulated();
    sim.set_pattern(tone_pattern(64, 4000));

    for _ in 0..2 {
        let (result, received) = capture(&mut dev, 2, 4);
        result.unwrap();
        assert_eq!(received.len(), 2);
        assert_eq!(dev.stream_stats().delivered, 2);
        assert_eq!(dev.calibration_state().unwrap(), CalibrationState::Finished);
        assert_eq!(dev.status(), AsyncStatus::Idle);
    }
}

#[test]
fn test_short_transfers_are_skipped() {
    let (sim, mut dev) = helpers::open_simulated();
    let mut frames = helpers::calibration_then(SAMPLES, Vec::new());
    frames.push(BulkFrame::Short(100));
    frames.push(BulkFrame::Short(0));
    frames.push(BulkFrame::Data(helpers::tone_raw(SAMPLES, 16, 3000)));
    sim.push_frames(frames);

    let (result, received) = capture(&mut dev, 1, 4);
    result.unwrap();

    assert_eq!(received.len(), 1);
    let stats = dev.stream_stats();
    assert_eq!(stats.short_transfers, 2);
    assert_eq!(stats.buffers, 5);
}

#[test]
fn test_unplugged_device_ends_stream() {
    let (sim, mut dev) = helpers::open_simulated();
    let mut frames = helpers::calibration_then(SAMPLES, Vec::new());
    frames.push(BulkFrame::NoDevice);
    sim.push_frames(frames);

    let mut delivered = 0;
    let result = dev.read_async(|_| delivered += 1, 4, SAMPLES as u32);

    assert!(matches!(result, Err(Error::DeviceLost)));
    assert_eq!(delivered, 0);
    assert!(dev.stream_stats().device_lost);
    assert_eq!(dev.status(), AsyncStatus::Idle);
    assert_eq!(dev.allocated_buffers(), 0);
}

#[test]
fn test_repeated_errors_mean_device_lost() {
    let (sim, mut dev) = helpers::open_simulated();
    sim.push_frames([BulkFrame::Error, BulkFrame::Error]);

    let result = dev.read_async(|_| {}, 2, SAMPLES as u32);

    assert!(matches!(result, Err(Error::DeviceLost)));
    let stats = dev.stream_stats();
    assert!(stats.device_lost);
    assert_eq!(stats.transfer_errors, 2);
    // stopped mid-calibration, the receive path is still put back
    assert_eq!(dev.calibration_state().unwrap(), CalibrationState::Finished);
    assert_eq!(sim.rffc507x_register(0x0C), 0x1798);
}

#[test]
fn test_isolated_error_is_retried() {
    let (sim, mut dev) = helpers::open_simulated();
    let mut frames = vec![BulkFrame::Error];
    frames.extend(helpers::calibration_then(
        SAMPLES,
        vec![helpers::tone_raw(SAMPLES, 16, 3000)],
    ));
    sim.push_frames(frames);

    let (result, received) = capture(&mut dev, 1, 2);
    result.unwrap();

    assert_eq!(received.len(), 1);
    let stats = dev.stream_stats();
    assert_eq!(stats.transfer_errors, 0);
    assert!(!stats.device_lost);
}

#[test]
fn test_submit_failure_reports_device_lost() {
    let (sim, mut dev) = helpers::open_simulated();
    sim.unplug();

    let result = dev.read_async(|_| {}, 4, SAMPLES as u32);
    assert!(matches!(result, Err(Error::DeviceLost)));
    assert_eq!(dev.status(), AsyncStatus::Idle);
    assert_eq!(dev.allocated_buffers(), 0);
}

#[test]
fn test_buffer_length_is_aligned() {
    let (sim, mut dev) = helpers::open_simulated();
    sim.set_pattern(tone_pattern(64, 4000));

    let cancel = dev.cancel_handle();
    let mut lengths = Vec::new();
    dev.read_async(
        |samples| {
            lengths.push(samples.len());
            cancel.cancel().unwrap();
        },
        0,
        1000,
    )
    .unwrap();

    assert_eq!(lengths, vec![896]);
}

#[test]
fn test_direct_sampling_survives_stream() {
    let (sim, mut dev) = helpers::open_simulated();
    dev.set_direct_sampling(true).unwrap();
    sim.set_pattern(tone_pattern(64, 4000));

    let (result, _) = capture(&mut dev, 1, 4);
    result.unwrap();

    assert!(dev.direct_sampling().unwrap());
    let gpo = sim.dev_gpo();
    assert!(gpo.contains(DevGpo::LPF_A0 | DevGpo::LPF_A1));
    assert!(!gpo.contains(DevGpo::NENBL_HF));
    assert_eq!(sim.si5351c_register(16), 0xCD);
}

#[test]
fn test_cancel_handle_outlives_device() {
    let (_sim, dev) = helpers::open_simulated();
    let handle = dev.cancel_handle();
    assert_eq!(handle.status().unwrap(), AsyncStatus::Idle);
    // nothing to stop, not an error
    handle.cancel().unwrap();

    drop(dev);
    assert!(matches!(handle.cancel(), Err(Error::InvalidHandle)));
    assert!(matches!(handle.status(), Err(Error::InvalidHandle)));
}

#[test]
fn test_closed_device_refuses_to_stream() {
    let (sim, mut dev) = helpers::open_simulated();
    dev.close().unwrap();
    assert!(sim.is_released());
    assert!(matches!(dev.read_async(|_| {}, 0, 0), Err(Error::NotOpen)));
    assert!(matches!(dev.cancel_async(), Err(Error::NotOpen)));
}
