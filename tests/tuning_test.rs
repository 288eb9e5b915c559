//! Integration tests for tuning and analog-path routing on a simulated device

mod helpers;

use approx::assert_relative_eq;
use fobos::bus::{REQ_DEV_GPO, REQ_RFFC507X};
use fobos::gpo::{IfFilter, Preselector};
use fobos::{Band, DevGpo, Error};

#[test]
fn test_band_edges() {
    let (_sim, mut dev) = helpers::open_simulated();

    let cases = [
        (40e6, Band::LowPass),
        (2_299e6, Band::LowPass),
        (2_300e6, Band::Bypass),
        (2_550e6, Band::Bypass),
        (2_551e6, Band::HighPass),
        (6_550e6, Band::HighPass),
    ];
    for (hz, band) in cases {
        let actual = dev.set_frequency(hz).unwrap();
        assert_eq!(dev.band().unwrap(), Some(band), "{} Hz", hz);
        // within one transceiver PLL step
        assert_relative_eq!(actual, hz, epsilon = 30.0);
    }
}

#[test]
fn test_out_of_range() {
    let (sim, mut dev) = helpers::open_simulated();
    for hz in [0.0, 39.9e6, 6_551e6, f64::NAN, -1e9] {
        sim.clear_log();
        assert!(
            matches!(dev.set_frequency(hz), Err(Error::OutOfRange(_))),
            "{} Hz",
            hz
        );
        assert!(sim.control_log().is_empty());
    }
    assert_eq!(dev.band().unwrap(), None);
}

#[test]
fn test_bypass_routing() {
    let (sim, mut dev) = helpers::open_simulated();
    dev.set_frequency(2_450e6).unwrap();
    assert_eq!(dev.band().unwrap(), Some(Band::Bypass));

    let gpo = sim.dev_gpo();
    assert_eq!(gpo.preselector(), Preselector::None);
    assert_eq!(gpo.if_filter(), IfFilter::None);
    assert!(!gpo.intersects(DevGpo::LNA_LP_SHD | DevGpo::LNA_HP_SHD));
    assert!(gpo.contains(DevGpo::MAX2830_ANTSEL));
    // synthesizer disabled, its clock output powered down
    assert_eq!(sim.rffc507x_register(0x15) & (1 << 14), 0);
    assert_eq!(sim.si5351c_register(16), 0xCD);
}

#[test]
fn test_band_change_back_to_low_pass() {
    let (sim, mut dev) = helpers::open_simulated();
    dev.set_frequency(2_450e6).unwrap();
    dev.set_frequency(100e6).unwrap();

    let gpo = sim.dev_gpo();
    assert_eq!(gpo.preselector(), Preselector::LowPass);
    assert!(!gpo.contains(DevGpo::MAX2830_ANTSEL));
    assert_ne!(sim.rffc507x_register(0x15) & (1 << 14), 0);
    assert_eq!(sim.si5351c_register(16), 0x4D);
}

#[test]
fn test_retune_within_band_is_coalesced() {
    let (sim, mut dev) = helpers::open_simulated();
    dev.set_frequency(100e6).unwrap();

    sim.clear_log();
    dev.set_frequency(105e6).unwrap();
    // same band: no GPO rewrite, only the synthesizer registers that moved
    assert_eq!(sim.count_requests(REQ_DEV_GPO), 0);
    let writes = sim.count_requests(REQ_RFFC507X);
    assert!(writes > 0);
    assert!(writes < 31);
}

#[test]
fn test_retune_to_same_frequency_is_noop() {
    let (sim, mut dev) = helpers::open_simulated();
    let actual = dev.set_frequency(5_800e6).unwrap();
    sim.clear_log();
    assert_eq!(dev.set_frequency(5_800e6).unwrap(), actual);
    assert!(sim.control_log().is_empty());
}

#[test]
fn test_samplerate_snaps_and_picks_filter() {
    let (sim, mut dev) = helpers::open_simulated();
    assert_eq!(dev.set_samplerate(9e6).unwrap(), 10e6);
    assert_eq!(dev.lpf().unwrap(), 0);
    assert!(!sim.dev_gpo().intersects(DevGpo::LPF_A0 | DevGpo::LPF_A1));

    assert_eq!(dev.set_samplerate(80e6).unwrap(), 80e6);
    assert_eq!(dev.lpf().unwrap(), 2);
    assert_eq!(dev.bandwidth_idx().unwrap(), 3);
}

#[test]
fn test_expert_transceiver_override_forces_full_retune() {
    let (sim, mut dev) = helpers::open_simulated();
    dev.set_frequency(2_450e6).unwrap();
    dev.set_max2830_frequency(2_420e6).unwrap();
    assert_eq!(dev.band().unwrap(), None);

    sim.clear_log();
    let actual = dev.set_frequency(2_450e6).unwrap();
    assert_relative_eq!(actual, 2_450e6, epsilon = 30.0);
    assert_eq!(dev.band().unwrap(), Some(Band::Bypass));
    assert!(!sim.control_log().is_empty());
}
