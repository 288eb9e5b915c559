//! Supported ADC sample rates and the filters that go with them.

/// Supported sample rates in Hz, descending.
pub const SAMPLE_RATES: [f64; 14] = [
    80_000_000.0,
    50_000_000.0,
    40_000_000.0,
    32_000_000.0,
    25_000_000.0,
    20_000_000.0,
    16_000_000.0,
    12_500_000.0,
    10_000_000.0,
    8_000_000.0,
    6_400_000.0,
    6_250_000.0,
    5_000_000.0,
    4_000_000.0,
];

/// Clock generator integer divider producing each entry of [`SAMPLE_RATES`].
pub const ADC_DIVIDERS: [u32; 14] = [10, 16, 20, 25, 32, 40, 50, 64, 80, 100, 125, 128, 160, 200];

/// Highest low-pass filter bank index.
pub const MAX_LPF_IDX: u8 = 2;

/// Settings derived from a sample-rate request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleRatePlan {
    pub index: usize,
    pub rate: f64,
    pub adc_divider: u32,
    pub lpf_idx: u8,
    pub bandwidth_idx: u8,
}

/// Index of the table entry closest to `hz`. Ties keep the higher rate.
pub fn nearest_index(hz: f64) -> usize {
    let mut df_min = SAMPLE_RATES[0];
    let mut i_min = 0;
    for (i, rate) in SAMPLE_RATES.iter().enumerate() {
        let df = (hz - rate).abs();
        if df < df_min {
            df_min = df;
            i_min = i;
        }
    }
    i_min
}

/// Low-pass filter bank for a sample rate.
pub fn lpf_index(rate: f64) -> u8 {
    if rate < 13_000_000.0 {
        0
    } else if rate < 26_000_000.0 {
        1
    } else {
        2
    }
}

/// Transceiver channel filter for a sample rate.
pub fn bandwidth_index(rate: f64) -> u8 {
    if rate < 15_000_000.0 {
        0
    } else if rate < 17_000_000.0 {
        1
    } else if rate < 30_000_000.0 {
        2
    } else {
        3
    }
}

pub fn plan(hz: f64) -> SampleRatePlan {
    let index = nearest_index(hz);
    let rate = SAMPLE_RATES[index];
    SampleRatePlan {
        index,
        rate,
        adc_divider: ADC_DIVIDERS[index],
        lpf_idx: lpf_index(rate),
        bandwidth_idx: bandwidth_index(rate),
    }
}
