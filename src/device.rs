//! The Fobos SDR device handle.
//!
//! [`Fobos`] owns the register bus and the driver-side shadows of the three
//! chips and the GPO word. All configuration goes through `&mut self`, so the
//! borrow checker rules out retuning while [`Fobos::read_async`] runs; the
//! only cross-thread operation is cancellation through a [`CancelHandle`].

use crate::bus::{BusFault, REQ_DEV_GPO, REQ_STREAM, REQ_USER_GPO, RegisterBus};
use crate::calibration::{
    CALIBRATION_LO_MHZ, CALIBRATION_MAX2830_HZ, Calibration, CalibrationState,
};
use crate::chips::{ClockOutput, Max2830, Rffc507x, Si5351c};
use crate::chips::rffc507x::LO_MAX_MHZ;
use crate::convert::SampleConverter;
use crate::error::{Error, Result};
use crate::gpo::{DevGpo, IfFilter};
use crate::samplerate::{self, MAX_LPF_IDX, SAMPLE_RATES};
use crate::stream::{
    AsyncStatus, BufferPool, CancelHandle, StreamControl, StreamGeometry, StreamStats,
};
use crate::transport::{
    BULK_IN_ENDPOINT, Completion, DeviceStrings, RusbTransport, TransferStatus, UsbTransport,
};
use crate::tuning::{self, Band};
use crate::{DRIVER_NAME, FW_VERSION, HW_REVISION, LIB_VERSION};
use num_complex::Complex;
use std::sync::Arc;
use std::time::Duration;

/// Wait per event-loop iteration while streaming.
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(1);

const DRAIN_TIMEOUT: Duration = Duration::from_millis(10);
/// Empty polls tolerated while waiting for cancelled transfers to return.
const DRAIN_IDLE_POLLS: usize = 500;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Tuning applied when the device is opened.
pub const POWER_ON_LO_MHZ: u32 = 2375;
pub const POWER_ON_MAX2830_HZ: f64 = 2_475_000_000.0;
pub const DEFAULT_SAMPLE_RATE: f64 = 10_000_000.0;

/// Reference clock source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClockSource {
    #[default]
    Internal,
    External,
}

/// Library version and USB backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApiInfo {
    pub lib_version: &'static str,
    pub driver_version: &'static str,
}

pub fn api_info() -> ApiInfo {
    ApiInfo {
        lib_version: LIB_VERSION,
        driver_version: DRIVER_NAME,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardInfo {
    pub hw_revision: &'static str,
    pub fw_version: &'static str,
    pub manufacturer: String,
    pub product: String,
    pub serial: String,
}

#[derive(Debug, Clone, Copy, Default)]
struct TuneState {
    /// Last frequency asked for through `set_frequency`.
    requested: Option<f64>,
    /// Frequency actually received.
    actual: f64,
    band: Option<Band>,
    swap_iq: bool,
}

/// Everything that exists only while the USB session is open.
struct Frontend {
    bus: RegisterBus,
    si5351c: Si5351c,
    max2830: Max2830,
    rffc507x: Rffc507x,
    /// GPO word last accepted by the device.
    gpo: DevGpo,
    user_gpo: u8,
    tune: TuneState,
    samplerate: f64,
    lpf_idx: u8,
    direct_sampling: bool,
    calibration: Calibration,
    converter: SampleConverter,
}

impl Frontend {
    fn power_on(transport: Box<dyn UsbTransport>) -> Self {
        let mut fe = Frontend {
            bus: RegisterBus::new(transport),
            si5351c: Si5351c::new(),
            max2830: Max2830::new(),
            rffc507x: Rffc507x::new(),
            gpo: DevGpo::empty(),
            user_gpo: 0,
            tune: TuneState::default(),
            samplerate: 0.0,
            lpf_idx: 0,
            direct_sampling: false,
            calibration: Calibration::new(),
            converter: SampleConverter::new(),
        };

        if let Err(e) = fe.push_gpo(DevGpo::power_on()) {
            tracing::warn!("Initial GPO write failed: {}", e);
        }
        fe.si5351c.init(&mut fe.bus);
        fe.max2830.init(&mut fe.bus);
        fe.rffc507x.init(&mut fe.bus);
        fe.rffc507x.set_lo_frequency(&mut fe.bus, POWER_ON_LO_MHZ);
        fe.max2830.set_frequency(&mut fe.bus, POWER_ON_MAX2830_HZ);
        fe.set_samplerate(DEFAULT_SAMPLE_RATE);
        fe
    }

    fn push_gpo(&mut self, gpo: DevGpo) -> Result<()> {
        self.bus.command(REQ_DEV_GPO, gpo.bits())?;
        self.gpo = gpo;
        Ok(())
    }

    /// Write the GPO word if it differs from what the device holds.
    fn write_gpo(&mut self, gpo: DevGpo) {
        if gpo != self.gpo {
            // logged and recorded by the bus
            let _ = self.push_gpo(gpo);
        }
    }

    fn set_clock(&mut self, output: ClockOutput, enabled: bool) {
        self.si5351c.set_clock_enabled(&mut self.bus, output, enabled);
    }

    fn set_rf_clocks(&mut self, enabled: bool) {
        self.set_clock(ClockOutput::Rffc507x, enabled);
        self.set_clock(ClockOutput::Max2830, enabled);
    }

    fn set_frequency(&mut self, hz: f64) -> Result<f64> {
        if self.tune.band.is_some()
            && (self.tune.requested == Some(hz) || self.tune.actual == hz)
        {
            return Ok(self.tune.actual);
        }

        let plan = tuning::plan(hz)?;
        let band_changed = self.tune.band != Some(plan.band);

        let mut gpo = self.gpo;
        plan.route(&mut gpo);
        self.write_gpo(gpo);

        if band_changed {
            match plan.band {
                Band::Bypass => {
                    self.rffc507x.set_enabled(&mut self.bus, false);
                    self.set_clock(ClockOutput::Rffc507x, false);
                }
                Band::LowPass | Band::HighPass => self.set_clock(ClockOutput::Rffc507x, true),
            }
        }

        let (max_hz, synth_hz) = match plan.synth_mhz {
            Some(lo_mhz) => {
                let synth_hz = self.rffc507x.set_lo_frequency(&mut self.bus, lo_mhz);
                let max_hz = self
                    .max2830
                    .set_frequency(&mut self.bus, plan.transceiver_hz(synth_hz));
                (max_hz, synth_hz)
            }
            None => {
                let max_hz = self
                    .max2830
                    .set_frequency(&mut self.bus, plan.transceiver_hz(0));
                (max_hz, 0)
            }
        };
        let actual = plan.rx_hz(max_hz, synth_hz);

        tracing::debug!(
            "Tuned {:.0} Hz on the {} path: LO {} Hz, MAX2830 {:.0} Hz, actual {:.0} Hz",
            hz,
            plan.band.name(),
            synth_hz,
            max_hz,
            actual
        );
        self.tune = TuneState {
            requested: Some(hz),
            actual,
            band: Some(plan.band),
            swap_iq: plan.swap_iq,
        };
        Ok(actual)
    }

    fn set_direct_sampling(&mut self, enabled: bool) {
        if enabled == self.direct_sampling {
            return;
        }
        let mut gpo = self.gpo;
        gpo.set_direct_sampling(enabled, self.lpf_idx.min(MAX_LPF_IDX));
        self.write_gpo(gpo);
        self.set_rf_clocks(!enabled);
        self.rffc507x.set_enabled(&mut self.bus, !enabled);
        self.direct_sampling = enabled;
        tracing::debug!("Direct sampling {}", if enabled { "on" } else { "off" });
    }

    fn set_samplerate(&mut self, hz: f64) -> f64 {
        let plan = samplerate::plan(hz);
        self.si5351c.set_adc_divider(&mut self.bus, plan.adc_divider);
        if !self.direct_sampling {
            let mut gpo = self.gpo;
            gpo.set_lpf(plan.lpf_idx);
            self.write_gpo(gpo);
        }
        self.lpf_idx = plan.lpf_idx;
        self.max2830.set_bandwidth(&mut self.bus, plan.bandwidth_idx);
        self.samplerate = plan.rate;
        tracing::debug!(
            "Sample rate {:.0} Hz (requested {:.0}), LPF {}, bandwidth {}",
            plan.rate,
            hz,
            plan.lpf_idx,
            plan.bandwidth_idx
        );
        plan.rate
    }

    fn set_lpf(&mut self, idx: i32) -> u8 {
        let idx = idx.clamp(0, i32::from(MAX_LPF_IDX)) as u8;
        if idx != self.lpf_idx && !self.direct_sampling {
            let mut gpo = self.gpo;
            gpo.set_lpf(idx);
            self.write_gpo(gpo);
        }
        self.lpf_idx = idx;
        idx
    }

    /// Point the receive path at the internal leakage tone.
    fn begin_calibration(&mut self) {
        self.calibration.arm();
        if self.direct_sampling {
            let mut gpo = self.gpo;
            gpo.set_lpf(self.lpf_idx);
            self.write_gpo(gpo);
            self.set_rf_clocks(true);
            self.rffc507x.set_enabled(&mut self.bus, true);
        }

        let mut gpo = self.gpo;
        gpo.set_lna_shutdown(false, false);
        gpo.select_if_filter(IfFilter::High);
        gpo.set_antenna_aux(false);
        self.write_gpo(gpo);

        self.max2830.set_frequency(&mut self.bus, CALIBRATION_MAX2830_HZ);
        self.rffc507x.set_enabled(&mut self.bus, false);
        self.set_clock(ClockOutput::Rffc507x, true);
        self.rffc507x.set_lo_frequency(&mut self.bus, CALIBRATION_LO_MHZ);
        tracing::debug!("Calibration started");
    }

    /// Hand the estimates to the converter and restore the user's tuning.
    fn finish_calibration(&mut self) {
        self.calibration.finish();
        let (scale_re, scale_im) = self.calibration.scale();
        let (dc_re, dc_im) = self.calibration.scaled_dc();
        self.converter.set_scale(scale_re, scale_im);
        self.converter.set_dc(dc_re, dc_im);
        tracing::debug!(
            "Calibration finished after {} buffers: scale=({:e}, {:e})",
            self.calibration.position(),
            scale_re,
            scale_im
        );

        let requested = self.tune.requested;
        self.tune = TuneState::default();
        match requested {
            Some(hz) => {
                if let Err(e) = self.set_frequency(hz) {
                    tracing::warn!("Could not restore tuning after calibration: {}", e);
                }
            }
            None => {
                let mut gpo = self.gpo;
                gpo.set_lna_shutdown(true, true);
                gpo.select_if_filter(IfFilter::None);
                self.write_gpo(gpo);
                self.rffc507x.set_lo_frequency(&mut self.bus, POWER_ON_LO_MHZ);
                self.max2830.set_frequency(&mut self.bus, POWER_ON_MAX2830_HZ);
            }
        }

        if self.direct_sampling {
            self.direct_sampling = false;
            self.set_direct_sampling(true);
        }
    }

    fn shutdown(&mut self) {
        let mut gpo = self.gpo;
        gpo.remove(DevGpo::LPF_A0 | DevGpo::LPF_A1);
        gpo.insert(DevGpo::NENBL_HF);
        self.write_gpo(gpo);
        self.rffc507x.set_enabled(&mut self.bus, false);
        self.set_rf_clocks(false);
        self.bus.transport_mut().release();
    }

    /// Submit a buffer, or park it in the pool when the stream is stopping.
    fn resubmit(
        &mut self,
        pool: &mut BufferPool,
        control: &StreamControl,
        stats: &mut StreamStats,
        geometry: &StreamGeometry,
        slot: usize,
        buffer: Vec<u8>,
    ) {
        if control.status() == AsyncStatus::Canceling {
            pool.put(slot, buffer);
            return;
        }
        if let Err(e) = self
            .bus
            .transport_mut()
            .submit_bulk(BULK_IN_ENDPOINT, slot, buffer)
        {
            tracing::warn!("Bulk transfer resubmit failed: {}", e.error);
            pool.put(e.slot, e.buffer);
            stats.transfer_errors += 1;
            if matches!(e.error, Error::Usb(rusb::Error::NoDevice))
                || stats.transfer_errors as usize >= geometry.buf_count
            {
                device_lost(control, stats);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_completion<F>(
        &mut self,
        completion: Completion,
        pool: &mut BufferPool,
        control: &StreamControl,
        stats: &mut StreamStats,
        geometry: &StreamGeometry,
        scratch: &mut Vec<Complex<f32>>,
        callback: &mut F,
    ) where
        F: FnMut(&[Complex<f32>]),
    {
        let Completion {
            slot,
            status,
            actual_length,
            buffer,
        } = completion;

        if control.status() == AsyncStatus::Canceling {
            pool.put(slot, buffer);
            return;
        }

        match status {
            TransferStatus::Completed => {
                if actual_length == geometry.transfer_size {
                    stats.buffers += 1;
                    let data = &buffer[..actual_length];
                    if self.calibration.state() == CalibrationState::Armed {
                        self.calibration.process(data);
                    } else {
                        self.converter.convert(
                            data,
                            scratch,
                            self.direct_sampling,
                            self.tune.swap_iq,
                        );
                        callback(scratch);
                        stats.delivered += 1;
                    }
                } else {
                    stats.short_transfers += 1;
                    tracing::trace!(
                        "Short bulk transfer: {} of {} bytes",
                        actual_length,
                        geometry.transfer_size
                    );
                }
                stats.transfer_errors = 0;
                self.resubmit(pool, control, stats, geometry, slot, buffer);
            }
            TransferStatus::Cancelled => pool.put(slot, buffer),
            TransferStatus::Error => {
                stats.transfer_errors += 1;
                tracing::warn!(
                    "Bulk transfer failed ({} in a row)",
                    stats.transfer_errors
                );
                if stats.transfer_errors as usize >= geometry.buf_count {
                    pool.put(slot, buffer);
                    device_lost(control, stats);
                } else {
                    self.resubmit(pool, control, stats, geometry, slot, buffer);
                }
            }
            TransferStatus::NoDevice => {
                pool.put(slot, buffer);
                device_lost(control, stats);
            }
        }
    }

    /// Event loop of one stream. Returns a fatal transport error, if any.
    fn run_stream<F>(
        &mut self,
        pool: &mut BufferPool,
        control: &StreamControl,
        stats: &mut StreamStats,
        geometry: &StreamGeometry,
        callback: &mut F,
    ) -> Option<Error>
    where
        F: FnMut(&[Complex<f32>]),
    {
        let mut scratch = Vec::with_capacity(geometry.buf_length);
        let mut fatal = None;
        let mut cancel_sent = false;
        let mut idle_polls = 0;

        loop {
            if self.calibration.is_complete() {
                self.finish_calibration();
            }
            if control.cancel_requested() {
                control.mark_canceling();
            }

            let canceling = control.status() == AsyncStatus::Canceling;
            if canceling {
                let transport = self.bus.transport_mut();
                if !cancel_sent {
                    tracing::debug!(
                        "Canceling {} in-flight transfers",
                        transport.pending_bulk()
                    );
                    transport.cancel_bulk();
                    cancel_sent = true;
                }
                if transport.pending_bulk() == 0 {
                    break;
                }
                if idle_polls >= DRAIN_IDLE_POLLS {
                    tracing::warn!(
                        "Giving up on {} transfers that did not return",
                        transport.pending_bulk()
                    );
                    break;
                }
            }

            let timeout = if canceling { DRAIN_TIMEOUT } else { EVENT_TIMEOUT };
            match self.bus.transport_mut().poll_bulk(timeout) {
                Ok(Some(completion)) => {
                    idle_polls = 0;
                    self.handle_completion(
                        completion,
                        pool,
                        control,
                        stats,
                        geometry,
                        &mut scratch,
                        callback,
                    );
                }
                Ok(None) => {
                    if canceling {
                        idle_polls += 1;
                    }
                }
                Err(e) => {
                    tracing::warn!("Event handling failed: {}", e);
                    fatal = Some(e);
                    if canceling {
                        break;
                    }
                    control.request_cancel();
                    control.mark_canceling();
                }
            }
        }
        fatal
    }
}

fn device_lost(control: &StreamControl, stats: &mut StreamStats) {
    if !stats.device_lost {
        tracing::warn!("Fobos SDR lost, stopping the stream");
    }
    stats.device_lost = true;
    control.request_cancel();
}

/// An open Fobos SDR.
pub struct Fobos {
    frontend: Option<Frontend>,
    control: Arc<StreamControl>,
    stats: StreamStats,
    pool: Option<BufferPool>,
    strings: DeviceStrings,
}

impl Fobos {
    /// Open the device at `index` and bring it to its power-on state.
    pub fn open(index: u32) -> Result<Self> {
        let transport = RusbTransport::open(index)?;
        Ok(Self::with_transport(Box::new(transport)))
    }

    /// Open the device behind an arbitrary transport.
    pub fn with_transport(transport: Box<dyn UsbTransport>) -> Self {
        let strings = transport.strings();
        let frontend = Frontend::power_on(transport);
        tracing::debug!("Fobos SDR {} ready", strings.serial);
        Fobos {
            frontend: Some(frontend),
            control: Arc::new(StreamControl::new()),
            stats: StreamStats::default(),
            pool: None,
            strings,
        }
    }

    fn front(&self) -> Result<&Frontend> {
        self.frontend.as_ref().ok_or(Error::NotOpen)
    }

    fn front_mut(&mut self) -> Result<&mut Frontend> {
        self.frontend.as_mut().ok_or(Error::NotOpen)
    }

    /// Stop any stream, park the analog path and release the interface.
    pub fn close(&mut self) -> Result<()> {
        let mut fe = self.frontend.take().ok_or(Error::NotOpen)?;
        self.control.request_cancel();
        if !self.control.wait_idle(Some(CLOSE_TIMEOUT)) {
            tracing::warn!("Stream did not stop before close");
        }
        fe.shutdown();
        tracing::debug!("Fobos SDR {} closed", self.strings.serial);
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.frontend.is_some()
    }

    pub fn board_info(&self) -> Result<BoardInfo> {
        self.front()?;
        Ok(BoardInfo {
            hw_revision: HW_REVISION,
            fw_version: FW_VERSION,
            manufacturer: self.strings.manufacturer.clone(),
            product: self.strings.product.clone(),
            serial: self.strings.serial.clone(),
        })
    }

    /// Tune to `hz`, returning the frequency actually received.
    ///
    /// Fails with [`Error::OutOfRange`] outside 40 MHz to 6.55 GHz and
    /// leaves the previous tuning untouched.
    pub fn set_frequency(&mut self, hz: f64) -> Result<f64> {
        self.front_mut()?.set_frequency(hz)
    }

    pub fn set_direct_sampling(&mut self, enabled: bool) -> Result<()> {
        self.front_mut()?.set_direct_sampling(enabled);
        Ok(())
    }

    /// Set the LNA gain code, clamped to 0..=3.
    pub fn set_lna_gain(&mut self, value: u8) -> Result<u8> {
        let fe = self.front_mut()?;
        Ok(fe.max2830.set_lna_gain(&mut fe.bus, value))
    }

    /// Set the VGA gain code, clamped to 0..=15.
    pub fn set_vga_gain(&mut self, value: u8) -> Result<u8> {
        let fe = self.front_mut()?;
        Ok(fe.max2830.set_vga_gain(&mut fe.bus, value))
    }

    /// Supported sample rates, highest first.
    pub fn samplerates(&self) -> Result<&'static [f64]> {
        self.front()?;
        Ok(&SAMPLE_RATES)
    }

    /// Select the supported rate nearest to `hz` and return it.
    pub fn set_samplerate(&mut self, hz: f64) -> Result<f64> {
        Ok(self.front_mut()?.set_samplerate(hz))
    }

    /// Override the low-pass filter bank chosen by the sample rate.
    pub fn set_lpf(&mut self, idx: i32) -> Result<u8> {
        Ok(self.front_mut()?.set_lpf(idx))
    }

    pub fn set_clk_source(&mut self, source: ClockSource) -> Result<()> {
        let fe = self.front_mut()?;
        let mut gpo = fe.gpo;
        gpo.set_external_clock(source == ClockSource::External);
        if gpo == fe.gpo {
            return Ok(());
        }
        fe.push_gpo(gpo)
    }

    /// Drive the user GPO lines.
    pub fn set_user_gpo(&mut self, value: u8) -> Result<()> {
        let fe = self.front_mut()?;
        fe.bus.command(REQ_USER_GPO, u16::from(value))?;
        fe.user_gpo = value;
        Ok(())
    }

    /// Program the transceiver PLL directly. The next `set_frequency`
    /// reprograms the whole path.
    pub fn set_max2830_frequency(&mut self, hz: f64) -> Result<f64> {
        if !hz.is_finite() || hz <= 0.0 {
            return Err(Error::OutOfRange(hz));
        }
        let fe = self.front_mut()?;
        fe.tune.band = None;
        Ok(fe.max2830.set_frequency(&mut fe.bus, hz))
    }

    /// Program the synthesizer LO directly, in MHz.
    pub fn set_rffc507x_lo_frequency(&mut self, lo_mhz: u32) -> Result<u64> {
        if lo_mhz == 0 || lo_mhz > LO_MAX_MHZ {
            return Err(Error::OutOfRange(f64::from(lo_mhz) * 1e6));
        }
        let fe = self.front_mut()?;
        fe.tune.band = None;
        Ok(fe.rffc507x.set_lo_frequency(&mut fe.bus, lo_mhz))
    }

    pub fn read_rffc507x_register(&mut self, addr: u8) -> Result<u16> {
        let fe = self.front_mut()?;
        fe.rffc507x.read_reg(&mut fe.bus, addr)
    }

    pub fn read_si5351c_register(&mut self, reg: u8) -> Result<u8> {
        let fe = self.front_mut()?;
        fe.si5351c.read_reg(&mut fe.bus, reg)
    }

    /// Raw serial-register exchange.
    pub fn spi_transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<()> {
        self.front_mut()?.bus.spi_transfer(tx, rx)
    }

    /// Drain the log of failed register-bus transfers.
    pub fn take_bus_faults(&mut self) -> Vec<BusFault> {
        self.frontend
            .as_mut()
            .map(|fe| fe.bus.take_faults())
            .unwrap_or_default()
    }

    /// Stream samples into `callback` until cancelled or the device is lost.
    ///
    /// `buf_count` transfers of `buf_length` complex samples are kept in
    /// flight (0 picks the defaults). The first buffers of every stream are
    /// used for I/Q calibration and are not delivered. Returns
    /// [`Error::DeviceLost`] when the stream ended because the device went
    /// away or kept failing, and [`Error::NotReady`] when a stream is already
    /// active (not reachable through `&mut self` alone).
    pub fn read_async<F>(&mut self, mut callback: F, buf_count: u32, buf_length: u32) -> Result<()>
    where
        F: FnMut(&[Complex<f32>]),
    {
        let control = Arc::clone(&self.control);
        let fe = self.frontend.as_mut().ok_or(Error::NotOpen)?;
        if !control.try_start() {
            return Err(Error::NotReady);
        }

        let geometry = StreamGeometry::new(buf_count, buf_length);
        let pool = match BufferPool::allocate(geometry.buf_count, geometry.transfer_size) {
            Ok(pool) => self.pool.insert(pool),
            Err(e) => {
                control.mark_idle();
                return Err(e);
            }
        };
        let mut stats = StreamStats::default();
        tracing::debug!(
            "Starting stream: {} buffers of {} samples",
            geometry.buf_count,
            geometry.buf_length
        );

        fe.begin_calibration();
        if let Err(e) = fe.bus.command(REQ_STREAM, 1) {
            tracing::warn!("Stream start command failed: {}", e);
        }
        let mut gpo = fe.gpo;
        gpo.remove(DevGpo::ADC_SDI);
        fe.write_gpo(gpo);

        for slot in 0..geometry.buf_count {
            let Some(buffer) = pool.take(slot) else {
                continue;
            };
            if let Err(e) = fe
                .bus
                .transport_mut()
                .submit_bulk(BULK_IN_ENDPOINT, slot, buffer)
            {
                tracing::warn!("Failed to submit bulk transfer {}: {}", slot, e.error);
                pool.put(e.slot, e.buffer);
                if matches!(e.error, Error::Usb(rusb::Error::NoDevice)) {
                    stats.device_lost = true;
                }
                control.request_cancel();
                break;
            }
        }

        control.mark_running();
        let fatal = fe.run_stream(pool, &control, &mut stats, &geometry, &mut callback);

        if let Err(e) = fe.bus.command(REQ_STREAM, 0) {
            tracing::debug!("Stream stop command failed: {}", e);
        }
        self.pool = None;
        let mut gpo = fe.gpo;
        gpo.insert(DevGpo::ADC_SDI);
        fe.write_gpo(gpo);
        if fe.calibration.state() == CalibrationState::Armed {
            // stopped before calibration completed
            fe.finish_calibration();
        }

        tracing::debug!(
            "Stream stopped: {} buffers, {} delivered, {} short",
            stats.buffers,
            stats.delivered,
            stats.short_transfers
        );
        self.stats = stats;
        control.mark_idle();

        match fatal {
            Some(e) => Err(e),
            None if stats.device_lost => Err(Error::DeviceLost),
            None => Ok(()),
        }
    }

    /// Handle that can stop a stream from another thread or the callback.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle::new(&self.control)
    }

    /// Request the stream to stop. Only useful from a thread that does not
    /// own the device; see [`Fobos::cancel_handle`].
    pub fn cancel_async(&self) -> Result<()> {
        self.front()?;
        self.control.request_cancel();
        Ok(())
    }

    pub fn status(&self) -> AsyncStatus {
        self.control.status()
    }

    /// Counters of the last stream.
    pub fn stream_stats(&self) -> StreamStats {
        self.stats
    }

    /// Transfer buffers currently allocated; zero outside a stream.
    pub fn allocated_buffers(&self) -> usize {
        self.pool.as_ref().map_or(0, BufferPool::len)
    }

    /// Frequency actually received, 0 before the first tuning.
    pub fn frequency(&self) -> Result<f64> {
        Ok(self.front()?.tune.actual)
    }

    pub fn band(&self) -> Result<Option<Band>> {
        Ok(self.front()?.tune.band)
    }

    /// Whether the current RF path inverts the spectrum.
    pub fn swap_iq(&self) -> Result<bool> {
        Ok(self.front()?.tune.swap_iq)
    }

    pub fn samplerate(&self) -> Result<f64> {
        Ok(self.front()?.samplerate)
    }

    pub fn lpf(&self) -> Result<u8> {
        Ok(self.front()?.lpf_idx)
    }

    pub fn lna_gain(&self) -> Result<u8> {
        Ok(self.front()?.max2830.lna_gain())
    }

    pub fn vga_gain(&self) -> Result<u8> {
        Ok(self.front()?.max2830.vga_gain())
    }

    pub fn bandwidth_idx(&self) -> Result<u8> {
        Ok(self.front()?.max2830.bandwidth_idx())
    }

    pub fn direct_sampling(&self) -> Result<bool> {
        Ok(self.front()?.direct_sampling)
    }

    pub fn clk_source(&self) -> Result<ClockSource> {
        Ok(if self.front()?.gpo.contains(DevGpo::CLKSEL) {
            ClockSource::Internal
        } else {
            ClockSource::External
        })
    }

    pub fn user_gpo(&self) -> Result<u8> {
        Ok(self.front()?.user_gpo)
    }

    /// GPO word as last accepted by the device.
    pub fn dev_gpo(&self) -> Result<DevGpo> {
        Ok(self.front()?.gpo)
    }

    pub fn calibration_state(&self) -> Result<CalibrationState> {
        Ok(self.front()?.calibration.state())
    }

    /// Per-channel scale applied to raw samples.
    pub fn iq_scale(&self) -> Result<(f32, f32)> {
        Ok(self.front()?.converter.scale())
    }

    /// Running DC estimate of the converter.
    pub fn dc_offset(&self) -> Result<(f32, f32)> {
        Ok(self.front()?.converter.dc())
    }
}

impl Drop for Fobos {
    fn drop(&mut self) {
        if self.frontend.is_some() {
            let _ = self.close();
        }
    }
}

impl std::fmt::Debug for Fobos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fobos")
            .field("serial", &self.strings.serial)
            .field("open", &self.frontend.is_some())
            .field("status", &self.control.status())
            .finish()
    }
}
