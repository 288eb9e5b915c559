//! USB transport layer for Fobos SDR devices.
//!
//! The driver talks to the board through two kinds of USB traffic: vendor
//! control requests that program the RF chips and the GPO lines, and bulk IN
//! transfers on endpoint 0x81 that carry ADC samples. [`UsbTransport`] is the
//! seam between the driver and the USB stack; [`RusbTransport`] implements it
//! on top of `rusb` and `rusb_async`, and [`crate::sim::SimulatedTransport`] implements it in
//! memory for tests.

use crate::error::{Error, Result};
use crate::{FOBOS_PID, FOBOS_VID};
use rusb::{Context, Device, DeviceHandle, Direction, Recipient, RequestType, UsbContext};
use rusb_async::TransferPool;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// Timeout for USB control transfers.
pub const CTRL_TIMEOUT: Duration = Duration::from_millis(300);

/// Bulk IN endpoint carrying the I/Q stream.
pub const BULK_IN_ENDPOINT: u8 = 0x81;

/// Longest an empty poll sleeps before returning.
const IDLE_POLL: Duration = Duration::from_millis(10);

/// Placeholder serial reported for devices that cannot be opened.
pub const UNKNOWN_SERIAL: &str = "XXXXXXXXXXXX";

/// Outcome of one bulk transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// Transfer finished, `actual_length` bytes are valid.
    Completed,
    /// Transfer was cancelled before completion.
    Cancelled,
    /// Transfer failed (stall, overflow, I/O error).
    Error,
    /// The device disappeared.
    NoDevice,
}

/// A finished bulk transfer, handing its buffer back to the owner.
#[derive(Debug)]
pub struct Completion {
    /// Buffer-pool slot the transfer was submitted from.
    pub slot: usize,
    pub status: TransferStatus,
    pub actual_length: usize,
    pub buffer: Vec<u8>,
}

/// Returned when a bulk transfer could not be submitted; the buffer is
/// handed back so the pool keeps ownership of it.
#[derive(Debug)]
pub struct SubmitError {
    pub error: Error,
    pub slot: usize,
    pub buffer: Vec<u8>,
}

/// String descriptors read when the device is opened.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceStrings {
    pub manufacturer: String,
    pub product: String,
    pub serial: String,
}

/// USB access used by the driver.
///
/// Control requests are always of the vendor type and addressed to the
/// device. Bulk transfers own their buffer while in flight and return it
/// through [`Completion`]; `poll_bulk` waits at most `timeout` and returns
/// at most one completion.
pub trait UsbTransport: Send {
    /// Vendor control OUT transfer, returns the number of bytes sent.
    fn control_out(&mut self, request: u8, value: u16, index: u16, data: &[u8]) -> Result<usize>;

    /// Vendor control IN transfer, returns the number of bytes received.
    fn control_in(&mut self, request: u8, value: u16, index: u16, buf: &mut [u8])
    -> Result<usize>;

    /// Queue a bulk IN transfer filling `buffer`.
    fn submit_bulk(
        &mut self,
        endpoint: u8,
        slot: usize,
        buffer: Vec<u8>,
    ) -> std::result::Result<(), SubmitError>;

    /// Wait up to `timeout` for the next finished transfer.
    fn poll_bulk(&mut self, timeout: Duration) -> Result<Option<Completion>>;

    /// Request cancellation of every outstanding transfer. Cancelled
    /// transfers are still reported through `poll_bulk`.
    fn cancel_bulk(&mut self);

    /// Number of transfers submitted and not yet returned.
    fn pending_bulk(&self) -> usize;

    /// String descriptors of the opened device.
    fn strings(&self) -> DeviceStrings;

    /// Release the claimed interface. Further traffic is undefined.
    fn release(&mut self) {}
}

/// Bookkeeping of submitted bulk transfers, in submission order.
///
/// `rusb_async` completes transfers first-in first-out and keeps the buffer
/// of a transfer that did not complete, so each entry remembers its pool
/// slot and buffer size to hand a replacement back to the pool.
#[derive(Debug, Default)]
pub struct InFlight {
    entries: VecDeque<(usize, usize)>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, slot: usize, size: usize) {
        self.entries.push_back((slot, size));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Turn the outcome of the oldest transfer into a completion.
    /// Timeouts and an empty pool leave the queue as it is.
    pub fn complete(
        &mut self,
        outcome: std::result::Result<Vec<u8>, rusb_async::Error>,
    ) -> Option<Completion> {
        let status = match &outcome {
            Ok(_) => TransferStatus::Completed,
            Err(rusb_async::Error::PollTimeout | rusb_async::Error::NoTransfersPending) => {
                return None;
            }
            Err(rusb_async::Error::Cancelled) => TransferStatus::Cancelled,
            Err(rusb_async::Error::Disconnected) => TransferStatus::NoDevice,
            Err(e) => {
                tracing::debug!("Bulk transfer failed: {}", e);
                TransferStatus::Error
            }
        };
        let (slot, size) = self.entries.pop_front()?;

        let (actual_length, buffer) = match outcome {
            Ok(mut data) => {
                let n = data.len();
                data.resize(size, 0);
                (n, data)
            }
            Err(_) => (0, vec![0; size]),
        };
        Some(Completion {
            slot,
            status,
            actual_length,
            buffer,
        })
    }
}

fn submit_error(error: &rusb_async::Error) -> Error {
    match error {
        rusb_async::Error::Disconnected => Error::Usb(rusb::Error::NoDevice),
        rusb_async::Error::Stall => Error::Usb(rusb::Error::Pipe),
        rusb_async::Error::Overflow => Error::Usb(rusb::Error::Overflow),
        _ => Error::Usb(rusb::Error::Io),
    }
}

/// `rusb`-backed transport.
///
/// Bulk transfers go through a `rusb_async::TransferPool`: every submitted
/// buffer is a libusb transfer in flight with no timeout, and `poll_bulk`
/// drives libusb events until the oldest one finishes or the poll times out.
pub struct RusbTransport {
    handle: Arc<DeviceHandle<Context>>,
    strings: DeviceStrings,
    pool: Option<TransferPool<Context>>,
    in_flight: InFlight,
    released: bool,
}

impl RusbTransport {
    /// Open the Fobos device at `index` (in enumeration order).
    pub fn open(index: u32) -> Result<Self> {
        let context = Context::new()?;
        let devices = context.devices()?;

        let mut count = 0;
        for device in devices.iter() {
            let desc = device.device_descriptor()?;
            if desc.vendor_id() == FOBOS_VID && desc.product_id() == FOBOS_PID {
                if count == index {
                    return Self::open_device(&device);
                }
                count += 1;
            }
        }

        Err(Error::DeviceNotFound(index))
    }

    /// Open a device handle and claim interface 0.
    fn open_device(device: &Device<Context>) -> Result<Self> {
        let desc = device.device_descriptor()?;
        let mut handle = match device.open() {
            Ok(handle) => handle,
            Err(rusb::Error::Access) => {
                tracing::warn!(
                    "Permission denied opening Fobos SDR, install the fobos-sdr udev rules"
                );
                return Err(Error::Usb(rusb::Error::Access));
            }
            Err(e) => return Err(e.into()),
        };

        let read = |index: Option<u8>| {
            index
                .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok())
                .unwrap_or_default()
        };
        let strings = DeviceStrings {
            manufacturer: read(desc.manufacturer_string_index()),
            product: read(desc.product_string_index()),
            serial: read(desc.serial_number_string_index()),
        };

        #[cfg(target_os = "linux")]
        {
            if handle.kernel_driver_active(0).unwrap_or(false) {
                tracing::debug!("Detaching kernel driver from interface 0");
                if let Err(e) = handle.detach_kernel_driver(0) {
                    tracing::warn!("Failed to detach kernel driver: {}", e);
                }
            }
        }

        handle.claim_interface(0)?;
        tracing::debug!(
            "Opened {} {} (serial {})",
            strings.manufacturer,
            strings.product,
            strings.serial
        );

        let handle = Arc::new(handle);
        let pool = TransferPool::new(handle.clone()).map_err(|e| submit_error(&e))?;
        Ok(RusbTransport {
            handle,
            strings,
            pool: Some(pool),
            in_flight: InFlight::new(),
            released: false,
        })
    }
}

impl UsbTransport for RusbTransport {
    fn control_out(&mut self, request: u8, value: u16, index: u16, data: &[u8]) -> Result<usize> {
        let request_type = rusb::request_type(Direction::Out, RequestType::Vendor, Recipient::Device);
        self.handle
            .write_control(request_type, request, value, index, data, CTRL_TIMEOUT)
            .map_err(|e| {
                tracing::debug!(
                    "Control OUT transfer failed: req=0x{:02X}, val={}, idx={}, error={}",
                    request,
                    value,
                    index,
                    e
                );
                Error::Usb(e)
            })
    }

    fn control_in(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
    ) -> Result<usize> {
        let request_type = rusb::request_type(Direction::In, RequestType::Vendor, Recipient::Device);
        self.handle
            .read_control(request_type, request, value, index, buf, CTRL_TIMEOUT)
            .map_err(|e| {
                tracing::debug!(
                    "Control IN transfer failed: req=0x{:02X}, val={}, idx={}, error={}",
                    request,
                    value,
                    index,
                    e
                );
                Error::Usb(e)
            })
    }

    fn submit_bulk(
        &mut self,
        endpoint: u8,
        slot: usize,
        buffer: Vec<u8>,
    ) -> std::result::Result<(), SubmitError> {
        let Some(pool) = self.pool.as_mut() else {
            return Err(SubmitError {
                error: Error::NotOpen,
                slot,
                buffer,
            });
        };
        // the transfer length is the buffer's capacity
        let size = buffer.len();
        match pool.submit_bulk(endpoint, buffer) {
            Ok(()) => {
                self.in_flight.push(slot, size);
                Ok(())
            }
            Err(e) => Err(SubmitError {
                error: submit_error(&e),
                slot,
                buffer: vec![0; size],
            }),
        }
    }

    fn poll_bulk(&mut self, timeout: Duration) -> Result<Option<Completion>> {
        let Some(pool) = self.pool.as_mut() else {
            return Err(Error::NotOpen);
        };
        if self.in_flight.is_empty() {
            std::thread::sleep(timeout.min(IDLE_POLL));
            return Ok(None);
        }
        Ok(self.in_flight.complete(pool.poll(timeout)))
    }

    fn cancel_bulk(&mut self) {
        if let Some(pool) = self.pool.as_mut() {
            pool.cancel_all();
        }
    }

    fn pending_bulk(&self) -> usize {
        self.in_flight.len()
    }

    fn strings(&self) -> DeviceStrings {
        self.strings.clone()
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        // dropping the pool cancels and reaps whatever is still in flight
        self.pool = None;
        self.in_flight = InFlight::new();
        match Arc::get_mut(&mut self.handle) {
            Some(handle) => {
                if let Err(e) = handle.release_interface(0) {
                    tracing::debug!("Failed to release USB interface: {}", e);
                }
            }
            None => tracing::debug!("USB handle still shared, interface released on close"),
        }
    }
}

impl Drop for RusbTransport {
    fn drop(&mut self) {
        // The interface must be released before the handle closes, or the
        // device stays busy until it is replugged.
        self.release();
        tracing::debug!("Fobos USB handle closed");
    }
}

/// Number of connected Fobos devices.
pub fn device_count() -> Result<usize> {
    let context = Context::new()?;
    let devices = context.devices()?;
    let mut count = 0;
    for device in devices.iter() {
        let desc = device.device_descriptor()?;
        if desc.vendor_id() == FOBOS_VID && desc.product_id() == FOBOS_PID {
            count += 1;
        }
    }
    Ok(count)
}

/// Serial numbers of all connected Fobos devices, in enumeration order.
///
/// Devices that cannot be opened (permissions, busy) are listed with a
/// placeholder serial so that indices stay aligned with [`RusbTransport::open`].
pub fn list_devices() -> Result<Vec<String>> {
    let context = Context::new()?;
    let devices = context.devices()?;
    let mut result = Vec::new();

    for device in devices.iter() {
        let desc = device.device_descriptor()?;
        if desc.vendor_id() != FOBOS_VID || desc.product_id() != FOBOS_PID {
            continue;
        }
        let serial = device
            .open()
            .ok()
            .and_then(|handle| {
                desc.serial_number_string_index()
                    .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok())
            })
            .unwrap_or_else(|| UNKNOWN_SERIAL.to_string());
        result.push(serial);
    }

    Ok(result)
}
