//! Error types for Fobos SDR operations.

use thiserror::Error;

/// Result type for Fobos operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Stable integer codes for every error, for hosts that report failures as
/// plain result codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    /// Operation successful.
    Ok = 0,
    /// The handle does not refer to a live device.
    InvalidHandle = -1,
    /// The device has no open USB session.
    NotOpen = -2,
    /// Frequency outside every supported band.
    OutOfRange = -3,
    /// No device at the requested index.
    DeviceNotFound = -4,
    /// The device is not in the state the operation requires.
    NotReady = -5,
    /// A USB transfer moved the wrong number of bytes.
    TransferSizeMismatch = -6,
    /// Persistent USB failure or unplug.
    DeviceLost = -7,
    /// Buffer allocation failed.
    AllocationFailure = -12,
    /// Error reported by libusb.
    Usb = -1000,
}

impl ErrorCode {
    /// Every known code, in declaration order.
    pub const ALL: [ErrorCode; 10] = [
        ErrorCode::Ok,
        ErrorCode::InvalidHandle,
        ErrorCode::NotOpen,
        ErrorCode::OutOfRange,
        ErrorCode::DeviceNotFound,
        ErrorCode::NotReady,
        ErrorCode::TransferSizeMismatch,
        ErrorCode::DeviceLost,
        ErrorCode::AllocationFailure,
        ErrorCode::Usb,
    ];

    /// Look up the code for a raw integer value.
    pub fn from_raw(code: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| *c as i32 == code)
    }

    /// Human-readable description of the code.
    pub fn description(self) -> &'static str {
        match self {
            ErrorCode::Ok => "Ok",
            ErrorCode::InvalidHandle => "No device specified, the handle is no longer valid",
            ErrorCode::NotOpen => "Device is not open, please open it first",
            ErrorCode::OutOfRange => "Frequency is out of the supported range",
            ErrorCode::DeviceNotFound => "No Fobos SDR device found at this index",
            ErrorCode::NotReady => "Device is not ready for reading",
            ErrorCode::TransferSizeMismatch => "USB transfer size mismatch",
            ErrorCode::DeviceLost => "Device lost, check the USB connection",
            ErrorCode::AllocationFailure => "Could not allocate transfer buffers",
            ErrorCode::Usb => "USB error",
        }
    }
}

/// Map a raw error code to a human-readable string.
pub fn error_name(code: i32) -> &'static str {
    ErrorCode::from_raw(code)
        .map(ErrorCode::description)
        .unwrap_or("Unknown error")
}

/// Errors that can occur during Fobos operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The handle refers to a device that no longer exists.
    #[error("Invalid device handle")]
    InvalidHandle,

    /// The device was closed, no USB session is active.
    #[error("Device is not open")]
    NotOpen,

    /// A USB transfer moved the wrong byte count.
    #[error("Transfer size mismatch: expected {expected} bytes, got {actual}")]
    TransferSizeMismatch { expected: usize, actual: usize },

    /// The operation requires a state the device is not in.
    #[error("Device is not ready")]
    NotReady,

    /// Frequency outside any supported band.
    #[error("Frequency {0} Hz is out of range")]
    OutOfRange(f64),

    /// Buffer allocation failed.
    #[error("Buffer allocation failed")]
    AllocationFailure,

    /// Persistent USB failure or unplug detected while streaming.
    #[error("Device lost")]
    DeviceLost,

    /// No device at the requested index.
    #[error("No Fobos SDR device found at index {0}")]
    DeviceNotFound(u32),

    /// USB operation failed.
    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),
}

impl Error {
    /// The stable integer code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::InvalidHandle => ErrorCode::InvalidHandle,
            Error::NotOpen => ErrorCode::NotOpen,
            Error::TransferSizeMismatch { .. } => ErrorCode::TransferSizeMismatch,
            Error::NotReady => ErrorCode::NotReady,
            Error::OutOfRange(_) => ErrorCode::OutOfRange,
            Error::AllocationFailure => ErrorCode::AllocationFailure,
            Error::DeviceLost => ErrorCode::DeviceLost,
            Error::DeviceNotFound(_) => ErrorCode::DeviceNotFound,
            Error::Usb(_) => ErrorCode::Usb,
        }
    }
}
