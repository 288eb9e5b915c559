#![doc = include_str!("../readme.md")]

pub mod bus;
pub mod calibration;
pub mod chips;
pub mod config;
pub mod convert;
pub mod device;
pub mod error;
pub mod gpo;
pub mod reader;
pub mod samplerate;
pub mod sim;
pub mod stream;
pub mod transport;
pub mod tuning;

pub use calibration::CalibrationState;
pub use config::FobosConfig;
pub use device::{ApiInfo, BoardInfo, ClockSource, Fobos, api_info};
pub use error::{Error, ErrorCode, Result, error_name};
pub use gpo::DevGpo;
pub use reader::{AsyncFobosReader, FobosReader};
pub use samplerate::SAMPLE_RATES;
pub use stream::{AsyncStatus, CancelHandle, StreamStats};
pub use transport::{UsbTransport, device_count, list_devices};
pub use tuning::Band;

// Fobos SDR USB identifiers
pub const FOBOS_VID: u16 = 0x16d0;
pub const FOBOS_PID: u16 = 0x132e;

pub const LIB_VERSION: &str = env!("CARGO_PKG_VERSION");
/// USB backend the driver is built on.
pub const DRIVER_NAME: &str = "rusb";
pub const HW_REVISION: &str = "2.0.1";
pub const FW_VERSION: &str = "1.1.0";
