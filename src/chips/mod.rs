//! Drivers for the three RF chips of the Fobos front end.
//!
//! Each driver translates settings into register writes on the
//! [`RegisterBus`](crate::bus::RegisterBus) it is handed; none of them own
//! the bus.

pub mod max2830;
pub mod rffc507x;
pub mod si5351c;

pub use max2830::Max2830;
pub use rffc507x::Rffc507x;
pub use si5351c::{ClockOutput, Si5351c};

/// Replace bits `to..=from` (high to low, inclusive) of `reg` with `value`.
pub fn register_modify(reg: u16, to: u8, from: u8, value: u32) -> u16 {
    let width = u32::from(to - from) + 1;
    let mask = if width >= 32 {
        u32::MAX
    } else {
        !(u32::MAX << width)
    } << from;
    let updated = (u32::from(reg) & !mask) | ((value << from) & mask);
    updated as u16
}
