//! ATmega32U4 backends: the USB controller register surface and the
//! bootloader call thunks.
//!
//! Compiled only for AVR targets with the `atmega32u4` feature. Host
//! builds drive the same engines through `mock` instead.

mod dfu;
mod usb;

pub use dfu::AvrDfu;
pub use usb::AvrUsb;

#[inline(always)]
fn read8(addr: usize) -> u8 {
    unsafe { core::ptr::read_volatile(addr as *const u8) }
}

#[inline(always)]
fn write8(addr: usize, value: u8) {
    unsafe { core::ptr::write_volatile(addr as *mut u8, value) }
}
