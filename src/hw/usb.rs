//! Volatile register layer over the on-chip USB device controller.
//!
//! One trait method per register operation; no state lives here. The
//! engines own all sequencing, so every method is a plain read or write
//! at a fixed data-space address.

use super::{read8, write8};
use crate::error::Error;
use crate::usb::bus::{DeviceEvents, EndpointConfig, EndpointEvents, EndpointKind, UsbController};

// Register addresses (data space).
const PLLCSR: usize = 0x49;
const UHWCON: usize = 0xD7;
const USBCON: usize = 0xD8;
const UDCON: usize = 0xE0;
const UDINT: usize = 0xE1;
const UDIEN: usize = 0xE2;
const UDADDR: usize = 0xE3;
const UEINTX: usize = 0xE8;
const UENUM: usize = 0xE9;
const UERST: usize = 0xEA;
const UECONX: usize = 0xEB;
const UECFG0X: usize = 0xEC;
const UECFG1X: usize = 0xED;
const UESTA0X: usize = 0xEE;
const UEIENX: usize = 0xF0;
const UEDATX: usize = 0xF1;

// UHWCON
const UVREGE: u8 = 1 << 0;
// USBCON
const USBE: u8 = 1 << 7;
const FRZCLK: u8 = 1 << 5;
const OTGPADE: u8 = 1 << 4;
// PLLCSR
const PINDIV: u8 = 1 << 4;
const PLLE: u8 = 1 << 1;
const PLOCK: u8 = 1 << 0;
// UDCON
const DETACH: u8 = 1 << 0;
// UDIEN / UDINT
const EORSTE: u8 = 1 << 3;
const SOFE: u8 = 1 << 2;
const EORSTI: u8 = 1 << 3;
const SOFI: u8 = 1 << 2;
// UDADDR
const ADDEN: u8 = 1 << 7;
// UEINTX
const TXINI: u8 = 1 << 0;
const RXOUTI: u8 = 1 << 2;
const RXSTPI: u8 = 1 << 3;
const FIFOCON: u8 = 1 << 7;
// UECONX
const EPEN: u8 = 1 << 0;
const RSTDT: u8 = 1 << 3;
const STALLRQC: u8 = 1 << 4;
const STALLRQ: u8 = 1 << 5;
// UECFG1X
const ALLOC: u8 = 1 << 1;
// UESTA0X
const CFGOK: u8 = 1 << 7;

/// UECFG0X value: transfer type in bits 7:6, direction in bit 0.
const fn cfg0(kind: EndpointKind) -> u8 {
    match kind {
        EndpointKind::Control => 0,
        EndpointKind::BulkOut => 0b10 << 6,
        EndpointKind::BulkIn => (0b10 << 6) | 1,
        EndpointKind::InterruptOut => 0b11 << 6,
        EndpointKind::InterruptIn => (0b11 << 6) | 1,
    }
}

/// UECFG1X value: FIFO size in bits 6:4 (8 << n bytes), bank count in
/// bits 3:2, ALLOC to claim the memory.
const fn cfg1(size: u8, double_bank: bool) -> u8 {
    let size_bits = match size {
        8 => 0,
        16 => 1,
        32 => 2,
        _ => 3,
    };
    let bank_bits = if double_bank { 0b01 } else { 0b00 };
    (size_bits << 4) | (bank_bits << 2) | ALLOC
}

/// The on-chip USB device controller.
///
/// Zero-sized; exclusion between the interrupt engines and foreground
/// users comes from interrupt masking at the call sites, not from this
/// type.
pub struct AvrUsb;

impl UsbController for AvrUsb {
    fn set_pads_regulator(&mut self, on: bool) {
        write8(UHWCON, if on { UVREGE } else { 0 });
    }

    fn configure_pll(&mut self) {
        // 16 MHz crystal: halve the input, default 48 MHz USB tap.
        write8(PLLCSR, PINDIV | PLLE);
    }

    fn pll_locked(&self) -> bool {
        read8(PLLCSR) & PLOCK != 0
    }

    fn enable_controller(&mut self) {
        // Enable with the clock frozen, then unfreeze and power the pads.
        write8(USBCON, USBE | FRZCLK);
        write8(USBCON, USBE | OTGPADE);
    }

    fn disable_controller(&mut self) {
        write8(USBCON, FRZCLK);
    }

    fn attach(&mut self) {
        write8(UDCON, 0);
    }

    fn detach(&mut self) {
        write8(UDCON, DETACH);
    }

    fn enable_device_interrupts(&mut self) {
        write8(UDIEN, EORSTE | SOFE);
    }

    fn disable_device_interrupts(&mut self) {
        write8(UDIEN, 0);
    }

    fn take_device_events(&mut self) -> DeviceEvents {
        let pending = read8(UDINT);
        write8(UDINT, 0);
        DeviceEvents {
            end_of_reset: pending & EORSTI != 0,
            start_of_frame: pending & SOFI != 0,
        }
    }

    fn enable_interrupts(&mut self) {
        unsafe { avr_device::interrupt::enable() };
    }

    fn disable_interrupts(&mut self) {
        avr_device::interrupt::disable();
    }

    fn selected_endpoint(&self) -> u8 {
        read8(UENUM) & 0x07
    }

    fn select_endpoint(&mut self, endpoint: u8) {
        write8(UENUM, endpoint & 0x07);
    }

    fn apply_endpoint_config(&mut self, config: &EndpointConfig) -> Result<(), Error> {
        self.select_endpoint(config.number);
        write8(UECONX, EPEN);
        write8(UECFG0X, cfg0(config.kind));
        write8(UECFG1X, cfg1(config.size, config.double_bank));
        if read8(UESTA0X) & CFGOK == 0 {
            return Err(Error::EndpointConfig);
        }
        write8(UEIENX, config.interrupts);
        Ok(())
    }

    fn reset_fifo(&mut self, endpoint: u8) {
        write8(UERST, 1 << endpoint);
        write8(UERST, 0);
    }

    fn endpoint_events(&self) -> EndpointEvents {
        EndpointEvents::new(read8(UEINTX))
    }

    fn setup_received(&self) -> bool {
        read8(UEINTX) & RXSTPI != 0
    }

    fn ack_setup(&mut self) {
        // Event bits clear on writing zero; ones leave the rest alone.
        write8(UEINTX, !RXSTPI);
    }

    fn stall(&mut self) {
        write8(UECONX, STALLRQ | EPEN);
    }

    fn unstall(&mut self) {
        write8(UECONX, STALLRQC | RSTDT | EPEN);
    }

    fn is_stalled(&self) -> bool {
        read8(UECONX) & STALLRQ != 0
    }

    fn set_address(&mut self, address: u8) {
        write8(UDADDR, address & 0x7F);
    }

    fn enable_address(&mut self) {
        write8(UDADDR, read8(UDADDR) | ADDEN);
    }

    fn in_ready(&self) -> bool {
        read8(UEINTX) & TXINI != 0
    }

    fn out_ready(&self) -> bool {
        read8(UEINTX) & RXOUTI != 0
    }

    fn release_in(&mut self) {
        write8(UEINTX, !(TXINI | FIFOCON));
    }

    fn release_out(&mut self) {
        write8(UEINTX, !(RXOUTI | FIFOCON));
    }

    fn read_byte(&mut self) -> u8 {
        read8(UEDATX)
    }

    fn write_byte(&mut self, byte: u8) {
        write8(UEDATX, byte);
    }
}
