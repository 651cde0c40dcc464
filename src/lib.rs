//! USB HID keyboard firmware core for the ATmega32U4.
//!
//! Everything that can run on the host lives here: the USB device and
//! control-transfer engines over a register trait, the raw-HID packet
//! protocol with its flashing session, and the bootloader bridge.
//! `cargo test` exercises all of it through the doubles in [`mock`].
//!
//! The firmware binary (`src/main.rs`, behind the `atmega32u4` feature)
//! plugs the real register backends from `hw` into the same engines and
//! adds the interrupt vectors and the matrix scanner.

#![cfg_attr(not(test), no_std)]
#![cfg_attr(target_arch = "avr", feature(asm_experimental_arch))]

pub mod boot;
pub mod config;
pub mod error;
pub mod hid;
#[cfg(all(feature = "atmega32u4", target_arch = "avr"))]
pub mod hw;
pub mod mock;
pub mod rawhid;
pub mod usb;

pub use error::Error;
