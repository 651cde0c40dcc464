//! Raw-HID message protocol.
//!
//! The host drives the firmware over a vendor-usage HID interface in
//! fixed 32-byte packets. Single packets carry pings and protocol
//! control; longer payloads are split into a start packet and
//! continuation packets and reassembled by [`engine::Engine`] into a
//! checksummed message, which the main loop then executes.
//!
//! Packet layout: one header byte, then up to [`RAWHID_PAYLOAD_SIZE`]
//! payload bytes. Message layout, spread over packet payloads:
//!
//! ```text
//! [kind u8] [total_len u16 LE] [payload ...] [crc16 u16 LE]
//! ```
//!
//! `total_len` counts the whole message including header and checksum;
//! the checksum covers the payload only.

pub mod engine;

pub use engine::{run_message, Engine, Message, Outcome};

use crate::config::{PAGE_SIZE, RAWHID_PACKET_SIZE};
use crate::error::Error;
use crate::usb::bus::{EndpointGuard, UsbController};

/// Packet headers.
pub const PACKET_PING: u8 = 0x00;
pub const PACKET_PONG: u8 = 0x01;
pub const PACKET_MSG_START: u8 = 0x02;
pub const PACKET_MSG_CONT: u8 = 0x03;
pub const PACKET_RESET_PROTO: u8 = 0x04;
pub const PACKET_STATUS: u8 = 0x05;

/// Message kinds, the first byte of a reassembled message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum MessageKind {
    /// Reboot into the DFU bootloader.
    Dfu = 0x00,
    /// Write one flash page: `[address u32 LE][page bytes]`.
    WritePage = 0x01,
    /// Activate a keyboard layout named in the payload.
    ActivateLayout = 0x02,
    /// Fall back to the default layout.
    DeactivateLayout = 0x03,
}

impl MessageKind {
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0x00 => Self::Dfu,
            0x01 => Self::WritePage,
            0x02 => Self::ActivateLayout,
            0x03 => Self::DeactivateLayout,
            _ => return None,
        })
    }
}

/// Session status codes as carried in STATUS packets. The numbering is
/// part of the wire protocol; 5 is unassigned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum SessionStatus {
    /// No message in flight.
    Idle = 0,
    /// A continuation arrived with no message being received.
    UnexpectedCont = 1,
    /// The reassembled message failed its checksum.
    CrcError = 2,
    /// Mid-reassembly, more packets expected.
    Receiving = 3,
    /// A complete message awaits or is under execution.
    Executing = 4,
    /// The message was malformed or of unknown kind.
    MessageError = 6,
    /// A new message start arrived while one was executing.
    Busy = 7,
    /// The message was structurally invalid or its operation failed.
    WrongMessage = 8,
}

/// Outbound packet transport, one report at a time.
pub trait PacketLink {
    /// Queue one packet. Best-effort from interrupt context: a busy
    /// transport refuses rather than blocks, and the reply is dropped.
    fn send(&mut self, packet: &[u8; RAWHID_PACKET_SIZE]) -> Result<(), Error>;

    /// Block until everything queued has left for the host.
    fn flush(&mut self);
}

/// Flash operations available to message execution.
pub trait UpdateOps {
    fn write_page(&mut self, address: u32, page: &[u8; PAGE_SIZE]) -> Result<(), Error>;

    /// Hand control to the bootloader. Diverges on hardware.
    fn enter_bootloader(&mut self);
}

/// Keyboard-layout switching hooks.
pub trait LayoutHook {
    /// Activate the layout selected by `payload`. Returns false if the
    /// selection is invalid.
    fn activate(&mut self, payload: &[u8]) -> bool;

    /// Return to the default layout.
    fn deactivate(&mut self);
}

/// [`PacketLink`] over a device IN endpoint.
pub struct EndpointLink<'a, U: UsbController> {
    usb: &'a mut U,
    endpoint: u8,
}

impl<'a, U: UsbController> EndpointLink<'a, U> {
    pub fn new(usb: &'a mut U, endpoint: u8) -> Self {
        Self { usb, endpoint }
    }
}

impl<U: UsbController> PacketLink for EndpointLink<'_, U> {
    fn send(&mut self, packet: &[u8; RAWHID_PACKET_SIZE]) -> Result<(), Error> {
        let mut usb = EndpointGuard::new(&mut *self.usb);
        usb.select_endpoint(self.endpoint);
        if !usb.in_ready() {
            return Err(Error::LinkBusy);
        }
        for &byte in packet {
            usb.write_byte(byte);
        }
        usb.release_in();
        Ok(())
    }

    fn flush(&mut self) {
        let mut usb = EndpointGuard::new(&mut *self.usb);
        usb.select_endpoint(self.endpoint);
        usb.wait_in();
    }
}

/// Reply to a PING.
pub fn pong_packet() -> [u8; RAWHID_PACKET_SIZE] {
    let mut packet = [0u8; RAWHID_PACKET_SIZE];
    packet[0] = PACKET_PONG;
    packet
}

/// Session status report: header byte, then the status code.
pub fn status_packet(status: SessionStatus) -> [u8; RAWHID_PACKET_SIZE] {
    let mut packet = [0u8; RAWHID_PACKET_SIZE];
    packet[0] = PACKET_STATUS;
    packet[1] = status as u8;
    packet
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockUsb;

    #[test]
    fn packet_builders_fill_header_and_pad() {
        let pong = pong_packet();
        assert_eq!(pong[0], PACKET_PONG);
        assert!(pong[1..].iter().all(|&b| b == 0));

        let status = status_packet(SessionStatus::CrcError);
        assert_eq!(status[0], PACKET_STATUS);
        assert_eq!(status[1], SessionStatus::CrcError as u8);
        assert!(status[2..].iter().all(|&b| b == 0));
    }

    #[test]
    fn status_codes_match_the_wire_protocol() {
        assert_eq!(SessionStatus::Idle as u8, 0);
        assert_eq!(SessionStatus::UnexpectedCont as u8, 1);
        assert_eq!(SessionStatus::CrcError as u8, 2);
        assert_eq!(SessionStatus::Receiving as u8, 3);
        assert_eq!(SessionStatus::Executing as u8, 4);
        assert_eq!(SessionStatus::MessageError as u8, 6);
        assert_eq!(SessionStatus::Busy as u8, 7);
        assert_eq!(SessionStatus::WrongMessage as u8, 8);
    }

    #[test]
    fn endpoint_link_sends_under_guard() {
        let mock = MockUsb::new();
        let mut usb = &mock;
        usb.select_endpoint(0);
        let mut link = EndpointLink::new(&mut usb, 2);
        let sent = link.send(&pong_packet());
        assert!(sent.is_ok());
        assert_eq!(mock.sent_packets(2), [&pong_packet()[..]]);
        assert_eq!(mock.selected(), 0);
    }

    #[test]
    fn endpoint_link_refuses_when_bank_busy() {
        let mock = MockUsb::new();
        mock.block_in(2);
        let mut usb = &mock;
        let mut link = EndpointLink::new(&mut usb, 2);
        assert_eq!(link.send(&pong_packet()), Err(Error::LinkBusy));
        assert!(mock.sent_packets(2).is_empty());
    }
}
