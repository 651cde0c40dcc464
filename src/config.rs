//! Application-wide constants and compile-time configuration.
//!
//! Endpoint assignments, packet geometry, and flash geometry live here so
//! they can be tuned in one place. The board-specific matrix wiring stays
//! in the firmware binary.

// USB

/// USB VID/PID - use the "pid.codes" open-source test VID.
/// Replace with your own allocated VID/PID for production.
pub const USB_VID: u16 = 0x1209;
pub const USB_PID: u16 = 0x0001;

/// Max packet size of the control endpoint (bytes).
pub const ENDPOINT0_SIZE: u8 = 32;

/// Boot keyboard interface number and its interrupt IN endpoint.
pub const KEYBOARD_INTERFACE: u16 = 0;
pub const KEYBOARD_ENDPOINT: u8 = 1;
pub const KEYBOARD_ENDPOINT_SIZE: u8 = 8;

/// Raw-HID interface number and its endpoint pair.
pub const RAWHID_INTERFACE: u16 = 1;
pub const RAWHID_TX_ENDPOINT: u8 = 2;
pub const RAWHID_RX_ENDPOINT: u8 = 3;

/// Number of endpoints in use, including endpoint 0.
pub const NUM_ENDPOINTS: usize = 4;

/// USB HID polling interval for the keyboard endpoint (ms).
pub const KEYBOARD_POLL_MS: u8 = 10;

/// USB HID polling interval for the raw-HID pair (ms).
pub const RAWHID_POLL_MS: u8 = 2;

// Raw-HID protocol geometry

/// Size of one raw-HID packet; equals the raw endpoints' max packet size.
pub const RAWHID_PACKET_SIZE: usize = 32;

/// Payload bytes per packet (packet minus the one-byte header).
pub const RAWHID_PAYLOAD_SIZE: usize = RAWHID_PACKET_SIZE - 1;

/// Reassembly buffer capacity; an entire message must fit.
pub const MSG_CAPACITY: usize = 256;

/// Message header: kind byte plus 16-bit declared length.
pub const MSG_HEADER_SIZE: usize = 3;

/// Trailing checksum width.
pub const MSG_CRC_SIZE: usize = 2;

/// Largest possible message payload (between header and checksum).
pub const MSG_MAX_PAYLOAD: usize = MSG_CAPACITY - MSG_HEADER_SIZE - MSG_CRC_SIZE;

// Flash geometry (ATmega32U4)

/// Byte address of the last flash cell.
pub const FLASHEND: u32 = 0x7FFF;

/// SPM page size in bytes. Hardware-fixed; not a tunable.
pub const PAGE_SIZE: usize = 128;
