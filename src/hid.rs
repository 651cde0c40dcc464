//! Boot-protocol HID keyboard: report layout, live key state and the
//! class-request processor for the keyboard interface.
//!
//! Report layout (8 bytes):
//! ```text
//! Byte 0: Modifier keys (bitfield), Left Ctrl .. Right GUI
//! Byte 1: Reserved (0x00)
//! Byte 2-7: Up to 6 simultaneous key codes (USB HID usage codes)
//! ```

use crate::usb::bus::{EndpointGuard, UsbController};
use crate::usb::setup::SetupPacket;

/// Keyboard report size in bytes.
pub const KEYBOARD_REPORT_SIZE: usize = 8;

/// HID class request codes (HID 1.11, §7.2).
pub const HID_GET_REPORT: u8 = 1;
pub const HID_GET_IDLE: u8 = 2;
pub const HID_GET_PROTOCOL: u8 = 3;
pub const HID_SET_REPORT: u8 = 9;
pub const HID_SET_IDLE: u8 = 10;
pub const HID_SET_PROTOCOL: u8 = 11;

/// Keyboard LED bits of the output report.
pub const LED_NUM_LOCK: u8 = 1 << 0;
pub const LED_CAPS_LOCK: u8 = 1 << 1;
pub const LED_SCROLL_LOCK: u8 = 1 << 2;

/// Modifier usage range; E0..E7 map to the modifier bitfield.
const MODIFIER_FIRST: u8 = 0xE0;
const MODIFIER_LAST: u8 = 0xE7;

/// Usage code reported in every slot while more than six keys are held.
const ERROR_ROLL_OVER: u8 = 0x01;

/// Standard USB HID boot-protocol keyboard report.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct KeyboardReport {
    /// Modifier key bitfield.
    pub modifier: u8,
    /// Reserved byte (always 0x00 per HID spec).
    pub reserved: u8,
    /// Up to 6 simultaneously pressed key codes.
    pub keycodes: [u8; 6],
}

impl KeyboardReport {
    /// Create an empty (all-keys-released) report.
    pub const fn empty() -> Self {
        Self {
            modifier: 0,
            reserved: 0,
            keycodes: [0; 6],
        }
    }

    /// Serialise into a byte slice for USB transmission.
    /// Returns the number of bytes written (always 8).
    pub fn serialize(&self, buf: &mut [u8]) -> usize {
        if buf.len() < KEYBOARD_REPORT_SIZE {
            return 0;
        }
        buf[0] = self.modifier;
        buf[1] = self.reserved;
        buf[2..8].copy_from_slice(&self.keycodes);
        KEYBOARD_REPORT_SIZE
    }
}

/// Live keyboard state: held keys, LEDs, idle and protocol settings.
///
/// The matrix scanner feeds key edges in; [`HidState::report`] renders
/// the current input report with 6-key rollover saturating to
/// ErrorRollOver per the boot protocol.
#[derive(Debug)]
pub struct HidState {
    held: heapless::Vec<u8, 16>,
    modifier: u8,
    leds: u8,
    idle_rate: u8,
    protocol: u8,
    dirty: bool,
}

impl HidState {
    pub const fn new() -> Self {
        Self {
            held: heapless::Vec::new(),
            modifier: 0,
            leds: 0,
            idle_rate: 0,
            // Report protocol, per HID default.
            protocol: 1,
            dirty: false,
        }
    }

    /// Track one key edge from the matrix. Usage code 0 is "no key" in
    /// layout maps and is ignored.
    pub fn set_scancode_state(&mut self, code: u8, pressed: bool) {
        if code == 0 {
            return;
        }
        if (MODIFIER_FIRST..=MODIFIER_LAST).contains(&code) {
            let bit = 1 << (code - MODIFIER_FIRST);
            let before = self.modifier;
            if pressed {
                self.modifier |= bit;
            } else {
                self.modifier &= !bit;
            }
            self.dirty |= self.modifier != before;
            return;
        }
        if pressed {
            if self.held.contains(&code) {
                return;
            }
            if self.held.push(code).is_ok() {
                self.dirty = true;
            }
        } else if let Some(position) = self.held.iter().position(|&held| held == code) {
            self.held.remove(position);
            self.dirty = true;
        }
    }

    /// Render the current input report.
    pub fn report(&self) -> KeyboardReport {
        let mut report = KeyboardReport::empty();
        report.modifier = self.modifier;
        if self.held.len() > report.keycodes.len() {
            report.keycodes = [ERROR_ROLL_OVER; 6];
        } else {
            for (slot, &code) in report.keycodes.iter_mut().zip(self.held.iter()) {
                *slot = code;
            }
        }
        report
    }

    /// True while a change is waiting to be committed.
    pub fn dirty(&self) -> bool {
        self.dirty
    }

    /// Call after the report made it onto the wire.
    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    pub fn leds(&self) -> u8 {
        self.leds
    }

    pub fn idle_rate(&self) -> u8 {
        self.idle_rate
    }

    pub fn protocol(&self) -> u8 {
        self.protocol
    }
}

impl Default for HidState {
    fn default() -> Self {
        Self::new()
    }
}

/// Class-request processor for the keyboard interface, for the control
/// engine's interface handler table. Runs the data stage only; the
/// engine completes the status stage.
pub fn handle_interface_request<U: UsbController>(
    usb: &mut U,
    setup: &SetupPacket,
    state: &mut HidState,
) -> bool {
    match setup.request {
        HID_GET_REPORT => {
            usb.wait_in();
            let mut bytes = [0u8; KEYBOARD_REPORT_SIZE];
            state.report().serialize(&mut bytes);
            for &byte in &bytes {
                usb.write_byte(byte);
            }
            usb.release_in();
            true
        }
        HID_SET_REPORT => {
            // The output report is the LED byte.
            usb.wait_out();
            state.leds = usb.read_byte();
            usb.release_out();
            true
        }
        HID_GET_IDLE => {
            usb.wait_in();
            usb.write_byte(state.idle_rate);
            usb.release_in();
            true
        }
        HID_SET_IDLE => {
            state.idle_rate = (setup.value >> 8) as u8;
            true
        }
        HID_GET_PROTOCOL => {
            usb.wait_in();
            usb.write_byte(state.protocol);
            usb.release_in();
            true
        }
        HID_SET_PROTOCOL => {
            state.protocol = setup.value as u8;
            true
        }
        _ => false,
    }
}

/// Push a report to the keyboard IN endpoint if its bank is free. A busy
/// bank drops this commit; the next tick retries with fresh state.
pub fn commit_report<U: UsbController>(
    usb: &mut U,
    endpoint: u8,
    report: &KeyboardReport,
) -> bool {
    let mut usb = EndpointGuard::new(usb);
    usb.select_endpoint(endpoint);
    if !usb.in_ready() {
        return false;
    }
    let mut bytes = [0u8; KEYBOARD_REPORT_SIZE];
    report.serialize(&mut bytes);
    for &byte in &bytes {
        usb.write_byte(byte);
    }
    usb.release_in();
    true
}

/// USB HID report descriptor for a boot-protocol keyboard:
/// 8 modifier bits, 1 reserved byte, 5 LED output bits, 6 key codes.
pub const KEYBOARD_REPORT_DESCRIPTOR: &[u8] = &[
    0x05, 0x01, // Usage Page (Generic Desktop)
    0x09, 0x06, // Usage (Keyboard)
    0xA1, 0x01, // Collection (Application)
    0x05, 0x07, //   Usage Page (Keyboard/Keypad)
    0x19, 0xE0, //   Usage Minimum (Left Control)
    0x29, 0xE7, //   Usage Maximum (Right GUI)
    0x15, 0x00, //   Logical Minimum (0)
    0x25, 0x01, //   Logical Maximum (1)
    0x75, 0x01, //   Report Size (1)
    0x95, 0x08, //   Report Count (8)
    0x81, 0x02, //   Input (Data, Variable, Absolute)
    0x95, 0x01, //   Report Count (1)
    0x75, 0x08, //   Report Size (8)
    0x81, 0x01, //   Input (Constant) - reserved byte
    0x05, 0x08, //   Usage Page (LEDs)
    0x19, 0x01, //   Usage Minimum (Num Lock)
    0x29, 0x05, //   Usage Maximum (Kana)
    0x95, 0x05, //   Report Count (5)
    0x75, 0x01, //   Report Size (1)
    0x91, 0x02, //   Output (Data, Variable, Absolute)
    0x95, 0x01, //   Report Count (1)
    0x75, 0x03, //   Report Size (3)
    0x91, 0x01, //   Output (Constant) - LED padding
    0x05, 0x07, //   Usage Page (Keyboard/Keypad)
    0x19, 0x00, //   Usage Minimum (0)
    0x29, 0xFF, //   Usage Maximum (255)
    0x15, 0x00, //   Logical Minimum (0)
    0x26, 0xFF, 0x00, // Logical Maximum (255)
    0x95, 0x06, //   Report Count (6)
    0x75, 0x08, //   Report Size (8)
    0x81, 0x00, //   Input (Data, Array)
    0xC0, // End Collection
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KEYBOARD_ENDPOINT;
    use crate::mock::{MockUsb, UsbAction};

    #[test]
    fn serialize_writes_boot_layout() {
        let report = KeyboardReport {
            modifier: 0x02,
            reserved: 0,
            keycodes: [0x04, 0x05, 0, 0, 0, 0],
        };
        let mut buf = [0xFFu8; 8];
        assert_eq!(report.serialize(&mut buf), KEYBOARD_REPORT_SIZE);
        assert_eq!(buf, [0x02, 0x00, 0x04, 0x05, 0, 0, 0, 0]);
    }

    #[test]
    fn serialize_refuses_short_buffers() {
        let report = KeyboardReport::empty();
        let mut buf = [0u8; 4];
        assert_eq!(report.serialize(&mut buf), 0);
    }

    #[test]
    fn modifiers_map_to_bitfield() {
        let mut state = HidState::new();
        state.set_scancode_state(0xE1, true); // Left Shift
        state.set_scancode_state(0xE4, true); // Right Ctrl
        assert_eq!(state.report().modifier, 0b0001_0010);
        state.set_scancode_state(0xE1, false);
        assert_eq!(state.report().modifier, 0b0001_0000);
    }

    #[test]
    fn keys_fill_slots_in_press_order() {
        let mut state = HidState::new();
        state.set_scancode_state(0x04, true);
        state.set_scancode_state(0x05, true);
        assert_eq!(state.report().keycodes, [0x04, 0x05, 0, 0, 0, 0]);
        state.set_scancode_state(0x04, false);
        assert_eq!(state.report().keycodes, [0x05, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn repeated_press_is_recorded_once() {
        let mut state = HidState::new();
        state.set_scancode_state(0x04, true);
        state.set_scancode_state(0x04, true);
        assert_eq!(state.report().keycodes, [0x04, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn seventh_key_saturates_to_roll_over() {
        let mut state = HidState::new();
        for code in 0x04..0x0A {
            state.set_scancode_state(code, true);
        }
        assert_eq!(state.report().keycodes, [0x04, 0x05, 0x06, 0x07, 0x08, 0x09]);

        state.set_scancode_state(0x0A, true);
        assert_eq!(state.report().keycodes, [ERROR_ROLL_OVER; 6]);

        // Releasing back to six restores the real codes.
        state.set_scancode_state(0x04, false);
        assert_eq!(state.report().keycodes, [0x05, 0x06, 0x07, 0x08, 0x09, 0x0A]);
    }

    #[test]
    fn rollover_keeps_modifiers() {
        let mut state = HidState::new();
        state.set_scancode_state(0xE0, true);
        for code in 0x04..0x0C {
            state.set_scancode_state(code, true);
        }
        let report = state.report();
        assert_eq!(report.modifier, 0x01);
        assert_eq!(report.keycodes, [ERROR_ROLL_OVER; 6]);
    }

    #[test]
    fn dirty_flag_tracks_changes() {
        let mut state = HidState::new();
        assert!(!state.dirty());
        state.set_scancode_state(0x04, true);
        assert!(state.dirty());
        state.clear_dirty();
        // No-op edges stay clean.
        state.set_scancode_state(0x04, true);
        state.set_scancode_state(0x3F, false);
        assert!(!state.dirty());
    }

    #[test]
    fn get_report_serves_current_state() {
        let mock = MockUsb::new();
        let mut usb = &mock;
        let mut state = HidState::new();
        state.set_scancode_state(0x04, true);
        let setup = SetupPacket {
            request_type: 0xA1,
            request: HID_GET_REPORT,
            value: 0x0100,
            index: 0,
            length: 8,
        };
        assert!(handle_interface_request(&mut usb, &setup, &mut state));
        assert_eq!(
            mock.sent_packets(0),
            [&[0u8, 0, 0x04, 0, 0, 0, 0, 0][..]]
        );
    }

    #[test]
    fn set_report_updates_leds() {
        let mock = MockUsb::new();
        mock.queue_out(0, &[LED_CAPS_LOCK | LED_NUM_LOCK]);
        let mut usb = &mock;
        let mut state = HidState::new();
        let setup = SetupPacket {
            request_type: 0x21,
            request: HID_SET_REPORT,
            value: 0x0200,
            index: 0,
            length: 1,
        };
        assert!(handle_interface_request(&mut usb, &setup, &mut state));
        assert_eq!(state.leds(), 0b0000_0011);
        assert!(mock.actions().contains(&UsbAction::ReleaseOut(0)));
    }

    #[test]
    fn idle_and_protocol_round_trip() {
        let mock = MockUsb::new();
        let mut usb = &mock;
        let mut state = HidState::new();

        let set_idle = SetupPacket {
            request_type: 0x21,
            request: HID_SET_IDLE,
            value: 0x7D00, // duration in the high byte
            index: 0,
            length: 0,
        };
        assert!(handle_interface_request(&mut usb, &set_idle, &mut state));
        assert_eq!(state.idle_rate(), 0x7D);

        let set_protocol = SetupPacket {
            request_type: 0x21,
            request: HID_SET_PROTOCOL,
            value: 0, // boot protocol
            index: 0,
            length: 0,
        };
        assert!(handle_interface_request(&mut usb, &set_protocol, &mut state));
        assert_eq!(state.protocol(), 0);

        let get_idle = SetupPacket {
            request_type: 0xA1,
            request: HID_GET_IDLE,
            value: 0,
            index: 0,
            length: 1,
        };
        assert!(handle_interface_request(&mut usb, &get_idle, &mut state));
        let get_protocol = SetupPacket {
            request_type: 0xA1,
            request: HID_GET_PROTOCOL,
            value: 0,
            index: 0,
            length: 1,
        };
        assert!(handle_interface_request(&mut usb, &get_protocol, &mut state));
        assert_eq!(mock.sent_packets(0), [&[0x7D][..], &[0x00][..]]);
    }

    #[test]
    fn unknown_class_request_is_refused() {
        let mock = MockUsb::new();
        let mut usb = &mock;
        let mut state = HidState::new();
        let setup = SetupPacket {
            request_type: 0x21,
            request: 0x42,
            value: 0,
            index: 0,
            length: 0,
        };
        assert!(!handle_interface_request(&mut usb, &setup, &mut state));
    }

    #[test]
    fn commit_report_sends_and_restores_selection() {
        let mock = MockUsb::new();
        let mut usb = &mock;
        usb.select_endpoint(0);
        let mut state = HidState::new();
        state.set_scancode_state(0xE0, true);
        assert!(commit_report(&mut usb, KEYBOARD_ENDPOINT, &state.report()));
        assert_eq!(
            mock.sent_packets(KEYBOARD_ENDPOINT),
            [&[0x01u8, 0, 0, 0, 0, 0, 0, 0][..]]
        );
        assert_eq!(mock.selected(), 0);
    }

    #[test]
    fn commit_report_drops_when_bank_busy() {
        let mock = MockUsb::new();
        mock.block_in(KEYBOARD_ENDPOINT);
        let mut usb = &mock;
        assert!(!commit_report(
            &mut usb,
            KEYBOARD_ENDPOINT,
            &KeyboardReport::empty()
        ));
        assert!(mock.sent_packets(KEYBOARD_ENDPOINT).is_empty());
    }
}
