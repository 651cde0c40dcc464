//! GH60 keyboard firmware for the ATmega32U4.
//!
//! Wires the USB device stack to a 5x14 switch matrix: a boot keyboard
//! interface fed from the timer-driven scan, and a raw HID interface
//! carrying the message protocol. Messages execute in the main loop, so
//! the flash routines never run inside an interrupt.

#![no_std]
#![no_main]

use core::cell::{Cell, RefCell};

use critical_section::{CriticalSection, Mutex};
use panic_halt as _;

use rawkbd::boot::{Bridge, FlashLayout};
use rawkbd::config::{
    ENDPOINT0_SIZE, FLASHEND, KEYBOARD_ENDPOINT, KEYBOARD_ENDPOINT_SIZE, KEYBOARD_INTERFACE,
    KEYBOARD_POLL_MS, NUM_ENDPOINTS, PAGE_SIZE, RAWHID_INTERFACE, RAWHID_PACKET_SIZE,
    RAWHID_POLL_MS, RAWHID_RX_ENDPOINT, RAWHID_TX_ENDPOINT, USB_PID, USB_VID,
};
use rawkbd::hid::{self, HidState};
use rawkbd::hw::{AvrDfu, AvrUsb};
use rawkbd::rawhid::{run_message, EndpointLink, Engine, LayoutHook, Outcome, PacketLink};
use rawkbd::usb::{
    Configuration, ControlPipe, DescriptorEntry, DeviceControl, EndpointConfig, EndpointEvents,
    EndpointHandler, EndpointKind, InterfaceHandler, SetupPacket, SofHandler, UsbController,
};

// GPIO port register blocks, PIN register first; DDR and PORT follow at
// the next two addresses.
const PINB: usize = 0x23;
const PINC: usize = 0x26;
const PIND: usize = 0x29;
const PINE: usize = 0x2C;
const PINF: usize = 0x2F;

// Clock prescaler and the 8-bit tick timer.
const CLKPR: usize = 0x61;
const TCCR0A: usize = 0x44;
const TCCR0B: usize = 0x45;
const TIMSK0: usize = 0x6E;

#[inline(always)]
fn read8(addr: usize) -> u8 {
    unsafe { (addr as *const u8).read_volatile() }
}

#[inline(always)]
fn write8(addr: usize, value: u8) {
    unsafe { (addr as *mut u8).write_volatile(value) }
}

/// One GPIO line, named by its PIN register and bit.
#[derive(Clone, Copy)]
struct Pin {
    pin: usize,
    mask: u8,
}

impl Pin {
    const fn new(pin: usize, bit: u8) -> Self {
        Self { pin, mask: 1 << bit }
    }

    fn ddr(self) -> usize {
        self.pin + 1
    }

    fn port(self) -> usize {
        self.pin + 2
    }

    /// Input with the pull-up on.
    fn sense(self) {
        write8(self.ddr(), read8(self.ddr()) & !self.mask);
        write8(self.port(), read8(self.port()) | self.mask);
    }

    /// High-impedance input.
    fn high_z(self) {
        write8(self.ddr(), read8(self.ddr()) & !self.mask);
        write8(self.port(), read8(self.port()) & !self.mask);
    }

    /// Push-pull output at the given level.
    fn drive(self, high: bool) {
        if high {
            write8(self.port(), read8(self.port()) | self.mask);
        } else {
            write8(self.port(), read8(self.port()) & !self.mask);
        }
        write8(self.ddr(), read8(self.ddr()) | self.mask);
    }

    fn is_low(self) -> bool {
        read8(self.pin) & self.mask == 0
    }
}

/// Row strobe lines, top row first.
const ROWS: [Pin; 5] = [
    Pin::new(PIND, 0),
    Pin::new(PIND, 1),
    Pin::new(PIND, 2),
    Pin::new(PIND, 3),
    Pin::new(PIND, 5),
];

/// Column sense lines, left to right across the board.
const COLS: [Pin; 14] = [
    Pin::new(PINF, 0),
    Pin::new(PINF, 1),
    Pin::new(PINE, 6),
    Pin::new(PINC, 7),
    Pin::new(PINC, 6),
    Pin::new(PINB, 6),
    Pin::new(PIND, 4),
    Pin::new(PINB, 1),
    Pin::new(PINB, 7),
    Pin::new(PINB, 5),
    Pin::new(PINB, 4),
    Pin::new(PIND, 7),
    Pin::new(PIND, 6),
    Pin::new(PINB, 3),
];

/// Caps lock indicator. The pin sinks the LED, so low is lit.
const CAPS_LED: Pin = Pin::new(PINB, 2);

/// Marks a matrix position with no switch fitted.
const NO_KEY: u8 = 0xFF;

/// Key number per matrix position. The bottom row is sparse; GH60 boards
/// only wire eight switches there.
const MATRIX: [[u8; 14]; 5] = [
    [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13],
    [14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27],
    [28, 29, 30, 31, 32, 33, 34, 35, 36, 37, 38, 39, 40, 41],
    [42, 43, 44, 45, 46, 47, 48, 49, 50, 51, 52, 53, 54, 55],
    [
        56, 57, 58, NO_KEY, NO_KEY, 59, NO_KEY, NO_KEY, NO_KEY, NO_KEY, 60, 61, 62, 63,
    ],
];

/// Keyboard usage tables indexed by key number. Table 0 is the default;
/// the host switches tables through the layout messages. A zero entry
/// leaves that position dead.
static LAYOUTS: [[u8; 64]; 2] = [
    // Plain ANSI/ISO map.
    [
        0x29, 0x1E, 0x1F, 0x20, 0x21, 0x22, 0x23, 0x24, 0x25, 0x26, 0x27, 0x2D, 0x2E, 0x2A,
        0x2B, 0x14, 0x1A, 0x08, 0x15, 0x17, 0x1C, 0x18, 0x0C, 0x12, 0x13, 0x2F, 0x30, 0x31,
        0x39, 0x04, 0x16, 0x07, 0x09, 0x0A, 0x0B, 0x0D, 0x0E, 0x0F, 0x33, 0x34, 0x32, 0x28,
        0xE1, 0x64, 0x1D, 0x1B, 0x06, 0x19, 0x05, 0x11, 0x10, 0x36, 0x37, 0x38, 0xE5, 0x00,
        0xE0, 0xE3, 0xE2, 0x2C, 0xE6, 0xE7, 0x65, 0xE4,
    ],
    // Arrow variant: WASD become the arrow cluster, Escape becomes grave.
    [
        0x35, 0x1E, 0x1F, 0x20, 0x21, 0x22, 0x23, 0x24, 0x25, 0x26, 0x27, 0x2D, 0x2E, 0x2A,
        0x2B, 0x14, 0x52, 0x08, 0x15, 0x17, 0x1C, 0x18, 0x0C, 0x12, 0x13, 0x2F, 0x30, 0x31,
        0x39, 0x50, 0x51, 0x4F, 0x09, 0x0A, 0x0B, 0x0D, 0x0E, 0x0F, 0x33, 0x34, 0x32, 0x28,
        0xE1, 0x64, 0x1D, 0x1B, 0x06, 0x19, 0x05, 0x11, 0x10, 0x36, 0x37, 0x38, 0xE5, 0x00,
        0xE0, 0xE3, 0xE2, 0x2C, 0xE6, 0xE7, 0x65, 0xE4,
    ],
];

/// Matrix scan runs once every `SCAN_DIVIDER + 2` timer ticks, roughly
/// 54 Hz at the 976 Hz overflow rate.
const SCAN_DIVIDER: u8 = 16;

static DEVICE_DESCRIPTOR: [u8; 18] = [
    18,   // bLength
    0x01, // DEVICE
    0x00, 0x02, // bcdUSB 2.00
    0, 0, 0, // class per interface
    ENDPOINT0_SIZE,
    (USB_VID & 0xFF) as u8,
    (USB_VID >> 8) as u8,
    (USB_PID & 0xFF) as u8,
    (USB_PID >> 8) as u8,
    0x00, 0x01, // bcdDevice 1.00
    0, // iManufacturer
    1, // iProduct
    0, // iSerialNumber
    1, // bNumConfigurations
];

const CONFIG_DESCRIPTOR_SIZE: usize = 9 + 9 + 9 + 7 + 9 + 9 + 7 + 7;

static CONFIG_DESCRIPTOR: [u8; CONFIG_DESCRIPTOR_SIZE] = [
    // Configuration: two interfaces, bus powered, 100 mA.
    9,
    0x02,
    CONFIG_DESCRIPTOR_SIZE as u8,
    0x00,
    2,
    1,
    0,
    0x80,
    50,
    // Interface 0: boot keyboard.
    9,
    0x04,
    KEYBOARD_INTERFACE as u8,
    0,
    1,
    0x03,
    0x01,
    0x01,
    0,
    // HID descriptor for the keyboard report map.
    9,
    0x21,
    0x11,
    0x01,
    0,
    1,
    0x22,
    hid::KEYBOARD_REPORT_DESCRIPTOR.len() as u8,
    0,
    // Keyboard IN endpoint.
    7,
    0x05,
    KEYBOARD_ENDPOINT | 0x80,
    0x03,
    KEYBOARD_ENDPOINT_SIZE,
    0,
    KEYBOARD_POLL_MS,
    // Interface 1: raw HID message pipe.
    9,
    0x04,
    RAWHID_INTERFACE as u8,
    0,
    2,
    0x03,
    0x00,
    0x00,
    0,
    // HID descriptor for the raw report map.
    9,
    0x21,
    0x11,
    0x01,
    0,
    1,
    0x22,
    RAWHID_REPORT_DESCRIPTOR.len() as u8,
    0,
    // Raw IN and OUT endpoints.
    7,
    0x05,
    RAWHID_TX_ENDPOINT | 0x80,
    0x03,
    RAWHID_PACKET_SIZE as u8,
    0,
    RAWHID_POLL_MS,
    7,
    0x05,
    RAWHID_RX_ENDPOINT,
    0x03,
    RAWHID_PACKET_SIZE as u8,
    0,
    RAWHID_POLL_MS,
];

/// Vendor-defined report map for the raw pipe: one 32-byte input report
/// and one 32-byte output report.
static RAWHID_REPORT_DESCRIPTOR: [u8; 28] = [
    0x06, 0xAB, 0xFF, // Usage Page (vendor)
    0x0A, 0x00, 0x02, // Usage
    0xA1, 0x01, // Collection (Application)
    0x75, 0x08, //   Report Size (8)
    0x15, 0x00, //   Logical Minimum (0)
    0x26, 0xFF, 0x00, //   Logical Maximum (255)
    0x95, RAWHID_PACKET_SIZE as u8, //   Report Count
    0x09, 0x01, //   Usage
    0x81, 0x02, //   Input (Data, Variable, Absolute)
    0x95, RAWHID_PACKET_SIZE as u8, //   Report Count
    0x09, 0x02, //   Usage
    0x91, 0x02, //   Output (Data, Variable, Absolute)
    0xC0, // End Collection
];

static STRING_LANGUAGE: [u8; 4] = [4, 0x03, 0x09, 0x04];

static STRING_PRODUCT: [u8; 24] = [
    24, 0x03, b'r', 0, b'a', 0, b'w', 0, b'k', 0, b'b', 0, b'd', 0, b' ', 0, b'g', 0, b'h', 0,
    b'6', 0, b'0', 0,
];

static DESCRIPTORS: [DescriptorEntry; 6] = [
    DescriptorEntry {
        value: 0x0100,
        index: 0x0000,
        data: &DEVICE_DESCRIPTOR,
    },
    DescriptorEntry {
        value: 0x0200,
        index: 0x0000,
        data: &CONFIG_DESCRIPTOR,
    },
    DescriptorEntry {
        value: 0x2200,
        index: KEYBOARD_INTERFACE,
        data: hid::KEYBOARD_REPORT_DESCRIPTOR,
    },
    DescriptorEntry {
        value: 0x2200,
        index: RAWHID_INTERFACE,
        data: &RAWHID_REPORT_DESCRIPTOR,
    },
    DescriptorEntry {
        value: 0x0300,
        index: 0x0000,
        data: &STRING_LANGUAGE,
    },
    DescriptorEntry {
        value: 0x0301,
        index: 0x0409,
        data: &STRING_PRODUCT,
    },
];

static ENDPOINTS: [EndpointConfig; NUM_ENDPOINTS] = [
    EndpointConfig {
        number: 0,
        kind: EndpointKind::Control,
        size: ENDPOINT0_SIZE,
        double_bank: false,
        interrupts: EndpointEvents::SETUP,
    },
    EndpointConfig {
        number: KEYBOARD_ENDPOINT,
        kind: EndpointKind::InterruptIn,
        size: KEYBOARD_ENDPOINT_SIZE,
        double_bank: true,
        interrupts: 0,
    },
    EndpointConfig {
        number: RAWHID_TX_ENDPOINT,
        kind: EndpointKind::InterruptIn,
        size: RAWHID_PACKET_SIZE as u8,
        double_bank: true,
        interrupts: 0,
    },
    EndpointConfig {
        number: RAWHID_RX_ENDPOINT,
        kind: EndpointKind::InterruptOut,
        size: RAWHID_PACKET_SIZE as u8,
        double_bank: true,
        interrupts: EndpointEvents::OUT_RECEIVED,
    },
];

static INTERFACE_HANDLERS: [InterfaceHandler<AvrUsb>; 1] = [InterfaceHandler {
    interface: KEYBOARD_INTERFACE,
    handler: keyboard_class,
}];

static SOF_HANDLERS: [SofHandler<AvrUsb>; 0] = [];

static ENDPOINT_HANDLERS: [EndpointHandler<AvrUsb>; 1] = [EndpointHandler {
    endpoint: RAWHID_RX_ENDPOINT,
    handler: rawhid_rx,
}];

/// Configuration value set by the host, shared by both engine halves.
static USB_CONFIG: Configuration = Configuration::new();

/// Device-event half of the USB engine, run from `USB_GEN`.
static DEVICE: Mutex<RefCell<Option<DeviceControl<'static, AvrUsb>>>> =
    Mutex::new(RefCell::new(None));

/// Endpoint-zero engine and endpoint fan-out, run from `USB_COM`.
static CONTROL: Mutex<RefCell<Option<ControlPipe<'static, AvrUsb>>>> =
    Mutex::new(RefCell::new(None));

/// Packet reassembly state for the raw pipe.
static PROTOCOL: Mutex<RefCell<Engine>> = Mutex::new(RefCell::new(Engine::new()));

/// Pressed keys, LED state and HID request state.
static HID: Mutex<RefCell<HidState>> = Mutex::new(RefCell::new(HidState::new()));

/// Index of the active entry in [`LAYOUTS`].
static ACTIVE_LAYOUT: Mutex<Cell<u8>> = Mutex::new(Cell::new(0));

/// Column states from the previous scan, one bitmask per row.
static PREVIOUS_ROWS: Mutex<RefCell<[u16; 5]>> = Mutex::new(RefCell::new([0; 5]));

/// Timer ticks since the last matrix scan.
static TICK: Mutex<Cell<u8>> = Mutex::new(Cell::new(0));

/// Switches the active layout table on host request.
struct LayoutSwitch;

impl LayoutHook for LayoutSwitch {
    fn activate(&mut self, payload: &[u8]) -> bool {
        match payload.first() {
            Some(&index) if (index as usize) < LAYOUTS.len() => {
                critical_section::with(|cs| ACTIVE_LAYOUT.borrow(cs).set(index));
                true
            }
            _ => false,
        }
    }

    fn deactivate(&mut self) {
        critical_section::with(|cs| ACTIVE_LAYOUT.borrow(cs).set(0));
    }
}

#[avr_device::entry]
fn main() -> ! {
    // Full 16 MHz; the fuses ship with divide-by-8 on.
    write8(CLKPR, 0x80);
    write8(CLKPR, 0x00);

    for col in COLS {
        col.sense();
    }
    for row in ROWS {
        row.high_z();
    }
    CAPS_LED.drive(true);

    // Fuse read goes through the bootloader routines, so set this up
    // before any interrupt source exists.
    let mut bridge = Bridge::new(AvrDfu::new(FLASHEND), FLASHEND);
    let flash = FlashLayout::new(FLASHEND, bridge.bootloader_size(), firmware_end());

    critical_section::with(|cs| {
        *CONTROL.borrow_ref_mut(cs) = Some(ControlPipe::new(
            AvrUsb,
            &USB_CONFIG,
            &ENDPOINTS,
            &DESCRIPTORS,
            &INTERFACE_HANDLERS,
            &ENDPOINT_HANDLERS,
        ));
        let mut device = DeviceControl::new(AvrUsb, &USB_CONFIG, &ENDPOINTS, &SOF_HANDLERS);
        device.init();
        *DEVICE.borrow_ref_mut(cs) = Some(device);
    });
    // The critical section rolls the interrupt flag back on exit, so the
    // enable from init() has to be repeated here.
    unsafe { avr_device::interrupt::enable() };

    while USB_CONFIG.get() == 0 {}

    // Idle report so the host sees a clean state.
    critical_section::with(|cs| {
        let state = HID.borrow_ref(cs);
        let mut usb = AvrUsb;
        hid::commit_report(&mut usb, KEYBOARD_ENDPOINT, &state.report());
    });

    // Tick timer: clk/64, overflow interrupt on. 976 Hz at 16 MHz.
    write8(TCCR0A, 0x00);
    write8(TCCR0B, 0x03);
    write8(TIMSK0, 0x01);

    let mut hook = LayoutSwitch;
    loop {
        let Some(message) =
            critical_section::with(|cs| PROTOCOL.borrow_ref_mut(cs).take_message())
        else {
            continue;
        };
        let outcome = run_message(&message, &flash, &mut bridge, &mut hook);
        critical_section::with(|cs| {
            let mut usb = AvrUsb;
            let mut link = EndpointLink::new(&mut usb, RAWHID_TX_ENDPOINT);
            PROTOCOL.borrow_ref_mut(cs).complete(outcome, &mut link);
            if outcome == Outcome::EnterDfu {
                link.flush();
                bridge.jump_to_bootloader();
            }
        });
    }
}

/// Device-level events: bus reset, start of frame.
#[avr_device::interrupt(atmega32u4)]
fn USB_GEN() {
    critical_section::with(|cs| {
        if let Some(device) = DEVICE.borrow_ref_mut(cs).as_mut() {
            device.device_interrupt();
        }
    });
}

/// Endpoint events: setup packets on endpoint zero, raw OUT traffic.
///
/// Descriptor streaming re-enables interrupts while this frame still
/// holds the pipe, so a setup or OUT event in that window re-enters
/// here. The nested entry backs off with the event flags still raised;
/// the streaming loop polls them and aborts, and the pending event
/// raises this vector again once the outer frame returns.
#[avr_device::interrupt(atmega32u4)]
fn USB_COM() {
    critical_section::with(|cs| {
        if let Ok(mut control) = CONTROL.borrow(cs).try_borrow_mut() {
            if let Some(control) = control.as_mut() {
                control.communication_interrupt();
            }
        }
    });
}

/// Divided tick: scan the matrix, mirror the caps lock LED, and push a
/// report when keys moved. A busy bank keeps the report pending for the
/// next scan.
#[avr_device::interrupt(atmega32u4)]
fn TIMER0_OVF() {
    critical_section::with(|cs| {
        let tick = TICK.borrow(cs);
        if tick.get() <= SCAN_DIVIDER {
            tick.set(tick.get() + 1);
            return;
        }
        tick.set(0);

        let mut state = HID.borrow_ref_mut(cs);
        scan_matrix(cs, &mut state);
        CAPS_LED.drive(state.leds() & hid::LED_CAPS_LOCK == 0);
        if state.dirty() {
            let mut usb = AvrUsb;
            if hid::commit_report(&mut usb, KEYBOARD_ENDPOINT, &state.report()) {
                state.clear_dirty();
            }
        }
    });
}

/// Class requests for the boot keyboard interface.
fn keyboard_class(usb: &mut AvrUsb, setup: &SetupPacket) -> bool {
    critical_section::with(|cs| {
        let mut state = HID.borrow_ref_mut(cs);
        hid::handle_interface_request(usb, setup, &mut state)
    })
}

/// OUT traffic on the raw pipe: feed the reassembly engine and let it
/// reply on the IN endpoint.
fn rawhid_rx(usb: &mut AvrUsb, events: EndpointEvents) {
    if !events.out_received() {
        return;
    }
    let mut packet = [0u8; RAWHID_PACKET_SIZE];
    for byte in packet.iter_mut() {
        *byte = usb.read_byte();
    }
    usb.release_out();
    critical_section::with(|cs| {
        let mut link = EndpointLink::new(&mut *usb, RAWHID_TX_ENDPOINT);
        PROTOCOL.borrow_ref_mut(cs).handle_packet(&packet, &mut link);
    });
}

/// Strobe each row low and sense the columns, feeding key edges through
/// the active layout into the HID state.
fn scan_matrix(cs: CriticalSection, state: &mut HidState) {
    let layout = &LAYOUTS[usize::from(ACTIVE_LAYOUT.borrow(cs).get())];
    let mut previous = PREVIOUS_ROWS.borrow_ref_mut(cs);
    for (row_index, row) in ROWS.iter().enumerate() {
        row.drive(false);
        settle();
        let mut columns: u16 = 0;
        for (col_index, col) in COLS.iter().enumerate() {
            if col.is_low() {
                columns |= 1 << col_index;
            }
        }
        row.high_z();

        let changed = columns ^ previous[row_index];
        if changed == 0 {
            continue;
        }
        previous[row_index] = columns;
        for col_index in 0..COLS.len() {
            if changed & (1 << col_index) == 0 {
                continue;
            }
            let key = MATRIX[row_index][col_index];
            if key == NO_KEY {
                continue;
            }
            let pressed = columns & (1 << col_index) != 0;
            state.set_scancode_state(layout[usize::from(key)], pressed);
        }
    }
}

/// Give the column lines time to settle after a strobe.
fn settle() {
    for _ in 0..16 {
        avr_device::asm::nop();
    }
}

extern "C" {
    static __data_load_end: u8;
}

/// First flash address past the firmware image, rounded up to a full
/// page. The linker places the initialised-data image right after the
/// text section, so its load end is the end of everything programmed.
fn firmware_end() -> u32 {
    let end = unsafe { core::ptr::addr_of!(__data_load_end) } as usize as u32;
    let mask = PAGE_SIZE as u32 - 1;
    (end + mask) & !mask
}
