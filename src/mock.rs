//! In-memory doubles for host-side tests.
//!
//! [`MockUsb`] stands in for the device controller and [`MockDfu`] for
//! the bootloader call boundary. Both work through shared references
//! with interior mutability, so a test can hand the same instance to an
//! engine and keep inspecting it, the way interrupt handlers and the
//! main loop share the real hardware. Every state-changing call lands in
//! an ordered action log; tests assert on sequences, not just end
//! states.
//!
//! Kept out of `cfg(test)` so integration tests and downstream crates
//! can drive the engines without hardware.

use core::cell::{Cell, RefCell};
use core::mem;

use heapless::{Deque, Vec};

use crate::boot::DfuCalls;
use crate::config::{PAGE_SIZE, RAWHID_PACKET_SIZE};
use crate::error::Error;
use crate::rawhid::{LayoutHook, PacketLink, UpdateOps};
use crate::usb::bus::{DeviceEvents, EndpointConfig, EndpointEvents, UsbController};

const ENDPOINTS: usize = 8;
const LOG_CAPACITY: usize = 256;

/// One recorded controller operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UsbAction {
    RegulatorOn,
    RegulatorOff,
    PllConfigured,
    ControllerEnabled,
    ControllerDisabled,
    Attached,
    Detached,
    DeviceInterruptsEnabled,
    DeviceInterruptsDisabled,
    InterruptsEnabled,
    InterruptsDisabled,
    Select(u8),
    ConfigureEndpoint(u8),
    ResetFifo(u8),
    AckSetup,
    Stall(u8),
    Unstall(u8),
    SetAddress(u8),
    EnableAddress,
    FifoRead(u8),
    ReleaseIn(u8),
    ReleaseOut(u8),
    /// Marker pushed by test handler functions.
    Note(u8),
}

/// Scriptable in-memory USB controller.
///
/// OUT traffic is a per-endpoint byte queue fed by the test; IN traffic
/// is captured packet-wise on every [`UsbController::release_in`].
/// Status-stage ZLPs from the host are modeled as always available.
pub struct MockUsb {
    log: RefCell<Vec<UsbAction, LOG_CAPACITY>>,
    selected: Cell<u8>,
    out_queues: RefCell<[Deque<u8, 1024>; ENDPOINTS]>,
    in_banks: RefCell<[Vec<u8, 64>; ENDPOINTS]>,
    sent: RefCell<[Vec<Vec<u8, 64>, 32>; ENDPOINTS]>,
    setup_pending: Cell<bool>,
    window_setup: RefCell<Option<[u8; 8]>>,
    device_events: Cell<DeviceEvents>,
    stalled: Cell<u8>,
    configured: Cell<u8>,
    config_failures: Cell<u8>,
    in_blocked: Cell<u8>,
    address: Cell<u8>,
    address_enabled: Cell<bool>,
}

impl MockUsb {
    pub fn new() -> Self {
        Self {
            log: RefCell::new(Vec::new()),
            selected: Cell::new(0),
            out_queues: RefCell::new([const { Deque::new() }; ENDPOINTS]),
            in_banks: RefCell::new([const { Vec::new() }; ENDPOINTS]),
            sent: RefCell::new([const { Vec::new() }; ENDPOINTS]),
            setup_pending: Cell::new(false),
            window_setup: RefCell::new(None),
            device_events: Cell::new(DeviceEvents::default()),
            stalled: Cell::new(0),
            configured: Cell::new(0),
            config_failures: Cell::new(0),
            in_blocked: Cell::new(0),
            address: Cell::new(0),
            address_enabled: Cell::new(false),
        }
    }

    fn push(&self, action: UsbAction) {
        // Best effort; a saturated log only loses ordering assertions.
        let _ = self.log.borrow_mut().push(action);
    }

    pub fn actions(&self) -> Vec<UsbAction, LOG_CAPACITY> {
        self.log.borrow().clone()
    }

    pub fn clear_actions(&self) {
        self.log.borrow_mut().clear();
    }

    /// Marker hook for handler functions under test.
    pub fn note(&self, tag: u8) {
        self.push(UsbAction::Note(tag));
    }

    pub fn selected(&self) -> u8 {
        self.selected.get()
    }

    /// Park a setup payload on endpoint 0 and raise the setup event.
    pub fn push_setup(&self, raw: &[u8; 8]) {
        self.queue_out(0, raw);
        self.setup_pending.set(true);
    }

    /// Land a setup payload the moment the global interrupt window
    /// opens, like a host retry preempting a descriptor stream.
    pub fn push_setup_on_window(&self, raw: &[u8; 8]) {
        *self.window_setup.borrow_mut() = Some(*raw);
    }

    /// Append OUT bytes for `endpoint`.
    pub fn queue_out(&self, endpoint: u8, data: &[u8]) {
        let mut queues = self.out_queues.borrow_mut();
        for &byte in data {
            let _ = queues[usize::from(endpoint)].push_back(byte);
        }
    }

    /// Packets released on `endpoint`, oldest first. A zero-length
    /// packet is an entry of length zero.
    pub fn sent_packets(&self, endpoint: u8) -> Vec<Vec<u8, 64>, 32> {
        self.sent.borrow()[usize::from(endpoint)].clone()
    }

    pub fn raise_end_of_reset(&self) {
        let mut events = self.device_events.get();
        events.end_of_reset = true;
        self.device_events.set(events);
    }

    pub fn raise_start_of_frame(&self) {
        let mut events = self.device_events.get();
        events.start_of_frame = true;
        self.device_events.set(events);
    }

    pub fn endpoint_configured(&self, endpoint: u8) -> bool {
        self.configured.get() & (1 << endpoint) != 0
    }

    /// Make [`UsbController::apply_endpoint_config`] fail for `endpoint`.
    pub fn fail_endpoint_config(&self, endpoint: u8) {
        self.config_failures
            .set(self.config_failures.get() | (1 << endpoint));
    }

    pub fn stalled(&self, endpoint: u8) -> bool {
        self.stalled.get() & (1 << endpoint) != 0
    }

    /// Keep the IN bank of `endpoint` busy.
    pub fn block_in(&self, endpoint: u8) {
        self.in_blocked.set(self.in_blocked.get() | (1 << endpoint));
    }

    pub fn address(&self) -> u8 {
        self.address.get()
    }

    pub fn address_enabled(&self) -> bool {
        self.address_enabled.get()
    }
}

impl Default for MockUsb {
    fn default() -> Self {
        Self::new()
    }
}

impl UsbController for &MockUsb {
    fn set_pads_regulator(&mut self, on: bool) {
        self.push(if on {
            UsbAction::RegulatorOn
        } else {
            UsbAction::RegulatorOff
        });
    }

    fn configure_pll(&mut self) {
        self.push(UsbAction::PllConfigured);
    }

    fn pll_locked(&self) -> bool {
        true
    }

    fn enable_controller(&mut self) {
        self.push(UsbAction::ControllerEnabled);
    }

    fn disable_controller(&mut self) {
        self.push(UsbAction::ControllerDisabled);
    }

    fn attach(&mut self) {
        self.push(UsbAction::Attached);
    }

    fn detach(&mut self) {
        self.push(UsbAction::Detached);
    }

    fn enable_device_interrupts(&mut self) {
        self.push(UsbAction::DeviceInterruptsEnabled);
    }

    fn disable_device_interrupts(&mut self) {
        self.push(UsbAction::DeviceInterruptsDisabled);
    }

    fn take_device_events(&mut self) -> DeviceEvents {
        self.device_events.replace(DeviceEvents::default())
    }

    fn enable_interrupts(&mut self) {
        self.push(UsbAction::InterruptsEnabled);
        let armed = self.window_setup.borrow_mut().take();
        if let Some(raw) = armed {
            self.push_setup(&raw);
        }
    }

    fn disable_interrupts(&mut self) {
        self.push(UsbAction::InterruptsDisabled);
    }

    fn selected_endpoint(&self) -> u8 {
        self.selected.get()
    }

    fn select_endpoint(&mut self, endpoint: u8) {
        self.selected.set(endpoint);
        self.push(UsbAction::Select(endpoint));
    }

    fn apply_endpoint_config(&mut self, config: &EndpointConfig) -> Result<(), Error> {
        self.select_endpoint(config.number);
        self.push(UsbAction::ConfigureEndpoint(config.number));
        if self.config_failures.get() & (1 << config.number) != 0 {
            return Err(Error::EndpointConfig);
        }
        self.configured
            .set(self.configured.get() | (1 << config.number));
        Ok(())
    }

    fn reset_fifo(&mut self, endpoint: u8) {
        self.push(UsbAction::ResetFifo(endpoint));
    }

    fn endpoint_events(&self) -> EndpointEvents {
        let endpoint = self.selected.get();
        let mut bits = 0;
        if !self.out_queues.borrow()[usize::from(endpoint)].is_empty() {
            bits |= EndpointEvents::OUT_RECEIVED;
        }
        if self.in_ready() {
            bits |= EndpointEvents::IN_READY;
        }
        if self.stalled(endpoint) {
            bits |= EndpointEvents::STALLED;
        }
        if endpoint == 0 && self.setup_pending.get() {
            bits |= EndpointEvents::SETUP;
        }
        EndpointEvents::new(bits)
    }

    fn setup_received(&self) -> bool {
        self.selected.get() == 0 && self.setup_pending.get()
    }

    fn ack_setup(&mut self) {
        self.setup_pending.set(false);
        self.push(UsbAction::AckSetup);
    }

    fn stall(&mut self) {
        let endpoint = self.selected.get();
        self.stalled.set(self.stalled.get() | (1 << endpoint));
        self.push(UsbAction::Stall(endpoint));
    }

    fn unstall(&mut self) {
        let endpoint = self.selected.get();
        self.stalled.set(self.stalled.get() & !(1 << endpoint));
        self.push(UsbAction::Unstall(endpoint));
    }

    fn is_stalled(&self) -> bool {
        self.stalled(self.selected.get())
    }

    fn set_address(&mut self, address: u8) {
        self.address.set(address & 0x7F);
        self.push(UsbAction::SetAddress(address & 0x7F));
    }

    fn enable_address(&mut self) {
        self.address_enabled.set(true);
        self.push(UsbAction::EnableAddress);
    }

    fn in_ready(&self) -> bool {
        self.in_blocked.get() & (1 << self.selected.get()) == 0
    }

    fn out_ready(&self) -> bool {
        true
    }

    fn release_in(&mut self) {
        let endpoint = usize::from(self.selected.get());
        let packet = mem::take(&mut self.in_banks.borrow_mut()[endpoint]);
        let _ = self.sent.borrow_mut()[endpoint].push(packet);
        self.push(UsbAction::ReleaseIn(endpoint as u8));
    }

    fn release_out(&mut self) {
        self.push(UsbAction::ReleaseOut(self.selected.get()));
    }

    fn read_byte(&mut self) -> u8 {
        let endpoint = usize::from(self.selected.get());
        let byte = self.out_queues.borrow_mut()[endpoint]
            .pop_front()
            .unwrap_or(0);
        self.push(UsbAction::FifoRead(byte));
        byte
    }

    fn write_byte(&mut self, byte: u8) {
        let endpoint = usize::from(self.selected.get());
        let _ = self.in_banks.borrow_mut()[endpoint].push(byte);
    }
}

/// One recorded bootloader call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DfuAction {
    ReadFuse(u8),
    ReadSignature(u32),
    Fill { word: u16, offset: u16 },
    EraseWrite(u32),
    Erase(u32),
    Program(u32),
    LockBits(u8),
    IrqOff,
    IrqOn,
    TickStopped,
    Jump(u16),
}

/// Scriptable double of the bootloader call boundary.
pub struct MockDfu {
    log: RefCell<Vec<DfuAction, LOG_CAPACITY>>,
    fuses: RefCell<[u8; 4]>,
    signatures: RefCell<Vec<(u32, u8), 8>>,
}

impl MockDfu {
    pub fn new() -> Self {
        Self {
            log: RefCell::new(Vec::new()),
            fuses: RefCell::new([0xFF; 4]),
            signatures: RefCell::new(Vec::new()),
        }
    }

    fn push(&self, action: DfuAction) {
        let _ = self.log.borrow_mut().push(action);
    }

    pub fn actions(&self) -> Vec<DfuAction, LOG_CAPACITY> {
        self.log.borrow().clone()
    }

    pub fn clear_actions(&self) {
        self.log.borrow_mut().clear();
    }

    pub fn set_fuse(&self, selector: u8, value: u8) {
        self.fuses.borrow_mut()[usize::from(selector)] = value;
    }

    pub fn set_signature(&self, address: u32, value: u8) {
        let _ = self.signatures.borrow_mut().push((address, value));
    }

    /// True once a jump was requested.
    pub fn jumped(&self) -> Option<u16> {
        self.log.borrow().iter().find_map(|a| match a {
            DfuAction::Jump(word_address) => Some(*word_address),
            _ => None,
        })
    }
}

impl Default for MockDfu {
    fn default() -> Self {
        Self::new()
    }
}

impl DfuCalls for &MockDfu {
    fn read_fuse(&mut self, selector: u8) -> u8 {
        self.push(DfuAction::ReadFuse(selector));
        self.fuses.borrow()[usize::from(selector)]
    }

    fn read_signature(&mut self, address: u32) -> u8 {
        self.push(DfuAction::ReadSignature(address));
        self.signatures
            .borrow()
            .iter()
            .find(|(a, _)| *a == address)
            .map(|(_, v)| *v)
            .unwrap_or(0)
    }

    fn fill_page_buffer(&mut self, word: u16, offset: u16) {
        self.push(DfuAction::Fill { word, offset });
    }

    fn erase_and_write_page(&mut self, address: u32) {
        self.push(DfuAction::EraseWrite(address));
    }

    fn erase_page(&mut self, address: u32) {
        self.push(DfuAction::Erase(address));
    }

    fn program_page(&mut self, address: u32) {
        self.push(DfuAction::Program(address));
    }

    fn write_lock_bits(&mut self, bits: u8) {
        self.push(DfuAction::LockBits(bits));
    }

    fn stop_tick_timer(&mut self) {
        self.push(DfuAction::TickStopped);
    }

    fn jump(&mut self, word_address: u16) {
        self.push(DfuAction::Jump(word_address));
    }

    fn without_interrupts<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        self.push(DfuAction::IrqOff);
        let result = f(self);
        self.push(DfuAction::IrqOn);
        result
    }
}

/// Packet transport double: records sends, can play busy.
pub struct MockLink {
    packets: Vec<[u8; RAWHID_PACKET_SIZE], 16>,
    busy: bool,
    flushes: usize,
}

impl MockLink {
    pub fn new() -> Self {
        Self {
            packets: Vec::new(),
            busy: false,
            flushes: 0,
        }
    }

    pub fn sent(&self) -> Vec<[u8; RAWHID_PACKET_SIZE], 16> {
        self.packets.clone()
    }

    pub fn clear(&mut self) {
        self.packets.clear();
    }

    pub fn set_busy(&mut self, busy: bool) {
        self.busy = busy;
    }

    pub fn flushes(&self) -> usize {
        self.flushes
    }
}

impl Default for MockLink {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketLink for MockLink {
    fn send(&mut self, packet: &[u8; RAWHID_PACKET_SIZE]) -> Result<(), Error> {
        if self.busy {
            return Err(Error::LinkBusy);
        }
        let _ = self.packets.push(*packet);
        Ok(())
    }

    fn flush(&mut self) {
        // Everything queued has left, so the bank is free again.
        self.busy = false;
        self.flushes += 1;
    }
}

/// Flash-operations double for protocol dispatch tests.
pub struct UpdateProbe {
    pages: Vec<(u32, [u8; PAGE_SIZE]), 4>,
    write_error: Option<Error>,
    entered: bool,
}

impl UpdateProbe {
    pub fn new() -> Self {
        Self {
            pages: Vec::new(),
            write_error: None,
            entered: false,
        }
    }

    pub fn pages(&self) -> &[(u32, [u8; PAGE_SIZE])] {
        &self.pages
    }

    pub fn fail_writes(&mut self, error: Error) {
        self.write_error = Some(error);
    }

    pub fn entered(&self) -> bool {
        self.entered
    }
}

impl Default for UpdateProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl UpdateOps for UpdateProbe {
    fn write_page(&mut self, address: u32, page: &[u8; PAGE_SIZE]) -> Result<(), Error> {
        if let Some(error) = self.write_error {
            return Err(error);
        }
        let _ = self.pages.push((address, *page));
        Ok(())
    }

    fn enter_bootloader(&mut self) {
        self.entered = true;
    }
}

/// Layout-hook double.
pub struct LayoutProbe {
    activations: Vec<Vec<u8, 64>, 4>,
    deactivations: usize,
    refuse: bool,
}

impl LayoutProbe {
    pub fn new() -> Self {
        Self {
            activations: Vec::new(),
            deactivations: 0,
            refuse: false,
        }
    }

    pub fn activations(&self) -> &[Vec<u8, 64>] {
        &self.activations
    }

    pub fn deactivations(&self) -> usize {
        self.deactivations
    }

    /// Make every activation fail.
    pub fn refuse(&mut self) {
        self.refuse = true;
    }
}

impl Default for LayoutProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl LayoutHook for LayoutProbe {
    fn activate(&mut self, payload: &[u8]) -> bool {
        if self.refuse {
            return false;
        }
        let mut copy = Vec::new();
        let _ = copy.extend_from_slice(&payload[..payload.len().min(64)]);
        let _ = self.activations.push(copy);
        true
    }

    fn deactivate(&mut self) {
        self.deactivations += 1;
    }
}
