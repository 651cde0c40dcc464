//! Endpoint-zero control-transfer engine.
//!
//! The engine is split the way the controller's two interrupt vectors
//! split: [`DeviceControl`] services device-level events (bus reset,
//! start of frame) and [`ControlPipe`] services endpoint events,
//! including every setup request. The halves share only the
//! [`Configuration`] cell, so the firmware can keep them in separate
//! interrupt-safe statics. That separation is what makes the descriptor
//! streaming window safe: it is the one place interrupts are re-enabled
//! inside a handler, and the device-event handler it admits touches no
//! state the pipe is using.
//!
//! Behaviour is table-driven. The firmware hands each engine static
//! slices of descriptors, endpoint configurations and handler functions;
//! the engine owns the transfer mechanics.

use core::cell::Cell;

use critical_section::Mutex;

use crate::config::ENDPOINT0_SIZE;
use crate::usb::bus::{EndpointConfig, EndpointEvents, EndpointGuard, UsbController};
use crate::usb::setup::{
    Direction, Recipient, RequestKind, SetupPacket, StandardRequest, FEATURE_ENDPOINT_HALT,
};

/// Active configuration value; zero means unconfigured.
///
/// Written from the device-event path (bus reset) and the setup path
/// (SET_CONFIGURATION), read by the start-of-frame gate and the main
/// loop, hence the interrupt-safe cell.
pub struct Configuration(Mutex<Cell<u8>>);

impl Configuration {
    pub const fn new() -> Self {
        Self(Mutex::new(Cell::new(0)))
    }

    pub fn get(&self) -> u8 {
        critical_section::with(|cs| self.0.borrow(cs).get())
    }

    pub fn set(&self, value: u8) {
        critical_section::with(|cs| self.0.borrow(cs).set(value))
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self::new()
    }
}

/// One descriptor the device can serve, keyed by the wValue/wIndex pair
/// of a GET_DESCRIPTOR request.
pub struct DescriptorEntry {
    pub value: u16,
    pub index: u16,
    pub data: &'static [u8],
}

/// Class-request handler bound to one interface.
///
/// The table is scanned in order; the first entry matching wIndex is
/// invoked and the scan stops, whether or not the handler accepts the
/// request. Handlers run the data stage only and return whether the
/// request was handled; the engine completes the status stage.
pub struct InterfaceHandler<U> {
    pub interface: u16,
    pub handler: fn(&mut U, &SetupPacket) -> bool,
}

/// Start-of-frame hook, run once per frame while configured.
pub struct SofHandler<U> {
    pub handler: fn(&mut U),
}

/// Endpoint interrupt handler. At most one entry per endpoint, or a
/// later handler will see events an earlier one already consumed.
pub struct EndpointHandler<U> {
    pub endpoint: u8,
    pub handler: fn(&mut U, EndpointEvents),
}

/// Device-event half of the engine: controller bring-up, bus reset and
/// start-of-frame fan-out.
pub struct DeviceControl<'t, U: UsbController> {
    usb: U,
    config: &'t Configuration,
    endpoints: &'t [EndpointConfig],
    sof_handlers: &'t [SofHandler<U>],
}

impl<'t, U: UsbController> DeviceControl<'t, U> {
    pub fn new(
        usb: U,
        config: &'t Configuration,
        endpoints: &'t [EndpointConfig],
        sof_handlers: &'t [SofHandler<U>],
    ) -> Self {
        Self {
            usb,
            config,
            endpoints,
            sof_handlers,
        }
    }

    /// Bring the controller onto the bus: pads regulator, PLL, controller
    /// enable, attach, then device interrupts and the global flag.
    pub fn init(&mut self) {
        self.usb.set_pads_regulator(true);
        self.usb.configure_pll();
        while !self.usb.pll_locked() {}
        self.usb.enable_controller();
        self.usb.attach();
        self.config.set(0);
        self.usb.enable_device_interrupts();
        self.usb.enable_interrupts();
    }

    /// Take the device off the bus and power the controller down.
    pub fn close(&mut self) {
        self.usb.disable_device_interrupts();
        self.usb.detach();
        self.usb.disable_controller();
        self.usb.set_pads_regulator(false);
    }

    /// Device-interrupt service body.
    ///
    /// On bus reset only endpoint 0 is reconfigured; the other endpoints
    /// wait for the host's SET_CONFIGURATION. The reset pass skips the
    /// start-of-frame work.
    pub fn device_interrupt(&mut self) {
        let Self {
            usb,
            config,
            endpoints,
            sof_handlers,
        } = self;
        let mut usb = EndpointGuard::new(usb);
        let events = usb.take_device_events();
        if events.end_of_reset {
            if let Some(ep0) = endpoints.iter().find(|e| e.number == 0) {
                let _ = usb.apply_endpoint_config(ep0);
            }
            config.set(0);
            return;
        }
        if events.start_of_frame && config.get() != 0 {
            for hook in sof_handlers.iter() {
                (hook.handler)(&mut *usb);
            }
        }
    }
}

/// Endpoint-event half of the engine: setup requests on endpoint 0 and
/// the endpoint handler table.
pub struct ControlPipe<'t, U: UsbController> {
    usb: U,
    config: &'t Configuration,
    endpoints: &'t [EndpointConfig],
    descriptors: &'t [DescriptorEntry],
    interfaces: &'t [InterfaceHandler<U>],
    endpoint_handlers: &'t [EndpointHandler<U>],
}

impl<'t, U: UsbController> ControlPipe<'t, U> {
    pub fn new(
        usb: U,
        config: &'t Configuration,
        endpoints: &'t [EndpointConfig],
        descriptors: &'t [DescriptorEntry],
        interfaces: &'t [InterfaceHandler<U>],
        endpoint_handlers: &'t [EndpointHandler<U>],
    ) -> Self {
        Self {
            usb,
            config,
            endpoints,
            descriptors,
            interfaces,
            endpoint_handlers,
        }
    }

    /// Communication-interrupt service body.
    ///
    /// A pending setup packet takes priority; otherwise every entry in
    /// the endpoint handler table is polled. All of it runs under an
    /// endpoint guard, so the interrupted context gets its selection
    /// back.
    pub fn communication_interrupt(&mut self) {
        let Self {
            usb,
            config,
            endpoints,
            descriptors,
            interfaces,
            endpoint_handlers,
        } = self;
        let mut usb = EndpointGuard::new(usb);
        usb.select_endpoint(0);
        if usb.setup_received() {
            handle_setup(&mut *usb, config, endpoints, descriptors, interfaces);
        } else {
            for entry in endpoint_handlers.iter() {
                usb.select_endpoint(entry.endpoint);
                let events = usb.endpoint_events();
                if events.any_handled() {
                    (entry.handler)(&mut *usb, events);
                }
            }
        }
    }
}

fn handle_setup<U: UsbController>(
    usb: &mut U,
    config: &Configuration,
    endpoints: &[EndpointConfig],
    descriptors: &[DescriptorEntry],
    interfaces: &[InterfaceHandler<U>],
) {
    let mut raw = [0u8; SetupPacket::SIZE];
    for byte in raw.iter_mut() {
        *byte = usb.read_byte();
    }
    // Acknowledging the setup event frees its bank, so the payload must
    // be out of the FIFO first.
    usb.ack_setup();
    let setup = SetupPacket::from_bytes(&raw);

    let handled = match (setup.kind(), setup.recipient()) {
        (RequestKind::Standard, Recipient::Device) => {
            standard_device_request(usb, &setup, config, endpoints, descriptors)
        }
        (RequestKind::Standard, Recipient::Interface) => {
            standard_interface_request(usb, &setup, descriptors)
        }
        (RequestKind::Standard, Recipient::Endpoint) => {
            standard_endpoint_request(usb, &setup, endpoints)
        }
        (RequestKind::Class, Recipient::Interface) => {
            class_interface_request(usb, &setup, interfaces)
        }
        _ => false,
    };
    if !handled {
        // Processors may have moved the selection; the protocol stall
        // belongs to endpoint 0.
        usb.select_endpoint(0);
        usb.stall();
    }
}

fn standard_device_request<U: UsbController>(
    usb: &mut U,
    setup: &SetupPacket,
    config: &Configuration,
    endpoints: &[EndpointConfig],
    descriptors: &[DescriptorEntry],
) -> bool {
    let Some(request) = StandardRequest::from_code(setup.request) else {
        return false;
    };
    match request {
        StandardRequest::GetStatus => {
            usb.wait_in();
            // Bus powered, no remote wakeup.
            usb.write_byte(0);
            usb.write_byte(0);
            usb.release_in();
            read_status_stage(usb);
            true
        }
        StandardRequest::SetAddress => {
            usb.set_address(setup.value as u8);
            write_status_stage(usb);
            // The request was answered at address zero; switch only after
            // the status stage has really left the FIFO.
            usb.wait_in();
            usb.enable_address();
            true
        }
        StandardRequest::GetDescriptor => {
            serve_descriptor(usb, setup, descriptors);
            true
        }
        StandardRequest::GetConfiguration => {
            usb.wait_in();
            usb.write_byte(config.get());
            usb.release_in();
            read_status_stage(usb);
            true
        }
        StandardRequest::SetConfiguration => {
            config.set(setup.value as u8);
            write_status_stage(usb);
            for ep in endpoints.iter().filter(|e| e.number != 0) {
                if usb.apply_endpoint_config(ep).is_err() {
                    return false;
                }
            }
            true
        }
        _ => false,
    }
}

fn standard_interface_request<U: UsbController>(
    usb: &mut U,
    setup: &SetupPacket,
    descriptors: &[DescriptorEntry],
) -> bool {
    match StandardRequest::from_code(setup.request) {
        // Class descriptors (HID report descriptors among them) are
        // requested at the interface, from the same table.
        Some(StandardRequest::GetDescriptor) => {
            serve_descriptor(usb, setup, descriptors);
            true
        }
        _ => false,
    }
}

fn standard_endpoint_request<U: UsbController>(
    usb: &mut U,
    setup: &SetupPacket,
    endpoints: &[EndpointConfig],
) -> bool {
    let Some(request) = StandardRequest::from_code(setup.request) else {
        return false;
    };
    // wIndex carries the direction bit on top of the endpoint number.
    let endpoint = (setup.index & 0x7F) as u8;
    let known = endpoints.iter().any(|e| e.number == endpoint);
    match request {
        StandardRequest::GetStatus => {
            if !known {
                return false;
            }
            usb.wait_in();
            let stalled = {
                let mut target = EndpointGuard::new(&mut *usb);
                target.select_endpoint(endpoint);
                target.is_stalled()
            };
            usb.write_byte(stalled as u8);
            usb.write_byte(0);
            usb.release_in();
            read_status_stage(usb);
            true
        }
        StandardRequest::SetFeature | StandardRequest::ClearFeature => {
            if setup.value != FEATURE_ENDPOINT_HALT || endpoint == 0 || !known {
                return false;
            }
            write_status_stage(usb);
            let mut target = EndpointGuard::new(&mut *usb);
            target.select_endpoint(endpoint);
            if request == StandardRequest::SetFeature {
                target.stall();
            } else {
                target.unstall();
                // Halting resets the data toggle; drop anything queued.
                target.reset_fifo(endpoint);
            }
            true
        }
        _ => false,
    }
}

fn class_interface_request<U: UsbController>(
    usb: &mut U,
    setup: &SetupPacket,
    interfaces: &[InterfaceHandler<U>],
) -> bool {
    let Some(entry) = interfaces.iter().find(|e| e.interface == setup.index) else {
        return false;
    };
    if !(entry.handler)(usb, setup) {
        return false;
    }
    match setup.direction() {
        Direction::DeviceToHost => read_status_stage(usb),
        Direction::HostToDevice => write_status_stage(usb),
    }
    true
}

/// Serve a GET_DESCRIPTOR request from the descriptor table.
///
/// Streaming a long descriptor can outlast a frame, so device interrupts
/// are re-enabled for exactly this transfer and disabled again before
/// returning. A bus reset arriving mid-transfer is then still serviced
/// promptly; the aborted transfer ends without a status stage.
fn serve_descriptor<U: UsbController>(
    usb: &mut U,
    setup: &SetupPacket,
    descriptors: &[DescriptorEntry],
) {
    let Some(entry) = descriptors
        .iter()
        .find(|d| d.value == setup.value && d.index == setup.index)
    else {
        usb.stall();
        return;
    };
    usb.enable_interrupts();
    if write_blob(usb, entry.data, setup.length as usize, ENDPOINT0_SIZE as usize) {
        read_status_stage(usb);
    }
    usb.disable_interrupts();
}

/// Stream `data`, clipped to the host's requested length, to the selected
/// IN endpoint in max-packet chunks. A short transfer ending exactly on a
/// packet boundary is terminated with a zero-length packet. Returns false
/// if the transfer was aborted by a stall or a fresh setup packet.
fn write_blob<U: UsbController>(
    usb: &mut U,
    data: &[u8],
    requested: usize,
    packet_size: usize,
) -> bool {
    let total = data.len().min(requested);
    let needs_zlp = total < requested && total % packet_size == 0;
    for chunk in data[..total].chunks(packet_size) {
        if !wait_in_or_abort(usb) {
            return false;
        }
        for &byte in chunk {
            usb.write_byte(byte);
        }
        usb.release_in();
    }
    if needs_zlp {
        if !wait_in_or_abort(usb) {
            return false;
        }
        usb.release_in();
    }
    true
}

fn wait_in_or_abort<U: UsbController>(usb: &U) -> bool {
    loop {
        if usb.is_stalled() || usb.setup_received() {
            return false;
        }
        if usb.in_ready() {
            return true;
        }
    }
}

/// Status stage of a control write: the device sends a zero-length
/// packet.
fn write_status_stage<U: UsbController>(usb: &mut U) {
    usb.wait_in();
    usb.release_in();
}

/// Status stage of a control read: the host sends a zero-length packet.
fn read_status_stage<U: UsbController>(usb: &mut U) {
    usb.wait_out();
    usb.release_out();
}
