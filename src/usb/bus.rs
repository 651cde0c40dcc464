//! Register-surface abstraction for the USB device controller.
//!
//! [`UsbController`] stays close to the hardware: one method per register
//! operation, endpoint state always addressed through the currently
//! selected endpoint. The AVR backend in `hw` is a thin volatile layer
//! over it; host tests drive the same engines through `mock::MockUsb`.
//!
//! Endpoint event bits use the controller's native positions, so the
//! hardware backend forwards its interrupt register unchanged.

use crate::error::Error;

/// Device-level interrupt flags, snapshotted and cleared in one read.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeviceEvents {
    pub end_of_reset: bool,
    pub start_of_frame: bool,
}

/// Per-endpoint event flags as seen by endpoint handlers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EndpointEvents(u8);

impl EndpointEvents {
    /// IN bank free, ready for the next packet.
    pub const IN_READY: u8 = 1 << 0;
    /// A STALL handshake was sent.
    pub const STALLED: u8 = 1 << 1;
    /// An OUT packet is waiting in the FIFO.
    pub const OUT_RECEIVED: u8 = 1 << 2;
    /// A setup packet is waiting (endpoint 0 only).
    pub const SETUP: u8 = 1 << 3;
    /// The host was NAKed on an OUT token.
    pub const NAK_OUT: u8 = 1 << 4;
    /// The host was NAKed on an IN token.
    pub const NAK_IN: u8 = 1 << 6;

    /// Events that wake an entry in the endpoint handler table.
    pub const HANDLED: u8 =
        Self::IN_READY | Self::STALLED | Self::OUT_RECEIVED | Self::NAK_OUT | Self::NAK_IN;

    pub const fn new(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn any_handled(self) -> bool {
        self.0 & Self::HANDLED != 0
    }

    pub const fn in_ready(self) -> bool {
        self.0 & Self::IN_READY != 0
    }

    pub const fn out_received(self) -> bool {
        self.0 & Self::OUT_RECEIVED != 0
    }

    pub const fn stalled(self) -> bool {
        self.0 & Self::STALLED != 0
    }
}

/// Transfer type and direction of one endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EndpointKind {
    Control,
    InterruptIn,
    InterruptOut,
    BulkIn,
    BulkOut,
}

/// Static description of one endpoint: number, type, FIFO geometry and
/// the event interrupts to arm.
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EndpointConfig {
    pub number: u8,
    pub kind: EndpointKind,
    /// Max packet size in bytes, a power of two from 8 to 64.
    pub size: u8,
    pub double_bank: bool,
    /// [`EndpointEvents`] bits to enable as interrupt sources.
    pub interrupts: u8,
}

/// The device-controller register surface.
///
/// Endpoint operations without an explicit endpoint argument act on the
/// currently selected endpoint. Callers that reselect must restore the
/// previous selection; [`EndpointGuard`] does this scoping.
pub trait UsbController {
    // Bring-up and teardown.
    fn set_pads_regulator(&mut self, on: bool);
    fn configure_pll(&mut self);
    fn pll_locked(&self) -> bool;
    fn enable_controller(&mut self);
    fn disable_controller(&mut self);
    /// Connect the D+ pull-up; the host sees the device appear.
    fn attach(&mut self);
    fn detach(&mut self);

    // Device-level interrupts.
    fn enable_device_interrupts(&mut self);
    fn disable_device_interrupts(&mut self);
    /// Read and clear the pending device-level events.
    fn take_device_events(&mut self) -> DeviceEvents;
    /// Global interrupt enable (`sei` on AVR).
    fn enable_interrupts(&mut self);
    fn disable_interrupts(&mut self);

    // Endpoint selection and configuration.
    fn selected_endpoint(&self) -> u8;
    fn select_endpoint(&mut self, endpoint: u8);
    /// Select, configure and activate the endpoint named in `config`.
    /// Leaves it selected. Fails if the controller rejects the FIFO
    /// allocation.
    fn apply_endpoint_config(&mut self, config: &EndpointConfig) -> Result<(), Error>;
    fn reset_fifo(&mut self, endpoint: u8);

    // State of the selected endpoint.
    fn endpoint_events(&self) -> EndpointEvents;
    fn setup_received(&self) -> bool;
    /// Acknowledge the pending setup event, freeing its bank.
    fn ack_setup(&mut self);
    fn stall(&mut self);
    fn unstall(&mut self);
    fn is_stalled(&self) -> bool;

    // Device address.
    /// Latch the address without activating it.
    fn set_address(&mut self, address: u8);
    /// Activate the previously latched address.
    fn enable_address(&mut self);

    // FIFO access on the selected endpoint.
    fn in_ready(&self) -> bool;
    fn out_ready(&self) -> bool;
    /// Hand the IN bank to the hardware for transmission.
    fn release_in(&mut self);
    /// Free the OUT bank for the next packet from the host.
    fn release_out(&mut self);
    fn read_byte(&mut self) -> u8;
    fn write_byte(&mut self, byte: u8);

    /// Busy-wait until the IN bank is free. Paced by the host draining
    /// the previous packet.
    fn wait_in(&self) {
        while !self.in_ready() {}
    }

    /// Busy-wait until an OUT packet arrives.
    fn wait_out(&self) {
        while !self.out_ready() {}
    }
}

/// Scoped endpoint selection.
///
/// Snapshots the selected endpoint on creation and restores it on drop.
/// Every interrupt entry point and every helper that reselects endpoints
/// mid-transfer runs under one of these, so an interrupted foreground
/// path never observes a moved selection.
pub struct EndpointGuard<'a, U: UsbController> {
    usb: &'a mut U,
    saved: u8,
}

impl<'a, U: UsbController> EndpointGuard<'a, U> {
    pub fn new(usb: &'a mut U) -> Self {
        let saved = usb.selected_endpoint();
        Self { usb, saved }
    }
}

impl<U: UsbController> core::ops::Deref for EndpointGuard<'_, U> {
    type Target = U;

    fn deref(&self) -> &U {
        self.usb
    }
}

impl<U: UsbController> core::ops::DerefMut for EndpointGuard<'_, U> {
    fn deref_mut(&mut self) -> &mut U {
        self.usb
    }
}

impl<U: UsbController> Drop for EndpointGuard<'_, U> {
    fn drop(&mut self) {
        self.usb.select_endpoint(self.saved);
    }
}
