//! Hand-built USB device stack.
//!
//! No descriptor builders and no class abstractions: the firmware brings
//! static descriptor bytes and handler tables, and the engine in
//! [`control`] runs the endpoint-zero state machine over the register
//! surface defined in [`bus`].

pub mod bus;
pub mod control;
pub mod setup;

pub use bus::{
    DeviceEvents, EndpointConfig, EndpointEvents, EndpointGuard, EndpointKind, UsbController,
};
pub use control::{
    Configuration, ControlPipe, DescriptorEntry, DeviceControl, EndpointHandler, InterfaceHandler,
    SofHandler,
};
pub use setup::{Direction, Recipient, RequestKind, SetupPacket, StandardRequest};
