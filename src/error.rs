//! Unified error type for rawkbd.
//!
//! We avoid `alloc` - all error variants carry only fixed-size data.
//! Implements `defmt::Format` when the `defmt` feature is enabled.

/// Top-level error type used across the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    // Flash
    /// Target address falls outside the writable application window.
    AddressRange,

    /// Target address is not aligned to an SPM page boundary.
    Misaligned,

    // USB
    /// The controller rejected an endpoint configuration.
    EndpointConfig,

    /// The outbound raw-HID bank is still occupied; the reply was dropped.
    LinkBusy,
}
