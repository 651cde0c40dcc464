//! Control-request setup packets.
//!
//! Every control transfer opens with an 8-byte setup stage. The raw bytes
//! are parsed once into a [`SetupPacket`] and requests are dispatched on
//! the decoded (type, recipient) pair, so the request processors never
//! test `bmRequestType` bits themselves.

/// Data-stage direction, bit 7 of `bmRequestType`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    HostToDevice,
    DeviceToHost,
}

/// Request type, bits 5..=6 of `bmRequestType`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RequestKind {
    Standard,
    Class,
    Vendor,
    Reserved,
}

/// Request recipient, bits 0..=4 of `bmRequestType`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Recipient {
    Device,
    Interface,
    Endpoint,
    Other,
}

/// Parsed 8-byte setup payload. Multi-byte fields are little-endian on
/// the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    /// Size of the setup stage payload.
    pub const SIZE: usize = 8;

    pub fn from_bytes(raw: &[u8; Self::SIZE]) -> Self {
        Self {
            request_type: raw[0],
            request: raw[1],
            value: u16::from_le_bytes([raw[2], raw[3]]),
            index: u16::from_le_bytes([raw[4], raw[5]]),
            length: u16::from_le_bytes([raw[6], raw[7]]),
        }
    }

    pub fn direction(&self) -> Direction {
        if self.request_type & 0x80 != 0 {
            Direction::DeviceToHost
        } else {
            Direction::HostToDevice
        }
    }

    pub fn kind(&self) -> RequestKind {
        match (self.request_type >> 5) & 0b11 {
            0 => RequestKind::Standard,
            1 => RequestKind::Class,
            2 => RequestKind::Vendor,
            _ => RequestKind::Reserved,
        }
    }

    pub fn recipient(&self) -> Recipient {
        match self.request_type & 0x1F {
            0 => Recipient::Device,
            1 => Recipient::Interface,
            2 => Recipient::Endpoint,
            _ => Recipient::Other,
        }
    }
}

/// Standard request codes (USB 2.0 §9.4).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum StandardRequest {
    GetStatus = 0,
    ClearFeature = 1,
    SetFeature = 3,
    SetAddress = 5,
    GetDescriptor = 6,
    SetDescriptor = 7,
    GetConfiguration = 8,
    SetConfiguration = 9,
    GetInterface = 10,
    SetInterface = 11,
    SynchFrame = 12,
}

impl StandardRequest {
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::GetStatus,
            1 => Self::ClearFeature,
            3 => Self::SetFeature,
            5 => Self::SetAddress,
            6 => Self::GetDescriptor,
            7 => Self::SetDescriptor,
            8 => Self::GetConfiguration,
            9 => Self::SetConfiguration,
            10 => Self::GetInterface,
            11 => Self::SetInterface,
            12 => Self::SynchFrame,
            _ => return None,
        })
    }
}

/// wValue selector of the endpoint-halt feature.
pub const FEATURE_ENDPOINT_HALT: u16 = 0;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_little_endian_fields() {
        let raw = [0x80, 0x06, 0x00, 0x01, 0x34, 0x12, 0x12, 0x00];
        let s = SetupPacket::from_bytes(&raw);
        assert_eq!(s.request_type, 0x80);
        assert_eq!(s.request, 0x06);
        assert_eq!(s.value, 0x0100);
        assert_eq!(s.index, 0x1234);
        assert_eq!(s.length, 0x0012);
    }

    #[test]
    fn decodes_direction() {
        let mut s = SetupPacket::from_bytes(&[0x80, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(s.direction(), Direction::DeviceToHost);
        s.request_type = 0x00;
        assert_eq!(s.direction(), Direction::HostToDevice);
    }

    #[test]
    fn decodes_kind_and_recipient() {
        let s = SetupPacket::from_bytes(&[0x21, 0x09, 0, 0, 0, 0, 1, 0]);
        assert_eq!(s.kind(), RequestKind::Class);
        assert_eq!(s.recipient(), Recipient::Interface);

        let s = SetupPacket::from_bytes(&[0x02, 0x01, 0, 0, 0x81, 0, 0, 0]);
        assert_eq!(s.kind(), RequestKind::Standard);
        assert_eq!(s.recipient(), Recipient::Endpoint);

        let s = SetupPacket::from_bytes(&[0x40, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(s.kind(), RequestKind::Vendor);
        assert_eq!(s.recipient(), Recipient::Device);

        let s = SetupPacket::from_bytes(&[0x63, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(s.kind(), RequestKind::Reserved);
        assert_eq!(s.recipient(), Recipient::Other);
    }

    #[test]
    fn standard_request_codes_round_trip() {
        for code in 0..=13u8 {
            match StandardRequest::from_code(code) {
                Some(req) => assert_eq!(req as u8, code),
                None => assert!(matches!(code, 2 | 4 | 13)),
            }
        }
    }
}
