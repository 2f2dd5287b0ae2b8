//! BGAPI frame layout and the commands/events the bridge inspects.
//!
//! A BGAPI message is `[type][len][class][command][payload...]`. The type byte
//! carries the message kind in its high bit (`0x20` command or response,
//! `0xA0` event). Frames are always held in this canonical, unbracketed form;
//! link-level bracketing belongs to the codec.

use std::fmt;

use bytes::{BufMut, BytesMut};
use strum::FromRepr;

use super::error::FramingError;
use crate::types::{HexBytes, MacAddr};

/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 4;

/// Largest frame the deframer will assemble, header included.
pub const MAX_FRAME_LEN: usize = 260;

/// Type byte of a command or response.
pub const TYPE_COMMAND: u8 = 0x20;

/// Type byte of an event.
pub const TYPE_EVENT: u8 = 0xA0;

/// Byte offsets within an extended scan response event.
pub mod scan {
    pub const PACKET_TYPE: usize = 4;
    pub const ADDRESS: usize = 5;
    pub const ADDRESS_TYPE: usize = 11;
    pub const BONDING: usize = 12;
    pub const ADV_SID: usize = 15;
    pub const RSSI: usize = 17;
    pub const CHANNEL: usize = 18;
    pub const DATA_LEN: usize = 21;
    pub const DATA: usize = 22;

    /// Advertising set id always reported by the chip for passive scans.
    pub const SENTINEL: u8 = 0xFF;
}

/// Returns true for the two BGAPI type bytes (`0x20`, `0xA0`).
pub fn is_type_byte(byte: u8) -> bool {
    byte & 0x7F == TYPE_COMMAND
}

/// Message kind, from the high bit of the type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Command from the application, or the chip's response to one.
    Command,
    /// Unsolicited event from the chip.
    Event,
}

/// Headers the bridge acts on, as `type << 24 | class << 8 | command`.
///
/// Everything else is forwarded untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr, strum::Display)]
#[repr(u32)]
pub enum Header {
    #[strum(serialize = "cmd_system_reset")]
    SystemReset = 0x2000_0101,
    #[strum(serialize = "cmd_system_get_bt_address")]
    GetBtAddress = 0x2000_0103,
    #[strum(serialize = "cmd_le_gap_set_discovery_timing")]
    SetDiscoveryTiming = 0x2000_0316,
    #[strum(serialize = "cmd_le_gap_start_discovery")]
    StartDiscovery = 0x2000_0318,
    #[strum(serialize = "cmd_le_gap_set_discovery_extended_scan_response")]
    SetExtendedScanResponse = 0x2000_031C,
    #[strum(serialize = "evt_system_boot")]
    SystemBoot = 0xA000_0100,
    #[strum(serialize = "evt_le_gap_extended_scan_response")]
    ExtendedScanResponse = 0xA000_0304,
}

/// One BGAPI message in canonical form.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    raw: BytesMut,
}

impl Frame {
    /// Build a command frame.
    ///
    /// # Panics
    ///
    /// If `payload` is longer than 255 bytes.
    pub fn command(class_id: u8, command_id: u8, payload: &[u8]) -> Self {
        Self::build(TYPE_COMMAND, class_id, command_id, payload)
    }

    /// Build an event frame.
    ///
    /// # Panics
    ///
    /// If `payload` is longer than 255 bytes.
    pub fn event(class_id: u8, command_id: u8, payload: &[u8]) -> Self {
        Self::build(TYPE_EVENT, class_id, command_id, payload)
    }

    fn build(type_byte: u8, class_id: u8, command_id: u8, payload: &[u8]) -> Self {
        assert!(payload.len() <= u8::MAX as usize, "BGAPI payload exceeds 255 bytes");
        let mut raw = BytesMut::with_capacity(HEADER_LEN + payload.len());
        raw.put_u8(type_byte);
        raw.put_u8(payload.len() as u8);
        raw.put_u8(class_id);
        raw.put_u8(command_id);
        raw.put_slice(payload);
        Self { raw }
    }

    /// Parse a complete canonical frame, checking the type byte and that the
    /// declared length matches the buffer.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FramingError> {
        let type_byte = *bytes.first().ok_or(FramingError::Terminator)?;
        if !is_type_byte(type_byte) {
            return Err(FramingError::UnexpectedByte(type_byte));
        }
        if bytes.len() < HEADER_LEN || bytes.len() != HEADER_LEN + bytes[1] as usize {
            return Err(FramingError::Terminator);
        }
        Ok(Self::from_raw(BytesMut::from(bytes)))
    }

    /// Wrap bytes already known to be a well-formed frame.
    pub(crate) fn from_raw(raw: BytesMut) -> Self {
        debug_assert!(raw.len() >= HEADER_LEN);
        Self { raw }
    }

    pub fn kind(&self) -> Kind {
        if self.raw[0] & 0x80 != 0 {
            Kind::Event
        } else {
            Kind::Command
        }
    }

    pub fn class_id(&self) -> u8 {
        self.raw[2]
    }

    pub fn command_id(&self) -> u8 {
        self.raw[3]
    }

    pub fn payload(&self) -> &[u8] {
        &self.raw[HEADER_LEN..]
    }

    /// Combined header word used to match known commands and events.
    pub fn header_word(&self) -> u32 {
        u32::from(self.raw[0]) << 24 | u32::from(self.raw[2]) << 8 | u32::from(self.raw[3])
    }

    pub fn header(&self) -> Option<Header> {
        Header::from_repr(self.header_word())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Mutable access for in-place rewriting (dedup zeroing, legacy
    /// conversion).
    pub(crate) fn raw_mut(&mut self) -> &mut BytesMut {
        &mut self.raw
    }

    /// True for `cmd_system_reset`.
    pub fn is_reset_command(&self) -> bool {
        self.header() == Some(Header::SystemReset)
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.header() {
            Some(header) => write!(f, "Frame({} {})", header, HexBytes(&self.raw)),
            None => write!(f, "Frame({})", HexBytes(&self.raw)),
        }
    }
}

/// `cmd_le_gap_set_discovery_extended_scan_response`.
pub fn extended_scan_command(enabled: bool) -> Frame {
    Frame::command(0x03, 0x1C, &[u8::from(enabled)])
}

/// Overwrite scan interval and window in a `cmd_le_gap_set_discovery_timing`
/// frame. Returns false, leaving the frame untouched, if it is too short.
pub fn patch_discovery_timing(frame: &mut Frame, interval: u16, window: u16) -> bool {
    // payload: phys(1) interval(2) window(2)
    let raw = frame.raw_mut();
    if raw.len() < HEADER_LEN + 5 {
        return false;
    }
    raw[HEADER_LEN + 1..HEADER_LEN + 3].copy_from_slice(&interval.to_le_bytes());
    raw[HEADER_LEN + 3..HEADER_LEN + 5].copy_from_slice(&window.to_le_bytes());
    true
}

/// Firmware version reported in the boot event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareVersion {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// A chip frame whose header matched and whose shape was validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChipMessage {
    /// Response to `cmd_system_get_bt_address`.
    BtAddress(MacAddr),
    /// Response to the injected extended scan enable.
    ExtendedScanSet,
    /// Response to `cmd_le_gap_start_discovery`.
    DiscoveryStarted,
    /// `evt_system_boot`.
    Boot(FirmwareVersion),
    /// `evt_le_gap_extended_scan_response` with a consistent data length.
    ScanResponse,
    /// Anything else, including known headers with the wrong shape.
    Other,
}

fn le16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

/// Classify a frame received from the chip.
pub fn classify(frame: &Frame) -> ChipMessage {
    let p = frame.as_bytes();
    let n = p.len();
    match frame.header() {
        Some(Header::GetBtAddress) if n == 10 && p[1] == 6 => MacAddr::from_wire_slice(&p[4..10])
            .map(ChipMessage::BtAddress)
            .unwrap_or(ChipMessage::Other),
        Some(Header::SetExtendedScanResponse) if n == 6 && p[1] == 2 => ChipMessage::ExtendedScanSet,
        Some(Header::StartDiscovery) if n == 6 && p[1] == 2 => ChipMessage::DiscoveryStarted,
        Some(Header::SystemBoot) if n == 22 && p[1] == 0x12 => ChipMessage::Boot(FirmwareVersion {
            major: le16(p, 4),
            minor: le16(p, 6),
            patch: le16(p, 8),
        }),
        Some(Header::ExtendedScanResponse)
            if n >= scan::DATA && p[1] >= 0x12 && p[scan::DATA_LEN] as usize == n - scan::DATA =>
        {
            ChipMessage::ScanResponse
        }
        _ => ChipMessage::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn frame(bytes: &[u8]) -> Frame {
        Frame::from_bytes(bytes).unwrap()
    }

    #[test]
    fn header_fields() {
        let f = frame(&[0x20, 0x02, 0x03, 0x18, 0x00, 0x00]);
        assert_eq!(f.kind(), Kind::Command);
        assert_eq!(f.class_id(), 0x03);
        assert_eq!(f.command_id(), 0x18);
        assert_eq!(f.header(), Some(Header::StartDiscovery));
        assert_eq!(f.payload(), &[0x00, 0x00]);

        let f = frame(&[0xA0, 0x01, 0x07, 0x07, 0x55]);
        assert_eq!(f.kind(), Kind::Event);
        assert_eq!(f.header(), None);
    }

    #[test]
    fn from_bytes_checks_length() {
        assert_eq!(
            Frame::from_bytes(&[0x20, 0x02, 0x03, 0x18, 0x00]),
            Err(FramingError::Terminator)
        );
        assert_eq!(
            Frame::from_bytes(&[0x55, 0x00, 0x00, 0x00]),
            Err(FramingError::UnexpectedByte(0x55))
        );
    }

    #[test]
    fn reset_command_detection() {
        assert!(frame(&[0x20, 0x01, 0x01, 0x01, 0x00]).is_reset_command());
        assert!(!frame(&[0x20, 0x00, 0x01, 0x03]).is_reset_command());
        // Response to reset never comes, but an event with the same class/id isn't one
        assert!(!frame(&[0xA0, 0x01, 0x01, 0x01, 0x00]).is_reset_command());
    }

    #[test]
    fn extended_scan_enable_encoding() {
        assert_eq!(extended_scan_command(true).as_bytes(), &[0x20, 0x01, 0x03, 0x1C, 0x01]);
        assert_eq!(extended_scan_command(false).as_bytes(), &[0x20, 0x01, 0x03, 0x1C, 0x00]);
    }

    #[test]
    fn discovery_timing_patch() {
        let mut f = frame(&[0x20, 0x05, 0x03, 0x16, 0x01, 0x10, 0x00, 0x10, 0x00]);
        assert!(patch_discovery_timing(&mut f, 0x0040, 0x0030));
        assert_eq!(f.as_bytes(), &[0x20, 0x05, 0x03, 0x16, 0x01, 0x40, 0x00, 0x30, 0x00]);

        let mut short = frame(&[0x20, 0x01, 0x03, 0x16, 0x01]);
        assert!(!patch_discovery_timing(&mut short, 1, 1));
        assert_eq!(short.as_bytes(), &[0x20, 0x01, 0x03, 0x16, 0x01]);
    }

    #[test]
    fn classify_bt_address() {
        let f = frame(&[0x20, 0x06, 0x01, 0x03, 0xF4, 0x83, 0x02, 0x38, 0xC1, 0xA4]);
        let mac: MacAddr = "A4:C1:38:02:83:F4".parse().unwrap();
        assert_eq!(classify(&f), ChipMessage::BtAddress(mac));
    }

    #[test]
    fn classify_boot_reads_version() {
        let mut payload = [0u8; 18];
        payload[..6].copy_from_slice(&[0x02, 0x00, 0x0D, 0x00, 0x02, 0x00]);
        let f = Frame::event(0x01, 0x00, &payload);
        assert_eq!(
            classify(&f),
            ChipMessage::Boot(FirmwareVersion { major: 2, minor: 13, patch: 2 })
        );
    }

    #[test_case(&[0x20, 0x02, 0x03, 0x1C, 0x00, 0x00], ChipMessage::ExtendedScanSet; "ext scan set")]
    #[test_case(&[0x20, 0x02, 0x03, 0x18, 0x00, 0x00], ChipMessage::DiscoveryStarted; "discovery started")]
    #[test_case(&[0x20, 0x01, 0x03, 0x18, 0x00], ChipMessage::Other; "short discovery response")]
    #[test_case(&[0x20, 0x02, 0x01, 0x03, 0x00, 0x00], ChipMessage::Other; "short bt address")]
    #[test_case(&[0xA0, 0x01, 0x01, 0x00, 0x00], ChipMessage::Other; "short boot")]
    #[test_case(&[0x20, 0x02, 0x07, 0x07, 0x00, 0x00], ChipMessage::Other; "unknown header")]
    fn classify_responses(bytes: &[u8], expected: ChipMessage) {
        assert_eq!(classify(&frame(bytes)), expected);
    }

    #[test]
    fn classify_scan_response_checks_data_len() {
        let mut payload = vec![0u8; 18 + 3];
        payload[scan::ADV_SID - 4] = scan::SENTINEL;
        payload[scan::DATA_LEN - 4] = 3;
        let f = Frame::event(0x03, 0x04, &payload);
        assert_eq!(classify(&f), ChipMessage::ScanResponse);

        payload[scan::DATA_LEN - 4] = 4;
        let f = Frame::event(0x03, 0x04, &payload);
        assert_eq!(classify(&f), ChipMessage::Other);
    }
}
