//! Xiaomi MiBeacon (service data UUID `0xFE95`).
//!
//! Layout of the service data after the UUID:
//!
//! ```text
//! frame_control[2] product_id[2] seq[1] mac[6]? capability[1+]? payload.. trailer..
//! ```
//!
//! The payload is an object: `event_id[2] len[1] data..`, optionally
//! encrypted with the device's bind key.

pub mod crypto;
pub mod event;

use bitflags::bitflags;
use serde::Serialize;

use crate::keys::KeyProvider;
use crate::types::{serialize_opt_hex, MacAddr};

pub use crypto::DecryptError;
pub use event::Reading;

bitflags! {
    /// Low bits of the frame control word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FrameControl: u16 {
        const ENCRYPTED = 0x0008;
        const MAC_INCLUDED = 0x0010;
        const CAPABILITY_INCLUDED = 0x0020;
        const OBJECT_INCLUDED = 0x0040;
        /// v5 only: plaintext payloads carry a 2-byte trailer.
        const MESH = 0x0080;
    }
}

/// How much a decode achieved. Numeric values are part of the published
/// output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Usefulness {
    /// Nothing usable, or not enough bytes.
    Unusable = 0,
    /// Valid beacon whose payload could not be decrypted.
    Encrypted = 1,
    /// Event id and data are available.
    Decoded = 2,
}

impl Serialize for Usefulness {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

/// A parsed MiBeacon.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MiBeacon {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac: Option<MacAddr>,
    #[serde(rename = "pdid")]
    pub product_id: u16,
    #[serde(rename = "seq")]
    pub sequence: u8,
    #[serde(rename = "eid", skip_serializing_if = "Option::is_none")]
    pub event_id: Option<u16>,
    #[serde(
        rename = "edata",
        serialize_with = "serialize_opt_hex",
        skip_serializing_if = "Option::is_none"
    )]
    pub event_data: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<&'static str>,
}

impl MiBeacon {
    fn note(mut self, comment: &'static str, usefulness: Usefulness) -> (Self, Usefulness) {
        self.comment = Some(comment);
        (self, usefulness)
    }

    /// Typed reading for a decoded beacon.
    pub fn reading(&self) -> Option<Reading> {
        let event_id = self.event_id?;
        Reading::decode(event_id, self.event_data.as_deref().unwrap_or_default(), self.product_id)
    }
}

const HEADER_LEN: usize = 5;
const MAC_END: usize = HEADER_LEN + 6;

/// Parse and, if needed and possible, decrypt a MiBeacon.
///
/// `data` is the service data following the `0xFE95` UUID.
pub fn decode(data: &[u8], keys: &dyn KeyProvider) -> (MiBeacon, Usefulness) {
    let beacon = MiBeacon::default();
    if data.len() < HEADER_LEN {
        return beacon.note("small payload", Usefulness::Unusable);
    }

    let fc = u16::from_le_bytes([data[0], data[1]]);
    let flags = FrameControl::from_bits_truncate(fc);
    let version = (fc >> 12) as u8;
    let mut beacon = MiBeacon {
        product_id: u16::from_le_bytes([data[2], data[3]]),
        sequence: data[4],
        ..beacon
    };

    if !flags.contains(FrameControl::MAC_INCLUDED) {
        return beacon.note("no mac", Usefulness::Unusable);
    }
    let Some(mac) = MacAddr::from_wire_slice(&data[HEADER_LEN..]) else {
        return beacon.note("small payload", Usefulness::Unusable);
    };
    beacon.mac = Some(mac);

    if !flags.contains(FrameControl::OBJECT_INCLUDED) {
        return beacon.note("no payload", Usefulness::Unusable);
    }

    let mut pos = MAC_END;
    if flags.contains(FrameControl::CAPABILITY_INCLUDED) {
        let Some(&capability) = data.get(pos) else {
            return beacon.note("small payload", Usefulness::Unusable);
        };
        pos += 1;
        if capability >> 3 == 0b11 {
            // IO capability
            pos += 2;
        }
        if version == 5 && capability & 0x20 != 0 {
            pos += 2;
        }
    }
    if pos > data.len() {
        return beacon.note("small payload", Usefulness::Unusable);
    }

    let payload = if flags.contains(FrameControl::ENCRYPTED) {
        let Some(key) = keys.lookup(&mac) else {
            return beacon.note("encrypted", Usefulness::Encrypted);
        };
        match crypto::decrypt(version, data, pos, &key) {
            Ok(plain) => plain,
            Err(DecryptError::TooShort(_)) => {
                return beacon.note("small payload", Usefulness::Unusable);
            }
            Err(_) => return beacon.note("wrong enc key", Usefulness::Encrypted),
        }
    } else if version == 5 && flags.contains(FrameControl::MESH) {
        match data.len().checked_sub(2) {
            Some(end) if end >= pos => data[pos..end].to_vec(),
            _ => return beacon.note("small payload", Usefulness::Unusable),
        }
    } else {
        data[pos..].to_vec()
    };

    if payload.len() < 4 {
        beacon.event_data = Some(payload);
        return beacon.note("small payload", Usefulness::Unusable);
    }

    // The object length byte is not checked: some custom firmware gets it wrong
    beacon.event_id = Some(u16::from_le_bytes([payload[0], payload[1]]));
    beacon.event_data = Some(payload[3..].to_vec());
    (beacon, Usefulness::Decoded)
}

#[cfg(test)]
mod tests {
    use super::crypto::vectors::*;
    use super::*;
    use std::collections::HashMap;

    fn bytes(s: &str) -> Vec<u8> {
        hex::decode(s).unwrap()
    }

    fn sensor() -> MacAddr {
        "A4:C1:38:02:83:F4".parse().unwrap()
    }

    fn keys(key: &str) -> HashMap<MacAddr, Vec<u8>> {
        HashMap::from([(sensor(), bytes(key))])
    }

    fn no_keys() -> HashMap<MacAddr, Vec<u8>> {
        HashMap::new()
    }

    #[test]
    fn v5_decrypts_with_bind_key() {
        let (beacon, useful) = decode(&bytes(V5_BEACON), &keys(V5_KEY));
        assert_eq!(useful, Usefulness::Decoded);
        assert_eq!(beacon.mac, Some(sensor()));
        assert_eq!(beacon.product_id, 1371);
        assert_eq!(beacon.sequence, 1);
        assert_eq!(beacon.event_id, Some(0x1006));
        assert_eq!(beacon.event_data.as_deref(), Some(&V5_PLAIN[3..]));
        assert_eq!(beacon.comment, None);
        // 1371 truncates humidity
        assert_eq!(beacon.reading(), Some(Reading::Humidity(45.0)));
    }

    #[test]
    fn v5_wrong_key() {
        let (beacon, useful) = decode(&bytes(V5_BEACON), &keys(V3_KEY));
        assert_eq!(useful, Usefulness::Encrypted);
        assert_eq!(beacon.comment, Some("wrong enc key"));

        let mut bad = bytes(V5_KEY);
        bad[15] ^= 0xFF;
        let (beacon, useful) = decode(&bytes(V5_BEACON), &HashMap::from([(sensor(), bad)]));
        assert_eq!(useful, Usefulness::Encrypted);
        assert_eq!(beacon.comment, Some("wrong enc key"));
    }

    #[test]
    fn encrypted_without_key() {
        let (beacon, useful) = decode(&bytes(V5_BEACON), &no_keys());
        assert_eq!(useful, Usefulness::Encrypted);
        assert_eq!(beacon.comment, Some("encrypted"));
        assert_eq!(beacon.mac, Some(sensor()));
        assert_eq!(beacon.product_id, 1371);
    }

    #[test]
    fn v3_decrypts_with_bind_key() {
        let (beacon, useful) = decode(&bytes(V3_BEACON), &keys(V3_KEY));
        assert_eq!(useful, Usefulness::Decoded);
        assert_eq!(beacon.product_id, 426);
        assert_eq!(beacon.event_id, Some(0x100D));
        assert_eq!(
            beacon.reading(),
            Some(Reading::Climate { temperature: 21.5, humidity: 45.1 })
        );
    }

    #[test]
    fn plain_beacon() {
        // v2, mac + object, battery 93 %
        let data = [
            0x50, 0x20, 0x98, 0x00, 0x07, 0xF4, 0x83, 0x02, 0x38, 0xC1, 0xA4, 0x0A, 0x10, 0x01, 0x5D,
        ];
        let (beacon, useful) = decode(&data, &no_keys());
        assert_eq!(useful, Usefulness::Decoded);
        assert_eq!(beacon.product_id, 0x0098);
        assert_eq!(beacon.reading(), Some(Reading::Battery(93)));
    }

    #[test]
    fn plain_v5_mesh_trailer_dropped() {
        let data = [
            0xD0, 0x50, 0x98, 0x00, 0x07, 0xF4, 0x83, 0x02, 0x38, 0xC1, 0xA4, 0x0A, 0x10, 0x01, 0x5D,
            0xEE, 0xFF,
        ];
        let (beacon, useful) = decode(&data, &no_keys());
        assert_eq!(useful, Usefulness::Decoded);
        assert_eq!(beacon.event_data, Some(vec![0x5D]));
    }

    #[test]
    fn capability_byte_skipped() {
        // capability 0x18: IO capability follows (2 bytes)
        let data = [
            0x70, 0x20, 0x98, 0x00, 0x07, 0xF4, 0x83, 0x02, 0x38, 0xC1, 0xA4, 0x18, 0x00, 0x00,
            0x0A, 0x10, 0x01, 0x5D,
        ];
        let (beacon, useful) = decode(&data, &no_keys());
        assert_eq!(useful, Usefulness::Decoded);
        assert_eq!(beacon.event_id, Some(0x100A));
    }

    #[test]
    fn missing_mac_or_object() {
        let (beacon, useful) = decode(&[0x40, 0x20, 0x98, 0x00, 0x07, 0x0A, 0x10, 0x01, 0x5D], &no_keys());
        assert_eq!(useful, Usefulness::Unusable);
        assert_eq!(beacon.comment, Some("no mac"));

        let data = [0x30, 0x20, 0x98, 0x00, 0x07, 0xF4, 0x83, 0x02, 0x38, 0xC1, 0xA4, 0x08];
        let (beacon, useful) = decode(&data, &no_keys());
        assert_eq!(useful, Usefulness::Unusable);
        assert_eq!(beacon.comment, Some("no payload"));
        assert_eq!(beacon.mac, Some(sensor()));
    }

    #[test]
    fn small_payloads() {
        let data = [0x50, 0x20, 0x98, 0x00, 0x07, 0xF4, 0x83, 0x02, 0x38, 0xC1, 0xA4, 0x0A, 0x10];
        let (beacon, useful) = decode(&data, &no_keys());
        assert_eq!(useful, Usefulness::Unusable);
        assert_eq!(beacon.comment, Some("small payload"));
        assert_eq!(beacon.event_data, Some(vec![0x0A, 0x10]));

        let (_, useful) = decode(&[0x50, 0x20], &no_keys());
        assert_eq!(useful, Usefulness::Unusable);

        // Truncated mac
        let (beacon, _) = decode(&[0x50, 0x20, 0x98, 0x00, 0x07, 0xF4], &no_keys());
        assert_eq!(beacon.comment, Some("small payload"));
    }

    #[test]
    fn serialized_shape() {
        let (beacon, _) = decode(&bytes(V5_BEACON), &keys(V5_KEY));
        let json = serde_json::to_value(&beacon).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "mac": "A4:C1:38:02:83:F4",
                "pdid": 1371,
                "seq": 1,
                "eid": 0x1006,
                "edata": "c301",
            })
        );
    }
}
